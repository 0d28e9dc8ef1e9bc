use std::fmt::{Display, Formatter};

use anyhow::{ensure, Result};
use binrw::binrw;

use crate::{
    error::FormatError,
    format::{
        checked_range, mtrl::MaterialTable, vertex::VertexBuffer, vertex::VertexDeclaration,
        CAABox, CMatrix4f, FormatVersion, FourCC, Uid,
    },
    util::table::{read_table, LeafWriter, Record, TableSpan},
};

// Model package
pub const K_CHUNK_MDPC: FourCC = FourCC(*b"MDPC");

/// Owner value marking a reference into the referencing package.
pub const OWNER_THIS_PACKAGE: u16 = 0xFFFD;
/// Owner value marking a shadow-only submodel without a material.
pub const OWNER_SHADOW: u16 = 0xCCCC;
/// Owner value marking a reference that could not be resolved.
pub const OWNER_UNRESOLVED: u16 = 0xFFFF;

pub const LOD_SLOT_COUNT: usize = 5;

#[binrw]
#[derive(Clone, Debug)]
pub struct SPackageHeader {
    pub magic: FourCC,
    pub version: u32,
    pub uid: Uid,
    pub flags: u32,
    pub model_count: u32,
    pub model_offset: u32,
    pub lod_count: u32,
    pub lod_offset: u32,
    pub instance_count: u32,
    pub instance_offset: u32,
    pub submodel_count: u32,
    pub submodel_offset: u32,
    pub vertex_declaration: u32,
    pub vertex_buffer_count: u32,
    pub vertex_buffer_offset: u32,
    pub index_count: u32,
    pub index_offset: u32,
    pub material_table_offset: u32,
}

impl Record for SPackageHeader {
    const SIZE: u32 = 76;
}

#[binrw]
#[derive(Clone, Debug)]
pub struct SModel {
    pub transforms: [CMatrix4f; 2],
    pub scale: [f32; 4],
    pub bounds: CAABox,
    /// Zero for an empty slot
    pub lod_offsets: [u32; LOD_SLOT_COUNT],
    pub vertex_buffer: u16,
    pub flags: u16,
}

impl Record for SModel {
    const SIZE: u32 = 192;
}

#[binrw]
#[derive(Clone, Debug)]
pub struct SLod {
    pub slot_type: u32,
    pub mask: u32,
    pub instance_offset: u32,
    pub instance_count: u32,
}

impl Record for SLod {
    const SIZE: u32 = 16;
}

#[binrw]
#[derive(Clone, Debug)]
pub struct SInstance {
    pub transform: CMatrix4f,
    pub submodel_offset: u32,
    pub submodel_count: u16,
    pub flags: u16,
}

impl Record for SInstance {
    const SIZE: u32 = 72;
}

#[binrw]
#[derive(Clone, Debug)]
pub struct SSubModel {
    pub primitive: u32,
    pub vertex_buffer: u16,
    pub flags: u16,
    pub vertex_base: u32,
    pub vertex_count: u32,
    pub index_start: u32,
    pub index_count: u32,
    pub material_index: u16,
    pub material_owner: u16,
}

impl Record for SSubModel {
    const SIZE: u32 = 28;
}

#[binrw]
#[derive(Clone, Debug)]
pub struct SVertexBuffer {
    pub vertex_count: u32,
    pub stride: u32,
    pub data_offset: u32,
}

impl Record for SVertexBuffer {
    const SIZE: u32 = 12;
}

/// Position of a LOD within a model.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LodSlot {
    High = 0,
    Medium = 1,
    Low = 2,
    VeryLow = 3,
    Shadow = 4,
}

impl LodSlot {
    pub const ALL: [LodSlot; LOD_SLOT_COUNT] =
        [LodSlot::High, LodSlot::Medium, LodSlot::Low, LodSlot::VeryLow, LodSlot::Shadow];

    /// Maps a LOD slot-type code onto its slot.
    pub fn from_slot_type(slot_type: u32) -> Option<Self> {
        Self::ALL.get(slot_type as usize).copied()
    }

    #[inline]
    pub fn index(self) -> usize { self as usize }
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Primitive {
    #[default]
    TriangleList = 4,
    TriangleStrip = 5,
    TriangleFan = 6,
}

impl Primitive {
    pub fn from_u32(value: u32, offset: u64) -> Result<Self, FormatError> {
        match value {
            4 => Ok(Self::TriangleList),
            5 => Ok(Self::TriangleStrip),
            6 => Ok(Self::TriangleFan),
            value => {
                Err(FormatError::InvalidValue { what: "primitive", value: value as u64, offset })
            }
        }
    }
}

/// Package owning the table a material handle points into.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MaterialOwner {
    ThisPackage,
    Shadow,
    Unresolved,
    /// Short UID of another package.
    ///
    /// DPL writes local references as the package's own short UID, so in a DPL
    /// package `Global(own)` encodes the same as `ThisPackage` and decodes as
    /// `ThisPackage`. Driv3r keeps the two apart. Conversion treats both as local.
    Global(u16),
}

impl MaterialOwner {
    /// Decodes an owner value. `own` is the short UID of the package being read.
    pub fn from_raw(raw: u16, version: FormatVersion, own: u16) -> Self {
        match raw {
            OWNER_THIS_PACKAGE => MaterialOwner::ThisPackage,
            OWNER_SHADOW => MaterialOwner::Shadow,
            OWNER_UNRESOLVED => MaterialOwner::Unresolved,
            raw if version == FormatVersion::Dpl && raw == own => MaterialOwner::ThisPackage,
            raw => MaterialOwner::Global(raw),
        }
    }

    /// Encodes an owner value using the local-reference convention of `version`.
    pub fn to_raw(self, version: FormatVersion, own: u16) -> u16 {
        match self {
            MaterialOwner::ThisPackage => match version {
                FormatVersion::Driv3r => OWNER_THIS_PACKAGE,
                FormatVersion::Dpl => own,
            },
            MaterialOwner::Shadow => OWNER_SHADOW,
            MaterialOwner::Unresolved => OWNER_UNRESOLVED,
            MaterialOwner::Global(uid) => uid,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct MaterialHandle {
    pub index: u16,
    pub owner: MaterialOwner,
}

impl MaterialHandle {
    pub const UNRESOLVED: Self = Self { index: 0, owner: MaterialOwner::Unresolved };

    pub const fn local(index: u16) -> Self { Self { index, owner: MaterialOwner::ThisPackage } }
}

impl Display for MaterialHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.owner {
            MaterialOwner::ThisPackage => write!(f, "#{} (local)", self.index),
            MaterialOwner::Shadow => write!(f, "#{} (shadow)", self.index),
            MaterialOwner::Unresolved => write!(f, "#{} (unresolved)", self.index),
            MaterialOwner::Global(uid) => write!(f, "#{} @ {:04X}", self.index, uid),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubModel {
    pub primitive: Primitive,
    pub vertex_buffer: u16,
    pub flags: u16,
    pub vertex_base: u32,
    pub vertex_count: u32,
    pub index_start: u32,
    pub index_count: u32,
    pub material: MaterialHandle,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub transform: CMatrix4f,
    pub flags: u16,
    pub submodels: Vec<SubModel>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Lod {
    pub slot_type: u32,
    /// Render passes using this LOD
    pub mask: u32,
    pub instances: Vec<Instance>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Model {
    pub transforms: [CMatrix4f; 2],
    pub scale: [f32; 4],
    pub bounds: CAABox,
    pub lods: [Option<Lod>; LOD_SLOT_COUNT],
    pub vertex_buffer: u16,
    pub flags: u16,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            transforms: [CMatrix4f::IDENTITY; 2],
            scale: [1.0; 4],
            bounds: CAABox::default(),
            lods: Default::default(),
            vertex_buffer: 0,
            flags: 0,
        }
    }
}

impl Model {
    pub fn lod(&self, slot: LodSlot) -> Option<&Lod> { self.lods[slot.index()].as_ref() }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelPackage {
    pub version: FormatVersion,
    pub uid: Uid,
    pub flags: u32,
    pub models: Vec<Model>,
    pub vertex_declaration: VertexDeclaration,
    pub vertex_buffers: Vec<VertexBuffer>,
    pub indices: Vec<u16>,
    pub materials: MaterialTable,
}

impl ModelPackage {
    pub fn new(version: FormatVersion, uid: Uid) -> Self {
        Self {
            version,
            uid,
            flags: 0,
            models: vec![],
            vertex_declaration: VertexDeclaration::Basic,
            vertex_buffers: vec![],
            indices: vec![],
            materials: MaterialTable::default(),
        }
    }

    /// All submodels in model, slot, instance order.
    pub fn submodels(&self) -> impl Iterator<Item = &SubModel> {
        self.models
            .iter()
            .flat_map(|m| m.lods.iter().flatten())
            .flat_map(|l| &l.instances)
            .flat_map(|i| &i.submodels)
    }

    /// Decodes a model package leaf.
    ///
    /// Tables are resolved back to front: submodels, instances, LODs, then
    /// models, each parent finding its children through the child table's span.
    pub fn read(data: &[u8]) -> Result<Self> {
        let header: SPackageHeader = read_table(data, "package header", 0, 1)?.remove(0);
        if header.magic != K_CHUNK_MDPC {
            return Err(FormatError::BadMagic {
                expected: K_CHUNK_MDPC,
                found: header.magic,
                offset: 0,
            }
            .into());
        }
        let version = FormatVersion::from_u32(header.version)?;
        let own = header.uid.short();
        let vertex_declaration = VertexDeclaration::from_u32(header.vertex_declaration, 52)?;

        // Submodels
        let submodel_span =
            TableSpan::new::<SSubModel>("submodel", header.submodel_offset, header.submodel_count);
        let raw: Vec<SSubModel> =
            read_table(data, "submodel table", header.submodel_offset, header.submodel_count)?;
        let mut submodels = Vec::with_capacity(raw.len());
        for (i, raw) in raw.into_iter().enumerate() {
            submodels.push(SubModel {
                primitive: Primitive::from_u32(raw.primitive, submodel_span.offset_of(i) as u64)?,
                vertex_buffer: raw.vertex_buffer,
                flags: raw.flags,
                vertex_base: raw.vertex_base,
                vertex_count: raw.vertex_count,
                index_start: raw.index_start,
                index_count: raw.index_count,
                material: MaterialHandle {
                    index: raw.material_index,
                    owner: MaterialOwner::from_raw(raw.material_owner, version, own),
                },
            });
        }

        // Instances
        let instance_span =
            TableSpan::new::<SInstance>("instance", header.instance_offset, header.instance_count);
        let raw: Vec<SInstance> =
            read_table(data, "instance table", header.instance_offset, header.instance_count)?;
        let mut instances = Vec::with_capacity(raw.len());
        for raw in raw {
            let count = raw.submodel_count as usize;
            let children = if count == 0 {
                vec![]
            } else {
                let first = submodel_span.index_of(raw.submodel_offset)?;
                submodel_span.check_run(first, count, raw.submodel_offset)?;
                submodels[first..first + count].to_vec()
            };
            instances.push(Instance {
                transform: raw.transform,
                flags: raw.flags,
                submodels: children,
            });
        }

        // LODs
        let lod_span = TableSpan::new::<SLod>("lod", header.lod_offset, header.lod_count);
        let raw: Vec<SLod> = read_table(data, "lod table", header.lod_offset, header.lod_count)?;
        let mut lods = Vec::with_capacity(raw.len());
        for raw in raw {
            let count = raw.instance_count as usize;
            let children = if count == 0 {
                vec![]
            } else {
                let first = instance_span.index_of(raw.instance_offset)?;
                instance_span.check_run(first, count, raw.instance_offset)?;
                instances[first..first + count].to_vec()
            };
            lods.push(Lod { slot_type: raw.slot_type, mask: raw.mask, instances: children });
        }

        // Models
        let raw: Vec<SModel> =
            read_table(data, "model table", header.model_offset, header.model_count)?;
        let mut models = Vec::with_capacity(raw.len());
        for raw in raw {
            let mut slots: [Option<Lod>; LOD_SLOT_COUNT] = Default::default();
            for (slot, &offset) in slots.iter_mut().zip(&raw.lod_offsets) {
                if offset != 0 {
                    *slot = Some(lods[lod_span.index_of(offset)?].clone());
                }
            }
            models.push(Model {
                transforms: raw.transforms,
                scale: raw.scale,
                bounds: raw.bounds,
                lods: slots,
                vertex_buffer: raw.vertex_buffer,
                flags: raw.flags,
            });
        }

        // Vertex buffers
        let raw: Vec<SVertexBuffer> = read_table(
            data,
            "vertex buffer table",
            header.vertex_buffer_offset,
            header.vertex_buffer_count,
        )?;
        let mut vertex_buffers = Vec::with_capacity(raw.len());
        for raw in raw {
            if raw.stride != vertex_declaration.stride() {
                return Err(FormatError::StrideMismatch {
                    stride: raw.stride,
                    expected: vertex_declaration.stride(),
                }
                .into());
            }
            let range = checked_range(
                "vertex data",
                raw.data_offset as u64,
                raw.vertex_count as u64 * raw.stride as u64,
                data.len(),
            )?;
            vertex_buffers.push(VertexBuffer { stride: raw.stride, data: data[range].to_vec() });
        }

        // Index buffer
        let range = checked_range(
            "index buffer",
            header.index_offset as u64,
            header.index_count as u64 * 2,
            data.len(),
        )?;
        let indices =
            data[range].chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();

        let materials = if header.material_table_offset == 0 {
            MaterialTable::default()
        } else {
            MaterialTable::read(data, header.material_table_offset)?
        };

        log::debug!(
            "MDPC {} v{}: {} models, {} LODs, {} instances, {} submodels",
            header.uid,
            header.version,
            models.len(),
            lods.len(),
            instances.len(),
            submodels.len()
        );
        Ok(Self {
            version,
            uid: header.uid,
            flags: header.flags,
            models,
            vertex_declaration,
            vertex_buffers,
            indices,
            materials,
        })
    }

    /// Encodes the package. Tables are written in dependency order and the
    /// header is filled in last.
    pub fn write(&self) -> Result<Vec<u8>> {
        let own = self.uid.short();
        let mut w = LeafWriter::new();
        let header_offset = w.reserve(SPackageHeader::SIZE)?;

        // Flatten the hierarchy, remembering where each parent's run starts
        let mut submodels = Vec::new();
        let mut instances = Vec::new();
        let mut lods = Vec::new();
        let mut model_lods = Vec::with_capacity(self.models.len());
        for model in &self.models {
            let mut slots = [None; LOD_SLOT_COUNT];
            for (slot, lod) in slots.iter_mut().zip(&model.lods) {
                let Some(lod) = lod else { continue };
                let first_instance = instances.len();
                for instance in &lod.instances {
                    let first_submodel = submodels.len();
                    for submodel in &instance.submodels {
                        submodels.push(SSubModel {
                            primitive: submodel.primitive as u32,
                            vertex_buffer: submodel.vertex_buffer,
                            flags: submodel.flags,
                            vertex_base: submodel.vertex_base,
                            vertex_count: submodel.vertex_count,
                            index_start: submodel.index_start,
                            index_count: submodel.index_count,
                            material_index: submodel.material.index,
                            material_owner: submodel.material.owner.to_raw(self.version, own),
                        });
                    }
                    instances.push((instance, first_submodel));
                }
                *slot = Some(lods.len());
                lods.push((lod, first_instance));
            }
            model_lods.push(slots);
        }

        w.align(4)?;
        let submodel_offset = w.write_table(&submodels)?;
        let submodel_span =
            TableSpan::new::<SSubModel>("submodel", submodel_offset, submodels.len() as u32);

        let instance_offset = w.position()?;
        for &(instance, first) in &instances {
            let count = instance.submodels.len();
            w.write_record(&SInstance {
                transform: instance.transform,
                submodel_offset: if count == 0 { 0 } else { submodel_span.offset_of(first) },
                submodel_count: u16::try_from(count)?,
                flags: instance.flags,
            })?;
        }
        let instance_span =
            TableSpan::new::<SInstance>("instance", instance_offset, instances.len() as u32);

        let lod_offset = w.position()?;
        for &(lod, first) in &lods {
            let count = lod.instances.len();
            w.write_record(&SLod {
                slot_type: lod.slot_type,
                mask: lod.mask,
                instance_offset: if count == 0 { 0 } else { instance_span.offset_of(first) },
                instance_count: count as u32,
            })?;
        }
        let lod_span = TableSpan::new::<SLod>("lod", lod_offset, lods.len() as u32);

        let model_offset = w.position()?;
        for (model, slots) in self.models.iter().zip(&model_lods) {
            w.write_record(&SModel {
                transforms: model.transforms,
                scale: model.scale,
                bounds: model.bounds,
                lod_offsets: slots.map(|slot| slot.map_or(0, |i| lod_span.offset_of(i))),
                vertex_buffer: model.vertex_buffer,
                flags: model.flags,
            })?;
        }

        // Descriptor table, then the vertex data it points at
        let stride = self.vertex_declaration.stride();
        w.align(4)?;
        let vertex_buffer_count = u32::try_from(self.vertex_buffers.len())?;
        let vertex_buffer_offset = w.reserve(vertex_buffer_count * SVertexBuffer::SIZE)?;
        for (i, buffer) in self.vertex_buffers.iter().enumerate() {
            ensure!(
                buffer.stride == stride,
                FormatError::StrideMismatch { stride: buffer.stride, expected: stride }
            );
            ensure!(
                buffer.data.len() % stride as usize == 0,
                "Vertex data size {:#X} is not a multiple of stride {stride}",
                buffer.data.len()
            );
            w.align(16)?;
            let data_offset = w.write_bytes(&buffer.data)?;
            let descriptor = SVertexBuffer {
                vertex_count: buffer.vertex_count() as u32,
                stride,
                data_offset,
            };
            w.write_record_at(vertex_buffer_offset + i as u32 * SVertexBuffer::SIZE, &descriptor)?;
        }

        let index_offset = w.position()?;
        for index in &self.indices {
            w.write_bytes(&index.to_le_bytes())?;
        }

        w.align(4)?;
        let material_table_offset = self.materials.write(&mut w)?;

        w.write_record_at(header_offset, &SPackageHeader {
            magic: K_CHUNK_MDPC,
            version: self.version.as_u32(),
            uid: self.uid,
            flags: self.flags,
            model_count: self.models.len() as u32,
            model_offset,
            lod_count: lods.len() as u32,
            lod_offset,
            instance_count: instances.len() as u32,
            instance_offset,
            submodel_count: submodels.len() as u32,
            submodel_offset,
            vertex_declaration: self.vertex_declaration as u32,
            vertex_buffer_count,
            vertex_buffer_offset,
            index_count: u32::try_from(self.indices.len())?,
            index_offset,
            material_table_offset,
        })?;
        w.align(16)?;
        Ok(w.into_inner())
    }
}
