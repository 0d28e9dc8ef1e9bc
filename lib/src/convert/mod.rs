pub mod compile;
pub mod directory;
pub mod fixup;
pub mod weld;

use anyhow::Result;

use crate::{
    convert::{
        directory::MaterialDirectory,
        fixup::MaterialFixups,
        weld::{Tolerance, WeldIndex, WeldPredicate, DEFAULT_WELD_TOLERANCE},
    },
    error::{ConvertError, Diagnostic, FormatError},
    format::{
        mdpc::{Instance, Lod, LodSlot, Model, ModelPackage, Primitive, SubModel, LOD_SLOT_COUNT},
        vertex::{Vertex, VertexBuffer},
        FormatVersion, Uid,
    },
};

#[derive(Clone, Debug)]
pub struct ConvertOptions {
    pub target: FormatVersion,
    /// UID of the converted package. Defaults to the version pair's placeholder,
    /// then to the source UID.
    pub target_uid: Option<Uid>,
    /// Weld epsilon
    pub tolerance: f32,
}

impl ConvertOptions {
    pub fn new(target: FormatVersion) -> Self {
        Self { target, target_uid: None, tolerance: DEFAULT_WELD_TOLERANCE }
    }
}

#[derive(Clone, Debug)]
pub struct Conversion {
    pub package: ModelPackage,
    pub diagnostics: Vec<Diagnostic>,
}

/// Builds a new package in the target format from `source`.
///
/// Geometry is re-welded per model into a single vertex buffer, strips and
/// fans become triangle lists, and every material handle is rewritten for the
/// target. Global materials are copied in through `directory`.
pub fn convert(
    source: &ModelPackage,
    options: &ConvertOptions,
    directory: &dyn MaterialDirectory,
) -> Result<Conversion> {
    let slot_maps = validate_source(source)?;

    let mut fixups = MaterialFixups::new(source, options.target, directory);
    let uid = options
        .target_uid
        .or_else(|| fixups.rule().and_then(|r| r.placeholder_uid))
        .unwrap_or(source.uid);
    log::info!(
        "Converting {} ({}) to {} ({})",
        source.uid,
        source.version,
        uid,
        options.target
    );
    fixups.copy_local_materials()?;

    let decl = source.vertex_declaration;
    let source_buffer = &source.vertex_buffers[0];
    let source_vertices = source_buffer.vertices(decl)?;
    let mut weld = WeldIndex::new(Tolerance(options.tolerance));
    let mut indices = Vec::new();
    let mut models = Vec::with_capacity(source.models.len());
    for (model_index, (model, slot_map)) in source.models.iter().zip(slot_maps).enumerate() {
        weld.begin_model();
        let mut lods: [Option<Lod>; LOD_SLOT_COUNT] = Default::default();
        for (lod, target_slot) in model.lods.iter().zip(slot_map) {
            let (Some(lod), Some(target_slot)) = (lod, target_slot) else { continue };
            let mut instances = Vec::with_capacity(lod.instances.len());
            for instance in &lod.instances {
                let mut submodels = Vec::with_capacity(instance.submodels.len());
                for submodel in &instance.submodels {
                    let mut out = rebuild_submodel(
                        model_index,
                        submodel,
                        &source.indices,
                        &source_vertices,
                        &mut weld,
                        &mut indices,
                    )?;
                    out.material = fixups.fixup_handle(model_index, submodel.material)?;
                    submodels.push(out);
                }
                instances.push(Instance {
                    transform: instance.transform,
                    flags: instance.flags,
                    submodels,
                });
            }
            lods[target_slot.index()] = Some(Lod {
                slot_type: target_slot as u32,
                mask: lod.mask,
                instances,
            });
        }
        models.push(Model {
            transforms: model.transforms,
            scale: model.scale,
            bounds: model.bounds,
            lods,
            vertex_buffer: 0,
            flags: model.flags,
        });
    }

    let (materials, diagnostics) = fixups.finish();
    let vertices = weld.into_vertices();
    log::info!(
        "Rebuilt {} vertices ({} in source), {} indices, {} materials, {} diagnostics",
        vertices.len(),
        source_vertices.len(),
        indices.len(),
        materials.materials.len(),
        diagnostics.len()
    );
    Ok(Conversion {
        package: ModelPackage {
            version: options.target,
            uid,
            flags: source.flags,
            models,
            vertex_declaration: decl,
            vertex_buffers: vec![VertexBuffer::from_vertices(decl, &vertices)],
            indices,
            materials,
        },
        diagnostics,
    })
}

type SlotMap = [Option<LodSlot>; LOD_SLOT_COUNT];

/// Rejects unsupported sources before any output is built, returning the
/// target slot of every populated LOD.
fn validate_source(source: &ModelPackage) -> Result<Vec<SlotMap>> {
    if source.vertex_buffers.len() != 1 {
        return Err(ConvertError::VertexBufferCount(source.vertex_buffers.len()).into());
    }
    let mut maps = Vec::with_capacity(source.models.len());
    for (model_index, model) in source.models.iter().enumerate() {
        let mut map: SlotMap = [None; LOD_SLOT_COUNT];
        let mut taken = [false; LOD_SLOT_COUNT];
        for (slot_index, lod) in model.lods.iter().enumerate() {
            let Some(lod) = lod else { continue };
            let slot = LodSlot::from_slot_type(lod.slot_type)
                .filter(|s| !taken[s.index()])
                .ok_or(ConvertError::UnmappedLodSlot {
                    model: model_index,
                    slot_type: lod.slot_type,
                })?;
            if lod.instances.is_empty() {
                let slot = slot_index;
                return Err(ConvertError::MissingGeometry { model: model_index, slot }.into());
            }
            taken[slot.index()] = true;
            map[slot_index] = Some(slot);
        }
        maps.push(map);
    }
    Ok(maps)
}

/// Triangles of a submodel, as indices relative to its vertex base.
fn triangulate(primitive: Primitive, indices: &[u16], offset: u64) -> Result<Vec<[u16; 3]>> {
    Ok(match primitive {
        Primitive::TriangleList => {
            if indices.len() % 3 != 0 {
                return Err(FormatError::InvalidValue {
                    what: "triangle list index count",
                    value: indices.len() as u64,
                    offset,
                }
                .into());
            }
            indices.chunks_exact(3).map(|t| [t[0], t[1], t[2]]).collect()
        }
        Primitive::TriangleStrip => indices
            .windows(3)
            .enumerate()
            .map(|(i, t)| if i % 2 == 0 { [t[0], t[1], t[2]] } else { [t[1], t[0], t[2]] })
            .filter(|t| !is_degenerate(t))
            .collect(),
        Primitive::TriangleFan => match indices.split_first() {
            Some((&center, rest)) => rest
                .windows(2)
                .map(|t| [center, t[0], t[1]])
                .filter(|t| !is_degenerate(t))
                .collect(),
            None => vec![],
        },
    })
}

#[inline]
fn is_degenerate(t: &[u16; 3]) -> bool { t[0] == t[1] || t[1] == t[2] || t[0] == t[2] }

/// Welds one submodel's geometry into the output buffers.
fn rebuild_submodel<P: WeldPredicate>(
    model: usize,
    submodel: &SubModel,
    source_indices: &[u16],
    source_vertices: &[Vertex],
    weld: &mut WeldIndex<P>,
    indices: &mut Vec<u16>,
) -> Result<SubModel> {
    let vertex_end = submodel.vertex_base as u64 + submodel.vertex_count as u64;
    if vertex_end > source_vertices.len() as u64 {
        return Err(FormatError::OutOfBounds {
            what: "submodel vertices",
            offset: submodel.vertex_base as u64,
            size: submodel.vertex_count as u64,
            len: source_vertices.len() as u64,
        }
        .into());
    }
    let index_range = crate::format::checked_range(
        "submodel indices",
        submodel.index_start as u64,
        submodel.index_count as u64,
        source_indices.len(),
    )?;
    let triangles =
        triangulate(submodel.primitive, &source_indices[index_range], submodel.index_start as u64)?;

    let base = weld.base();
    let index_start = indices.len();
    let mut max_index = 0usize;
    for triangle in &triangles {
        for &rel in triangle {
            // Indices may only reach the submodel's own vertex range
            if rel as u32 >= submodel.vertex_count {
                return Err(FormatError::OutOfBounds {
                    what: "vertex index",
                    offset: rel as u64,
                    size: 1,
                    len: submodel.vertex_count as u64,
                }
                .into());
            }
            let abs = submodel.vertex_base as usize + rel as usize;
            let vertex = source_vertices.get(abs).ok_or(FormatError::OutOfBounds {
                what: "vertex index",
                offset: abs as u64,
                size: 1,
                len: source_vertices.len() as u64,
            })?;
            let rebased = weld.insert(*vertex) - base;
            let Ok(index) = u16::try_from(rebased) else {
                let count = weld.len() - base;
                return Err(ConvertError::TooManyVertices { model, count }.into());
            };
            max_index = max_index.max(rebased);
            indices.push(index);
        }
    }
    let index_count = indices.len() - index_start;
    Ok(SubModel {
        primitive: Primitive::TriangleList,
        vertex_buffer: 0,
        flags: submodel.flags,
        vertex_base: base as u32,
        vertex_count: if index_count == 0 { 0 } else { max_index as u32 + 1 },
        index_start: index_start as u32,
        index_count: index_count as u32,
        material: submodel.material,
    })
}
