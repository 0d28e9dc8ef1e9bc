use anyhow::{ensure, Result};
use binrw::binrw;

use crate::{
    error::FormatError,
    format::checked_range,
    util::table::{read_table, read_u32_array, LeafWriter, Record, TableSpan},
};

#[binrw]
#[derive(Clone, Debug, Default)]
pub struct SMaterialTableHeader {
    pub material_count: u32,
    pub material_offset: u32,
    pub substance_count: u32,
    pub substance_offset: u32,
    pub texture_count: u32,
    pub texture_offset: u32,
}

impl Record for SMaterialTableHeader {
    const SIZE: u32 = 24;
}

#[binrw]
#[derive(Clone, Debug)]
pub struct SMaterial {
    pub flags: u32,
    pub substance_offset: u32,
    pub substance_count: u16,
    pub reserved: u16,
}

impl Record for SMaterial {
    const SIZE: u32 = 12;
}

#[binrw]
#[derive(Clone, Debug)]
pub struct SSubstance {
    pub bin: u8,
    pub flags: u8,
    pub mode: [u8; 3],
    pub reserved: u8,
    pub texture_flags: u16,
    pub texture_ref_offset: u32,
}

impl Record for SSubstance {
    const SIZE: u32 = 12;
}

#[binrw]
#[derive(Clone, Debug)]
pub struct STexture {
    pub uid: u32,
    pub hash: u32,
    pub kind: u16,
    pub flags: u16,
    pub width: u16,
    pub height: u16,
    pub data_offset: u32,
    pub data_size: u32,
}

impl Record for STexture {
    const SIZE: u32 = 24;
}

/// Shape of a substance's texture list.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum TextureFlags {
    #[default]
    None = 0,
    Clean = 1,
    CleanDamage = 2,
    ColorMask = 3,
    /// Clean + damage, color mask stored in their alpha
    DplColorMask = 4,
    /// Clean, damage, clean mask, damage mask
    DamageColorMask = 5,
}

impl TextureFlags {
    pub fn from_u16(value: u16, offset: u64) -> Result<Self, FormatError> {
        Ok(match value {
            0 => Self::None,
            1 => Self::Clean,
            2 => Self::CleanDamage,
            3 => Self::ColorMask,
            4 => Self::DplColorMask,
            5 => Self::DamageColorMask,
            value => {
                return Err(FormatError::InvalidValue {
                    what: "texture flags",
                    value: value as u64,
                    offset,
                })
            }
        })
    }

    pub const fn texture_count(self) -> usize {
        match self {
            TextureFlags::None => 0,
            TextureFlags::Clean => 1,
            TextureFlags::CleanDamage | TextureFlags::ColorMask | TextureFlags::DplColorMask => 2,
            TextureFlags::DamageColorMask => 4,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Texture {
    pub uid: u32,
    /// CRC-32 of `data`
    pub hash: u32,
    pub kind: u16,
    pub flags: u16,
    pub width: u16,
    pub height: u16,
    /// Encoded image (DDS)
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Substance {
    pub bin: u8,
    pub flags: u8,
    pub mode: [u8; 3],
    pub reserved: u8,
    pub texture_flags: TextureFlags,
    /// Indices into the owning table's textures; length fixed by `texture_flags`.
    pub textures: Vec<usize>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Material {
    pub flags: u32,
    pub reserved: u16,
    pub substances: Vec<Substance>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaterialTable {
    pub materials: Vec<Material>,
    pub textures: Vec<Texture>,
}

impl MaterialTable {
    /// Index of a texture with the same identity, if present.
    pub fn find_texture(&self, uid: u32, hash: u32) -> Option<usize> {
        self.textures.iter().position(|t| t.uid == uid && t.hash == hash)
    }

    /// Adds a texture unless one with the same identity exists.
    pub fn add_texture(&mut self, texture: Texture) -> usize {
        if let Some(index) = self.find_texture(texture.uid, texture.hash) {
            return index;
        }
        self.textures.push(texture);
        self.textures.len() - 1
    }

    /// Decodes the material table whose header is at `offset`.
    ///
    /// Textures are read first, then substances resolve their texture
    /// references, then materials resolve their substance runs.
    pub fn read(data: &[u8], offset: u32) -> Result<Self> {
        let header: SMaterialTableHeader =
            read_table(data, "material table header", offset, 1)?.remove(0);

        let raw_textures: Vec<STexture> =
            read_table(data, "texture table", header.texture_offset, header.texture_count)?;
        let texture_span =
            TableSpan::new::<STexture>("texture", header.texture_offset, header.texture_count);
        let mut textures = Vec::with_capacity(raw_textures.len());
        for raw in raw_textures {
            let range = checked_range(
                "texture data",
                raw.data_offset as u64,
                raw.data_size as u64,
                data.len(),
            )?;
            textures.push(Texture {
                uid: raw.uid,
                hash: raw.hash,
                kind: raw.kind,
                flags: raw.flags,
                width: raw.width,
                height: raw.height,
                data: data[range].to_vec(),
            });
        }

        let raw_substances: Vec<SSubstance> =
            read_table(data, "substance table", header.substance_offset, header.substance_count)?;
        let substance_span = TableSpan::new::<SSubstance>(
            "substance",
            header.substance_offset,
            header.substance_count,
        );
        let mut substances = Vec::with_capacity(raw_substances.len());
        for (i, raw) in raw_substances.into_iter().enumerate() {
            let record_offset = substance_span.offset_of(i) as u64;
            let texture_flags = TextureFlags::from_u16(raw.texture_flags, record_offset + 8)?;
            let count = texture_flags.texture_count() as u32;
            let mut refs = Vec::with_capacity(count as usize);
            if count > 0 {
                for texture_offset in
                    read_u32_array(data, "texture references", raw.texture_ref_offset, count)?
                {
                    refs.push(texture_span.index_of(texture_offset)?);
                }
            }
            substances.push(Substance {
                bin: raw.bin,
                flags: raw.flags,
                mode: raw.mode,
                reserved: raw.reserved,
                texture_flags,
                textures: refs,
            });
        }

        let raw_materials: Vec<SMaterial> =
            read_table(data, "material table", header.material_offset, header.material_count)?;
        let mut materials = Vec::with_capacity(raw_materials.len());
        for raw in raw_materials {
            let count = raw.substance_count as usize;
            let material_substances = if count == 0 {
                vec![]
            } else {
                let first = substance_span.index_of(raw.substance_offset)?;
                substance_span.check_run(first, count, raw.substance_offset)?;
                substances[first..first + count].to_vec()
            };
            materials.push(Material {
                flags: raw.flags,
                reserved: raw.reserved,
                substances: material_substances,
            });
        }
        log::debug!(
            "Material table @ {:#X}: {} materials, {} substances, {} textures",
            offset,
            materials.len(),
            substances.len(),
            textures.len()
        );
        Ok(Self { materials, textures })
    }

    /// Encodes the table in dependency order, returning the header offset.
    pub fn write(&self, w: &mut LeafWriter) -> Result<u32> {
        // Texture data
        let mut data_offsets = Vec::with_capacity(self.textures.len());
        for texture in &self.textures {
            w.align(16)?;
            data_offsets.push(w.write_bytes(&texture.data)?);
        }

        // Textures
        w.align(4)?;
        let texture_offset = w.position()?;
        let texture_span =
            TableSpan::new::<STexture>("texture", texture_offset, self.textures.len() as u32);
        for (texture, &data_offset) in self.textures.iter().zip(&data_offsets) {
            w.write_record(&STexture {
                uid: texture.uid,
                hash: texture.hash,
                kind: texture.kind,
                flags: texture.flags,
                width: texture.width,
                height: texture.height,
                data_offset,
                data_size: u32::try_from(texture.data.len())?,
            })?;
        }

        // Texture reference arrays
        let mut ref_offsets = Vec::new();
        for substance in self.materials.iter().flat_map(|m| &m.substances) {
            ensure!(
                substance.textures.len() == substance.texture_flags.texture_count(),
                "Substance with {:?} has {} textures, expected {}",
                substance.texture_flags,
                substance.textures.len(),
                substance.texture_flags.texture_count()
            );
            if substance.textures.is_empty() {
                ref_offsets.push(0);
                continue;
            }
            let offset = w.position()?;
            for &index in &substance.textures {
                ensure!(index < self.textures.len(), "Texture index {index} out of range");
                w.write_bytes(&texture_span.offset_of(index).to_le_bytes())?;
            }
            ref_offsets.push(offset);
        }

        // Substances
        let substance_offset = w.position()?;
        let mut substance_count = 0u32;
        for (substance, texture_ref_offset) in
            self.materials.iter().flat_map(|m| &m.substances).zip(ref_offsets)
        {
            w.write_record(&SSubstance {
                bin: substance.bin,
                flags: substance.flags,
                mode: substance.mode,
                reserved: substance.reserved,
                texture_flags: substance.texture_flags as u16,
                texture_ref_offset,
            })?;
            substance_count += 1;
        }

        // Materials
        let material_offset = w.position()?;
        let mut first_substance = 0u32;
        for material in &self.materials {
            let count = material.substances.len() as u32;
            w.write_record(&SMaterial {
                flags: material.flags,
                substance_offset: if count == 0 {
                    0
                } else {
                    substance_offset + first_substance * SSubstance::SIZE
                },
                substance_count: u16::try_from(count)?,
                reserved: material.reserved,
            })?;
            first_substance += count;
        }

        w.write_record(&SMaterialTableHeader {
            material_count: self.materials.len() as u32,
            material_offset,
            substance_count,
            substance_offset,
            texture_count: self.textures.len() as u32,
            texture_offset,
        })
    }
}
