use std::collections::HashMap;

use anyhow::{anyhow, Result};
use image::RgbaImage;

use crate::{
    convert::directory::MaterialDirectory,
    error::Diagnostic,
    format::{
        mdpc::{MaterialHandle, MaterialOwner, ModelPackage},
        mtrl::{Material, MaterialTable, Substance, TextureFlags},
        txtr::{alpha_to_color, decode_dds, red_to_alpha, texture_from_image},
        FormatVersion, Uid,
    },
};

// Driv3r substance flags
pub const SUBSTANCE_SPECULAR: u8 = 0x01;
pub const SUBSTANCE_EMISSIVE: u8 = 0x04;
// DPL bit patterns carrying the same meaning
pub const DPL_SPECULAR_MODE: u8 = 0x06;
pub const DPL_EMISSIVE_FLAGS: u8 = 0x18;

/// Rewrites one substance for the target version. Texture indices in the
/// input refer to the source table, those in the output to the destination.
pub type SubstanceFixup = fn(&Substance, &mut TextureContext<'_>) -> Result<Substance>;

pub struct FixupRule {
    pub source: FormatVersion,
    pub target: FormatVersion,
    pub substance: SubstanceFixup,
    /// UID given to converted packages when none is requested
    pub placeholder_uid: Option<Uid>,
}

pub static FIXUP_RULES: [FixupRule; 2] = [
    FixupRule {
        source: FormatVersion::Dpl,
        target: FormatVersion::Driv3r,
        substance: expand_dpl_substance,
        placeholder_uid: Some(Uid::new(0xFF, 0)),
    },
    FixupRule {
        source: FormatVersion::Driv3r,
        target: FormatVersion::Dpl,
        substance: collapse_driv3r_substance,
        placeholder_uid: None,
    },
];

/// Rule for a version pair, or `None` for passthrough.
pub fn fixup_rule(source: FormatVersion, target: FormatVersion) -> Option<&'static FixupRule> {
    FIXUP_RULES.iter().find(|r| r.source == source && r.target == target)
}

/// DPL to Driv3r flag bits.
pub fn expand_dpl_flags(substance: &Substance) -> Substance {
    let mut out = substance.clone();
    out.mode[2] = 0;
    if out.mode[0] & DPL_SPECULAR_MODE == DPL_SPECULAR_MODE {
        out.mode[0] &= !DPL_SPECULAR_MODE;
        out.flags |= SUBSTANCE_SPECULAR;
    }
    if out.flags & DPL_EMISSIVE_FLAGS == DPL_EMISSIVE_FLAGS {
        out.flags &= !DPL_EMISSIVE_FLAGS;
        out.flags |= SUBSTANCE_EMISSIVE;
    }
    out
}

/// Driv3r to DPL flag bits.
pub fn collapse_driv3r_flags(substance: &Substance) -> Substance {
    let mut out = substance.clone();
    if out.flags & SUBSTANCE_SPECULAR != 0 {
        out.flags &= !SUBSTANCE_SPECULAR;
        out.mode[0] |= DPL_SPECULAR_MODE;
    }
    if out.flags & SUBSTANCE_EMISSIVE != 0 {
        out.flags &= !SUBSTANCE_EMISSIVE;
        out.flags |= DPL_EMISSIVE_FLAGS;
    }
    out
}

/// Same substance with its textures copied into the destination.
pub fn passthrough_substance(
    substance: &Substance,
    ctx: &mut TextureContext<'_>,
) -> Result<Substance> {
    let mut out = substance.clone();
    out.textures = ctx.copy_all(&substance.textures)?;
    Ok(out)
}

/// Clean + damage with masks in alpha, to clean, damage and two explicit masks.
pub fn expand_dpl_substance(
    substance: &Substance,
    ctx: &mut TextureContext<'_>,
) -> Result<Substance> {
    let mut out = expand_dpl_flags(substance);
    out.textures = ctx.copy_all(&substance.textures)?;
    if substance.texture_flags == TextureFlags::DplColorMask && substance.textures.len() == 2 {
        let masks = ctx.synthesize(TextureOp::ExtractMasks, &substance.textures, |images| {
            Ok(images.iter().map(alpha_to_color).collect())
        })?;
        if let Some(masks) = masks {
            out.texture_flags = TextureFlags::DamageColorMask;
            out.textures.extend(masks);
        }
    }
    Ok(out)
}

/// Clean, damage and two masks, to clean + damage carrying the masks in alpha.
pub fn collapse_driv3r_substance(
    substance: &Substance,
    ctx: &mut TextureContext<'_>,
) -> Result<Substance> {
    let mut out = collapse_driv3r_flags(substance);
    if substance.texture_flags == TextureFlags::DamageColorMask && substance.textures.len() == 4 {
        let merged = ctx.synthesize(TextureOp::MergeMasks, &substance.textures, |images| {
            Ok(vec![red_to_alpha(&images[0], &images[2])?, red_to_alpha(&images[1], &images[3])?])
        })?;
        if let Some(merged) = merged {
            out.texture_flags = TextureFlags::DplColorMask;
            out.textures = merged;
            return Ok(out);
        }
    }
    out.textures = ctx.copy_all(&substance.textures)?;
    Ok(out)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TextureOp {
    ExtractMasks,
    MergeMasks,
}

type SynthesisKey = (TextureOp, Vec<(u32, u32)>);

/// Texture access for substance fixups: reads from a source table and adds
/// to the destination on first use.
pub struct TextureContext<'a> {
    source: &'a MaterialTable,
    dest: &'a mut MaterialTable,
    synthesized: &'a mut HashMap<SynthesisKey, Option<Vec<usize>>>,
    diagnostics: &'a mut Vec<Diagnostic>,
}

impl TextureContext<'_> {
    /// Copies a source texture, returning its destination index.
    pub fn copy(&mut self, index: usize) -> Result<usize> {
        let texture = self
            .source
            .textures
            .get(index)
            .ok_or_else(|| anyhow!("Texture index {index} out of range"))?;
        Ok(match self.dest.find_texture(texture.uid, texture.hash) {
            Some(existing) => existing,
            None => self.dest.add_texture(texture.clone()),
        })
    }

    pub fn copy_all(&mut self, indices: &[usize]) -> Result<Vec<usize>> {
        indices.iter().map(|&i| self.copy(i)).collect()
    }

    /// Builds new textures from decoded source images. Output `i` inherits
    /// kind and flags from source `i`. Returns `None`, with a diagnostic, if
    /// any source cannot be transcoded. Results are memoized per source set.
    pub fn synthesize<F>(
        &mut self,
        op: TextureOp,
        sources: &[usize],
        f: F,
    ) -> Result<Option<Vec<usize>>>
    where
        F: FnOnce(&[RgbaImage]) -> Result<Vec<RgbaImage>>,
    {
        let source = self.source;
        let mut textures = Vec::with_capacity(sources.len());
        for &index in sources {
            let texture = source
                .textures
                .get(index)
                .ok_or_else(|| anyhow!("Texture index {index} out of range"))?;
            textures.push(texture);
        }
        let key: SynthesisKey = (op, textures.iter().map(|t| (t.uid, t.hash)).collect());
        if let Some(result) = self.synthesized.get(&key) {
            return Ok(result.clone());
        }

        let images: Result<Vec<RgbaImage>> = textures
            .iter()
            .map(|t| decode_dds(&t.data).map_err(|e| anyhow!("{:08X}: {e}", t.uid)))
            .collect();
        let result = images.and_then(|images| {
            let outputs = f(&images)?;
            outputs
                .iter()
                .zip(&textures)
                .map(|(image, template)| texture_from_image(template, image))
                .collect::<Result<Vec<_>>>()
        });
        let result = match result {
            Ok(new_textures) => {
                Some(new_textures.into_iter().map(|t| self.dest.add_texture(t)).collect())
            }
            Err(e) => {
                let uid = textures.first().map_or(0, |t| t.uid);
                log::warn!("Failed to transcode texture set {uid:08X} ({op:?}): {e}");
                self.diagnostics
                    .push(Diagnostic::TextureTranscode { uid, message: format!("{op:?}: {e}") });
                None
            }
        };
        self.synthesized.insert(key, result.clone());
        Ok(result)
    }
}

/// Material handle and substance rewriting for one conversion.
pub struct MaterialFixups<'a> {
    source: &'a ModelPackage,
    target: FormatVersion,
    rule: Option<&'static FixupRule>,
    directory: &'a dyn MaterialDirectory,
    materials: MaterialTable,
    /// (owner, index) of copied global materials to their destination index
    globals: HashMap<(u16, u16), u16>,
    synthesized: HashMap<SynthesisKey, Option<Vec<usize>>>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> MaterialFixups<'a> {
    pub fn new(
        source: &'a ModelPackage,
        target: FormatVersion,
        directory: &'a dyn MaterialDirectory,
    ) -> Self {
        Self {
            source,
            target,
            rule: fixup_rule(source.version, target),
            directory,
            materials: MaterialTable::default(),
            globals: HashMap::new(),
            synthesized: HashMap::new(),
            diagnostics: vec![],
        }
    }

    pub fn rule(&self) -> Option<&'static FixupRule> { self.rule }

    /// Copies the source package's own materials in order, so local indices
    /// stay valid in the destination. Without a rule the texture list is
    /// carried over whole, unreferenced entries included.
    pub fn copy_local_materials(&mut self) -> Result<()> {
        let (source, rule) = (self.source, self.rule);
        if rule.is_none() {
            for texture in &source.materials.textures {
                self.materials.add_texture(texture.clone());
            }
        }
        for material in &source.materials.materials {
            self.copy_material(material, &source.materials, rule)?;
        }
        Ok(())
    }

    fn copy_material(
        &mut self,
        material: &Material,
        table: &MaterialTable,
        rule: Option<&'static FixupRule>,
    ) -> Result<u16> {
        let fixup = rule.map_or(passthrough_substance as SubstanceFixup, |r| r.substance);
        let mut ctx = TextureContext {
            source: table,
            dest: &mut self.materials,
            synthesized: &mut self.synthesized,
            diagnostics: &mut self.diagnostics,
        };
        let substances = material
            .substances
            .iter()
            .map(|s| fixup(s, &mut ctx))
            .collect::<Result<Vec<_>>>()?;
        let index = u16::try_from(self.materials.materials.len())?;
        self.materials.materials.push(Material {
            flags: material.flags,
            reserved: material.reserved,
            substances,
        });
        Ok(index)
    }

    /// Rewrites a submodel's material handle for the destination package.
    pub fn fixup_handle(&mut self, model: usize, handle: MaterialHandle) -> Result<MaterialHandle> {
        let own = self.source.uid.short();
        match handle.owner {
            MaterialOwner::ThisPackage => Ok(self.local_handle(model, handle)),
            MaterialOwner::Global(owner) if owner == own => Ok(self.local_handle(model, handle)),
            MaterialOwner::Shadow => Ok(handle),
            MaterialOwner::Unresolved => Ok(MaterialHandle::UNRESOLVED),
            MaterialOwner::Global(owner) => {
                if let Some(&index) = self.globals.get(&(owner, handle.index)) {
                    return Ok(MaterialHandle::local(index));
                }
                let directory = self.directory;
                let Some(found) = directory.find(handle) else {
                    log::warn!("Model {model}: global material {handle} not found");
                    self.diagnostics.push(Diagnostic::UnresolvedMaterial { model, handle });
                    return Ok(MaterialHandle::UNRESOLVED);
                };
                // The global table may use a different layout than the source
                let rule = fixup_rule(found.version, self.target);
                let index = self.copy_material(found.material, found.table, rule)?;
                log::debug!("Copied global material {handle} ({:?}) to #{index}", found.version);
                self.globals.insert((owner, handle.index), index);
                Ok(MaterialHandle::local(index))
            }
        }
    }

    fn local_handle(&mut self, model: usize, handle: MaterialHandle) -> MaterialHandle {
        if (handle.index as usize) < self.source.materials.materials.len() {
            MaterialHandle::local(handle.index)
        } else {
            log::warn!("Model {model}: local material {handle} out of range");
            self.diagnostics.push(Diagnostic::InvalidLocalMaterial { model, handle });
            MaterialHandle::UNRESOLVED
        }
    }

    pub fn finish(self) -> (MaterialTable, Vec<Diagnostic>) { (self.materials, self.diagnostics) }
}
