use anyhow::Result;
use indexmap::IndexMap;

use crate::format::{
    chunk::ChunkFile,
    mdpc::{MaterialHandle, MaterialOwner, ModelPackage, K_CHUNK_MDPC},
    mtrl::{Material, MaterialTable},
    FormatVersion,
};

/// A material together with the table its texture indices refer to.
#[derive(Copy, Clone, Debug)]
pub struct MaterialRef<'a> {
    pub material: &'a Material,
    pub table: &'a MaterialTable,
    /// Layout of the package owning `table`
    pub version: FormatVersion,
}

/// Read-only lookup of materials owned by other packages.
pub trait MaterialDirectory {
    /// Resolves a global handle. Non-global handles are never found.
    fn find(&self, handle: MaterialHandle) -> Option<MaterialRef<'_>>;
}

/// Directory without any global materials.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoGlobals;

impl MaterialDirectory for NoGlobals {
    fn find(&self, _handle: MaterialHandle) -> Option<MaterialRef<'_>> { None }
}

/// Material tables of global packages, keyed by short UID.
#[derive(Clone, Debug, Default)]
pub struct GlobalMaterials {
    tables: IndexMap<u16, (FormatVersion, MaterialTable)>,
}

impl GlobalMaterials {
    pub fn new() -> Self { Self::default() }

    /// Registers a package's material table, replacing any with the same short UID.
    pub fn insert(&mut self, package: &ModelPackage) {
        let short = package.uid.short();
        let entry = (package.version, package.materials.clone());
        if self.tables.insert(short, entry).is_some() {
            log::warn!("Global package {:04X} registered twice; keeping the last", short);
        }
    }

    /// Registers every model package found in a chunk tree.
    pub fn insert_chunks(&mut self, file: &ChunkFile) -> Result<usize> {
        let mut count = 0;
        for chunk in file.find_all(K_CHUNK_MDPC) {
            let Some(data) = chunk.bytes() else { continue };
            let package = ModelPackage::read(data)?;
            log::debug!(
                "Global package {} with {} materials",
                package.uid,
                package.materials.materials.len()
            );
            self.insert(&package);
            count += 1;
        }
        Ok(count)
    }

    pub fn len(&self) -> usize { self.tables.len() }

    pub fn is_empty(&self) -> bool { self.tables.is_empty() }
}

impl MaterialDirectory for GlobalMaterials {
    fn find(&self, handle: MaterialHandle) -> Option<MaterialRef<'_>> {
        let MaterialOwner::Global(owner) = handle.owner else { return None };
        let (version, table) = self.tables.get(&owner)?;
        let material = table.materials.get(handle.index as usize)?;
        Some(MaterialRef { material, table, version: *version })
    }
}
