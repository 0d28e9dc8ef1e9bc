use std::{
    fs::{DirBuilder, File},
    io::BufWriter,
    path::Path,
};

use anyhow::{Context, Result};
use memmap2::{Mmap, MmapOptions};

/// Opens a chunk file as a read-only memory map.
///
/// Leaves parsed from the map borrow from it, so large payloads are only
/// paged in when they are actually touched.
pub fn map_file<P: AsRef<Path>>(path: P) -> Result<Mmap> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("Failed to open file '{}'", path.display()))?;
    let map = unsafe { MmapOptions::new().map(&file) }
        .with_context(|| format!("Failed to mmap file '{}'", path.display()))?;
    Ok(map)
}

/// Creates (or truncates) an output file, creating parent directories as needed.
pub fn create_file<P: AsRef<Path>>(path: P) -> Result<BufWriter<File>> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        DirBuilder::new()
            .recursive(true)
            .create(parent)
            .with_context(|| format!("Failed to create directory '{}'", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create output file '{}'", path.display()))?;
    Ok(BufWriter::new(file))
}
