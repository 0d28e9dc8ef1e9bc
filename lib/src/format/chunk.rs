use std::{
    borrow::Cow,
    io::{Seek, SeekFrom, Write},
    mem::size_of,
};

use anyhow::{anyhow, ensure, Result};
use zerocopy::{AsBytes, FromBytes, FromZeroes, LittleEndian, U16, U32};

use crate::{
    error::FormatError,
    format::{checked_range, peek_four_cc, FourCC},
    util::align_up,
};

// Chunk container
pub const K_CHUNK_CHNK: FourCC = FourCC(*b"CHNK");
pub const CHUNK_VERSION: u32 = 3;
// Chunks are padded to this boundary at their end
pub const CHUNK_END_ALIGN: u64 = 16;
pub const MAX_ALIGN: u8 = 15;
/// Deepest package nesting accepted when reading
pub const MAX_CHUNK_DEPTH: u32 = 64;

#[derive(Copy, Clone, Debug, Default, PartialEq, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct ChunkHeader {
    pub magic: FourCC,
    pub size: U32<LittleEndian>,
    pub count: U32<LittleEndian>,
    pub version: U32<LittleEndian>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct ChunkEntry {
    pub id: FourCC,
    pub offset: U32<LittleEndian>,
    pub version: u8,
    pub align: u8,
    pub reserved: U16<LittleEndian>,
    pub size: U32<LittleEndian>,
}

pub const CHUNK_HEADER_SIZE: usize = size_of::<ChunkHeader>();
pub const CHUNK_ENTRY_SIZE: usize = size_of::<ChunkEntry>();

/// Payload of a chunk node: either raw bytes or a nested container.
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkData<'a> {
    Buffer(Cow<'a, [u8]>),
    Package(ChunkFile<'a>),
}

/// One node of the chunk tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk<'a> {
    pub id: FourCC,
    pub version: u8,
    /// Alignment of the payload, as a power of two.
    pub align: u8,
    pub reserved: u16,
    pub data: ChunkData<'a>,
}

impl<'a> Chunk<'a> {
    pub fn buffer<D: Into<Cow<'a, [u8]>>>(id: FourCC, version: u8, align: u8, data: D) -> Self {
        Self { id, version, align, reserved: 0, data: ChunkData::Buffer(data.into()) }
    }

    pub fn package(id: FourCC, version: u8, align: u8, file: ChunkFile<'a>) -> Self {
        Self { id, version, align, reserved: 0, data: ChunkData::Package(file) }
    }

    /// Leaf payload, or `None` for packages.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.data {
            ChunkData::Buffer(data) => Some(data),
            ChunkData::Package(_) => None,
        }
    }

    /// Replaces the payload with owned bytes.
    pub fn replace_data(&mut self, data: Vec<u8>) {
        self.data = ChunkData::Buffer(Cow::Owned(data));
    }
}

/// A chunk container: the root of a file or a nested package.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkFile<'a> {
    pub version: u32,
    pub children: Vec<Chunk<'a>>,
}

impl Default for ChunkFile<'_> {
    fn default() -> Self { Self { version: CHUNK_VERSION, children: vec![] } }
}

impl<'a> ChunkFile<'a> {
    pub fn new(children: Vec<Chunk<'a>>) -> Self { Self { version: CHUNK_VERSION, children } }

    /// Parses a container. Leaf payloads borrow from `data`.
    pub fn read(data: &'a [u8]) -> Result<Self> { Self::read_at(data, 0, 0) }

    fn read_at(data: &'a [u8], base: u64, depth: u32) -> Result<Self> {
        if depth > MAX_CHUNK_DEPTH {
            return Err(FormatError::InvalidValue {
                what: "chunk nesting depth",
                value: depth as u64,
                offset: base,
            }
            .into());
        }
        let header = ChunkHeader::read_from_prefix(data).ok_or_else(|| {
            anyhow!(FormatError::OutOfBounds {
                what: "chunk header",
                offset: base,
                size: CHUNK_HEADER_SIZE as u64,
                len: data.len() as u64,
            })
        })?;
        if header.magic != K_CHUNK_CHNK {
            return Err(FormatError::BadMagic {
                expected: K_CHUNK_CHNK,
                found: header.magic,
                offset: base,
            }
            .into());
        }
        let version = header.version.get();
        if version != CHUNK_VERSION {
            return Err(FormatError::Version { what: "chunk", version }.into());
        }
        let size = header.size.get() as u64;
        let data = &data[checked_range("chunk", 0, size, data.len())?];
        let count = header.count.get() as u64;
        let table_range = checked_range(
            "chunk entry table",
            CHUNK_HEADER_SIZE as u64,
            count * CHUNK_ENTRY_SIZE as u64,
            data.len(),
        )?;
        let mut children = Vec::with_capacity(count as usize);
        for raw in data[table_range].chunks_exact(CHUNK_ENTRY_SIZE) {
            let entry = ChunkEntry::read_from(raw).ok_or_else(|| anyhow!("Invalid chunk entry"))?;
            if entry.align > MAX_ALIGN {
                return Err(FormatError::InvalidValue {
                    what: "chunk alignment",
                    value: entry.align as u64,
                    offset: base + entry.offset.get() as u64,
                }
                .into());
            }
            let offset = entry.offset.get() as u64;
            let range = checked_range("chunk entry", offset, entry.size.get() as u64, data.len())
                .map_err(|_| FormatError::OutOfBounds {
                    what: "chunk entry",
                    offset: base + offset,
                    size: entry.size.get() as u64,
                    len: base + data.len() as u64,
                })?;
            let payload = &data[range];
            let chunk_data = if payload.len() >= CHUNK_HEADER_SIZE
                && peek_four_cc(payload) == K_CHUNK_CHNK
            {
                ChunkData::Package(Self::read_at(payload, base + offset, depth + 1)?)
            } else {
                ChunkData::Buffer(Cow::Borrowed(payload))
            };
            log::debug!("{:?} @ {:#X} size {:#X}", entry.id, base + offset, entry.size.get());
            children.push(Chunk {
                id: entry.id,
                version: entry.version,
                align: entry.align,
                reserved: entry.reserved.get(),
                data: chunk_data,
            });
        }
        Ok(Self { version, children })
    }

    /// Serializes the container, recomputing offsets and sizes bottom-up.
    pub fn write<W: Write + Seek>(&self, w: &mut W) -> Result<()> {
        // Reserve space for the header and entry table
        let start = w.stream_position()?;
        let table_size = CHUNK_HEADER_SIZE + self.children.len() * CHUNK_ENTRY_SIZE;
        w.write_all(&vec![0u8; table_size])?;

        // Write the children and determine their offsets
        let mut entries = Vec::with_capacity(self.children.len());
        for child in &self.children {
            ensure!(
                child.align <= MAX_ALIGN,
                "Invalid alignment {} for {:?}",
                child.align,
                child.id
            );
            let pos = w.stream_position()? - start;
            let aligned = align_up(pos, 1u64 << child.align);
            write_padding(w, aligned - pos)?;
            match &child.data {
                ChunkData::Buffer(data) => w.write_all(data)?,
                ChunkData::Package(file) => file.write(w)?,
            }
            let end = w.stream_position()? - start;
            entries.push(ChunkEntry {
                id: child.id,
                offset: U32::new(u32::try_from(aligned)?),
                version: child.version,
                align: child.align,
                reserved: U16::new(child.reserved),
                size: U32::new(u32::try_from(end - aligned)?),
            });
        }

        // Pad the end of the chunk
        let pos = w.stream_position()? - start;
        let end = align_up(pos, CHUNK_END_ALIGN);
        write_padding(w, end - pos)?;

        // Return to the start of the chunk and write the header
        let header = ChunkHeader {
            magic: K_CHUNK_CHNK,
            size: U32::new(u32::try_from(end)?),
            count: U32::new(u32::try_from(self.children.len())?),
            version: U32::new(self.version),
        };
        w.seek(SeekFrom::Start(start))?;
        w.write_all(header.as_bytes())?;
        for entry in &entries {
            w.write_all(entry.as_bytes())?;
        }

        // Seek to the end
        w.seek(SeekFrom::Start(start + end))?;
        Ok(())
    }

    /// Serializes the container into a new buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Depth-first search for the first chunk with type `id`.
    pub fn find(&self, id: FourCC) -> Option<&Chunk<'a>> {
        for child in &self.children {
            if child.id == id {
                return Some(child);
            }
            if let ChunkData::Package(file) = &child.data {
                if let Some(found) = file.find(id) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// All chunks with type `id`, depth-first.
    pub fn find_all(&self, id: FourCC) -> Vec<&Chunk<'a>> {
        let mut out = Vec::new();
        self.visit(&mut |chunk| {
            if chunk.id == id {
                out.push(chunk);
            }
        });
        out
    }

    /// Calls `f` for every node, parents before children.
    pub fn visit<'s, F>(&'s self, f: &mut F)
    where F: FnMut(&'s Chunk<'a>) {
        for child in &self.children {
            f(child);
            if let ChunkData::Package(file) = &child.data {
                file.visit(f);
            }
        }
    }

    /// Calls `f` on every leaf with type `id`, allowing the payload to be replaced.
    pub fn visit_leaves_mut<F>(&mut self, id: FourCC, f: &mut F) -> Result<()>
    where F: FnMut(&mut Chunk<'a>) -> Result<()> {
        for child in &mut self.children {
            match &mut child.data {
                ChunkData::Package(file) => file.visit_leaves_mut(id, f)?,
                ChunkData::Buffer(_) if child.id == id => f(child)?,
                ChunkData::Buffer(_) => {}
            }
        }
        Ok(())
    }
}

fn write_padding<W: Write>(w: &mut W, len: u64) -> Result<()> {
    const ZEROES: [u8; 64] = [0u8; 64];
    let mut remain = len as usize;
    while remain > 0 {
        let n = remain.min(ZEROES.len());
        w.write_all(&ZEROES[..n])?;
        remain -= n;
    }
    Ok(())
}

/// Recursively dump a chunk tree
pub fn dump_chunks<W: Write>(w: &mut W, file: &ChunkFile, indent: usize) -> Result<()> {
    let indstr = "  ".repeat(indent);
    for child in &file.children {
        match &child.data {
            ChunkData::Buffer(data) => writeln!(
                w,
                "{indstr}- {:?} v{} align {} size {:#X}",
                child.id,
                child.version,
                1u32 << child.align,
                data.len()
            )?,
            ChunkData::Package(package) => {
                writeln!(
                    w,
                    "{indstr}+ {:?} v{} align {} ({} children)",
                    child.id,
                    child.version,
                    1u32 << child.align,
                    package.children.len()
                )?;
                dump_chunks(w, package, indent + 1)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChunkFile<'static> {
        ChunkFile::new(vec![
            Chunk::buffer(FourCC(*b"INFO"), 1, 2, vec![1u8, 2, 3]),
            Chunk::package(
                FourCC(*b"PACK"),
                0,
                4,
                ChunkFile::new(vec![
                    Chunk::buffer(FourCC(*b"MDPC"), 6, 7, vec![0xAAu8; 37]),
                    Chunk::buffer(FourCC(*b"TEXT"), 0, 0, b"hello".to_vec()),
                ]),
            ),
            Chunk::buffer(FourCC(*b"EMPT"), 0, 4, Vec::new()),
        ])
    }

    #[test]
    fn test_round_trip() {
        let file = sample();
        let bytes = file.to_bytes().unwrap();
        assert_eq!(bytes.len() % CHUNK_END_ALIGN as usize, 0);
        assert_eq!(&bytes[0..4], b"CHNK");
        let read = ChunkFile::read(&bytes).unwrap();
        assert_eq!(read, file);
        // Writing again must be byte-identical
        assert_eq!(read.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_alignment_preserved() {
        let bytes = sample().to_bytes().unwrap();
        let header = ChunkHeader::read_from_prefix(&bytes).unwrap();
        assert_eq!(header.count.get(), 3);
        assert_eq!(header.size.get() as usize, bytes.len());
        for raw in bytes[CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + 3 * CHUNK_ENTRY_SIZE]
            .chunks_exact(CHUNK_ENTRY_SIZE)
        {
            let entry = ChunkEntry::read_from(raw).unwrap();
            assert_eq!(entry.offset.get() % (1 << entry.align), 0, "{:?}", entry.id);
        }
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0..4].copy_from_slice(b"KNHC");
        let err = ChunkFile::read(&bytes).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FormatError>(),
            Some(FormatError::BadMagic { offset: 0, .. })
        ));
    }

    #[test]
    fn test_entry_out_of_bounds() {
        let mut bytes = sample().to_bytes().unwrap();
        // Grow the first entry's size past the end of the chunk
        let size_pos = CHUNK_HEADER_SIZE + 12;
        bytes[size_pos..size_pos + 4].copy_from_slice(&0x10000u32.to_le_bytes());
        let err = ChunkFile::read(&bytes).unwrap_err();
        assert!(matches!(err.downcast_ref::<FormatError>(), Some(FormatError::OutOfBounds { .. })));
    }

    #[test]
    fn test_truncated() {
        let bytes = sample().to_bytes().unwrap();
        assert!(ChunkFile::read(&bytes[..8]).is_err());
        assert!(ChunkFile::read(&bytes[..bytes.len() - 16]).is_err());
    }

    #[test]
    fn test_find_and_replace() {
        let mut file = sample();
        assert_eq!(file.find(FourCC(*b"TEXT")).and_then(Chunk::bytes), Some(&b"hello"[..]));
        assert!(file.find(FourCC(*b"NONE")).is_none());
        assert_eq!(file.find_all(FourCC(*b"MDPC")).len(), 1);
        file.visit_leaves_mut(FourCC(*b"MDPC"), &mut |chunk| {
            chunk.replace_data(vec![1, 2, 3, 4]);
            Ok(())
        })
        .unwrap();
        let bytes = file.to_bytes().unwrap();
        let read = ChunkFile::read(&bytes).unwrap();
        assert_eq!(read.find(FourCC(*b"MDPC")).and_then(Chunk::bytes), Some(&[1u8, 2, 3, 4][..]));
    }

    fn nested(depth: u32) -> ChunkFile<'static> {
        let mut file = ChunkFile::new(vec![Chunk::buffer(FourCC(*b"LEAF"), 0, 0, vec![7u8])]);
        for _ in 0..depth {
            file = ChunkFile::new(vec![Chunk::package(FourCC(*b"PACK"), 0, 0, file)]);
        }
        file
    }

    #[test]
    fn test_nesting_limit() {
        let bytes = nested(MAX_CHUNK_DEPTH).to_bytes().unwrap();
        let read = ChunkFile::read(&bytes).unwrap();
        assert_eq!(read.find(FourCC(*b"LEAF")).and_then(Chunk::bytes), Some(&[7u8][..]));

        let bytes = nested(MAX_CHUNK_DEPTH + 1).to_bytes().unwrap();
        let err = ChunkFile::read(&bytes).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FormatError>(),
            Some(FormatError::InvalidValue { what: "chunk nesting depth", value: 65, .. })
        ));
    }

    #[test]
    fn test_dump() {
        let mut out = Vec::new();
        dump_chunks(&mut out, &sample(), 0).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("+ \"PACK\""));
        assert!(text.contains("  - \"MDPC\" v6 align 128 size 0x25"));
    }
}
