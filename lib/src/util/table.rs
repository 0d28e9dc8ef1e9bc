use std::io::{Cursor, Seek, SeekFrom, Write};

use anyhow::Result;
use binrw::{BinRead, BinWrite, Endian};

use crate::{error::FormatError, format::checked_range, util::align_up};

/// Fixed-size on-disk record.
pub trait Record {
    const SIZE: u32;
}

/// Reads `count` consecutive records starting at `offset`.
pub fn read_table<T>(data: &[u8], what: &'static str, offset: u32, count: u32) -> Result<Vec<T>>
where T: Record + for<'a> BinRead<Args<'a> = ()> {
    if count == 0 {
        return Ok(vec![]);
    }
    let range = checked_range(what, offset as u64, count as u64 * T::SIZE as u64, data.len())?;
    let mut reader = Cursor::new(&data[range]);
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(T::read_options(&mut reader, Endian::Little, ())?);
    }
    Ok(out)
}

/// Reads `count` little-endian `u32` values starting at `offset`.
pub fn read_u32_array(
    data: &[u8],
    what: &'static str,
    offset: u32,
    count: u32,
) -> Result<Vec<u32>> {
    let range = checked_range(what, offset as u64, count as u64 * 4, data.len())?;
    Ok(data[range].chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
}

/// Location of a record table within a leaf, used to turn offsets back into indices.
#[derive(Copy, Clone, Debug)]
pub struct TableSpan {
    pub what: &'static str,
    pub offset: u32,
    pub count: u32,
    pub size: u32,
}

impl TableSpan {
    pub fn new<T: Record>(what: &'static str, offset: u32, count: u32) -> Self {
        Self { what, offset, count, size: T::SIZE }
    }

    /// Index of the record at `offset`, or a dangling offset error.
    pub fn index_of(&self, offset: u32) -> Result<usize, FormatError> {
        let dangling = || FormatError::DanglingOffset { what: self.what, offset: offset as u64 };
        let rel = offset.checked_sub(self.offset).ok_or_else(dangling)?;
        if rel % self.size != 0 || rel / self.size >= self.count {
            return Err(dangling());
        }
        Ok((rel / self.size) as usize)
    }

    /// Checks that `count` records starting at `index` lie within the table.
    pub fn check_run(&self, index: usize, count: usize, offset: u32) -> Result<(), FormatError> {
        if index + count > self.count as usize {
            return Err(FormatError::OutOfBounds {
                what: self.what,
                offset: offset as u64,
                size: count as u64 * self.size as u64,
                len: (self.offset + self.count * self.size) as u64,
            });
        }
        Ok(())
    }

    /// Offset of the record at `index`.
    #[inline]
    pub fn offset_of(&self, index: usize) -> u32 { self.offset + index as u32 * self.size }
}

/// Builds a leaf front to back. Offsets handed out are relative to the leaf start.
#[derive(Default)]
pub struct LeafWriter {
    inner: Cursor<Vec<u8>>,
}

impl LeafWriter {
    pub fn new() -> Self { Self::default() }

    pub fn position(&self) -> Result<u32> { Ok(u32::try_from(self.inner.get_ref().len())?) }

    /// Pads with zeroes to a multiple of `align`.
    pub fn align(&mut self, align: u64) -> Result<u32> {
        let pos = self.inner.get_ref().len() as u64;
        let aligned = align_up(pos, align);
        self.inner.get_mut().resize(aligned as usize, 0);
        self.inner.seek(SeekFrom::End(0))?;
        Ok(u32::try_from(aligned)?)
    }

    /// Reserves `size` zeroed bytes, returning their offset.
    pub fn reserve(&mut self, size: u32) -> Result<u32> {
        let offset = self.position()?;
        self.inner.get_mut().resize((offset + size) as usize, 0);
        self.inner.seek(SeekFrom::End(0))?;
        Ok(offset)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<u32> {
        let offset = self.position()?;
        self.inner.write_all(data)?;
        Ok(offset)
    }

    pub fn write_record<T>(&mut self, record: &T) -> Result<u32>
    where T: Record + for<'a> BinWrite<Args<'a> = ()> {
        let offset = self.position()?;
        record.write_options(&mut self.inner, Endian::Little, ())?;
        debug_assert_eq!(self.position()? - offset, T::SIZE);
        Ok(offset)
    }

    /// Writes records back to back, returning the table offset.
    pub fn write_table<T>(&mut self, records: &[T]) -> Result<u32>
    where T: Record + for<'a> BinWrite<Args<'a> = ()> {
        let offset = self.position()?;
        for record in records {
            self.write_record(record)?;
        }
        Ok(offset)
    }

    /// Overwrites a previously reserved record, then returns to the end.
    pub fn write_record_at<T>(&mut self, offset: u32, record: &T) -> Result<()>
    where T: Record + for<'a> BinWrite<Args<'a> = ()> {
        self.inner.seek(SeekFrom::Start(offset as u64))?;
        record.write_options(&mut self.inner, Endian::Little, ())?;
        self.inner.seek(SeekFrom::End(0))?;
        Ok(())
    }

    pub fn into_inner(self) -> Vec<u8> { self.inner.into_inner() }
}

#[cfg(test)]
mod tests {
    use binrw::binrw;

    use super::*;

    #[binrw]
    #[derive(Clone, Debug, PartialEq)]
    struct SPair {
        a: u32,
        b: u16,
        c: u16,
    }

    impl Record for SPair {
        const SIZE: u32 = 8;
    }

    #[test]
    fn test_table_round_trip() {
        let mut w = LeafWriter::new();
        w.reserve(4).unwrap();
        assert_eq!(w.align(16).unwrap(), 16);
        let records = vec![SPair { a: 1, b: 2, c: 3 }, SPair { a: 4, b: 5, c: 6 }];
        let offset = w.write_table(&records).unwrap();
        assert_eq!(offset, 16);
        w.write_record_at(0, &SPair { a: 0xAABBCCDD, b: 0, c: 0 }).unwrap();
        let data = w.into_inner();
        assert_eq!(data.len(), 32);
        assert_eq!(&data[0..4], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(read_table::<SPair>(&data, "pair", 16, 2).unwrap(), records);
        assert!(read_table::<SPair>(&data, "pair", 24, 2).is_err());
    }

    #[test]
    fn test_span_lookup() {
        let span = TableSpan::new::<SPair>("pair", 16, 3);
        assert_eq!(span.index_of(16).unwrap(), 0);
        assert_eq!(span.index_of(32).unwrap(), 2);
        assert_eq!(span.offset_of(1), 24);
        assert!(matches!(span.index_of(20), Err(FormatError::DanglingOffset { offset: 20, .. })));
        assert!(span.index_of(40).is_err());
        assert!(span.index_of(8).is_err());
        assert!(span.check_run(1, 2, 24).is_ok());
        assert!(span.check_run(2, 2, 32).is_err());
    }
}
