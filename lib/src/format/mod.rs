pub mod chunk;
pub mod mdpc;
pub mod mtrl;
pub mod txtr;
pub mod vertex;

use std::{
    fmt::{Debug, Display, Formatter, Write},
    ops::Range,
};

use anyhow::{anyhow, Result};
use binrw::binrw;
use strum::{Display as StrumDisplay, EnumIter, EnumString};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::{array_ref, error::FormatError};

#[binrw]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default, FromBytes, FromZeroes, AsBytes)]
#[repr(transparent)]
pub struct FourCC(pub [u8; 4]);

impl Display for FourCC {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for c in self.0 {
            f.write_char(c as char)?;
        }
        Ok(())
    }
}

impl Debug for FourCC {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_char('"')?;
        for c in self.0 {
            f.write_char(c as char)?;
        }
        f.write_char('"')?;
        Ok(())
    }
}

impl PartialEq<[u8; 4]> for FourCC {
    fn eq(&self, other: &[u8; 4]) -> bool { &self.0 == other }
}

#[inline]
pub fn peek_four_cc(data: &[u8]) -> FourCC {
    if data.len() < 4 {
        return FourCC::default();
    }
    FourCC(*array_ref!(data, 0, 4))
}

/// Composite identifier of a model package.
#[binrw]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Uid {
    pub low: i32,
    pub high: i32,
}

impl Uid {
    pub const fn new(low: i32, high: i32) -> Self { Self { low, high } }

    /// The 16-bit form stored in material handle owners.
    #[inline]
    pub fn short(self) -> u16 { self.low as u16 }
}

impl Display for Uid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}:{:08X}", self.low as u32, self.high as u32)
    }
}

impl Debug for Uid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { Display::fmt(self, f) }
}

impl std::str::FromStr for Uid {
    type Err = anyhow::Error;

    /// Parses `low:high` or `low`, each either decimal or `0x`-prefixed hex.
    fn from_str(s: &str) -> Result<Self> {
        fn parse_part(s: &str) -> Result<i32> {
            let s = s.trim();
            let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u32::from_str_radix(hex, 16)?
            } else {
                s.parse::<i64>()? as u32
            };
            Ok(value as i32)
        }
        let (low, high) = match s.split_once(':') {
            Some((low, high)) => (parse_part(low)?, parse_part(high)?),
            None => (parse_part(s)?, 0),
        };
        Ok(Self { low, high })
    }
}

/// On-disk model package format version.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, StrumDisplay, EnumIter, EnumString,
)]
#[strum(ascii_case_insensitive)]
#[repr(u32)]
pub enum FormatVersion {
    #[strum(serialize = "driv3r")]
    Driv3r = 1,
    #[strum(serialize = "dpl")]
    Dpl = 6,
}

impl FormatVersion {
    pub fn from_u32(version: u32) -> Result<Self, FormatError> {
        match version {
            1 => Ok(Self::Driv3r),
            6 => Ok(Self::Dpl),
            version => Err(FormatError::Version { what: "model package", version }),
        }
    }

    #[inline]
    pub fn as_u32(self) -> u32 { self as u32 }
}

#[binrw]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct CVector3f {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl CVector3f {
    pub const fn new(x: f32, y: f32, z: f32) -> Self { Self { x, y, z } }
}

impl From<[f32; 3]> for CVector3f {
    fn from(v: [f32; 3]) -> Self { Self { x: v[0], y: v[1], z: v[2] } }
}

impl From<CVector3f> for [f32; 3] {
    fn from(v: CVector3f) -> Self { [v.x, v.y, v.z] }
}

#[binrw]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct CAABox {
    pub min: CVector3f,
    pub max: CVector3f,
}

impl CAABox {
    /// Smallest box containing all of `points`, or a zero box if empty.
    pub fn from_points<I: IntoIterator<Item = [f32; 3]>>(points: I) -> Self {
        let mut iter = points.into_iter();
        let Some(first) = iter.next() else { return Self::default() };
        let (mut min, mut max) = (first, first);
        for p in iter {
            for i in 0..3 {
                min[i] = min[i].min(p[i]);
                max[i] = max[i].max(p[i]);
            }
        }
        Self { min: min.into(), max: max.into() }
    }
}

/// 4x4 matrix in row-vector convention (translation in the fourth row).
/// Only the affine part is meaningful.
#[binrw]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CMatrix4f {
    pub m: [[f32; 4]; 4],
}

impl CMatrix4f {
    pub const IDENTITY: Self = Self {
        m: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    /// Column-major flattening of the equivalent column-vector matrix, as glTF expects.
    pub fn to_gltf_array(&self) -> [f32; 16] {
        let mut out = [0f32; 16];
        for (row, dst) in self.m.iter().zip(out.chunks_exact_mut(4)) {
            dst.copy_from_slice(row);
        }
        out
    }
}

impl Default for CMatrix4f {
    fn default() -> Self { Self::IDENTITY }
}

/// Checked `offset..offset + size` within a buffer of `len` bytes.
pub fn checked_range(
    what: &'static str,
    offset: u64,
    size: u64,
    len: usize,
) -> Result<Range<usize>> {
    let end = offset.checked_add(size);
    match end {
        Some(end) if end <= len as u64 => Ok(offset as usize..end as usize),
        _ => Err(anyhow!(FormatError::OutOfBounds { what, offset, size, len: len as u64 })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_parse() {
        assert_eq!("0x10:2".parse::<Uid>().unwrap(), Uid::new(0x10, 2));
        assert_eq!("255".parse::<Uid>().unwrap(), Uid::new(255, 0));
        assert_eq!("0xFFFFFFFF:0".parse::<Uid>().unwrap(), Uid::new(-1, 0));
        assert!("zz".parse::<Uid>().is_err());
        assert_eq!(Uid::new(0x1234_5678, 0).short(), 0x5678);
    }

    #[test]
    fn test_format_version() {
        assert_eq!(FormatVersion::from_u32(1).unwrap(), FormatVersion::Driv3r);
        assert_eq!(FormatVersion::from_u32(6).unwrap(), FormatVersion::Dpl);
        assert!(FormatVersion::from_u32(2).is_err());
        assert_eq!("DPL".parse::<FormatVersion>().unwrap(), FormatVersion::Dpl);
        assert_eq!(FormatVersion::Driv3r.to_string(), "driv3r");
    }

    #[test]
    fn test_checked_range() {
        assert_eq!(checked_range("x", 4, 4, 8).unwrap(), 4..8);
        let err = checked_range("x", 6, 4, 8).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FormatError>(),
            Some(FormatError::OutOfBounds { offset: 6, size: 4, len: 8, .. })
        ));
        assert!(checked_range("x", u64::MAX, 1, 8).is_err());
    }

    #[test]
    fn test_bounds() {
        let b = CAABox::from_points([[1.0, -2.0, 3.0], [-1.0, 5.0, 0.0]]);
        assert_eq!(b.min, CVector3f::new(-1.0, -2.0, 0.0));
        assert_eq!(b.max, CVector3f::new(1.0, 5.0, 3.0));
    }

    #[test]
    fn test_matrix_columns() {
        let mut m = CMatrix4f::IDENTITY;
        m.m[3][0] = 5.0;
        let cols = m.to_gltf_array();
        assert_eq!(cols[12], 5.0);
        assert_eq!(cols[0], 1.0);
        assert_eq!(cols[3], 0.0);
    }
}
