use thiserror::Error;

use crate::format::{mdpc::MaterialHandle, FourCC};

/// Fatal errors raised while decoding or encoding binary data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormatError {
    #[error("Bad magic at {offset:#X}: expected {expected}, found {found}")]
    BadMagic { expected: FourCC, found: FourCC, offset: u64 },
    #[error("Unsupported {what} version {version}")]
    Version { what: &'static str, version: u32 },
    #[error("{what} at {offset:#X} (size {size:#X}) is outside of {len:#X} bytes")]
    OutOfBounds { what: &'static str, offset: u64, size: u64, len: u64 },
    #[error("{what} references unknown offset {offset:#X}")]
    DanglingOffset { what: &'static str, offset: u64 },
    #[error("Invalid {what} {value:#X} at {offset:#X}")]
    InvalidValue { what: &'static str, value: u64, offset: u64 },
    #[error("Vertex buffer stride {stride} does not match declaration stride {expected}")]
    StrideMismatch { stride: u32, expected: u32 },
}

/// Inputs the conversion pipeline refuses to process.
///
/// These are raised before any part of the output package is built.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    #[error("Expected exactly one vertex buffer, found {0}")]
    VertexBufferCount(usize),
    #[error("Model {model}: LOD slot type {slot_type:#X} cannot be mapped")]
    UnmappedLodSlot { model: usize, slot_type: u32 },
    #[error("Model {model}: LOD slot {slot} has no instances")]
    MissingGeometry { model: usize, slot: usize },
    #[error("Polygon group {group}, face {face}: expected 3 vertices, found {count}")]
    NonTriangulated { group: usize, face: usize, count: usize },
    #[error("Polygon group {group}: vertex {vertex} out of range (count {count})")]
    VertexOutOfRange { group: usize, vertex: u32, count: usize },
    #[error("Model {model}: {count} vertices do not fit 16-bit indices")]
    TooManyVertices { model: usize, count: usize },
}

/// Recoverable conditions collected during a conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// A global material could not be found; the handle was degraded to unresolved.
    UnresolvedMaterial { model: usize, handle: MaterialHandle },
    /// A local material index was out of range; the handle was degraded to unresolved.
    InvalidLocalMaterial { model: usize, handle: MaterialHandle },
    /// A texture set could not be transcoded; the substance kept its original shape.
    TextureTranscode { uid: u32, message: String },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::UnresolvedMaterial { model, handle } => {
                write!(f, "Model {model}: unresolved global material {handle}")
            }
            Diagnostic::InvalidLocalMaterial { model, handle } => {
                write!(f, "Model {model}: local material {handle} out of range")
            }
            Diagnostic::TextureTranscode { uid, message } => {
                write!(f, "Texture {uid:08X}: {message}")
            }
        }
    }
}
