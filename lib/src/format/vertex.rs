use anyhow::{ensure, Result};

use crate::{array_ref, error::FormatError};

/// Vertex layout selected once per model package.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum VertexDeclaration {
    /// Position, normal, uv
    #[default]
    Basic = 0,
    /// Basic + BGRA color
    Colored = 1,
    /// Basic + blend position and blend normal
    Blended = 2,
}

impl VertexDeclaration {
    pub fn from_u32(value: u32, offset: u64) -> Result<Self, FormatError> {
        match value {
            0 => Ok(Self::Basic),
            1 => Ok(Self::Colored),
            2 => Ok(Self::Blended),
            value => Err(FormatError::InvalidValue {
                what: "vertex declaration",
                value: value as u64,
                offset,
            }),
        }
    }

    pub const fn stride(self) -> u32 {
        match self {
            VertexDeclaration::Basic => 32,
            VertexDeclaration::Colored => 36,
            VertexDeclaration::Blended => 56,
        }
    }
}

/// Decoded vertex record. Fields not present in a declaration stay zeroed.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    /// B, G, R, A
    pub color: [u8; 4],
    pub blend_position: [f32; 3],
    pub blend_normal: [f32; 3],
}

impl Vertex {
    pub fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self { position, normal, uv, ..Default::default() }
    }

    /// Decodes one record of `decl.stride()` bytes.
    pub fn read(decl: VertexDeclaration, data: &[u8]) -> Self {
        let mut v = Vertex {
            position: read_vec3(data, 0),
            normal: read_vec3(data, 12),
            uv: [read_f32(data, 24), read_f32(data, 28)],
            ..Default::default()
        };
        match decl {
            VertexDeclaration::Basic => {}
            VertexDeclaration::Colored => v.color = *array_ref!(data, 32, 4),
            VertexDeclaration::Blended => {
                v.blend_position = read_vec3(data, 32);
                v.blend_normal = read_vec3(data, 44);
            }
        }
        v
    }

    /// Appends one record of `decl.stride()` bytes.
    pub fn write(&self, decl: VertexDeclaration, out: &mut Vec<u8>) {
        write_floats(out, &self.position);
        write_floats(out, &self.normal);
        write_floats(out, &self.uv);
        match decl {
            VertexDeclaration::Basic => {}
            VertexDeclaration::Colored => out.extend_from_slice(&self.color),
            VertexDeclaration::Blended => {
                write_floats(out, &self.blend_position);
                write_floats(out, &self.blend_normal);
            }
        }
    }
}

#[inline]
fn read_f32(data: &[u8], offset: usize) -> f32 { f32::from_le_bytes(*array_ref!(data, offset, 4)) }

#[inline]
fn read_vec3(data: &[u8], offset: usize) -> [f32; 3] {
    [read_f32(data, offset), read_f32(data, offset + 4), read_f32(data, offset + 8)]
}

#[inline]
fn write_floats(out: &mut Vec<u8>, values: &[f32]) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Opaque fixed-stride vertex records.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VertexBuffer {
    pub stride: u32,
    pub data: Vec<u8>,
}

impl VertexBuffer {
    pub fn from_vertices(decl: VertexDeclaration, vertices: &[Vertex]) -> Self {
        let stride = decl.stride();
        let mut data = Vec::with_capacity(vertices.len() * stride as usize);
        for v in vertices {
            v.write(decl, &mut data);
        }
        Self { stride, data }
    }

    pub fn vertex_count(&self) -> usize {
        if self.stride == 0 {
            0
        } else {
            self.data.len() / self.stride as usize
        }
    }

    pub fn vertices(&self, decl: VertexDeclaration) -> Result<Vec<Vertex>> {
        ensure!(
            self.stride == decl.stride(),
            FormatError::StrideMismatch { stride: self.stride, expected: decl.stride() }
        );
        Ok(self.data.chunks_exact(self.stride as usize).map(|r| Vertex::read(decl, r)).collect())
    }
}
