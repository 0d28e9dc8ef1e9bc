use crate::format::vertex::Vertex;

pub const DEFAULT_WELD_TOLERANCE: f32 = 1e-5;

/// Decides whether two vertices may be merged. A match is a best-effort weld,
/// not a proof of identity.
pub trait WeldPredicate {
    fn possibly_equal(&self, a: &Vertex, b: &Vertex) -> bool;
}

/// Component-wise comparison within an absolute epsilon. Colors must match exactly.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Tolerance(pub f32);

impl Default for Tolerance {
    fn default() -> Self { Self(DEFAULT_WELD_TOLERANCE) }
}

#[inline]
fn near(a: &[f32], b: &[f32], eps: f32) -> bool {
    a.iter().zip(b).all(|(a, b)| (a - b).abs() <= eps)
}

impl WeldPredicate for Tolerance {
    fn possibly_equal(&self, a: &Vertex, b: &Vertex) -> bool {
        let eps = self.0;
        a.color == b.color
            && near(&a.position, &b.position, eps)
            && near(&a.normal, &b.normal, eps)
            && near(&a.uv, &b.uv, eps)
            && near(&a.blend_position, &b.blend_position, eps)
            && near(&a.blend_normal, &b.blend_normal, eps)
    }
}

/// Growing vertex list with per-model deduplication.
///
/// Lookups only consider vertices added since the last [`WeldIndex::begin_model`],
/// so separate models never share vertices.
#[derive(Clone, Debug)]
pub struct WeldIndex<P> {
    predicate: P,
    vertices: Vec<Vertex>,
    base: usize,
}

impl<P: WeldPredicate> WeldIndex<P> {
    pub fn new(predicate: P) -> Self { Self { predicate, vertices: vec![], base: 0 } }

    /// Starts a new model scope at the current end of the buffer.
    pub fn begin_model(&mut self) { self.base = self.vertices.len(); }

    /// First vertex of the current model.
    #[inline]
    pub fn base(&self) -> usize { self.base }

    #[inline]
    pub fn len(&self) -> usize { self.vertices.len() }

    #[inline]
    pub fn is_empty(&self) -> bool { self.vertices.is_empty() }

    /// Absolute index of an equivalent vertex in the current scope, appending if none.
    pub fn insert(&mut self, vertex: Vertex) -> usize {
        let scope = &self.vertices[self.base..];
        if let Some(pos) = scope.iter().position(|v| self.predicate.possibly_equal(v, &vertex)) {
            return self.base + pos;
        }
        self.vertices.push(vertex);
        self.vertices.len() - 1
    }

    pub fn vertices(&self) -> &[Vertex] { &self.vertices }

    pub fn into_vertices(self) -> Vec<Vertex> { self.vertices }
}
