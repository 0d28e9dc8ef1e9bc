use anyhow::Result;
use serde_derive::Deserialize;

use crate::{
    convert::weld::{Tolerance, WeldIndex, DEFAULT_WELD_TOLERANCE},
    error::ConvertError,
    format::{
        mdpc::{Instance, Lod, LodSlot, MaterialHandle, Model, ModelPackage, Primitive, SubModel},
        mtrl::Material,
        vertex::{Vertex, VertexBuffer, VertexDeclaration},
        CAABox, CMatrix4f, FormatVersion, Uid,
    },
};

/// Generic mesh arrays, as produced by an interchange-format importer.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MeshDescription {
    pub positions: Vec<[f32; 3]>,
    /// Per position; missing entries are zero
    #[serde(default)]
    pub normals: Vec<[f32; 3]>,
    #[serde(default)]
    pub uvs: Vec<[f32; 2]>,
    pub groups: Vec<PolygonGroup>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PolygonGroup {
    /// Local material index
    pub material: u16,
    /// Vertex index triples
    pub faces: Vec<Vec<u32>>,
}

#[derive(Clone, Debug)]
pub struct CompileOptions {
    pub version: FormatVersion,
    pub uid: Uid,
    pub tolerance: f32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self { version: FormatVersion::Dpl, uid: Uid::default(), tolerance: DEFAULT_WELD_TOLERANCE }
    }
}

/// All faces must be triangles referencing existing vertices.
fn validate(mesh: &MeshDescription) -> Result<(), ConvertError> {
    let count = mesh.positions.len();
    for (group_index, group) in mesh.groups.iter().enumerate() {
        for (face_index, face) in group.faces.iter().enumerate() {
            if face.len() != 3 {
                return Err(ConvertError::NonTriangulated {
                    group: group_index,
                    face: face_index,
                    count: face.len(),
                });
            }
            if let Some(&vertex) = face.iter().find(|&&v| v as usize >= count) {
                return Err(ConvertError::VertexOutOfRange { group: group_index, vertex, count });
            }
        }
    }
    Ok(())
}

/// Builds a single-model package from a mesh description: one high LOD with
/// one instance, and one triangle-list submodel per polygon group.
pub fn compile(mesh: &MeshDescription, options: &CompileOptions) -> Result<ModelPackage> {
    validate(mesh)?;

    let decl = VertexDeclaration::Basic;
    let mut weld = WeldIndex::new(Tolerance(options.tolerance));
    weld.begin_model();
    let mut indices = Vec::new();
    let mut submodels = Vec::with_capacity(mesh.groups.len());
    for group in &mesh.groups {
        let index_start = indices.len();
        let mut max_index = 0usize;
        for &v in group.faces.iter().flatten() {
            let v = v as usize;
            let vertex = Vertex::new(
                mesh.positions[v],
                mesh.normals.get(v).copied().unwrap_or_default(),
                mesh.uvs.get(v).copied().unwrap_or_default(),
            );
            let index = weld.insert(vertex);
            let Ok(short) = u16::try_from(index) else {
                return Err(ConvertError::TooManyVertices { model: 0, count: weld.len() }.into());
            };
            max_index = max_index.max(index);
            indices.push(short);
        }
        let index_count = indices.len() - index_start;
        submodels.push(SubModel {
            primitive: Primitive::TriangleList,
            vertex_buffer: 0,
            flags: 0,
            vertex_base: 0,
            vertex_count: if index_count == 0 { 0 } else { max_index as u32 + 1 },
            index_start: index_start as u32,
            index_count: index_count as u32,
            material: MaterialHandle::local(group.material),
        });
    }

    let vertices = weld.into_vertices();
    let mut model = Model {
        bounds: CAABox::from_points(vertices.iter().map(|v| v.position)),
        ..Default::default()
    };
    model.lods[LodSlot::High.index()] = Some(Lod {
        slot_type: LodSlot::High as u32,
        mask: u32::MAX,
        instances: vec![Instance { transform: CMatrix4f::IDENTITY, flags: 0, submodels }],
    });

    // One placeholder material per referenced index
    let mut package = ModelPackage::new(options.version, options.uid);
    let material_count = mesh.groups.iter().map(|g| g.material as usize + 1).max().unwrap_or(0);
    package.materials.materials = vec![Material::default(); material_count];
    package.vertex_declaration = decl;
    package.vertex_buffers = vec![VertexBuffer::from_vertices(decl, &vertices)];
    package.indices = indices;
    package.models.push(model);
    log::info!(
        "Compiled {} groups into {} vertices, {} indices",
        mesh.groups.len(),
        vertices.len(),
        package.indices.len()
    );
    Ok(package)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> MeshDescription {
        serde_json::from_str(
            r#"{
                "positions": [[0,0,0],[1,0,0],[1,1,0],[0,1,0],[0,0,0]],
                "normals": [[0,0,1],[0,0,1],[0,0,1],[0,0,1],[0,0,1]],
                "uvs": [[0,0],[1,0],[1,1],[0,1],[0,0]],
                "groups": [
                    { "material": 0, "faces": [[0,1,2]] },
                    { "material": 2, "faces": [[4,2,3]] }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_compile_welds() {
        let package = compile(&quad(), &CompileOptions::default()).unwrap();
        // Position 4 duplicates position 0
        assert_eq!(package.vertex_buffers[0].vertex_count(), 4);
        assert_eq!(package.indices, vec![0, 1, 2, 0, 2, 3]);
        let submodels: Vec<_> = package.submodels().collect();
        assert_eq!(submodels.len(), 2);
        assert_eq!(submodels[1].index_start, 3);
        assert_eq!(submodels[1].material, MaterialHandle::local(2));
        assert_eq!(package.materials.materials.len(), 3);
        let model = &package.models[0];
        assert!(model.lod(LodSlot::High).is_some());
        assert_eq!(model.bounds.max, crate::format::CVector3f::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn test_rejects_polygons() {
        let mut mesh = quad();
        mesh.groups[1].faces.push(vec![0, 1, 2, 3]);
        let err = compile(&mesh, &CompileOptions::default()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConvertError>(),
            Some(&ConvertError::NonTriangulated { group: 1, face: 1, count: 4 })
        );
    }

    #[test]
    fn test_rejects_missing_vertex() {
        let mut mesh = quad();
        mesh.groups[0].faces[0][2] = 9;
        let err = compile(&mesh, &CompileOptions::default()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConvertError>(),
            Some(&ConvertError::VertexOutOfRange { group: 0, vertex: 9, count: 5 })
        );
    }

    #[test]
    fn test_compiled_package_encodes() {
        let package = compile(&quad(), &CompileOptions::default()).unwrap();
        let data = package.write().unwrap();
        assert_eq!(ModelPackage::read(&data).unwrap(), package);
    }
}
