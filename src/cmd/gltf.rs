use std::{collections::BTreeMap, io::Cursor};

use anyhow::Result;
use binrw::BinWriterExt;
use gltf_json::{self as json, buffer::Stride, validation::USize64};
use json::validation::Checked::Valid;
use serde_json::json;
use spoollib::{
    format::{
        mdpc::{LodSlot, MaterialOwner, ModelPackage, Primitive, SubModel},
        vertex::Vertex,
    },
    util::align_up,
};

// Position, normal, UV
const OUT_STRIDE: usize = 32;

fn buffer_view(
    offset: usize,
    length: usize,
    stride: Option<usize>,
    name: String,
) -> json::buffer::View {
    json::buffer::View {
        buffer: json::Index::new(0),
        byte_length: USize64::from(length),
        byte_offset: Some(USize64::from(offset)),
        byte_stride: stride.map(Stride),
        extensions: Default::default(),
        extras: Default::default(),
        name: Some(name),
        target: Some(Valid(if stride.is_some() {
            json::buffer::Target::ArrayBuffer
        } else {
            json::buffer::Target::ElementArrayBuffer
        })),
    }
}

fn accessor(
    view: u32,
    offset: usize,
    count: usize,
    component_type: json::accessor::ComponentType,
    type_: json::accessor::Type,
    name: String,
) -> json::Accessor {
    json::Accessor {
        buffer_view: Some(json::Index::new(view)),
        byte_offset: Some(USize64::from(offset)),
        count: USize64::from(count),
        component_type: Valid(json::accessor::GenericComponentType(component_type)),
        extensions: None,
        extras: Default::default(),
        type_: Valid(type_),
        min: None,
        max: None,
        name: Some(name),
        normalized: false,
        sparse: None,
    }
}

fn node(name: String, mesh: Option<u32>, children: Vec<json::Index<json::Node>>) -> json::Node {
    json::Node {
        camera: None,
        children: if children.is_empty() { None } else { Some(children) },
        extensions: None,
        extras: None,
        matrix: None,
        mesh: mesh.map(json::Index::new),
        name: Some(name),
        rotation: None,
        scale: None,
        translation: None,
        skin: None,
        weights: None,
    }
}

#[derive(Default)]
struct SceneBuilder {
    accessors: Vec<json::Accessor>,
    views: Vec<json::buffer::View>,
    meshes: Vec<json::Mesh>,
    nodes: Vec<json::Node>,
}

impl SceneBuilder {
    fn push_node(&mut self, node: json::Node) -> json::Index<json::Node> {
        self.nodes.push(node);
        json::Index::new(self.nodes.len() as u32 - 1)
    }

    fn push_accessor(&mut self, accessor: json::Accessor) -> json::Index<json::Accessor> {
        self.accessors.push(accessor);
        json::Index::new(self.accessors.len() as u32 - 1)
    }
}

/// Builds a glTF scene of a package, returning the document and the
/// contents of its single binary buffer (to be stored at `buffer_uri`).
///
/// Every submodel becomes one mesh under a node per instance, grouped by
/// model and LOD slot. Materials are exported by name only.
pub fn export_gltf(package: &ModelPackage, buffer_uri: &str) -> Result<(json::Root, Vec<u8>)> {
    let decl = package.vertex_declaration;
    let mut w = Cursor::new(Vec::new());

    // Vertex section: all buffers back to back, re-laid out to a fixed stride
    let mut buffer_vertices = Vec::with_capacity(package.vertex_buffers.len());
    let mut buffer_offsets = Vec::with_capacity(package.vertex_buffers.len());
    for buffer in &package.vertex_buffers {
        let vertices = buffer.vertices(decl)?;
        buffer_offsets.push(w.position() as usize);
        for v in &vertices {
            w.write_le(&v.position)?;
            w.write_le(&v.normal)?;
            w.write_le(&v.uv)?;
        }
        buffer_vertices.push(vertices);
    }
    let index_offset = align_up(w.position(), 4);
    w.set_position(index_offset);
    for &index in &package.indices {
        w.write_le(&index)?;
    }
    let data = w.into_inner();

    let mut scene = SceneBuilder::default();
    let index_view = scene.views.len() as u32;
    scene.views.push(buffer_view(
        index_offset as usize,
        package.indices.len() * 2,
        None,
        "Indices".into(),
    ));

    let mut roots = Vec::with_capacity(package.models.len());
    for (model_index, model) in package.models.iter().enumerate() {
        let mut lod_nodes = vec![];
        for (slot, lod) in LodSlot::ALL.iter().zip(&model.lods) {
            let Some(lod) = lod else { continue };
            let mut instance_nodes = Vec::with_capacity(lod.instances.len());
            for (instance_index, instance) in lod.instances.iter().enumerate() {
                let mut submodel_nodes = Vec::with_capacity(instance.submodels.len());
                for submodel in &instance.submodels {
                    let mesh_index = scene.meshes.len();
                    let buffer_index = submodel.vertex_buffer as usize;
                    let Some(vertices) = buffer_vertices.get(buffer_index) else {
                        log::warn!("Mesh {mesh_index}: missing vertex buffer {buffer_index}");
                        continue;
                    };
                    if submodel.vertex_count == 0 || submodel.index_count == 0 {
                        log::debug!("Mesh {mesh_index}: skipping empty submodel");
                        continue;
                    }
                    let base = buffer_offsets[buffer_index];
                    let mesh =
                        submodel_mesh(&mut scene, package, submodel, vertices, base, index_view)?;
                    scene.meshes.push(mesh);
                    let name = format!("Submodel {mesh_index} ({})", submodel.material);
                    let mesh_node = node(name, Some(mesh_index as u32), vec![]);
                    submodel_nodes.push(scene.push_node(mesh_node));
                }
                let mut instance_node =
                    node(format!("Instance {instance_index}"), None, submodel_nodes);
                instance_node.matrix = Some(instance.transform.to_gltf_array());
                instance_nodes.push(scene.push_node(instance_node));
            }
            let name = format!("Model {model_index} LOD {slot:?}");
            lod_nodes.push(scene.push_node(node(name, None, instance_nodes)));
        }
        roots.push(scene.push_node(node(format!("Model {model_index}"), None, lod_nodes)));
    }

    let materials = (0..package.materials.materials.len())
        .map(|i| json::Material { name: Some(format!("Material {i}")), ..Default::default() })
        .collect();
    let root = json::Root {
        accessors: scene.accessors,
        animations: vec![],
        asset: Default::default(),
        buffers: vec![json::Buffer {
            byte_length: USize64::from(data.len()),
            extensions: Default::default(),
            extras: Default::default(),
            name: None,
            uri: Some(buffer_uri.to_string()),
        }],
        buffer_views: scene.views,
        scene: Some(json::Index::new(0)),
        extensions: None,
        extras: Default::default(),
        extensions_used: vec![],
        extensions_required: vec![],
        cameras: vec![],
        images: vec![],
        materials,
        meshes: scene.meshes,
        nodes: scene.nodes,
        samplers: vec![],
        scenes: vec![json::Scene {
            extensions: Default::default(),
            extras: Default::default(),
            name: Some(format!("{}", package.uid)),
            nodes: roots,
        }],
        skins: vec![],
        textures: vec![],
    };
    Ok((root, data))
}

fn submodel_mesh(
    scene: &mut SceneBuilder,
    package: &ModelPackage,
    submodel: &SubModel,
    vertices: &[Vertex],
    buffer_offset: usize,
    index_view: u32,
) -> Result<json::Mesh> {
    let mesh_index = scene.meshes.len();
    let range = spoollib::format::checked_range(
        "submodel vertices",
        submodel.vertex_base as u64,
        submodel.vertex_count as u64,
        vertices.len(),
    )?;
    let vertices = &vertices[range];
    spoollib::format::checked_range(
        "submodel indices",
        submodel.index_start as u64,
        submodel.index_count as u64,
        package.indices.len(),
    )?;

    let view = scene.views.len() as u32;
    scene.views.push(buffer_view(
        buffer_offset + submodel.vertex_base as usize * OUT_STRIDE,
        vertices.len() * OUT_STRIDE,
        Some(OUT_STRIDE),
        format!("Mesh {mesh_index} vertices"),
    ));
    let count = vertices.len();
    let mut position = accessor(
        view,
        0,
        count,
        json::accessor::ComponentType::F32,
        json::accessor::Type::Vec3,
        format!("Mesh {mesh_index} positions"),
    );
    let (mut min, mut max) = ([f32::MAX; 3], [f32::MIN; 3]);
    for v in vertices {
        for i in 0..3 {
            min[i] = min[i].min(v.position[i]);
            max[i] = max[i].max(v.position[i]);
        }
    }
    position.min = Some(json!(min));
    position.max = Some(json!(max));

    let mut attributes = BTreeMap::new();
    attributes.insert(Valid(json::mesh::Semantic::Positions), scene.push_accessor(position));
    attributes.insert(
        Valid(json::mesh::Semantic::Normals),
        scene.push_accessor(accessor(
            view,
            12,
            count,
            json::accessor::ComponentType::F32,
            json::accessor::Type::Vec3,
            format!("Mesh {mesh_index} normals"),
        )),
    );
    attributes.insert(
        Valid(json::mesh::Semantic::TexCoords(0)),
        scene.push_accessor(accessor(
            view,
            24,
            count,
            json::accessor::ComponentType::F32,
            json::accessor::Type::Vec2,
            format!("Mesh {mesh_index} UVs"),
        )),
    );
    let indices = scene.push_accessor(accessor(
        index_view,
        submodel.index_start as usize * 2,
        submodel.index_count as usize,
        json::accessor::ComponentType::U16,
        json::accessor::Type::Scalar,
        format!("Mesh {mesh_index} indices"),
    ));

    let material = match submodel.material.owner {
        MaterialOwner::ThisPackage
            if (submodel.material.index as usize) < package.materials.materials.len() =>
        {
            Some(json::Index::new(submodel.material.index as u32))
        }
        _ => None,
    };
    let mode = match submodel.primitive {
        Primitive::TriangleList => json::mesh::Mode::Triangles,
        Primitive::TriangleStrip => json::mesh::Mode::TriangleStrip,
        Primitive::TriangleFan => json::mesh::Mode::TriangleFan,
    };
    Ok(json::Mesh {
        extensions: None,
        extras: Default::default(),
        name: Some(format!("Mesh {mesh_index}")),
        primitives: vec![json::mesh::Primitive {
            attributes,
            extensions: None,
            extras: Default::default(),
            indices: Some(indices),
            material,
            mode: Valid(mode),
            targets: None,
        }],
        weights: None,
    })
}
