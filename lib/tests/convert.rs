use image::{Rgba, RgbaImage};
use spoollib::{
    convert::{
        convert,
        directory::{GlobalMaterials, NoGlobals},
        ConvertOptions,
    },
    error::{ConvertError, Diagnostic, FormatError},
    format::{
        chunk::{Chunk, ChunkFile},
        mdpc::{
            Instance, Lod, MaterialHandle, MaterialOwner, Model, ModelPackage, Primitive,
            SPackageHeader, SSubModel, SubModel, K_CHUNK_MDPC,
        },
        mtrl::{Material, MaterialTable, Substance, Texture, TextureFlags},
        txtr::{decode_dds, encode_dds},
        vertex::{Vertex, VertexBuffer, VertexDeclaration},
        CMatrix4f, FormatVersion, Uid,
    },
    util::table::read_table,
};

const SOURCE_UID: Uid = Uid::new(0x0002_1234, 0x77);

fn texture(uid: u32, rgb: [u8; 3], alpha: u8) -> Texture {
    let image = RgbaImage::from_pixel(4, 4, Rgba([rgb[0], rgb[1], rgb[2], alpha]));
    let data = encode_dds(&image).unwrap();
    Texture { uid, hash: crc32fast::hash(&data), kind: 1, flags: 0, width: 4, height: 4, data }
}

fn color_mask_table() -> MaterialTable {
    MaterialTable {
        materials: vec![Material {
            flags: 0,
            reserved: 0,
            substances: vec![Substance {
                bin: 1,
                flags: 0x18,
                mode: [0x06, 0, 0x11],
                reserved: 0,
                texture_flags: TextureFlags::DplColorMask,
                textures: vec![0, 1],
            }],
        }],
        textures: vec![texture(100, [200, 0, 0], 60), texture(101, [0, 200, 0], 120)],
    }
}

/// Four corners of a quad, with the first corner repeated.
fn quad_vertices() -> Vec<Vertex> {
    [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]]
        .iter()
        .map(|&[x, y]| Vertex::new([x, y, 0.0], [0.0, 0.0, 1.0], [x, y]))
        .collect()
}

fn submodel(index_start: u32, index_count: u32, material: MaterialHandle) -> SubModel {
    SubModel {
        primitive: Primitive::TriangleList,
        vertex_buffer: 0,
        flags: 0,
        vertex_base: 0,
        vertex_count: 5,
        index_start,
        index_count,
        material,
    }
}

fn single_instance_model(submodels: Vec<SubModel>) -> Model {
    let mut model = Model::default();
    model.lods[0] = Some(Lod {
        slot_type: 0,
        mask: 1,
        instances: vec![Instance { transform: CMatrix4f::IDENTITY, flags: 0, submodels }],
    });
    model
}

fn dpl_source(submodels: Vec<SubModel>) -> ModelPackage {
    let mut package = ModelPackage::new(FormatVersion::Dpl, SOURCE_UID);
    package.vertex_buffers =
        vec![VertexBuffer::from_vertices(VertexDeclaration::Basic, &quad_vertices())];
    package.indices = vec![0, 1, 2, 4, 2, 3];
    package.models.push(single_instance_model(submodels));
    package.materials = color_mask_table();
    package
}

fn encode_decode(package: &ModelPackage) -> ModelPackage {
    ModelPackage::read(&package.write().unwrap()).unwrap()
}

fn all_substances(package: &ModelPackage) -> impl Iterator<Item = &Substance> {
    package.materials.materials.iter().flat_map(|m| &m.substances)
}

#[test]
fn test_round_trip_through_container() {
    let package = dpl_source(vec![submodel(0, 6, MaterialHandle::local(0))]);
    let file = ChunkFile::new(vec![
        Chunk::buffer(K_CHUNK_MDPC, 6, 4, package.write().unwrap()),
        Chunk::buffer(spoollib::format::FourCC(*b"INFO"), 0, 2, b"build 42".to_vec()),
    ]);
    let bytes = file.to_bytes().unwrap();
    let read = ChunkFile::read(&bytes).unwrap();
    let leaf = read.find(K_CHUNK_MDPC).and_then(Chunk::bytes).unwrap();
    assert_eq!(ModelPackage::read(leaf).unwrap(), package);
}

#[test]
fn test_scenario_expand_color_mask() {
    let source = dpl_source(vec![submodel(0, 6, MaterialHandle::local(0))]);
    let result = convert(
        &encode_decode(&source),
        &ConvertOptions::new(FormatVersion::Driv3r),
        &NoGlobals,
    )
    .unwrap();
    assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    let package = encode_decode(&result.package);
    assert_eq!(package.version, FormatVersion::Driv3r);
    let substance = &package.materials.materials[0].substances[0];
    assert_eq!(substance.texture_flags, TextureFlags::DamageColorMask);
    assert_eq!(substance.textures.len(), 4);
    assert_eq!(substance.flags, 0x01 | 0x04);
    assert_eq!(substance.mode, [0, 0, 0]);
    let mask = decode_dds(&package.materials.textures[substance.textures[3]].data).unwrap();
    assert!(mask.pixels().all(|p| p.0 == [120, 120, 120, 255]));
}

#[test]
fn test_scenario_local_owner_sentinel() {
    let source = dpl_source(vec![submodel(0, 6, MaterialHandle::local(0))]);
    let data = source.write().unwrap();
    let header: SPackageHeader = read_table(&data, "header", 0, 1).unwrap().remove(0);
    let raw: SSubModel =
        read_table(&data, "submodel", header.submodel_offset, 1).unwrap().remove(0);
    // DPL stores local references as the package's own short UID
    assert_eq!(raw.material_owner, SOURCE_UID.short());

    let result = convert(
        &ModelPackage::read(&data).unwrap(),
        &ConvertOptions::new(FormatVersion::Driv3r),
        &NoGlobals,
    )
    .unwrap();
    assert_eq!(result.package.uid, Uid::new(0xFF, 0));
    let data = result.package.write().unwrap();
    let header: SPackageHeader = read_table(&data, "header", 0, 1).unwrap().remove(0);
    let raw: SSubModel =
        read_table(&data, "submodel", header.submodel_offset, 1).unwrap().remove(0);
    assert_eq!(raw.material_owner, 0xFFFD);
    assert_eq!(raw.material_index, 0);
}

#[test]
fn test_scenario_shared_global_material() {
    let global_handle = MaterialHandle { index: 1, owner: MaterialOwner::Global(0x0042) };
    let source = dpl_source(vec![
        submodel(0, 3, global_handle),
        submodel(3, 3, global_handle),
        submodel(0, 3, MaterialHandle::local(0)),
    ]);
    let mut global = ModelPackage::new(FormatVersion::Dpl, Uid::new(0x0042, 0));
    global.materials = color_mask_table();
    global.materials.materials.insert(0, Material { flags: 5, ..Default::default() });
    let mut globals = GlobalMaterials::new();
    globals.insert(&global);

    let result =
        convert(&source, &ConvertOptions::new(FormatVersion::Driv3r), &globals).unwrap();
    let handles: Vec<_> = result.package.submodels().map(|s| s.material).collect();
    assert_eq!(handles, vec![
        MaterialHandle::local(1),
        MaterialHandle::local(1),
        MaterialHandle::local(0)
    ]);
    // One local material plus a single copy of the global one
    assert_eq!(result.package.materials.materials.len(), 2);
    // Both materials use the same source textures and so share their copies
    assert_eq!(result.package.materials.textures.len(), 4);
}

#[test]
fn test_scenario_multiple_vertex_buffers() {
    let mut source = dpl_source(vec![submodel(0, 6, MaterialHandle::local(0))]);
    source.vertex_buffers.push(source.vertex_buffers[0].clone());
    let err = convert(&source, &ConvertOptions::new(FormatVersion::Driv3r), &NoGlobals)
        .unwrap_err();
    assert_eq!(err.downcast_ref::<ConvertError>(), Some(&ConvertError::VertexBufferCount(2)));
}

#[test]
fn test_conversion_deterministic() {
    let source = dpl_source(vec![
        submodel(0, 6, MaterialHandle::local(0)),
        submodel(0, 3, MaterialHandle { index: 0, owner: MaterialOwner::Shadow }),
    ]);
    for target in [FormatVersion::Driv3r, FormatVersion::Dpl] {
        let options = ConvertOptions::new(target);
        let a = convert(&source, &options, &NoGlobals).unwrap().package.write().unwrap();
        let b = convert(&source, &options, &NoGlobals).unwrap().package.write().unwrap();
        assert_eq!(a, b);
    }
}

#[test]
fn test_handle_validity() {
    let source = dpl_source(vec![
        submodel(0, 3, MaterialHandle::local(0)),
        submodel(0, 3, MaterialHandle::local(9)),
        submodel(0, 3, MaterialHandle { index: 3, owner: MaterialOwner::Global(0x0555) }),
        submodel(0, 3, MaterialHandle { index: 3, owner: MaterialOwner::Shadow }),
        submodel(3, 3, MaterialHandle { index: 8, owner: MaterialOwner::Unresolved }),
    ]);
    let result = convert(&source, &ConvertOptions::new(FormatVersion::Driv3r), &NoGlobals).unwrap();
    let count = result.package.materials.materials.len();
    for submodel in result.package.submodels() {
        match submodel.material.owner {
            MaterialOwner::ThisPackage => assert!((submodel.material.index as usize) < count),
            MaterialOwner::Shadow => {}
            MaterialOwner::Unresolved => assert_eq!(submodel.material.index, 0),
            MaterialOwner::Global(_) => panic!("global handle survived conversion"),
        }
    }
    assert_eq!(result.diagnostics.len(), 2);
    assert!(matches!(result.diagnostics[0], Diagnostic::InvalidLocalMaterial { model: 0, .. }));
    assert!(matches!(result.diagnostics[1], Diagnostic::UnresolvedMaterial { model: 0, .. }));
}

#[test]
fn test_texture_shape_invariant() {
    let source = dpl_source(vec![submodel(0, 6, MaterialHandle::local(0))]);
    let driv3r = convert(&source, &ConvertOptions::new(FormatVersion::Driv3r), &NoGlobals)
        .unwrap()
        .package;
    let dpl = convert(&driv3r, &ConvertOptions::new(FormatVersion::Dpl), &NoGlobals)
        .unwrap()
        .package;
    for package in [&driv3r, &dpl] {
        for substance in all_substances(package) {
            assert_eq!(substance.textures.len(), substance.texture_flags.texture_count());
        }
    }
    // Collapsing restores the compact shape, bits and alpha
    let substance = &dpl.materials.materials[0].substances[0];
    assert_eq!(substance.texture_flags, TextureFlags::DplColorMask);
    assert_eq!(substance.flags, 0x18);
    assert_eq!(substance.mode[0], 0x06);
    assert_eq!(dpl.materials.textures.len(), 2);
    let clean = decode_dds(&dpl.materials.textures[substance.textures[0]].data).unwrap();
    assert!(clean.pixels().all(|p| p.0 == [200, 0, 0, 60]));
    let damage = decode_dds(&dpl.materials.textures[substance.textures[1]].data).unwrap();
    assert!(damage.pixels().all(|p| p.0 == [0, 200, 0, 120]));
    // The source UID was never requested, so the Driv3r placeholder carries over
    assert_eq!(dpl.uid, Uid::new(0xFF, 0));
}

#[test]
fn test_weld_idempotent() {
    let source = dpl_source(vec![submodel(0, 6, MaterialHandle::local(0))]);
    let first = convert(&source, &ConvertOptions::new(FormatVersion::Dpl), &NoGlobals)
        .unwrap()
        .package;
    // The duplicated corner is welded away
    assert_eq!(first.vertex_buffers[0].vertex_count(), 4);
    assert_eq!(first.indices, vec![0, 1, 2, 0, 2, 3]);
    let second = convert(&first, &ConvertOptions::new(FormatVersion::Dpl), &NoGlobals)
        .unwrap()
        .package;
    assert_eq!(second.vertex_buffers, first.vertex_buffers);
    assert_eq!(second.indices, first.indices);
}

#[test]
fn test_models_do_not_share_vertices() {
    let mut source = dpl_source(vec![submodel(0, 6, MaterialHandle::local(0))]);
    source.models.push(source.models[0].clone());
    let result = convert(&source, &ConvertOptions::new(FormatVersion::Dpl), &NoGlobals).unwrap();
    let package = result.package;
    assert_eq!(package.vertex_buffers[0].vertex_count(), 8);
    let bases: Vec<_> = package.submodels().map(|s| s.vertex_base).collect();
    assert_eq!(bases, vec![0, 4]);
    // Indices are relative to each model's first vertex
    assert_eq!(package.indices[..6], package.indices[6..]);
}

#[test]
fn test_strips_become_lists() {
    let mut source = dpl_source(vec![]);
    source.indices = vec![0, 1, 3, 2];
    let mut strip = submodel(0, 4, MaterialHandle::local(0));
    strip.primitive = Primitive::TriangleStrip;
    source.models[0] = single_instance_model(vec![strip]);
    let result = convert(&source, &ConvertOptions::new(FormatVersion::Driv3r), &NoGlobals).unwrap();
    let out: Vec<_> = result.package.submodels().collect();
    assert_eq!(out[0].primitive, Primitive::TriangleList);
    assert_eq!(out[0].index_count, 6);
}

#[test]
fn test_missing_geometry() {
    let mut source = dpl_source(vec![submodel(0, 6, MaterialHandle::local(0))]);
    source.models[0].lods[2] = Some(Lod { slot_type: 2, mask: 0, instances: vec![] });
    let err = convert(&source, &ConvertOptions::new(FormatVersion::Driv3r), &NoGlobals)
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ConvertError>(),
        Some(&ConvertError::MissingGeometry { model: 0, slot: 2 })
    );
}

#[test]
fn test_unmapped_lod_slot() {
    let mut source = dpl_source(vec![submodel(0, 6, MaterialHandle::local(0))]);
    if let Some(lod) = source.models[0].lods[0].as_mut() {
        lod.slot_type = 7;
    }
    let err = convert(&source, &ConvertOptions::new(FormatVersion::Driv3r), &NoGlobals)
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ConvertError>(),
        Some(&ConvertError::UnmappedLodSlot { model: 0, slot_type: 7 })
    );
}

#[test]
fn test_submodel_outside_buffers() {
    let source = dpl_source(vec![submodel(3, 6, MaterialHandle::local(0))]);
    let err = convert(&source, &ConvertOptions::new(FormatVersion::Driv3r), &NoGlobals)
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<FormatError>(), Some(FormatError::OutOfBounds { .. })));
}

#[test]
fn test_index_outside_submodel_range() {
    // Index 4 exists in the buffer but lies past the submodel's four vertices
    let mut short = submodel(0, 6, MaterialHandle::local(0));
    short.vertex_count = 4;
    let source = dpl_source(vec![short]);
    let err = convert(&source, &ConvertOptions::new(FormatVersion::Driv3r), &NoGlobals)
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<FormatError>(),
        Some(&FormatError::OutOfBounds { what: "vertex index", offset: 4, size: 1, len: 4 })
    );
}

fn attributed_vertices() -> Vec<Vertex> {
    let mut vertices = quad_vertices();
    for (i, v) in vertices.iter_mut().enumerate() {
        v.color = [i as u8 * 40, 10, 20, 255];
        v.blend_position = [i as f32, 1.0, 2.0];
        v.blend_normal = [0.0, 1.0, 0.0];
    }
    vertices[4] = vertices[0];
    vertices
}

fn with_declaration(decl: VertexDeclaration, vertices: &[Vertex]) -> ModelPackage {
    let mut source = dpl_source(vec![submodel(0, 6, MaterialHandle::local(0))]);
    source.vertex_declaration = decl;
    source.vertex_buffers = vec![VertexBuffer::from_vertices(decl, vertices)];
    source
}

#[test]
fn test_colored_weld_requires_exact_color() {
    let vertices = attributed_vertices();
    let source = with_declaration(VertexDeclaration::Colored, &vertices);
    let result = convert(&source, &ConvertOptions::new(FormatVersion::Driv3r), &NoGlobals).unwrap();
    let package = encode_decode(&result.package);
    assert_eq!(package.vertex_declaration, VertexDeclaration::Colored);
    assert_eq!(package.indices, vec![0, 1, 2, 0, 2, 3]);
    let out = package.vertex_buffers[0].vertices(VertexDeclaration::Colored).unwrap();
    let colors: Vec<_> = out.iter().map(|v| v.color).collect();
    assert_eq!(colors, vertices[..4].iter().map(|v| v.color).collect::<Vec<_>>());

    // Same position, normal and uv, one color step apart
    let mut vertices = vertices;
    vertices[4].color[0] += 1;
    let source = with_declaration(VertexDeclaration::Colored, &vertices);
    let result = convert(&source, &ConvertOptions::new(FormatVersion::Driv3r), &NoGlobals).unwrap();
    let package = encode_decode(&result.package);
    assert_eq!(package.indices, vec![0, 1, 2, 3, 2, 4]);
    let out = package.vertex_buffers[0].vertices(VertexDeclaration::Colored).unwrap();
    assert_eq!(out.len(), 5);
    assert_eq!(out[3].color, vertices[4].color);
}

#[test]
fn test_blend_fields_survive_conversion() {
    let vertices = attributed_vertices();
    let source = with_declaration(VertexDeclaration::Blended, &vertices);
    let result = convert(&source, &ConvertOptions::new(FormatVersion::Driv3r), &NoGlobals).unwrap();
    let package = encode_decode(&result.package);
    assert_eq!(package.vertex_declaration, VertexDeclaration::Blended);
    assert_eq!(package.vertex_buffers[0].stride, 56);
    let out = package.vertex_buffers[0].vertices(VertexDeclaration::Blended).unwrap();
    // Colors are not part of the blended layout
    let expected: Vec<_> = vertices[..4].iter().map(|v| Vertex { color: [0; 4], ..*v }).collect();
    assert_eq!(out, expected);
}

#[test]
fn test_explicit_target_uid() {
    let source = dpl_source(vec![submodel(0, 6, MaterialHandle::local(0))]);
    let options = ConvertOptions {
        target_uid: Some(Uid::new(5, 6)),
        ..ConvertOptions::new(FormatVersion::Driv3r)
    };
    let result = convert(&source, &options, &NoGlobals).unwrap();
    assert_eq!(result.package.uid, Uid::new(5, 6));
    // Same-version conversion keeps the source UID
    let result = convert(&source, &ConvertOptions::new(FormatVersion::Dpl), &NoGlobals).unwrap();
    assert_eq!(result.package.uid, SOURCE_UID);
    assert_eq!(result.package.materials, source.materials);
}
