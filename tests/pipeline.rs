use std::fs;
use std::io::Write;
use std::path::Path;
use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tempfile::TempDir;
use meshport::geometry::{Vector3D, MeshReader};
use meshport::pipeline::{convert_shape, convert_shapes, ConversionContext, ShapeDescriptor, ShapeKind};
use meshport::ply::PolygonFile;
use meshport::{DecodeError, LoadOptions, Mesh, Transform};

const QUAD_OBJ: &str = "\
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
vn 0 0 1
f 1/1/1 2/2/1 3/3/1 4/4/1
";

fn context(directory: &TempDir) -> ConversionContext {
    ConversionContext::new(directory.path().join("scene"), directory.path().join("out"))
}

fn read_output(directory: &TempDir, relative_path: &str) -> Mesh {
    let bytes = fs::read(directory.path().join("out").join(relative_path)).unwrap();
    PolygonFile::read_mesh(&bytes[..], &LoadOptions::default()).unwrap()
}

fn write_source(directory: &TempDir, name: &str, contents: &[u8]) {
    let scene = directory.path().join("scene");
    fs::create_dir_all(&scene).unwrap();
    fs::write(scene.join(name), contents).unwrap();
}

/// Single-shape version 4 container with positions and indices only
fn serialized_container(vertices: &[[f32; 3]], indices: &[u32]) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.write_u32::<LittleEndian>(0x1000).unwrap();
    raw.extend_from_slice(b"shape\0");
    raw.write_u64::<LittleEndian>(vertices.len() as u64).unwrap();
    raw.write_u64::<LittleEndian>((indices.len() / 3) as u64).unwrap();
    for value in vertices.concat() {
        raw.write_f32::<LittleEndian>(value).unwrap();
    }
    for &index in indices {
        raw.write_u32::<LittleEndian>(index).unwrap();
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw).unwrap();

    let mut file = Vec::new();
    file.write_u16::<LittleEndian>(0x041C).unwrap();
    file.write_u16::<LittleEndian>(4).unwrap();
    file.extend_from_slice(&encoder.finish().unwrap());
    file.write_u64::<LittleEndian>(0).unwrap();
    file.write_u32::<LittleEndian>(1).unwrap();
    file
}

#[test]
fn rectangle_is_transformed_and_written() {
    let directory = TempDir::new().unwrap();
    let mut context = context(&directory);

    let mut descriptor = ShapeDescriptor::new(ShapeKind::Rectangle);
    descriptor.transform = Transform::translation(0.0, 0.0, 5.0);
    descriptor.flags.flip_normals = true;

    let converted = convert_shape(&mut context, &descriptor).unwrap();
    assert_eq!(converted.relative_path, "meshes/__rectangle_0.ply");
    assert!(!converted.pass_through);

    let mesh = read_output(&directory, &converted.relative_path);
    assert_eq!(mesh.vertices()[0], Vector3D::new([-1.0, -1.0, 5.0]));
    assert_eq!(mesh.normals()[0], Vector3D::new([0.0, 0.0, -1.0]));
}

#[test]
fn sphere_uses_running_counter() {
    let directory = TempDir::new().unwrap();
    let mut context = context(&directory);

    let shapes = [ShapeDescriptor::new(ShapeKind::Rectangle), ShapeDescriptor::new(ShapeKind::Sphere)];
    let converted = convert_shapes(&mut context, &shapes);
    assert_eq!(converted.len(), 2);
    assert_eq!(converted[1].relative_path, "meshes/__sphere_1.ply");
    assert_eq!(read_output(&directory, &converted[1].relative_path).face_count(), 2 * 32 * 64);
}

#[test]
fn untouched_polygon_files_pass_through() {
    let directory = TempDir::new().unwrap();
    write_source(&directory, "floor.ply", &meshport::primitives::rectangle().to_polygon_file_bytes());
    let mut context = context(&directory);

    let converted = convert_shape(&mut context, &ShapeDescriptor::from_file(ShapeKind::Ply, "floor.ply")).unwrap();
    assert!(converted.pass_through);
    assert_eq!(converted.relative_path, "../scene/floor.ply");
    assert!(!directory.path().join("out/meshes").exists());
}

#[test]
fn missing_polygon_files_are_not_referenced() {
    let directory = TempDir::new().unwrap();
    let mut context = context(&directory);

    let descriptor = ShapeDescriptor::from_file(ShapeKind::Ply, "nowhere.ply");
    assert!(matches!(convert_shape(&mut context, &descriptor), Err(DecodeError::Io(_))));
    assert!(convert_shapes(&mut context, &[descriptor]).is_empty());
    assert_eq!(context.converted_count(), 0);
}

#[test]
fn transformed_polygon_files_are_re_encoded() {
    let directory = TempDir::new().unwrap();
    write_source(&directory, "floor.ply", &meshport::primitives::rectangle().to_polygon_file_bytes());
    let mut context = context(&directory);

    let mut descriptor = ShapeDescriptor::from_file(ShapeKind::Ply, "floor.ply");
    descriptor.transform = Transform::scale(2.0, 2.0, 2.0);
    let converted = convert_shape(&mut context, &descriptor).unwrap();

    assert!(!converted.pass_through);
    assert_eq!(converted.relative_path, "meshes/floor.ply");
    assert!((read_output(&directory, &converted.relative_path).surface_area() - 16.0).abs() < 1e-4);
}

#[test]
fn wavefront_flags() {
    let directory = TempDir::new().unwrap();
    write_source(&directory, "quad.obj", QUAD_OBJ.as_bytes());
    let mut context = context(&directory);

    let mut descriptor = ShapeDescriptor::from_file(ShapeKind::Obj, "quad.obj");
    descriptor.flags.face_normals = true;
    descriptor.flags.flip_tex_coords = true;
    let converted = convert_shape(&mut context, &descriptor).unwrap();

    let mesh = read_output(&directory, &converted.relative_path);
    assert_eq!(mesh.vertex_count(), 6);
    assert_eq!(mesh.indices(), &[0, 1, 2, 3, 4, 5]);
    assert_eq!(mesh.normals()[0], Vector3D::new([0.0, 0.0, 1.0]));
    assert_eq!(mesh.tex_coords()[0][1], 1.0);
}

#[test]
fn serialized_shapes_convert() {
    let directory = TempDir::new().unwrap();
    let container = serialized_container(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]], &[0, 1, 2]);
    write_source(&directory, "leaf.serialized", &container);
    let mut context = context(&directory);

    let converted = convert_shape(&mut context, &ShapeDescriptor::from_file(ShapeKind::Serialized, "leaf.serialized")).unwrap();
    assert_eq!(converted.relative_path, "meshes/leaf.ply");
    let mesh = read_output(&directory, &converted.relative_path);
    assert_eq!(mesh.vertex_count(), 3);
    assert_eq!(mesh.face_count(), 1);
}

#[test]
fn name_collisions_get_suffixes() {
    let directory = TempDir::new().unwrap();
    write_source(&directory, "quad.obj", QUAD_OBJ.as_bytes());
    let mut context = context(&directory);

    let mut descriptor = ShapeDescriptor::from_file(ShapeKind::Obj, "quad.obj");
    descriptor.transform = Transform::translation(1.0, 0.0, 0.0);
    let converted = convert_shapes(&mut context, &[descriptor.clone(), descriptor.clone(), descriptor]);

    let paths: Vec<_> = converted.iter().map(|shape| shape.relative_path.as_str()).collect();
    assert_eq!(paths, ["meshes/quad.ply", "meshes/quad_2.ply", "meshes/quad_3.ply"]);
    assert!(directory.path().join("out/meshes/quad_3.ply").is_file());
}

#[test]
fn failing_shapes_are_skipped() {
    let directory = TempDir::new().unwrap();
    write_source(&directory, "line.obj", b"v 0 0 0\nv 1 0 0\nv 2 0 0\nf 1 2 3\n");
    let mut context = context(&directory);

    let shapes = [
        ShapeDescriptor::from_file(ShapeKind::Obj, "line.obj"),
        ShapeDescriptor::new(ShapeKind::from("cylinder")),
        ShapeDescriptor::from_file(ShapeKind::Serialized, "missing.serialized"),
        ShapeDescriptor::new(ShapeKind::Obj),
        ShapeDescriptor::new(ShapeKind::Rectangle),
    ];

    let mut scratch = ConversionContext::new(directory.path().join("scene"), directory.path().join("scratch"));
    assert!(matches!(convert_shape(&mut scratch, &shapes[0]), Err(DecodeError::Degenerate { .. })));
    assert!(matches!(convert_shape(&mut scratch, &shapes[1]), Err(DecodeError::Unsupported(_))));
    assert!(matches!(convert_shape(&mut scratch, &shapes[2]), Err(DecodeError::Io(_))));

    let converted = convert_shapes(&mut context, &shapes);
    assert_eq!(converted.len(), 1);
    assert_eq!(converted[0].kind, ShapeKind::Rectangle);
    assert_eq!(converted[0].relative_path, "meshes/__rectangle_0.ply");
}

#[test]
fn converted_list_serializes() {
    let directory = TempDir::new().unwrap();
    let mut context = context(&directory).with_mesh_dir("geometry");
    let converted = convert_shapes(&mut context, &[ShapeDescriptor::new(ShapeKind::Rectangle)]);

    let json = serde_json::to_value(&converted).unwrap();
    assert_eq!(json[0]["type"], "rectangle");
    assert_eq!(json[0]["relative_path"], "geometry/__rectangle_0.ply");
    assert_eq!(json[0]["pass_through"], false);
    assert!(Path::new(&directory.path().join("out/geometry/__rectangle_0.ply")).is_file());
}
