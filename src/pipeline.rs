//! Shape conversion: decode or generate each shape, post-process it and store it as a canonical polygon file

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use crate::error::DecodeError;
use crate::geometry::{LoadOptions, Mesh, MeshReader, MeshWriter, Transform, MIN_SURFACE_AREA};
use crate::ply::PolygonFile;
use crate::primitives::{self, SphereParams};
#[cfg(feature = "serialized")]
use crate::serialized::SerializedFile;
#[cfg(feature = "wavefront-obj")]
use crate::wavefront_obj::WavefrontObj;

/// Directory, relative to the output root, that converted meshes are written to
pub const DEFAULT_MESH_DIR: &str = "meshes";

/// Kind of a shape, from its plugin tag
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ShapeKind {
    Rectangle,
    Sphere,
    Serialized,
    Obj,
    Ply,
    /// Any other tag; conversion is skipped
    Unsupported(String),
}

impl ShapeKind {
    pub fn tag(&self) -> &str {
        match self {
            ShapeKind::Rectangle => "rectangle",
            ShapeKind::Sphere => "sphere",
            ShapeKind::Serialized => "serialized",
            ShapeKind::Obj => "obj",
            ShapeKind::Ply => "ply",
            ShapeKind::Unsupported(tag) => tag,
        }
    }

    /// True for kinds that are read from a source file
    pub fn is_file_backed(&self) -> bool {
        matches!(self, ShapeKind::Serialized | ShapeKind::Obj | ShapeKind::Ply)
    }
}

impl From<&str> for ShapeKind {
    fn from(tag: &str) -> Self {
        match tag {
            "rectangle" => ShapeKind::Rectangle,
            "sphere" => ShapeKind::Sphere,
            "serialized" => ShapeKind::Serialized,
            "obj" => ShapeKind::Obj,
            "ply" => ShapeKind::Ply,
            other => ShapeKind::Unsupported(other.to_string()),
        }
    }
}

impl From<String> for ShapeKind {
    fn from(tag: String) -> Self {
        ShapeKind::from(tag.as_str())
    }
}

impl From<ShapeKind> for String {
    fn from(kind: ShapeKind) -> Self {
        kind.tag().to_string()
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Per-shape post-processing switches; all off by default
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeFlags {
    pub flip_normals: bool,
    pub flip_tex_coords: bool,
    /// Re-facet the mesh with per-triangle normals; source normals are not loaded
    pub face_normals: bool,
    /// Shape (serialized) or group (Wavefront) within the source file
    pub shape_index: usize,
}

impl ShapeFlags {
    /// True if any flag requires the mesh to be modified
    pub fn needs_processing(&self) -> bool {
        self.flip_normals || self.flip_tex_coords || self.face_normals
    }
}

/// One shape reference from the scene
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShapeDescriptor {
    #[serde(rename = "type")]
    pub kind: ShapeKind,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub flags: ShapeFlags,
    /// Source file of file-backed kinds, relative to the input root unless absolute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<PathBuf>,
    /// Sphere center, radius and tessellation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sphere: Option<SphereParams>,
}

impl ShapeDescriptor {
    pub fn new(kind: ShapeKind) -> Self {
        ShapeDescriptor { kind, transform: Transform::IDENTITY, flags: ShapeFlags::default(), filename: None, sphere: None }
    }

    pub fn from_file(kind: ShapeKind, filename: impl Into<PathBuf>) -> Self {
        ShapeDescriptor { filename: Some(filename.into()), ..ShapeDescriptor::new(kind) }
    }
}

/// Result of converting one shape
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertedShape {
    /// Position of the shape in the converted list
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: ShapeKind,
    /// Polygon file path, relative to the output root, `/` separated
    pub relative_path: String,
    /// The source polygon file is referenced directly instead of being re-encoded
    pub pass_through: bool,
}

/// Computes `path` relative to `base`, if both share a root
fn relative_to(path: &Path, base: &Path) -> Option<PathBuf> {
    let mut path_components = path.components().peekable();
    let mut base_components = base.components().peekable();
    while let (Some(a), Some(b)) = (path_components.peek(), base_components.peek()) {
        if a != b {
            break;
        }
        path_components.next();
        base_components.next();
    }

    let mut relative = PathBuf::new();
    for component in base_components {
        match component {
            Component::Normal(_) => relative.push(".."),
            Component::CurDir => {}
            _ => return None,
        }
    }
    relative.extend(path_components);
    Some(relative)
}

/// Paths and bookkeeping shared by all shapes of one conversion
///
/// Owns the registry of claimed output paths, so that two shapes never write to the same file.
#[derive(Debug)]
pub struct ConversionContext {
    input_root: PathBuf,
    output_root: PathBuf,
    mesh_dir: PathBuf,
    claimed_paths: HashSet<PathBuf>,
    converted: usize,
}

impl ConversionContext {
    /// # Arguments
    ///
    /// * `input_root`: Directory relative source paths are resolved against
    /// * `output_root`: Directory the scene output lives in; written paths are relative to it
    ///
    /// returns: ConversionContext
    pub fn new(input_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        ConversionContext {
            input_root: input_root.into(),
            output_root: output_root.into(),
            mesh_dir: PathBuf::from(DEFAULT_MESH_DIR),
            claimed_paths: HashSet::new(),
            converted: 0,
        }
    }

    /// Sets the mesh directory, relative to the output root
    pub fn with_mesh_dir(mut self, mesh_dir: impl Into<PathBuf>) -> Self {
        self.mesh_dir = mesh_dir.into();
        self
    }

    pub fn mesh_dir(&self) -> PathBuf {
        self.output_root.join(&self.mesh_dir)
    }

    /// Number of shapes converted so far
    pub fn converted_count(&self) -> usize {
        self.converted
    }

    pub fn resolve_input(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.input_root.join(path)
        }
    }

    /// Claims an output path for a mesh named after `name`, creating the mesh directory if needed
    ///
    /// The extension is replaced by `.ply`; names that were claimed before get `_2`, `_3`, ... appended to their stem.
    pub fn request_mesh_path(&mut self, name: &Path) -> io::Result<PathBuf> {
        let mesh_dir = self.mesh_dir();
        fs::create_dir_all(&mesh_dir)?;

        let stem = name.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mesh".to_string());
        let mut candidate = mesh_dir.join(format!("{}.ply", stem));
        let mut counter = 2;
        while !self.claimed_paths.insert(candidate.clone()) {
            candidate = mesh_dir.join(format!("{}_{}.ply", stem, counter));
            counter += 1;
        }
        Ok(candidate)
    }

    /// Path as written to the scene: relative to the output root where possible, with `/` separators
    pub fn prepare_filename(&self, path: &Path) -> String {
        let relative = if path.is_absolute() {
            relative_to(path, &self.output_root).unwrap_or_else(|| path.to_path_buf())
        } else {
            path.to_path_buf()
        };
        relative.to_string_lossy().replace('\\', "/")
    }
}

fn open(path: &Path) -> Result<BufReader<File>, DecodeError> {
    Ok(BufReader::new(File::open(path)?))
}

/// Decodes the mesh of a file-backed shape kind
///
/// Kinds whose format module is disabled, and kinds that are not file-backed, are Unsupported.
pub fn decode(kind: &ShapeKind, path: &Path, options: &LoadOptions) -> Result<Mesh, DecodeError> {
    match kind {
        ShapeKind::Ply => PolygonFile::read_mesh(open(path)?, options),
        #[cfg(feature = "serialized")]
        ShapeKind::Serialized => SerializedFile::read_mesh(open(path)?, options),
        #[cfg(feature = "wavefront-obj")]
        ShapeKind::Obj => WavefrontObj::read_mesh(open(path)?, options),
        other => Err(DecodeError::Unsupported(format!("cannot decode {} shapes", other))),
    }
}

/// Canonical polygon file encoding of a mesh
pub fn encode(mesh: &Mesh) -> Vec<u8> {
    mesh.to_polygon_file_bytes()
}

/// Transform, degenerate rejection, then the flag-controlled steps
fn post_process(mesh: &mut Mesh, descriptor: &ShapeDescriptor) -> Result<(), DecodeError> {
    mesh.apply_transform(&descriptor.transform);

    let area = mesh.surface_area();
    if area <= MIN_SURFACE_AREA {
        return Err(DecodeError::Degenerate { area });
    }

    let flags = &descriptor.flags;
    if flags.face_normals {
        mesh.compute_face_normals();
    }
    if flags.flip_tex_coords {
        mesh.flip_tex_v();
    }
    if flags.flip_normals {
        mesh.flip_normals();
    }
    Ok(())
}

/// Converts one shape, writing its polygon file into the mesh directory
///
/// # Arguments
///
/// * `context`: Path resolution and output registry
/// * `descriptor`: Shape to convert
///
/// returns: Result<ConvertedShape, DecodeError>
pub fn convert_shape(context: &mut ConversionContext, descriptor: &ShapeDescriptor) -> Result<ConvertedShape, DecodeError> {
    let index = context.converted;
    let flags = &descriptor.flags;

    let (mut mesh, name) = match &descriptor.kind {
        ShapeKind::Rectangle => (primitives::rectangle(), PathBuf::from(format!("__rectangle_{}.ply", index))),
        ShapeKind::Sphere => (
            primitives::uv_sphere(&descriptor.sphere.unwrap_or_default())?,
            PathBuf::from(format!("__sphere_{}.ply", index)),
        ),
        kind if kind.is_file_backed() => {
            let filename = descriptor.filename.as_deref()
                .ok_or_else(|| DecodeError::Format(format!("{} shape has no filename", kind)))?;
            let source = context.resolve_input(filename);

            if *kind == ShapeKind::Ply && descriptor.transform.is_identity() && !flags.needs_processing() {
                if !source.is_file() {
                    return Err(DecodeError::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("polygon file {} does not exist", source.display()),
                    )));
                }
                let relative_path = context.prepare_filename(&source);
                info!("referencing {} directly", relative_path);
                context.converted += 1;
                return Ok(ConvertedShape { index, kind: kind.clone(), relative_path, pass_through: true });
            }

            let options = LoadOptions {
                ignore_normals: flags.face_normals,
                ignore_tex_coords: false,
                shape_index: flags.shape_index,
            };
            let mesh = decode(kind, &source, &options)?;
            debug!("decoded {}: {} vertices, {} faces", source.display(), mesh.vertex_count(), mesh.face_count());
            (mesh, source)
        }
        other => return Err(DecodeError::Unsupported(format!("no support for {} shapes", other))),
    };

    post_process(&mut mesh, descriptor)?;

    let path = context.request_mesh_path(&name)?;
    PolygonFile::write_mesh(BufWriter::new(File::create(&path)?), &mesh)?;
    info!("wrote {} ({} vertices, {} faces)", path.display(), mesh.vertex_count(), mesh.face_count());

    context.converted += 1;
    Ok(ConvertedShape {
        index,
        kind: descriptor.kind.clone(),
        relative_path: context.prepare_filename(&path),
        pass_through: false,
    })
}

/// Converts every shape, skipping (and logging) those that fail
///
/// Returns the converted shapes in input order.
pub fn convert_shapes(context: &mut ConversionContext, descriptors: &[ShapeDescriptor]) -> Vec<ConvertedShape> {
    descriptors.iter()
        .enumerate()
        .filter_map(|(position, descriptor)| match convert_shape(context, descriptor) {
            Ok(converted) => Some(converted),
            Err(error) => {
                error!(
                    "skipping shape {} ({}{}): {}",
                    position,
                    descriptor.kind,
                    descriptor.filename.as_ref().map(|path| format!(", {}", path.display())).unwrap_or_default(),
                    error
                );
                None
            }
        })
        .collect()
}
