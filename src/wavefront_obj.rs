//! Wavefront .obj reader
//!
//! Tokens are extracted by tobj; corner de-duplication and triangulation happen here.

use std::io::{self, BufRead, Read};
use indexmap::IndexSet;
use tracing::{debug, warn};
use crate::error::DecodeError;
use crate::geometry::{triangulate_fan, LoadOptions, Mesh, MeshReader, Vector2D, Vector3D};
use crate::util::SliceExtension;

/// Wavefront .obj parser
pub struct WavefrontObj;

/// Group-wide (position, normal, texture coordinate) index tuple of one face corner
type CornerKey = (usize, Option<usize>, Option<usize>);

/// Accumulates the models of one group into a single indexed mesh
#[derive(Default)]
struct GroupBuilder {
    use_normals: bool,
    use_tex_coords: bool,
    /// Unique corners; the set index is the output vertex id
    corners: IndexSet<CornerKey>,
    vertices: Vec<Vector3D<f32>>,
    normals: Vec<Vector3D<f32>>,
    tex_coords: Vec<Vector2D<f32>>,
    indices: Vec<u32>,
    /// Index offsets of the current model within the group
    position_base: usize,
    normal_base: usize,
    tex_coord_base: usize,
    warned_short_face: bool,
}

/// Selects the per-corner attribute indices of a model
///
/// tobj leaves the attribute index list empty when it coincides with the position indices.
fn attribute_indices<'a>(indices: &'a [u32], attribute_indices: &'a [u32], attribute: &str) -> Result<&'a [u32], DecodeError> {
    if attribute_indices.is_empty() {
        Ok(indices)
    } else if attribute_indices.len() == indices.len() {
        Ok(attribute_indices)
    } else {
        Err(DecodeError::Format(format!("{} {} indices for {} face corners", attribute_indices.len(), attribute, indices.len())))
    }
}

impl GroupBuilder {
    fn new(use_normals: bool, use_tex_coords: bool) -> Self {
        GroupBuilder { use_normals, use_tex_coords, ..GroupBuilder::default() }
    }

    fn add_model(&mut self, mesh: &tobj::Mesh) -> Result<(), DecodeError> {
        let normal_indices = attribute_indices(&mesh.indices, &mesh.normal_indices, "normal")?;
        let tex_coord_indices = attribute_indices(&mesh.indices, &mesh.texcoord_indices, "texture coordinate")?;

        let triangle_arities;
        let arities = if mesh.face_arities.is_empty() {
            triangle_arities = vec![3u32; mesh.indices.len() / 3];
            &triangle_arities
        } else {
            &mesh.face_arities
        };

        let mut face_buffer = Vec::new();
        let mut start = 0usize;
        for &arity in arities {
            let end = start + arity as usize;
            if end > mesh.indices.len() {
                return Err(DecodeError::Format(format!("face of {} corners runs past the index list", arity)));
            }

            face_buffer.clear();
            for corner in start..end {
                face_buffer.push(self.add_corner(mesh, corner, normal_indices, tex_coord_indices)?);
            }
            if !triangulate_fan(&face_buffer, &mut self.indices) && !self.warned_short_face {
                warn!("wavefront group contains faces with fewer than 3 corners, dropping them");
                self.warned_short_face = true;
            }
            start = end;
        }

        self.position_base += mesh.positions.len() / 3;
        self.normal_base += mesh.normals.len() / 3;
        self.tex_coord_base += mesh.texcoords.len() / 2;
        Ok(())
    }

    /// Returns the vertex id of a corner, creating the vertex on first use
    fn add_corner(&mut self, mesh: &tobj::Mesh, corner: usize, normal_indices: &[u32], tex_coord_indices: &[u32]) -> Result<u32, DecodeError> {
        let position_index = mesh.indices[corner] as usize;
        let normal_index = self.use_normals.then(|| normal_indices[corner] as usize);
        let tex_coord_index = self.use_tex_coords.then(|| tex_coord_indices[corner] as usize);

        let key = (
            self.position_base + position_index,
            normal_index.map(|index| self.normal_base + index),
            tex_coord_index.map(|index| self.tex_coord_base + index),
        );
        let (vertex_id, inserted) = self.corners.insert_full(key);

        if inserted {
            let position = mesh.positions.select_array::<3>(position_index * 3)
                .ok_or_else(|| missing_element(position_index, mesh.positions.len() / 3))?;
            self.vertices.push(Vector3D::new(*position));

            if let Some(index) = normal_index {
                let normal = mesh.normals.select_array::<3>(index * 3)
                    .ok_or_else(|| missing_element(index, mesh.normals.len() / 3))?;
                self.normals.push(Vector3D::new(*normal));
            }
            if let Some(index) = tex_coord_index {
                let uv = mesh.texcoords.select_array::<2>(index * 2)
                    .ok_or_else(|| missing_element(index, mesh.texcoords.len() / 2))?;
                self.tex_coords.push(Vector2D::new(*uv));
            }
        }

        u32::try_from(vertex_id).map_err(|_| DecodeError::Format("wavefront group has more than 2^32 vertices".to_string()))
    }

    fn finish(self, options: &LoadOptions) -> Result<Mesh, DecodeError> {
        if self.vertices.is_empty() {
            return Err(DecodeError::NoData("mesh has no vertices".to_string()));
        }
        debug!("wavefront group: {} corners de-duplicated to {} vertices", self.indices.len(), self.vertices.len());

        let normals = if options.ignore_normals { Vec::new() } else { self.normals };
        let tex_coords = if options.ignore_tex_coords { Vec::new() } else { self.tex_coords };
        Mesh::new(self.vertices, normals, tex_coords, self.indices)
    }
}

fn missing_element(index: usize, count: usize) -> DecodeError {
    DecodeError::InvalidIndex { index: index as u64, vertex_count: count as u64 }
}

/// Finds the first face corner whose `keyword` attribute index (`v`, `vt` or `vn`) points past the declared elements
///
/// tobj reports out-of-range corners without the offending index, so the source is scanned again for it.
fn out_of_range_corner(source: &str, keyword: &str) -> Option<DecodeError> {
    let slot = match keyword {
        "v" => 0,
        "vt" => 1,
        _ => 2,
    };
    let declared = source.lines()
        .filter(|line| line.split_whitespace().next() == Some(keyword))
        .count();

    for line in source.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("f") {
            continue;
        }
        for corner in tokens {
            let Some(index) = corner.split('/').nth(slot).and_then(|field| field.parse::<i64>().ok()) else { continue };
            // Relative (negative) indices resolve against elements seen so far and cannot run past the end
            if index > 0 && index as usize > declared {
                return Some(missing_element(index as usize - 1, declared));
            }
        }
    }
    None
}

fn map_load_error(source: &str, error: tobj::LoadError) -> DecodeError {
    let keyword = match error {
        tobj::LoadError::FaceVertexOutOfBounds => "v",
        tobj::LoadError::FaceTexCoordOutOfBounds => "vt",
        tobj::LoadError::FaceNormalOutOfBounds => "vn",
        _ => return DecodeError::Format(format!("wavefront parse error: {}", error)),
    };
    out_of_range_corner(source, keyword)
        .unwrap_or_else(|| DecodeError::Format(format!("wavefront parse error: {}", error)))
}

/// tobj starts a new model at every material change; consecutive models of the same name form one group
fn group_models(models: Vec<tobj::Model>) -> Vec<Vec<tobj::Model>> {
    let mut groups: Vec<Vec<tobj::Model>> = Vec::new();
    for model in models {
        match groups.last_mut() {
            Some(group) if group[0].name == model.name => group.push(model),
            _ => groups.push(vec![model]),
        }
    }
    groups
}

impl<R: BufRead> MeshReader<R> for WavefrontObj {
    fn read_mesh(mut input: R, options: &LoadOptions) -> Result<Mesh, DecodeError> {
        let load_options = tobj::LoadOptions {
            single_index: false,
            triangulate: false,
            ignore_points: true,
            ignore_lines: true,
            ..tobj::LoadOptions::default()
        };
        let mut source = String::new();
        input.read_to_string(&mut source).map_err(|error| match error.kind() {
            io::ErrorKind::InvalidData => DecodeError::Format("wavefront file is not valid UTF-8".to_string()),
            _ => DecodeError::from(error),
        })?;

        // Material libraries are never opened
        let (models, _) = tobj::load_obj_buf(&mut source.as_bytes(), &load_options, |_| Err(tobj::LoadError::OpenFileFailed))
            .map_err(|error| map_load_error(&source, error))?;

        // Attribute presence is decided for the whole file, not per group
        let has_normals = models.iter().any(|model| !model.mesh.normals.is_empty());
        let has_tex_coords = models.iter().any(|model| !model.mesh.texcoords.is_empty());

        let groups = group_models(models);
        let group_count = groups.len();
        let group = groups.into_iter()
            .nth(options.shape_index)
            .ok_or(DecodeError::ShapeIndexOutOfRange { index: options.shape_index, count: group_count })?;

        let mut builder = GroupBuilder::new(has_normals, has_tex_coords);
        for model in &group {
            builder.add_model(&model.mesh)?;
        }
        builder.finish(options)
    }
}
