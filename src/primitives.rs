//! Procedural primitive meshes

use serde::{Deserialize, Serialize};
use crate::error::DecodeError;
use crate::geometry::{GeometryNumber, Mesh, Vector2D, Vector3D};

/// Axis-aligned square spanning `[-1, 1]²` in the z = 0 plane, facing +z
pub fn rectangle() -> Mesh {
    Mesh::from_parts_unchecked(
        vec![
            Vector3D::new([-1.0, -1.0, 0.0]),
            Vector3D::new([1.0, -1.0, 0.0]),
            Vector3D::new([1.0, 1.0, 0.0]),
            Vector3D::new([-1.0, 1.0, 0.0]),
        ],
        vec![Vector3D::new([0.0, 0.0, 1.0]); 4],
        vec![
            Vector2D::new([0.0, 0.0]),
            Vector2D::new([1.0, 0.0]),
            Vector2D::new([1.0, 1.0]),
            Vector2D::new([0.0, 1.0]),
        ],
        vec![0, 1, 2, 0, 2, 3],
    )
}

/// Parameters of a UV sphere
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SphereParams {
    pub center: [f32; 3],
    pub radius: f32,
    /// Longitude divisions
    pub slices: u32,
    /// Latitude divisions; there are `stacks + 1` rings from pole to pole
    pub stacks: u32,
}

impl Default for SphereParams {
    fn default() -> Self {
        SphereParams { center: [0.0; 3], radius: 1.0, slices: 64, stacks: 32 }
    }
}

/// Builds a UV sphere
///
/// Ring `i` sits at polar angle `rho = π·i/stacks` and column `j` at azimuth `theta = 2π·j/slices`.
/// Every ring has `slices` vertices, including the two pole rings, whose vertices coincide.
/// Normals are unit length; texture coordinates are `(theta / 2π, rho / π)`.
///
/// # Arguments
///
/// * `params`: Center, radius and tessellation
///
/// returns: Result<Mesh, DecodeError>
pub fn uv_sphere(params: &SphereParams) -> Result<Mesh, DecodeError> {
    let SphereParams { center, radius, slices, stacks } = *params;
    if slices < 3 || stacks < 2 {
        return Err(DecodeError::InvalidMesh(format!("sphere needs at least 3 slices and 2 stacks, got {} and {}", slices, stacks)));
    }
    if !radius.is_finite() || radius <= 0.0 {
        return Err(DecodeError::InvalidMesh(format!("invalid sphere radius {}", radius)));
    }

    // Vertex ids and the index count (6 per quad) must fit in u32
    let too_large = || DecodeError::InvalidMesh(format!("sphere tessellation {}x{} is too large", slices, stacks));
    let ring_count = stacks.checked_add(1).ok_or_else(too_large)?;
    let vertex_count = ring_count.checked_mul(slices).ok_or_else(too_large)? as usize;
    stacks.checked_mul(slices).and_then(|quads| quads.checked_mul(6)).ok_or_else(too_large)?;

    let center = Vector3D::new(center);
    let mut vertices = Vec::with_capacity(vertex_count);
    let mut normals = Vec::with_capacity(vertex_count);
    let mut tex_coords = Vec::with_capacity(vertex_count);

    for ring in 0..ring_count {
        let v = ring as f32 / stacks as f32;
        let rho = f32::PI * v;
        for column in 0..slices {
            let u = column as f32 / slices as f32;
            let theta = 2.0 * f32::PI * u;
            let direction = Vector3D::new([rho.sin() * theta.cos(), rho.sin() * theta.sin(), rho.cos()]);

            vertices.push(center + direction * radius);
            normals.push(direction);
            tex_coords.push(Vector2D::new([u, v]));
        }
    }

    let mut indices = Vec::with_capacity((stacks * slices * 6) as usize);
    for ring in 0..stacks {
        let next_ring = (ring + 1) % ring_count;
        for column in 0..slices {
            let next_column = (column + 1) % slices;
            let a = ring * slices + column;
            let b = ring * slices + next_column;
            let c = next_ring * slices + column;
            let d = next_ring * slices + next_column;
            indices.extend_from_slice(&[a, c, b, b, c, d]);
        }
    }

    Ok(Mesh::from_parts_unchecked(vertices, normals, tex_coords, indices))
}
