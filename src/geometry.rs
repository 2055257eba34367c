//! General geometry types: vectors, matrices, transforms and the triangle [`Mesh`]

use std::io;
use std::ops::{Add, Index, IndexMut, Mul, Neg, Sub};
use serde::{Deserialize, Serialize};
use crate::error::DecodeError;

/// Scalar types geometry is generic over, `f32` and `f64`
pub trait GeometryNumber:
    Sized
    + Copy
    + Neg<Output=Self>
    + Add<Self, Output=Self>
    + Sub<Self, Output=Self>
    + Mul<Self, Output=Self>
    + PartialOrd
    + std::iter::Sum
{
    const PI: Self;

    fn sqrt(self) -> Self;
}

impl GeometryNumber for f32 {
    const PI: Self = std::f32::consts::PI;

    fn sqrt(self) -> Self {
        f32::sqrt(self)
    }
}

impl GeometryNumber for f64 {
    const PI: Self = std::f64::consts::PI;

    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
}

/// Fixed-size vector of `N` components
///
/// Meshes use the [`Vector3D`] and [`Vector2D`] aliases.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct VectorN<T, const N: usize> {
    array: [T; N],
}

impl<T, const N: usize> VectorN<T, N> {
    pub const fn new(array: [T; N]) -> Self {
        VectorN { array }
    }

    pub fn to_array(self) -> [T; N] {
        self.array
    }

    /// Applies `f` to every component
    #[inline]
    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> VectorN<U, N> {
        VectorN::new(self.array.map(f))
    }
}

impl<T: Copy, const N: usize> VectorN<T, N> {
    /// Combines the components of two vectors position by position
    ///
    /// ```
    /// use meshport::geometry::Vector3D;
    /// let products = Vector3D::new([1, 2, 3]).zip_with(Vector3D::new([4, 5, 6]), |a, b| a * b);
    /// assert_eq!(products.to_array(), [4, 10, 18]);
    /// ```
    #[inline]
    pub fn zip_with<U: Copy, V>(self, other: VectorN<U, N>, f: impl Fn(T, U) -> V) -> VectorN<V, N> {
        VectorN::new(std::array::from_fn(|component| f(self.array[component], other.array[component])))
    }
}

impl<T: Neg, const N: usize> Neg for VectorN<T, N> {
    type Output = VectorN<T::Output, N>;

    fn neg(self) -> Self::Output {
        self.map(|component| -component)
    }
}

impl<T: Add<Output=T> + Copy, const N: usize> Add for VectorN<T, N> {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        self.zip_with(other, T::add)
    }
}

impl<T: Sub<Output=T> + Copy, const N: usize> Sub for VectorN<T, N> {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        self.zip_with(other, T::sub)
    }
}

/// Scaling by a scalar
impl<T: Mul<Output=T> + Copy, const N: usize> Mul<T> for VectorN<T, N> {
    type Output = Self;

    fn mul(self, factor: T) -> Self {
        self.map(|component| component * factor)
    }
}

impl<T, const N: usize> Index<usize> for VectorN<T, N> {
    type Output = T;

    fn index(&self, component: usize) -> &T {
        &self.array[component]
    }
}

impl<T, const N: usize> IndexMut<usize> for VectorN<T, N> {
    fn index_mut(&mut self, component: usize) -> &mut T {
        &mut self.array[component]
    }
}

impl<T, const N: usize> IntoIterator for VectorN<T, N> {
    type Item = T;
    type IntoIter = std::array::IntoIter<T, N>;

    fn into_iter(self) -> Self::IntoIter {
        self.array.into_iter()
    }
}

impl<T: GeometryNumber, const N: usize> VectorN<T, N> {
    pub fn dot(self, other: Self) -> T {
        self.array.iter()
            .zip(other.array.iter())
            .map(|(&a, &b)| a * b)
            .sum()
    }

    /// Euclidean length
    pub fn magnitude(self) -> T {
        self.dot(self).sqrt()
    }
}

pub type Vector3D<T> = VectorN<T, 3>;
pub type Vector2D<T> = VectorN<T, 2>;

impl<T: Copy + Mul<Output=T> + Sub<Output=T>> Vector3D<T> {
    /// Right-handed cross product `self × other`
    pub fn cross_product(self, other: Self) -> Self {
        let [ax, ay, az] = self.array;
        let [bx, by, bz] = other.array;
        Vector3D::new([
            ay * bz - az * by,
            az * bx - ax * bz,
            ax * by - ay * bx,
        ])
    }
}

/// 3x3 matrix stored as rows; vectors are multiplied as columns, `M · v`
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Matrix3<T>([Vector3D<T>; 3]);

impl<T: GeometryNumber> Matrix3<T> {
    pub fn from_row_major(rows: [[T; 3]; 3]) -> Matrix3<T> {
        Matrix3(rows.map(Vector3D::new))
    }

    pub fn to_row_major(self) -> [[T; 3]; 3] {
        self.0.map(VectorN::to_array)
    }

    /// `M · vector`
    pub fn apply(self, vector: Vector3D<T>) -> Vector3D<T> {
        Vector3D::new(self.0.map(|row| row.dot(vector)))
    }

    pub fn transpose(self) -> Matrix3<T> {
        let rows = self.to_row_major();
        Matrix3::from_row_major(std::array::from_fn(|row| std::array::from_fn(|column| rows[column][row])))
    }

    /// Scales every element by `factor`
    pub fn scaled(self, factor: T) -> Matrix3<T> {
        Matrix3(self.0.map(|row| row * factor))
    }

    pub fn determinant(self) -> T {
        let [a, b, c] = self.0;
        a.dot(b.cross_product(c))
    }

    /// Cofactor matrix, `det(M) · (M⁻¹)ᵀ`; unlike the inverse it exists for singular matrices too
    pub fn cofactor(self) -> Matrix3<T> {
        let [a, b, c] = self.0;
        Matrix3([b.cross_product(c), c.cross_product(a), a.cross_product(b)])
    }
}

/// Tolerance used by [`Transform::is_identity`]
pub const IDENTITY_TOLERANCE: f32 = 1e-5;

/// 4x4 affine transform, stored row-major
///
/// Points are transformed as column vectors: `p' = M · [x, y, z, 1]ᵀ`; the bottom row is not used.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 16]", into = "[f32; 16]")]
pub struct Transform {
    rows: [[f32; 4]; 4],
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        rows: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0]
        ]
    };

    /// Construct a transform from 16 row-major elements
    pub fn from_row_major(elements: [f32; 16]) -> Self {
        Transform { rows: std::array::from_fn(|row| std::array::from_fn(|column| elements[row * 4 + column])) }
    }

    /// The 16 row-major elements of this transform
    pub fn to_row_major(&self) -> [f32; 16] {
        std::array::from_fn(|index| self.rows[index / 4][index % 4])
    }

    pub fn scale(x: f32, y: f32, z: f32) -> Self {
        let mut transform = Transform::IDENTITY;
        transform.rows[0][0] = x;
        transform.rows[1][1] = y;
        transform.rows[2][2] = z;
        transform
    }

    pub fn translation(x: f32, y: f32, z: f32) -> Self {
        let mut transform = Transform::IDENTITY;
        transform.rows[0][3] = x;
        transform.rows[1][3] = y;
        transform.rows[2][3] = z;
        transform
    }

    /// True if every element is within [`IDENTITY_TOLERANCE`] of the identity matrix
    pub fn is_identity(&self) -> bool {
        self.rows.iter().enumerate().all(|(row, values)| {
            values.iter().enumerate().all(|(column, value)| {
                let expected = if row == column { 1.0 } else { 0.0 };
                (value - expected).abs() <= IDENTITY_TOLERANCE
            })
        })
    }

    /// Upper-left 3x3 block, the transform without translation
    pub fn linear_part(&self) -> Matrix3<f32> {
        let [r1, r2, r3, _] = self.rows;
        Matrix3::from_row_major([
            [r1[0], r1[1], r1[2]],
            [r2[0], r2[1], r2[2]],
            [r3[0], r3[1], r3[2]]
        ])
    }

    /// Applies the full transform, including translation, to a position
    pub fn transform_point(&self, point: Vector3D<f32>) -> Vector3D<f32> {
        let translation = Vector3D::new([self.rows[0][3], self.rows[1][3], self.rows[2][3]]);
        self.linear_part().apply(point) + translation
    }

    /// Matrix to transform normals with; the inverse-transpose of the linear part
    ///
    /// Singular transforms fall back to the cofactor matrix, which keeps the direction of the inverse-transpose where it exists.
    pub fn normal_matrix(&self) -> Matrix3<f32> {
        let linear = self.linear_part();
        let cofactor = linear.cofactor();
        let determinant = linear.determinant();
        if determinant.abs() > f32::EPSILON {
            cofactor.scaled(1.0 / determinant)
        } else {
            cofactor
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Transform::IDENTITY
    }
}

impl From<[f32; 16]> for Transform {
    fn from(elements: [f32; 16]) -> Self {
        Transform::from_row_major(elements)
    }
}

impl From<Transform> for [f32; 16] {
    fn from(transform: Transform) -> Self {
        transform.to_row_major()
    }
}

/// Meshes with a surface area at or below this are rejected as degenerate
pub const MIN_SURFACE_AREA: f32 = 1e-6;

/// Triangle mesh
///
/// Normals and texture coordinates are either absent (empty) or given for every vertex, index-aligned with `vertices`.
/// Faces are stored as a flat list of vertex indices; each consecutive triple is one triangle.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Mesh {
    /// Vertex positions; insertion order is the vertex id
    vertices: Vec<Vector3D<f32>>,
    /// Per-vertex normals, empty or the same length as `vertices`
    normals: Vec<Vector3D<f32>>,
    /// Per-vertex texture coordinates, empty or the same length as `vertices`
    tex_coords: Vec<Vector2D<f32>>,
    /// Triangle vertex indices, length is a multiple of 3, every value `< vertices.len()`
    indices: Vec<u32>,
}

impl Mesh {
    /// Constructs a new Mesh, validating all invariants
    ///
    /// # Arguments
    ///
    /// * `vertices`: Vertex positions
    /// * `normals`: Per-vertex normals, or empty
    /// * `tex_coords`: Per-vertex texture coordinates, or empty
    /// * `indices`: Triangle vertex indices
    ///
    /// returns: Result<Mesh, DecodeError>
    pub fn new(
        vertices: Vec<Vector3D<f32>>,
        normals: Vec<Vector3D<f32>>,
        tex_coords: Vec<Vector2D<f32>>,
        indices: Vec<u32>,
    ) -> Result<Mesh, DecodeError> {
        if !normals.is_empty() && normals.len() != vertices.len() {
            return Err(DecodeError::InvalidMesh(format!("{} normals for {} vertices", normals.len(), vertices.len())));
        }
        if !tex_coords.is_empty() && tex_coords.len() != vertices.len() {
            return Err(DecodeError::InvalidMesh(format!("{} texture coordinates for {} vertices", tex_coords.len(), vertices.len())));
        }
        if indices.len() % 3 != 0 {
            return Err(DecodeError::InvalidMesh(format!("index count {} is not a multiple of 3", indices.len())));
        }
        if let Some(&index) = indices.iter().find(|&&index| index as usize >= vertices.len()) {
            return Err(DecodeError::InvalidIndex { index: index as u64, vertex_count: vertices.len() as u64 });
        }

        Ok(Mesh { vertices, normals, tex_coords, indices })
    }

    /// Constructs a mesh whose invariants hold by construction
    pub(crate) fn from_parts_unchecked(
        vertices: Vec<Vector3D<f32>>,
        normals: Vec<Vector3D<f32>>,
        tex_coords: Vec<Vector2D<f32>>,
        indices: Vec<u32>,
    ) -> Mesh {
        debug_assert!(normals.is_empty() || normals.len() == vertices.len());
        debug_assert!(tex_coords.is_empty() || tex_coords.len() == vertices.len());
        debug_assert!(indices.len() % 3 == 0);
        Mesh { vertices, normals, tex_coords, indices }
    }

    pub fn vertices(&self) -> &[Vector3D<f32>] {
        &self.vertices
    }

    pub fn normals(&self) -> &[Vector3D<f32>] {
        &self.normals
    }

    pub fn tex_coords(&self) -> &[Vector2D<f32>] {
        &self.tex_coords
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn face_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn has_normals(&self) -> bool {
        !self.normals.is_empty()
    }

    pub fn has_tex_coords(&self) -> bool {
        !self.tex_coords.is_empty()
    }

    /// Iterator over the vertex indices of each triangle
    pub fn triangles(&self) -> impl ExactSizeIterator<Item=[u32; 3]> + '_ {
        self.indices.chunks_exact(3).map(|triangle| [triangle[0], triangle[1], triangle[2]])
    }

    fn triangle_positions(&self, [a, b, c]: [u32; 3]) -> [Vector3D<f32>; 3] {
        [self.vertices[a as usize], self.vertices[b as usize], self.vertices[c as usize]]
    }

    /// Applies `transform` to all positions, and its normal matrix to all normals
    ///
    /// Identity transforms leave the mesh untouched.
    pub fn apply_transform(&mut self, transform: &Transform) {
        if transform.is_identity() {
            return;
        }

        for vertex in &mut self.vertices {
            *vertex = transform.transform_point(*vertex);
        }

        if !self.normals.is_empty() {
            let normal_matrix = transform.normal_matrix();
            for normal in &mut self.normals {
                *normal = normal_matrix.apply(*normal);
            }
        }
    }

    pub fn flip_normals(&mut self) {
        for normal in &mut self.normals {
            *normal = -*normal;
        }
    }

    /// Flips the vertical texture axis, `v -> 1 - v`
    pub fn flip_tex_v(&mut self) {
        for uv in &mut self.tex_coords {
            uv[1] = 1.0 - uv[1];
        }
    }

    /// Replaces shared vertices with three fresh vertices per triangle, each carrying the triangle's normal
    ///
    /// Normals are the unnormalized edge cross product; their magnitude is twice the triangle's area.
    /// Texture coordinates are duplicated alongside, and indices become `0, 1, 2, ...`.
    pub fn compute_face_normals(&mut self) {
        let corner_count = self.indices.len();
        let mut vertices = Vec::with_capacity(corner_count);
        let mut normals = Vec::with_capacity(corner_count);
        let mut tex_coords = Vec::with_capacity(if self.has_tex_coords() { corner_count } else { 0 });

        for triangle in self.triangles() {
            let [p0, p1, p2] = self.triangle_positions(triangle);
            let normal = (p1 - p0).cross_product(p2 - p0);

            vertices.extend_from_slice(&[p0, p1, p2]);
            normals.extend_from_slice(&[normal; 3]);
            if self.has_tex_coords() {
                tex_coords.extend(triangle.map(|index| self.tex_coords[index as usize]));
            }
        }

        let indices = (0..corner_count as u32).collect();
        *self = Mesh { vertices, normals, tex_coords, indices };
    }

    /// Total area of all triangles
    pub fn surface_area(&self) -> f32 {
        self.triangles()
            .map(|triangle| {
                let [p0, p1, p2] = self.triangle_positions(triangle);
                (p1 - p0).cross_product(p2 - p0).magnitude() * 0.5
            })
            .sum()
    }

    /// True if the surface area is too small for the mesh to be worth keeping
    pub fn is_degenerate(&self) -> bool {
        self.surface_area() <= MIN_SURFACE_AREA
    }
}

/// Appends a fan triangulation of a polygon to `indices`: `(c0, ci, ci+1)` for each `i` in `1..n-1`
///
/// Only exact for convex polygons. Returns false, appending nothing, if the polygon has fewer than 3 corners.
pub fn triangulate_fan(corners: &[u32], indices: &mut Vec<u32>) -> bool {
    match corners {
        [first, rest @ ..] if rest.len() >= 2 => {
            for pair in rest.windows(2) {
                indices.extend_from_slice(&[*first, pair[0], pair[1]]);
            }
            true
        }
        _ => false
    }
}

/// Options for mesh decoders
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Drop vertex normals even if the file provides them
    pub ignore_normals: bool,
    /// Drop texture coordinates even if the file provides them
    pub ignore_tex_coords: bool,
    /// Shape (serialized) or group (Wavefront) to load from multi-shape files
    pub shape_index: usize,
}

pub trait MeshReader<Input> {
    fn read_mesh(input: Input, options: &LoadOptions) -> Result<Mesh, DecodeError>;
}

pub trait MeshWriter<Output> {
    fn write_mesh(output: Output, mesh: &Mesh) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> Mesh {
        Mesh::new(
            vec![
                Vector3D::new([0.0, 0.0, 0.0]),
                Vector3D::new([1.0, 0.0, 0.0]),
                Vector3D::new([1.0, 1.0, 0.0]),
                Vector3D::new([0.0, 1.0, 0.0]),
            ],
            vec![Vector3D::new([0.0, 0.0, 1.0]); 4],
            vec![
                Vector2D::new([0.0, 0.0]),
                Vector2D::new([1.0, 0.0]),
                Vector2D::new([1.0, 1.0]),
                Vector2D::new([0.0, 1.0]),
            ],
            vec![0, 1, 2, 0, 2, 3],
        ).unwrap()
    }

    #[test]
    fn new_rejects_out_of_range_index() {
        let result = Mesh::new(vec![Vector3D::new([0.0; 3]); 3], Vec::new(), Vec::new(), vec![0, 1, 3]);
        assert!(matches!(result, Err(DecodeError::InvalidIndex { index: 3, vertex_count: 3 })));
    }

    #[test]
    fn new_rejects_partial_attributes() {
        let result = Mesh::new(vec![Vector3D::new([0.0; 3]); 3], vec![Vector3D::new([0.0; 3]); 2], Vec::new(), vec![0, 1, 2]);
        assert!(matches!(result, Err(DecodeError::InvalidMesh(_))));
        let result = Mesh::new(vec![Vector3D::new([0.0; 3]); 3], Vec::new(), Vec::new(), vec![0, 1]);
        assert!(matches!(result, Err(DecodeError::InvalidMesh(_))));
    }

    #[test]
    fn cross_product_is_right_handed() {
        let x = Vector3D::new([1.0f32, 0.0, 0.0]);
        let y = Vector3D::new([0.0f32, 1.0, 0.0]);
        assert_eq!(x.cross_product(y), Vector3D::new([0.0, 0.0, 1.0]));
    }

    #[test]
    fn matrix_rows_and_cofactors() {
        let a = Matrix3::from_row_major([[2.0f32, 0.0, 0.0], [0.0, 3.0, 0.0], [1.0, 0.0, 4.0]]);
        assert_eq!(a.transpose().to_row_major(), [[2.0, 0.0, 1.0], [0.0, 3.0, 0.0], [0.0, 0.0, 4.0]]);
        assert_eq!(a.apply(Vector3D::new([1.0, 1.0, 1.0])), Vector3D::new([2.0, 3.0, 5.0]));
        assert_eq!(a.determinant(), 24.0);
        assert_eq!(a.cofactor().to_row_major(), [[12.0, 0.0, -3.0], [0.0, 8.0, 0.0], [0.0, 0.0, 6.0]]);
    }

    #[test]
    fn identity_detection_uses_tolerance() {
        assert!(Transform::IDENTITY.is_identity());
        let mut elements = Transform::IDENTITY.to_row_major();
        elements[3] = 5e-6;
        assert!(Transform::from_row_major(elements).is_identity());
        elements[3] = 1e-3;
        assert!(!Transform::from_row_major(elements).is_identity());
    }

    #[test]
    fn identity_transform_is_noop() {
        let mut mesh = quad();
        mesh.apply_transform(&Transform::IDENTITY);
        assert_eq!(mesh, quad());
    }

    #[test]
    fn translation_moves_points_not_normals() {
        let mut mesh = quad();
        mesh.apply_transform(&Transform::translation(1.0, 2.0, 3.0));
        assert_eq!(mesh.vertices()[2], Vector3D::new([2.0, 3.0, 3.0]));
        assert_eq!(mesh.normals()[0], Vector3D::new([0.0, 0.0, 1.0]));
    }

    #[test]
    fn uniform_scale_quadruples_area() {
        let mut mesh = quad();
        let area = mesh.surface_area();
        mesh.apply_transform(&Transform::scale(2.0, 2.0, 2.0));
        assert!((mesh.surface_area() - area * 4.0).abs() < 1e-5);
    }

    #[test]
    fn non_uniform_scale_keeps_normals_perpendicular() {
        // Plane x + y = 1, normal (1, 1, 0)
        let mut mesh = Mesh::new(
            vec![
                Vector3D::new([1.0, 0.0, 0.0]),
                Vector3D::new([0.0, 1.0, 0.0]),
                Vector3D::new([1.0, 0.0, 1.0]),
            ],
            vec![Vector3D::new([1.0, 1.0, 0.0]); 3],
            Vec::new(),
            vec![0, 1, 2],
        ).unwrap();
        mesh.apply_transform(&Transform::scale(4.0, 1.0, 1.0));

        let edge = mesh.vertices()[1] - mesh.vertices()[0];
        assert!(edge.dot(mesh.normals()[0]).abs() < 1e-5);
    }

    #[test]
    fn face_normals_duplicate_vertices() {
        let mut mesh = quad();
        mesh.compute_face_normals();

        assert_eq!(mesh.vertex_count(), 6);
        assert_eq!(mesh.normals().len(), 6);
        assert_eq!(mesh.tex_coords().len(), 6);
        assert_eq!(mesh.indices(), &[0, 1, 2, 3, 4, 5]);
        // Unit quad halves have area 0.5, so the unnormalized normal has length 1
        assert_eq!(mesh.normals()[0], Vector3D::new([0.0, 0.0, 1.0]));
        assert_eq!(mesh.tex_coords()[5], Vector2D::new([0.0, 1.0]));
    }

    #[test]
    fn face_normals_are_unnormalized() {
        let mut mesh = Mesh::new(
            vec![
                Vector3D::new([0.0, 0.0, 0.0]),
                Vector3D::new([2.0, 0.0, 0.0]),
                Vector3D::new([0.0, 3.0, 0.0]),
            ],
            Vec::new(),
            Vec::new(),
            vec![0, 1, 2],
        ).unwrap();
        mesh.compute_face_normals();
        assert_eq!(mesh.normals(), &[Vector3D::new([0.0, 0.0, 6.0]); 3]);
        assert!(!mesh.has_tex_coords());
    }

    #[test]
    fn flips() {
        let mut mesh = quad();
        mesh.flip_normals();
        mesh.flip_tex_v();
        assert_eq!(mesh.normals()[0], Vector3D::new([0.0, 0.0, -1.0]));
        assert_eq!(mesh.tex_coords()[0], Vector2D::new([0.0, 1.0]));
        assert_eq!(mesh.tex_coords()[2], Vector2D::new([1.0, 0.0]));
    }

    #[test]
    fn fan_triangulation() {
        let mut indices = Vec::new();
        assert!(triangulate_fan(&[7, 8, 9, 10, 11], &mut indices));
        assert_eq!(indices, vec![7, 8, 9, 7, 9, 10, 7, 10, 11]);
        assert!(!triangulate_fan(&[1, 2], &mut indices));
        assert_eq!(indices.len(), 9);
    }

    #[test]
    fn degenerate_detection() {
        let mesh = Mesh::new(vec![Vector3D::new([1.0, 1.0, 1.0]); 3], Vec::new(), Vec::new(), vec![0, 1, 2]).unwrap();
        assert!(mesh.is_degenerate());
        assert!(!quad().is_degenerate());
    }
}
