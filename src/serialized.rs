//! Mitsuba serialized mesh container reader
//!
//! Layout, all little-endian:
//! ```text
//! [u16 magic 0x041C][u16 version][zlib payload]      shape 0
//! [u16 magic 0x041C][u16 version][zlib payload]      shape 1 ...
//! [offset of shape 0] ... [offset of shape n-1]      u64 for version >= 4, u32 before
//! [u32 shape count]
//! ```

use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use bitflags::bitflags;
use flate2::read::ZlibDecoder;
use tracing::{debug, warn};
use crate::error::DecodeError;
use crate::geometry::{LoadOptions, Mesh, MeshReader, VectorN};
use crate::util::{EndianReader, Endianness};

/// Serialized container parser
pub struct SerializedFile;

pub const SERIALIZED_MAGIC: u16 = 0x041C;
/// Oldest container version that stores a shape table
pub const MIN_VERSION: u16 = 3;
/// Size of the magic + version pair repeated at the start of every shape
const SHAPE_HEADER_SIZE: u64 = 4;
/// Upper bound on up-front allocation; counts come from untrusted data
const MAX_PREALLOCATION: u64 = 1 << 20;

bitflags! {
    /// Per-shape content flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct MeshFlags: u32 {
        const VERTEX_NORMALS = 0x0001;
        const TEX_COORDS = 0x0002;
        const VERTEX_COLORS = 0x0008;
        const FACE_NORMALS = 0x0010;
        const SINGLE_PRECISION = 0x1000;
        const DOUBLE_PRECISION = 0x2000;
    }
}

/// Byte ranges of every shape record, taken from the trailing shape table
#[derive(Debug, PartialEq)]
struct ContainerIndex {
    version: u16,
    shapes: Vec<Range<u64>>,
}

fn read_magic<R: Read>(reader: &mut EndianReader<R>) -> Result<u16, DecodeError> {
    let magic = reader.read_u16()?;
    if magic != SERIALIZED_MAGIC {
        return Err(DecodeError::Format(format!("invalid serialized magic {:#06x}", magic)));
    }
    let version = reader.read_u16()?;
    if version < MIN_VERSION {
        return Err(DecodeError::Format(format!("serialized version {} is too old, need at least {}", version, MIN_VERSION)));
    }
    Ok(version)
}

fn read_index<R: Read + Seek>(input: &mut R) -> Result<ContainerIndex, DecodeError> {
    input.seek(SeekFrom::Start(0))?;
    let version = read_magic(&mut EndianReader::new(&mut *input, Endianness::Little))?;

    let length = input.seek(SeekFrom::End(0))?;
    if length < SHAPE_HEADER_SIZE + 4 {
        return Err(DecodeError::TruncatedStream("serialized file has no shape table".to_string()));
    }
    input.seek(SeekFrom::End(-4))?;
    let shape_count = EndianReader::new(&mut *input, Endianness::Little).read_u32()? as u64;

    let offset_size = if version >= 4 { 8 } else { 4 };
    let table_start = shape_count.checked_mul(offset_size)
        .and_then(|table_size| (length - 4).checked_sub(table_size))
        .filter(|&start| start >= SHAPE_HEADER_SIZE)
        .ok_or_else(|| DecodeError::Format(format!("shape table of {} entries does not fit in {} bytes", shape_count, length)))?;

    input.seek(SeekFrom::Start(table_start))?;
    let mut reader = EndianReader::new(&mut *input, Endianness::Little);
    let mut starts = Vec::with_capacity(shape_count as usize);
    for _ in 0..shape_count {
        starts.push(if version >= 4 { reader.read_u64()? } else { reader.read_u32()? as u64 });
    }

    let mut shapes = Vec::with_capacity(starts.len());
    for (index, &start) in starts.iter().enumerate() {
        let end = starts.get(index + 1).copied().unwrap_or(table_start);
        if start > end || end > table_start {
            return Err(DecodeError::Format(format!("shape {} has invalid byte range {}..{}", index, start, end)));
        }
        shapes.push(start..end);
    }

    Ok(ContainerIndex { version, shapes })
}

/// Reads `count` vectors of `N` floats, stored as f32 or f64
fn read_vectors<R: Read, const N: usize>(
    reader: &mut EndianReader<R>,
    count: u64,
    double_precision: bool,
) -> Result<Vec<VectorN<f32, N>>, DecodeError> {
    let mut vectors = Vec::with_capacity(count.min(MAX_PREALLOCATION) as usize);
    for _ in 0..count {
        let mut array = [0.0f32; N];
        for value in &mut array {
            *value = if double_precision { reader.read_f64()? as f32 } else { reader.read_f32()? };
        }
        vectors.push(VectorN::new(array));
    }
    Ok(vectors)
}

/// Parses one inflated shape record
fn read_shape<R: Read>(reader: &mut EndianReader<R>, version: u16, options: &LoadOptions) -> Result<Mesh, DecodeError> {
    let flags = MeshFlags::from_bits_retain(reader.read_u32()?);

    if version >= 4 {
        // Shape name, unused
        while reader.read_u8()? != 0 {}
    }

    let vertex_count = reader.read_u64()?;
    let triangle_count = reader.read_u64()?;
    if vertex_count == 0 || triangle_count == 0 {
        return Err(DecodeError::NoData(format!("shape has {} vertices and {} triangles", vertex_count, triangle_count)));
    }
    debug!("serialized shape: {} vertices, {} triangles, flags {:?}", vertex_count, triangle_count, flags);

    let double_precision = flags.contains(MeshFlags::DOUBLE_PRECISION);
    let scalar_size = if double_precision { 8 } else { 4 };

    let vertices = read_vectors::<_, 3>(reader, vertex_count, double_precision)?;

    let mut normals = Vec::new();
    if flags.contains(MeshFlags::VERTEX_NORMALS) {
        normals = read_vectors::<_, 3>(reader, vertex_count, double_precision)?;
        if options.ignore_normals {
            normals = Vec::new();
        }
    }

    let mut tex_coords = Vec::new();
    if flags.contains(MeshFlags::TEX_COORDS) {
        tex_coords = read_vectors::<_, 2>(reader, vertex_count, double_precision)?;
        if options.ignore_tex_coords {
            tex_coords = Vec::new();
        }
    }

    if flags.contains(MeshFlags::VERTEX_COLORS) {
        let color_bytes = vertex_count.checked_mul(3 * scalar_size)
            .ok_or_else(|| DecodeError::Format(format!("vertex count {} overflows color data", vertex_count)))?;
        reader.skip(color_bytes)?;
    }

    let corner_count = triangle_count.checked_mul(3)
        .ok_or_else(|| DecodeError::Format(format!("triangle count {} overflows index data", triangle_count)))?;
    let mut indices = Vec::with_capacity(corner_count.min(MAX_PREALLOCATION) as usize);
    let wide_indices = vertex_count > u32::MAX as u64;
    if wide_indices {
        warn!("shape has {} vertices, 64 bit indices are truncated to 32 bits", vertex_count);
    }
    for _ in 0..corner_count {
        let index = if wide_indices { reader.read_u64()? } else { reader.read_u32()? as u64 };
        if index >= vertex_count {
            return Err(DecodeError::InvalidIndex { index, vertex_count });
        }
        indices.push(index as u32);
    }

    if flags.contains(MeshFlags::FACE_NORMALS) {
        debug!("shape stores face normals, ignoring them");
    }
    Ok(Mesh::from_parts_unchecked(vertices, normals, tex_coords, indices))
}

impl SerializedFile {
    /// Number of shapes stored in a container
    pub fn shape_count<R: Read + Seek>(input: &mut R) -> Result<usize, DecodeError> {
        Ok(read_index(input)?.shapes.len())
    }
}

impl<R: Read + Seek> MeshReader<R> for SerializedFile {
    fn read_mesh(mut input: R, options: &LoadOptions) -> Result<Mesh, DecodeError> {
        let index = read_index(&mut input)?;
        if index.shapes.is_empty() {
            return Err(DecodeError::NoData("serialized file contains no shapes".to_string()));
        }
        let range = index.shapes.get(options.shape_index)
            .ok_or(DecodeError::ShapeIndexOutOfRange { index: options.shape_index, count: index.shapes.len() })?
            .clone();
        if range.end - range.start < SHAPE_HEADER_SIZE {
            return Err(DecodeError::TruncatedStream(format!("shape {} is only {} bytes", options.shape_index, range.end - range.start)));
        }

        input.seek(SeekFrom::Start(range.start))?;
        let shape_version = read_magic(&mut EndianReader::new(&mut input, Endianness::Little))?;
        if shape_version != index.version {
            debug!("shape {} has version {}, container has {}", options.shape_index, shape_version, index.version);
        }

        let payload = (&mut input).take(range.end - range.start - SHAPE_HEADER_SIZE);
        let mut reader = EndianReader::new(ZlibDecoder::new(payload), Endianness::Little);
        read_shape(&mut reader, shape_version, options)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::{Cursor, Write};
    use byteorder::{LittleEndian, WriteBytesExt};
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use crate::geometry::{Vector2D, Vector3D};
    use super::*;

    /// Shape record contents before compression
    pub(crate) struct TestShape {
        pub flags: u32,
        pub vertices: Vec<[f64; 3]>,
        pub normals: Vec<[f64; 3]>,
        pub tex_coords: Vec<[f64; 2]>,
        pub indices: Vec<u64>,
    }

    impl TestShape {
        /// A strip of `columns` quads, `2 * (columns + 1)` vertices and `2 * columns` triangles
        pub(crate) fn strip(columns: u32) -> TestShape {
            let mut vertices = Vec::new();
            for column in 0..=columns {
                vertices.push([column as f64, 0.0, 0.0]);
                vertices.push([column as f64, 1.0, 0.0]);
            }
            let mut indices = Vec::new();
            for column in 0..columns as u64 {
                let base = column * 2;
                indices.extend_from_slice(&[base, base + 2, base + 3, base, base + 3, base + 1]);
            }
            TestShape { flags: MeshFlags::SINGLE_PRECISION.bits(), vertices, normals: Vec::new(), tex_coords: Vec::new(), indices }
        }

        fn encode(&self, version: u16) -> Vec<u8> {
            let double = self.flags & MeshFlags::DOUBLE_PRECISION.bits() != 0;
            let mut raw = Vec::new();
            raw.write_u32::<LittleEndian>(self.flags).unwrap();
            if version >= 4 {
                raw.extend_from_slice(b"test shape\0");
            }
            raw.write_u64::<LittleEndian>(self.vertices.len() as u64).unwrap();
            raw.write_u64::<LittleEndian>((self.indices.len() / 3) as u64).unwrap();
            let write_values = |raw: &mut Vec<u8>, values: &[f64]| {
                for &value in values {
                    if double {
                        raw.write_f64::<LittleEndian>(value).unwrap();
                    } else {
                        raw.write_f32::<LittleEndian>(value as f32).unwrap();
                    }
                }
            };
            write_values(&mut raw, &self.vertices.concat());
            write_values(&mut raw, &self.normals.concat());
            write_values(&mut raw, &self.tex_coords.concat());
            if self.flags & MeshFlags::VERTEX_COLORS.bits() != 0 {
                write_values(&mut raw, &vec![0.5; self.vertices.len() * 3]);
            }
            for &index in &self.indices {
                if self.vertices.len() as u64 > u32::MAX as u64 {
                    raw.write_u64::<LittleEndian>(index).unwrap();
                } else {
                    raw.write_u32::<LittleEndian>(index as u32).unwrap();
                }
            }

            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw).unwrap();
            encoder.finish().unwrap()
        }
    }

    /// Builds a complete container holding `shapes`
    pub(crate) fn container(version: u16, shapes: &[TestShape]) -> Vec<u8> {
        let mut file = Vec::new();
        let mut offsets = Vec::new();
        for shape in shapes {
            offsets.push(file.len() as u64);
            file.write_u16::<LittleEndian>(SERIALIZED_MAGIC).unwrap();
            file.write_u16::<LittleEndian>(version).unwrap();
            file.extend_from_slice(&shape.encode(version));
        }
        for offset in offsets {
            if version >= 4 {
                file.write_u64::<LittleEndian>(offset).unwrap();
            } else {
                file.write_u32::<LittleEndian>(offset as u32).unwrap();
            }
        }
        file.write_u32::<LittleEndian>(shapes.len() as u32).unwrap();
        file
    }

    fn read(file: Vec<u8>, shape_index: usize) -> Result<Mesh, DecodeError> {
        SerializedFile::read_mesh(Cursor::new(file), &LoadOptions { shape_index, ..LoadOptions::default() })
    }

    #[test]
    fn strip_counts() {
        let mesh = read(container(4, &[TestShape::strip(96)]), 0).unwrap();
        assert_eq!(mesh.vertex_count(), 194);
        assert_eq!(mesh.face_count(), 192);
    }

    #[test]
    fn two_hundred_vertices() {
        let mut shape = TestShape::strip(96);
        // Pad to 200 vertices with unreferenced points
        shape.vertices.extend(std::iter::repeat([5.0, 5.0, 5.0]).take(6));
        let mesh = read(container(4, &[shape]), 0).unwrap();
        assert_eq!(mesh.vertex_count(), 200);
        assert_eq!(mesh.face_count(), 192);
    }

    #[test]
    fn selects_shape_by_index() {
        let file = container(4, &[TestShape::strip(1), TestShape::strip(3)]);
        assert_eq!(SerializedFile::shape_count(&mut Cursor::new(file.clone())).unwrap(), 2);
        assert_eq!(read(file.clone(), 0).unwrap().face_count(), 2);
        assert_eq!(read(file.clone(), 1).unwrap().face_count(), 6);
        assert!(matches!(read(file, 2), Err(DecodeError::ShapeIndexOutOfRange { index: 2, count: 2 })));
    }

    #[test]
    fn version_three_has_narrow_offsets_and_no_name() {
        let file = container(3, &[TestShape::strip(2), TestShape::strip(4)]);
        let mesh = read(file, 1).unwrap();
        assert_eq!(mesh.face_count(), 8);
        assert_eq!(mesh.vertices()[9], Vector3D::new([4.0, 1.0, 0.0]));
    }

    #[test]
    fn double_precision_attributes() {
        let mut shape = TestShape::strip(1);
        shape.flags = (MeshFlags::DOUBLE_PRECISION | MeshFlags::VERTEX_NORMALS | MeshFlags::TEX_COORDS | MeshFlags::VERTEX_COLORS).bits();
        shape.normals = vec![[0.0, 0.0, 1.0]; 4];
        shape.tex_coords = vec![[0.25, 0.75]; 4];

        let mesh = read(container(4, &[shape]), 0).unwrap();
        assert_eq!(mesh.normals()[3], Vector3D::new([0.0, 0.0, 1.0]));
        assert_eq!(mesh.tex_coords()[1], Vector2D::new([0.25, 0.75]));
        assert_eq!(mesh.indices(), &[0, 2, 3, 0, 3, 1]);
    }

    #[test]
    fn ignore_options_still_consume_attributes() {
        let mut shape = TestShape::strip(1);
        shape.flags |= (MeshFlags::VERTEX_NORMALS | MeshFlags::TEX_COORDS).bits();
        shape.normals = vec![[0.0, 0.0, 1.0]; 4];
        shape.tex_coords = vec![[0.0, 1.0]; 4];

        let options = LoadOptions { ignore_normals: true, ignore_tex_coords: true, shape_index: 0 };
        let mesh = SerializedFile::read_mesh(Cursor::new(container(4, &[shape])), &options).unwrap();
        assert!(!mesh.has_normals());
        assert!(!mesh.has_tex_coords());
        assert_eq!(mesh.indices(), &[0, 2, 3, 0, 3, 1]);
    }

    #[test]
    fn invalid_index() {
        let mut shape = TestShape::strip(1);
        shape.indices[4] = 4;
        assert!(matches!(read(container(4, &[shape]), 0), Err(DecodeError::InvalidIndex { index: 4, vertex_count: 4 })));
    }

    #[test]
    fn empty_shape_has_no_data() {
        let shape = TestShape { flags: 0, vertices: Vec::new(), normals: Vec::new(), tex_coords: Vec::new(), indices: Vec::new() };
        assert!(matches!(read(container(4, &[shape]), 0), Err(DecodeError::NoData(_))));
        assert!(matches!(read(container(4, &[]), 0), Err(DecodeError::Format(_))));
    }

    #[test]
    fn bad_header() {
        let mut file = container(4, &[TestShape::strip(1)]);
        file[0] = 0x1D;
        assert!(matches!(read(file, 0), Err(DecodeError::Format(_))));

        let mut file = container(4, &[TestShape::strip(1)]);
        file[2] = 2;
        assert!(matches!(read(file, 0), Err(DecodeError::Format(_))));

        assert!(matches!(read(vec![0x1C, 0x04], 0), Err(DecodeError::TruncatedStream(_))));
    }

    #[test]
    fn oversized_shape_table() {
        let mut file = container(4, &[TestShape::strip(1)]);
        let count = file.len() - 4;
        file[count..].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(read(file, 0), Err(DecodeError::Format(_))));
    }

    #[test]
    fn truncated_payload() {
        let file = container(4, &[TestShape::strip(8)]);
        // Cut the compressed payload in half but keep a valid trailer
        let payload_end = file.len() - 12;
        let mut cut = file[..payload_end / 2].to_vec();
        cut.write_u64::<LittleEndian>(0).unwrap();
        cut.write_u32::<LittleEndian>(1).unwrap();
        assert!(matches!(read(cut, 0), Err(DecodeError::TruncatedStream(_))));
    }
}
