//! Polygon file (.ply) reader and canonical binary writer
//!
//! The header is line-oriented ASCII up to `end_header`; the body is either whitespace separated text
//! (one record per line) or packed binary in the declared byte order.

use std::io::{self, BufRead, Write};
use byteorder::{NativeEndian, WriteBytesExt};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_till1};
use nom::character::complete::{digit1, space0, space1};
use nom::combinator::{eof, map, map_res, opt, rest};
use nom::sequence::{preceded, tuple};
use nom::IResult;
use tracing::{error, warn};
use crate::error::DecodeError;
use crate::geometry::{triangulate_fan, LoadOptions, Mesh, MeshReader, MeshWriter, Vector2D, Vector3D};
use crate::util::{EndianReader, Endianness};

/// Polygon file parser & generator
pub struct PolygonFile;

/// Upper bound on up-front allocation; element counts come from untrusted headers
const MAX_PREALLOCATION: usize = 1 << 20;

/// Storage method of the body, from the `format` header line
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StorageMethod {
    Ascii,
    Binary(Endianness),
}

impl StorageMethod {
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "ascii" => Some(StorageMethod::Ascii),
            "binary_little_endian" => Some(StorageMethod::Binary(Endianness::Little)),
            "binary_big_endian" => Some(StorageMethod::Binary(Endianness::Big)),
            _ => None
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            StorageMethod::Ascii => "ascii",
            StorageMethod::Binary(Endianness::Little) => "binary_little_endian",
            StorageMethod::Binary(Endianness::Big) => "binary_big_endian",
        }
    }
}

/// Scalar property types, needed to size (and skip) properties we do not use
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ScalarType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl ScalarType {
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "char" | "int8" => Some(ScalarType::Int8),
            "uchar" | "uint8" => Some(ScalarType::UInt8),
            "short" | "int16" => Some(ScalarType::Int16),
            "ushort" | "uint16" => Some(ScalarType::UInt16),
            "int" | "int32" => Some(ScalarType::Int32),
            "uint" | "uint32" => Some(ScalarType::UInt32),
            "float" | "float32" => Some(ScalarType::Float32),
            "double" | "float64" => Some(ScalarType::Float64),
            _ => None
        }
    }

    fn size(self) -> u64 {
        match self {
            ScalarType::Int8 | ScalarType::UInt8 => 1,
            ScalarType::Int16 | ScalarType::UInt16 => 2,
            ScalarType::Int32 | ScalarType::UInt32 | ScalarType::Float32 => 4,
            ScalarType::Float64 => 8,
        }
    }
}

/// Semantic role of a per-vertex float slot; the discriminant is the slot's position in a vertex record buffer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum VertexRole {
    X = 0,
    Y = 1,
    Z = 2,
    NX = 3,
    NY = 4,
    NZ = 5,
    U = 6,
    V = 7,
}

impl VertexRole {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "x" => Some(VertexRole::X),
            "y" => Some(VertexRole::Y),
            "z" => Some(VertexRole::Z),
            "nx" => Some(VertexRole::NX),
            "ny" => Some(VertexRole::NY),
            "nz" => Some(VertexRole::NZ),
            "u" => Some(VertexRole::U),
            "v" => Some(VertexRole::V),
            _ => None
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Property {
    /// `property float <name>`, assigned to a role if the name is known
    Float(Option<VertexRole>),
    /// Scalar of another type; consumed but never assigned
    Skipped(ScalarType),
    /// `property list <count type> <index type> <name>`
    List { count_type: ScalarType, index_type: ScalarType, is_vertex_indices: bool },
    /// Property whose data size cannot be determined
    Unsupported(String),
}

#[derive(Clone, Debug, PartialEq)]
enum ElementKind {
    Vertex,
    Face,
    Other(String),
}

#[derive(Clone, Debug, PartialEq)]
struct Element {
    kind: ElementKind,
    count: usize,
    properties: Vec<Property>,
}

impl Element {
    fn has_role(&self, role: VertexRole) -> bool {
        self.properties.contains(&Property::Float(Some(role)))
    }
}

/// Parsed header: storage method and elements in declaration order
#[derive(Clone, Debug, PartialEq)]
struct Header {
    method: StorageMethod,
    elements: Vec<Element>,
}

impl Header {
    fn element(&self, kind: &ElementKind) -> Option<&Element> {
        self.elements.iter().find(|element| element.kind == *kind)
    }

    fn vertex_count(&self) -> usize {
        self.element(&ElementKind::Vertex).map_or(0, |element| element.count)
    }

    fn has_normals(&self) -> bool {
        self.element(&ElementKind::Vertex)
            .is_some_and(|vertex| [VertexRole::NX, VertexRole::NY, VertexRole::NZ].into_iter().all(|role| vertex.has_role(role)))
    }

    fn has_tex_coords(&self) -> bool {
        self.element(&ElementKind::Vertex)
            .is_some_and(|vertex| vertex.has_role(VertexRole::U) && vertex.has_role(VertexRole::V))
    }
}

/// One tokenized header line
#[derive(Debug, PartialEq)]
enum HeaderLine<'a> {
    Comment,
    Format { method: &'a str, version: Option<&'a str> },
    Element { name: &'a str, count: usize },
    Property { type_name: &'a str, name: &'a str },
    ListProperty { count_type: &'a str, index_type: &'a str, name: &'a str },
    EndHeader,
    Blank,
    Unknown(&'a str),
}

fn token(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c.is_whitespace())(input)
}

fn header_line(input: &str) -> IResult<&str, HeaderLine> {
    preceded(space0, alt((
        map(tuple((alt((tag("comment"), tag("obj_info"))), alt((space1, eof)), rest)), |_| HeaderLine::Comment),
        map(
            tuple((tag("format"), space1, token, opt(preceded(space1, token)))),
            |(_, _, method, version)| HeaderLine::Format { method, version },
        ),
        map(
            tuple((tag("element"), space1, token, space1, map_res(digit1, |count: &str| count.parse::<usize>()))),
            |(_, _, name, _, count)| HeaderLine::Element { name, count },
        ),
        map(
            tuple((tag("property"), space1, tag("list"), space1, token, space1, token, space1, token)),
            |(_, _, _, _, count_type, _, index_type, _, name)| HeaderLine::ListProperty { count_type, index_type, name },
        ),
        map(
            tuple((tag("property"), space1, token, space1, token)),
            |(_, _, type_name, _, name)| HeaderLine::Property { type_name, name },
        ),
        map(tag("end_header"), |_| HeaderLine::EndHeader),
        map(eof, |_| HeaderLine::Blank),
        map(token, HeaderLine::Unknown),
    )))(input)
}

/// Reads one header line, without its line terminator
///
/// Returns None at end of stream
fn read_header_line<R: BufRead>(input: &mut R) -> Result<Option<String>, DecodeError> {
    let mut buffer = Vec::new();
    if input.read_until(b'\n', &mut buffer)? == 0 {
        return Ok(None);
    }
    while matches!(buffer.last(), Some(b'\n' | b'\r')) {
        buffer.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buffer).into_owned()))
}

fn parse_list_property(count_type: &str, index_type: &str, name: &str) -> Property {
    let count = ScalarType::from_keyword(count_type).filter(|ty| matches!(ty, ScalarType::Int8 | ScalarType::UInt8));
    let index = ScalarType::from_keyword(index_type).filter(|ty| matches!(ty, ScalarType::Int32 | ScalarType::UInt32));
    match (count, index) {
        (Some(count_type), Some(index_type)) => Property::List {
            count_type,
            index_type,
            is_vertex_indices: name == "vertex_indices" || name == "vertex_index",
        },
        _ => {
            error!("only 'property list uchar int' is supported, ignoring list '{}' of {} {}", name, count_type, index_type);
            Property::Unsupported(format!("list {} {} {}", count_type, index_type, name))
        }
    }
}

fn parse_scalar_property(element: &ElementKind, type_name: &str, name: &str) -> Property {
    match ScalarType::from_keyword(type_name) {
        Some(ScalarType::Float32) => Property::Float(if *element == ElementKind::Vertex { VertexRole::from_name(name) } else { None }),
        Some(other) => {
            if *element == ElementKind::Vertex {
                error!("only float vertex properties are supported, ignoring {} {}", type_name, name);
            }
            Property::Skipped(other)
        }
        None => {
            error!("unknown property type {}, ignoring {}", type_name, name);
            Property::Unsupported(format!("{} {}", type_name, name))
        }
    }
}

fn read_header<R: BufRead>(input: &mut R) -> Result<Header, DecodeError> {
    match read_header_line(input)? {
        Some(magic) if magic == "ply" => {}
        Some(_) => return Err(DecodeError::Format("missing 'ply' magic".to_string())),
        None => return Err(DecodeError::Format("empty polygon file".to_string())),
    }

    let mut header = Header { method: StorageMethod::Ascii, elements: Vec::new() };
    loop {
        let line = read_header_line(input)?
            .ok_or_else(|| DecodeError::TruncatedStream("header has no 'end_header' line".to_string()))?;
        let (_, parsed) = header_line(&line)
            .map_err(|_| DecodeError::Format(format!("malformed header line '{}'", line)))?;

        match parsed {
            HeaderLine::Comment | HeaderLine::Blank => {}
            HeaderLine::Format { method, .. } => match StorageMethod::from_keyword(method) {
                Some(method) => header.method = method,
                None => warn!("unknown format {}, ignoring it", method),
            },
            HeaderLine::Element { name, count } => {
                let kind = match name {
                    "vertex" => ElementKind::Vertex,
                    "face" => ElementKind::Face,
                    other => {
                        warn!("unknown element type {}", other);
                        ElementKind::Other(other.to_string())
                    }
                };
                header.elements.push(Element { kind, count, properties: Vec::new() });
            }
            HeaderLine::Property { type_name, name } => match header.elements.last_mut() {
                Some(element) => {
                    let property = parse_scalar_property(&element.kind, type_name, name);
                    element.properties.push(property);
                }
                None => warn!("property {} declared before any element, ignoring it", name),
            },
            HeaderLine::ListProperty { count_type, index_type, name } => match header.elements.last_mut() {
                Some(element) => element.properties.push(parse_list_property(count_type, index_type, name)),
                None => warn!("list property {} declared before any element, ignoring it", name),
            },
            HeaderLine::EndHeader => break,
            HeaderLine::Unknown(keyword) => warn!("unknown header entry {}", keyword),
        }
    }

    validate_header(&header)?;
    Ok(header)
}

fn validate_header(header: &Header) -> Result<(), DecodeError> {
    let vertex = header.element(&ElementKind::Vertex)
        .ok_or_else(|| DecodeError::Format("no vertex element".to_string()))?;
    if ![VertexRole::X, VertexRole::Y, VertexRole::Z].into_iter().all(|role| vertex.has_role(role)) {
        return Err(DecodeError::Format("vertex element lacks x, y or z".to_string()));
    }

    let face = header.element(&ElementKind::Face)
        .ok_or_else(|| DecodeError::Format("no face element".to_string()))?;
    let index_slot = face.properties.iter()
        .position(|property| matches!(property, Property::List { is_vertex_indices: true, .. }))
        .ok_or_else(|| DecodeError::Format("face element lacks a 'vertex_indices' list".to_string()))?;
    if index_slot != 0 {
        warn!("vertex_indices is face property {}, other face properties are discarded", index_slot);
    }

    for element in header.elements.iter().filter(|element| element.count > 0) {
        if let Some(Property::Unsupported(description)) = element.properties.iter().find(|property| matches!(property, Property::Unsupported(_))) {
            return Err(DecodeError::Unsupported(format!("cannot read data of property '{}'", description)));
        }
    }
    Ok(())
}

/// Source of body values, either text tokens or packed binary
trait RecordReader {
    /// Called before each element record
    fn begin_record(&mut self) -> Result<(), DecodeError>;
    fn read_float(&mut self) -> Result<f32, DecodeError>;
    fn read_list_count(&mut self, count_type: ScalarType) -> Result<usize, DecodeError>;
    fn read_index(&mut self, index_type: ScalarType) -> Result<u64, DecodeError>;
    fn skip_scalar(&mut self, scalar_type: ScalarType) -> Result<(), DecodeError>;
}

/// Text body; each record is one line of whitespace separated values
struct AsciiRecords<R> {
    input: R,
    tokens: std::vec::IntoIter<String>,
}

impl<R: BufRead> AsciiRecords<R> {
    fn new(input: R) -> Self {
        AsciiRecords { input, tokens: Vec::new().into_iter() }
    }

    fn next_token(&mut self) -> Result<String, DecodeError> {
        self.tokens.next()
            .ok_or_else(|| DecodeError::Format("record has fewer values than its element declares".to_string()))
    }
}

impl<R: BufRead> RecordReader for AsciiRecords<R> {
    fn begin_record(&mut self) -> Result<(), DecodeError> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self.input.read_line(&mut line).map_err(|error| match error.kind() {
                io::ErrorKind::InvalidData => DecodeError::Format("ascii record is not valid UTF-8".to_string()),
                _ => DecodeError::from(error),
            })?;
            if read == 0 {
                return Err(DecodeError::TruncatedStream("polygon file ended before all records were read".to_string()));
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        self.tokens = line.split_whitespace().map(str::to_string).collect::<Vec<_>>().into_iter();
        Ok(())
    }

    fn read_float(&mut self) -> Result<f32, DecodeError> {
        let token = self.next_token()?;
        token.parse().map_err(|_| DecodeError::Format(format!("'{}' is not a number", token)))
    }

    fn read_list_count(&mut self, _count_type: ScalarType) -> Result<usize, DecodeError> {
        let token = self.next_token()?;
        token.parse().map_err(|_| DecodeError::Format(format!("'{}' is not a list length", token)))
    }

    fn read_index(&mut self, _index_type: ScalarType) -> Result<u64, DecodeError> {
        let token = self.next_token()?;
        match token.parse::<i64>() {
            Ok(index) => u64::try_from(index).map_err(|_| DecodeError::Format(format!("negative vertex index {}", index))),
            Err(_) => Err(DecodeError::Format(format!("'{}' is not a vertex index", token))),
        }
    }

    fn skip_scalar(&mut self, _scalar_type: ScalarType) -> Result<(), DecodeError> {
        self.next_token().map(|_| ())
    }
}

/// Packed binary body
struct BinaryRecords<R>(EndianReader<R>);

impl<R: BufRead> RecordReader for BinaryRecords<R> {
    fn begin_record(&mut self) -> Result<(), DecodeError> {
        Ok(())
    }

    fn read_float(&mut self) -> Result<f32, DecodeError> {
        Ok(self.0.read_f32()?)
    }

    fn read_list_count(&mut self, count_type: ScalarType) -> Result<usize, DecodeError> {
        let count = self.0.read_u8()?;
        match count_type {
            ScalarType::Int8 if (count as i8) < 0 => Err(DecodeError::Format(format!("negative list length {}", count as i8))),
            _ => Ok(count as usize)
        }
    }

    fn read_index(&mut self, index_type: ScalarType) -> Result<u64, DecodeError> {
        // Signed indices are reinterpreted, so negative values are rejected as out of range
        match index_type {
            ScalarType::Int32 => Ok(self.0.read_i32()? as u32 as u64),
            _ => Ok(self.0.read_u32()? as u64),
        }
    }

    fn skip_scalar(&mut self, scalar_type: ScalarType) -> Result<(), DecodeError> {
        Ok(self.0.skip(scalar_type.size())?)
    }
}

fn skip_property<D: RecordReader>(reader: &mut D, property: &Property) -> Result<(), DecodeError> {
    match property {
        Property::Float(_) => reader.read_float().map(|_| ()),
        Property::Skipped(scalar_type) => reader.skip_scalar(*scalar_type),
        Property::List { count_type, index_type, .. } => {
            let count = reader.read_list_count(*count_type)?;
            for _ in 0..count {
                reader.skip_scalar(*index_type)?;
            }
            Ok(())
        }
        Property::Unsupported(description) => Err(DecodeError::Unsupported(format!("cannot read data of property '{}'", description))),
    }
}

fn read_body<D: RecordReader>(header: &Header, reader: &mut D, options: &LoadOptions) -> Result<Mesh, DecodeError> {
    let vertex_count = header.vertex_count();
    let use_normals = !options.ignore_normals && header.has_normals();
    let use_tex_coords = !options.ignore_tex_coords && header.has_tex_coords();

    let capacity = vertex_count.min(MAX_PREALLOCATION);
    let mut vertices = Vec::with_capacity(capacity);
    let mut normals = Vec::with_capacity(if use_normals { capacity } else { 0 });
    let mut tex_coords = Vec::with_capacity(if use_tex_coords { capacity } else { 0 });
    let mut indices = Vec::new();

    let mut face_buffer = Vec::new();
    let mut warned_short_face = false;

    for element in &header.elements {
        match element.kind {
            ElementKind::Vertex => {
                for _ in 0..element.count {
                    reader.begin_record()?;
                    let mut slots = [0.0f32; 8];
                    for property in &element.properties {
                        match property {
                            Property::Float(Some(role)) => slots[*role as usize] = reader.read_float()?,
                            other => skip_property(reader, other)?,
                        }
                    }

                    let [x, y, z, nx, ny, nz, u, v] = slots;
                    vertices.push(Vector3D::new([x, y, z]));
                    if use_normals {
                        normals.push(Vector3D::new([nx, ny, nz]));
                    }
                    if use_tex_coords {
                        tex_coords.push(Vector2D::new([u, v]));
                    }
                }
            }
            ElementKind::Face => {
                indices.reserve(element.count.min(MAX_PREALLOCATION) * 3);
                for _ in 0..element.count {
                    reader.begin_record()?;
                    face_buffer.clear();
                    let mut found_indices = false;
                    for property in &element.properties {
                        match property {
                            Property::List { count_type, index_type, is_vertex_indices: true } if !found_indices => {
                                found_indices = true;
                                let count = reader.read_list_count(*count_type)?;
                                for _ in 0..count {
                                    let index = reader.read_index(*index_type)?;
                                    if index >= vertex_count as u64 {
                                        return Err(DecodeError::InvalidIndex { index, vertex_count: vertex_count as u64 });
                                    }
                                    face_buffer.push(index as u32);
                                }
                            }
                            other => skip_property(reader, other)?,
                        }
                    }

                    if !triangulate_fan(&face_buffer, &mut indices) && !warned_short_face {
                        warn!("polygon file contains faces with fewer than 3 vertices, dropping them");
                        warned_short_face = true;
                    }
                }
            }
            ElementKind::Other(_) => {
                for _ in 0..element.count {
                    reader.begin_record()?;
                    for property in &element.properties {
                        skip_property(reader, property)?;
                    }
                }
            }
        }
    }

    Ok(Mesh::from_parts_unchecked(vertices, normals, tex_coords, indices))
}

impl<R: BufRead> MeshReader<R> for PolygonFile {
    fn read_mesh(mut input: R, options: &LoadOptions) -> Result<Mesh, DecodeError> {
        let header = read_header(&mut input)?;
        match header.method {
            StorageMethod::Ascii => read_body(&header, &mut AsciiRecords::new(input), options),
            StorageMethod::Binary(order) => read_body(&header, &mut BinaryRecords(EndianReader::new(input, order)), options),
        }
    }
}

fn write_header<W: Write>(output: &mut W, mesh: &Mesh) -> io::Result<()> {
    writeln!(output, "ply")?;
    writeln!(output, "format {} 1.0", StorageMethod::Binary(Endianness::host()).keyword())?;
    writeln!(output, "comment Created by meshport")?;
    writeln!(output, "element vertex {}", mesh.vertex_count())?;
    writeln!(output, "property float x")?;
    writeln!(output, "property float y")?;
    writeln!(output, "property float z")?;
    if mesh.has_normals() {
        writeln!(output, "property float nx")?;
        writeln!(output, "property float ny")?;
        writeln!(output, "property float nz")?;
    }
    if mesh.has_tex_coords() {
        writeln!(output, "property float u")?;
        writeln!(output, "property float v")?;
    }
    writeln!(output, "element face {}", mesh.face_count())?;
    writeln!(output, "property list uchar int vertex_indices")?;
    writeln!(output, "end_header")
}

impl<W: Write> MeshWriter<W> for PolygonFile {
    fn write_mesh(mut output: W, mesh: &Mesh) -> io::Result<()> {
        write_header(&mut output, mesh)?;

        for index in 0..mesh.vertex_count() {
            for value in mesh.vertices()[index] {
                output.write_f32::<NativeEndian>(value)?;
            }
            if let Some(normal) = mesh.normals().get(index) {
                for value in *normal {
                    output.write_f32::<NativeEndian>(value)?;
                }
            }
            if let Some(uv) = mesh.tex_coords().get(index) {
                for value in *uv {
                    output.write_f32::<NativeEndian>(value)?;
                }
            }
        }

        for triangle in mesh.triangles() {
            output.write_u8(3)?;
            for index in triangle {
                output.write_i32::<NativeEndian>(index as i32)?;
            }
        }

        output.flush()
    }
}

impl Mesh {
    /// Canonical encoding: binary polygon file in host byte order
    pub fn to_polygon_file_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(256 + self.vertex_count() * 32 + self.face_count() * 13);
        // Writing into a Vec cannot fail
        let _ = PolygonFile::write_mesh(&mut bytes, self);
        bytes
    }
}
