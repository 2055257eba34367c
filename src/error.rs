//! Error type shared by all mesh decoders and the geometry pipeline

use std::io;
use thiserror::Error;

/// Errors raised while decoding, validating or converting a single mesh
///
/// All variants are local to one shape; the pipeline logs them and moves on to the next shape.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// I/O failure other than running out of data (e.g. file could not be opened)
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
    /// Bad magic, version or header token; the whole file is unusable
    #[error("invalid format: {0}")]
    Format(String),
    /// Stream ended in the middle of a record
    #[error("unexpected end of stream: {0}")]
    TruncatedStream(String),
    /// A face references a vertex that does not exist
    #[error("vertex index {index} out of range for {vertex_count} vertices")]
    InvalidIndex { index: u64, vertex_count: u64 },
    /// Unsupported property type, list type, or shape kind
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Mesh has (near) zero surface area
    #[error("degenerate geometry: surface area {area}")]
    Degenerate { area: f32 },
    /// File or shape contains no geometry
    #[error("no data: {0}")]
    NoData(String),
    /// Requested shape or group does not exist in the file
    #[error("shape index {index} out of range, file has {count} shapes")]
    ShapeIndexOutOfRange { index: usize, count: usize },
    /// Mesh buffers violate the [`crate::geometry::Mesh`] invariants
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
}

impl DecodeError {
    /// True if only the offending element is lost, rather than the whole file being unusable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecodeError::Unsupported(_) | DecodeError::Degenerate { .. })
    }
}

impl From<io::Error> for DecodeError {
    fn from(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            DecodeError::TruncatedStream(error.to_string())
        } else {
            DecodeError::Io(error)
        }
    }
}
