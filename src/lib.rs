pub mod error;
pub mod util;
pub mod geometry;
pub mod ply;
#[cfg(feature = "serialized")]
pub mod serialized;
#[cfg(feature = "wavefront-obj")]
pub mod wavefront_obj;
pub mod primitives;
pub mod pipeline;

pub use error::DecodeError;
pub use geometry::{LoadOptions, Mesh, MeshReader, MeshWriter, Transform};
