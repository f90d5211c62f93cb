//! Frame and cubemap data model shared between the producer and the encoder.

pub mod frame;
pub mod model;

pub use frame::{FrameMeta, SharedFrame};
pub use model::{Cubemap, CubemapFace, CubemapShape, ROOT_NAME, StereoCubemap};
