//! Cubestream streams a live stereo cubemap as twelve independent H.264 face streams and puts
//! them back together on the receiving side.
//!
//! The public API follows the data path:
//!
//! - A producer allocates a [`StereoCubemap`] in a shared segment and publishes frames into it
//! - A [`CubemapEncoderSession`] runs one [`FaceEncodingPipeline`] per face and eye
//! - On the client, [`FaceDecodingPipeline`]s feed a [`CubemapAssemblyEngine`], which hands
//!   complete cubemaps to a [`CubemapConsumer`]
#![deny(unsafe_code)]

pub mod assemble;
pub mod config;
pub mod cubemap;
pub mod decode;
pub mod encode;
pub mod foundation;
pub mod media;
pub mod observe;
pub mod session;
pub mod shm;

pub use crate::foundation::core::{
    EyeCount, EyeIndex, FaceIndex, FaceMask, MAX_EYES, MAX_FACES, PixelFormat, Pts,
};
pub use crate::foundation::error::{StreamError, StreamResult};
pub use crate::foundation::queue::{ClosableQueue, PopOutcome};

pub use crate::assemble::{
    AssemblyOpts, AssemblyStats, CoveragePolicy, CubemapAssemblyEngine, CubemapConsumer,
    FrameOutcome, Handoff, SourceInfo, SyncKeyPolicy,
};
pub use crate::config::{EncoderConfig, ReceiverConfig, ShmConfig, StreamConfig};
pub use crate::cubemap::{Cubemap, CubemapFace, CubemapShape, SharedFrame, StereoCubemap};
pub use crate::decode::{FaceDecoder, FaceDecodingPipeline, FaceFrameSink, FfmpegFaceDecoder};
pub use crate::encode::{
    CubemapEncoderSession, EncoderFactory, EncoderSetup, FaceEncoder, FaceEncodingPipeline,
    FfmpegFaceEncoder,
};
pub use crate::media::{AccessUnit, Nalu, RawFrame};
pub use crate::observe::{NullObserver, PipelineObserver, StatsCollector, StatsSummary};
pub use crate::session::SessionContext;
