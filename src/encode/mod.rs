//! Server side: per-face raw frames to H.264 access units.

pub mod encoder;
pub mod ffmpeg;
pub mod pipeline;
pub mod pts;
pub mod server;

pub use encoder::{EncoderFactory, EncoderSetup, FaceEncoder};
pub use ffmpeg::{FfmpegFaceEncoder, is_ffmpeg_on_path};
pub use pipeline::{EncodePipelineOpts, EncodePipelineStats, EncodeState, FaceEncodingPipeline};
pub use pts::{PtsCorrector, PtsDecision};
pub use server::{CubemapEncoderSession, PipelineCallback, ProducerWatch};
