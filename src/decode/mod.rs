//! Client side: per-face H.264 access units back to raw frames.

pub mod decoder;
pub mod ffmpeg;
pub mod pipeline;

pub use decoder::FaceDecoder;
pub use ffmpeg::FfmpegFaceDecoder;
pub use pipeline::{DecodePipelineOpts, DecodePipelineStats, FaceDecodingPipeline, FaceFrameSink};
