use crate::foundation::core::{EyeIndex, FaceIndex};
use crate::foundation::error::StreamResult;
use crate::media::frame::RawFrame;
use crate::media::nalu::AccessUnit;
use std::sync::Arc;

/// Parameters every face encoder is opened with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderSetup {
    pub width: u32,
    pub height: u32,
    pub avg_bit_rate: u64,
    /// Nominal capture rate; only a rate-control hint since timestamps are explicit.
    pub fps_hint: u32,
}

/// H.264 encoder for one face stream.
///
/// Input frames are `yuv420p` at the setup's size with strictly increasing timestamps. Every
/// returned access unit starts with an AUD and carries the `pts` and `sequence` of the frame it
/// encodes; units come back in encode order, possibly some calls later than their frame.
pub trait FaceEncoder: Send {
    fn encode(&mut self, frame: &RawFrame) -> StreamResult<Vec<AccessUnit>>;
    /// Drain anything still buffered. No further `encode` calls follow.
    fn flush(&mut self) -> StreamResult<Vec<AccessUnit>>;
}

/// Opens an encoder for a face that just attached.
pub type EncoderFactory =
    Arc<dyn Fn(FaceIndex, EyeIndex, &EncoderSetup) -> StreamResult<Box<dyn FaceEncoder>> + Send + Sync>;
