use crate::foundation::error::StreamResult;
use crate::media::frame::RawFrame;
use crate::media::nalu::Nalu;

/// H.264 decoder for one face stream.
///
/// NAL units go in one at a time in stream order; decoded pictures come out whenever the decoder
/// has them, in display order. A corrupt unit is reported as an error and the decoder stays usable.
pub trait FaceDecoder: Send {
    fn decode(&mut self, nalu: &Nalu) -> StreamResult<Vec<RawFrame>>;
    fn flush(&mut self) -> StreamResult<Vec<RawFrame>>;
}
