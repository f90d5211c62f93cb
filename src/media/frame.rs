use crate::foundation::core::{PixelFormat, Pts};
use crate::foundation::error::{StreamError, StreamResult};

/// Owned, process-local picture. Travels between pipeline stages and into the assembly engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pts: Pts,
    /// Producer capture sequence (encode side) or the sync counter recovered from the stream
    /// (decode side, robust syncing only).
    pub sequence: Option<u64>,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        pts: Pts,
        data: Vec<u8>,
    ) -> StreamResult<Self> {
        format.validate_dims(width, height)?;
        let expected = format.frame_len(width, height);
        if data.len() != expected {
            return Err(StreamError::validation(format!(
                "{}x{} {:?} frame needs {expected} bytes, got {}",
                width,
                height,
                format,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            pts,
            sequence: None,
            data,
        })
    }

    /// Zero-filled frame, used to seed buffer pools.
    pub fn blank(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            pts: Pts::default(),
            sequence: None,
            data: vec![0; format.frame_len(width, height)],
        }
    }

    pub fn expected_len(&self) -> usize {
        self.format.frame_len(self.width, self.height)
    }

    pub fn same_shape(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_checks_buffer_length() {
        assert!(RawFrame::new(2, 2, PixelFormat::Rgba8, Pts(0), vec![0; 16]).is_ok());
        let err = RawFrame::new(2, 2, PixelFormat::Rgba8, Pts(0), vec![0; 15]).unwrap_err();
        assert!(err.to_string().contains("needs 16 bytes"));
        assert!(RawFrame::new(0, 2, PixelFormat::Rgba8, Pts(0), vec![]).is_err());
    }

    #[test]
    fn blank_is_sized_for_format() {
        let f = RawFrame::blank(4, 4, PixelFormat::Yuv420p);
        assert_eq!(f.data.len(), 24);
        assert_eq!(f.expected_len(), 24);
        assert!(f.same_shape(4, 4, PixelFormat::Yuv420p));
    }
}
