use crate::foundation::core::{PixelFormat, Pts};
use crate::foundation::error::{StreamError, StreamResult};
use crate::media::frame::RawFrame;
use crate::shm::arena::{Arena, ArenaValue, Offset};
use crate::shm::signal::{SharedSignal, WaitOutcome};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

const PIXEL_ALIGN: usize = 64;

#[repr(C)]
pub(crate) struct FrameRaw {
    signal: SharedSignal,
    width: AtomicU32,
    height: AtomicU32,
    format: AtomicU32,
    _pad: AtomicU32,
    pts: AtomicI64,
    sequence: AtomicU64,
    pixels: AtomicU64,
    pixels_len: AtomicU64,
}

// SAFETY: repr(C), atomics plus `SharedSignal`, all-zero is a valid (uninitialised) state.
#[allow(unsafe_code)]
unsafe impl ArenaValue for FrameRaw {}

/// Arena bytes one frame of this shape occupies, padding included.
pub(crate) fn frame_footprint(width: u32, height: u32, format: PixelFormat) -> usize {
    std::mem::size_of::<FrameRaw>().next_multiple_of(PIXEL_ALIGN)
        + format.frame_len(width, height).next_multiple_of(PIXEL_ALIGN)
        + 2 * PIXEL_ALIGN
}

/// Timestamp and capture sequence of a frame's current content.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameMeta {
    pub pts: Pts,
    pub sequence: u64,
}

/// Handle to a pixel buffer living in an arena.
///
/// The geometry is fixed at allocation; only the pixels, timestamp and sequence change, always
/// under the frame's own [`SharedSignal`] lock. A producer overwrites the content in place and
/// notifies; consumers wait for a newer generation and copy out.
#[derive(Clone)]
pub struct SharedFrame {
    arena: Arc<Arena>,
    off: Offset<FrameRaw>,
    width: u32,
    height: u32,
    format: PixelFormat,
    pixels: u64,
    pixels_len: usize,
}

impl std::fmt::Debug for SharedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFrame")
            .field("offset", &self.off)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

impl SharedFrame {
    pub fn allocate(
        arena: &Arc<Arena>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> StreamResult<Self> {
        format.validate_dims(width, height)?;
        let pixels_len = format.frame_len(width, height);
        let off = arena.alloc::<FrameRaw>()?;
        let pixels = arena.alloc_bytes(pixels_len, PIXEL_ALIGN)?;
        let raw = arena.get(off)?;
        raw.signal.init()?;
        raw.width.store(width, Ordering::Relaxed);
        raw.height.store(height, Ordering::Relaxed);
        raw.format.store(format.raw(), Ordering::Relaxed);
        raw.pixels.store(pixels, Ordering::Relaxed);
        raw.pixels_len.store(pixels_len as u64, Ordering::Release);
        Ok(Self {
            arena: arena.clone(),
            off,
            width,
            height,
            format,
            pixels,
            pixels_len,
        })
    }

    /// Resolve a frame allocated by another handle, possibly in another process.
    pub(crate) fn open(arena: &Arc<Arena>, off: Offset<FrameRaw>) -> StreamResult<Self> {
        let raw = arena.get(off)?;
        let width = raw.width.load(Ordering::Relaxed);
        let height = raw.height.load(Ordering::Relaxed);
        let format = PixelFormat::from_raw(raw.format.load(Ordering::Relaxed))?;
        let pixels = raw.pixels.load(Ordering::Relaxed);
        let pixels_len = raw.pixels_len.load(Ordering::Acquire) as usize;
        if pixels_len != format.frame_len(width, height) {
            return Err(StreamError::shm(format!(
                "frame at {off:?} has inconsistent geometry"
            )));
        }
        arena.bytes_ptr(pixels, pixels_len)?;
        Ok(Self {
            arena: arena.clone(),
            off,
            width,
            height,
            format,
            pixels,
            pixels_len,
        })
    }

    fn raw(&self) -> StreamResult<&FrameRaw> {
        self.arena.get(self.off)
    }

    pub(crate) fn offset(&self) -> Offset<FrameRaw> {
        self.off
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn pixels_len(&self) -> usize {
        self.pixels_len
    }

    pub fn signal(&self) -> StreamResult<&SharedSignal> {
        Ok(&self.raw()?.signal)
    }

    fn check_len(&self, len: usize) -> StreamResult<()> {
        if len != self.pixels_len {
            return Err(StreamError::validation(format!(
                "frame holds {} bytes, got {len}",
                self.pixels_len
            )));
        }
        Ok(())
    }

    /// Overwrite content without waking consumers.
    pub fn write(&self, pixels: &[u8], pts: Pts, sequence: u64) -> StreamResult<()> {
        self.check_len(pixels.len())?;
        let raw = self.raw()?;
        let _guard = raw.signal.lock()?;
        self.arena.copy_in(self.pixels, pixels)?;
        raw.pts.store(pts.0, Ordering::Release);
        raw.sequence.store(sequence, Ordering::Release);
        Ok(())
    }

    /// Producer side: overwrite content, advance the capture sequence and wake consumers.
    /// Returns the new sequence number.
    pub fn publish(&self, pixels: &[u8], pts: Pts) -> StreamResult<u64> {
        self.check_len(pixels.len())?;
        let raw = self.raw()?;
        let guard = raw.signal.lock()?;
        self.arena.copy_in(self.pixels, pixels)?;
        raw.pts.store(pts.0, Ordering::Release);
        let sequence = raw.sequence.load(Ordering::Acquire) + 1;
        raw.sequence.store(sequence, Ordering::Release);
        raw.signal.notify_locked(&guard);
        Ok(sequence)
    }

    /// Copy the current content into `dst`, resizing it as needed.
    pub fn read_into(&self, dst: &mut Vec<u8>) -> StreamResult<FrameMeta> {
        let raw = self.raw()?;
        dst.resize(self.pixels_len, 0);
        let _guard = raw.signal.lock()?;
        self.arena.copy_out(self.pixels, dst)?;
        Ok(FrameMeta {
            pts: Pts(raw.pts.load(Ordering::Acquire)),
            sequence: raw.sequence.load(Ordering::Acquire),
        })
    }

    pub fn meta(&self) -> StreamResult<FrameMeta> {
        let raw = self.raw()?;
        let _guard = raw.signal.lock()?;
        Ok(FrameMeta {
            pts: Pts(raw.pts.load(Ordering::Acquire)),
            sequence: raw.sequence.load(Ordering::Acquire),
        })
    }

    /// Owned copy of the current content.
    pub fn snapshot(&self) -> StreamResult<RawFrame> {
        let mut data = Vec::new();
        let meta = self.read_into(&mut data)?;
        Ok(RawFrame {
            width: self.width,
            height: self.height,
            format: self.format,
            pts: meta.pts,
            sequence: Some(meta.sequence),
            data,
        })
    }

    pub fn generation(&self) -> StreamResult<u64> {
        Ok(self.raw()?.signal.generation())
    }

    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> StreamResult<WaitOutcome> {
        self.raw()?.signal.wait_newer(seen, timeout)
    }

    /// Re-create the frame's signal after the producer died.
    pub fn reset_signal(&self) -> StreamResult<()> {
        self.raw()?.signal.reset()
    }
}
