use crate::config::ReceiverConfig;
use crate::decode::decoder::FaceDecoder;
use crate::foundation::core::{EyeIndex, FaceIndex, PixelFormat};
use crate::foundation::error::{StreamError, StreamResult};
use crate::foundation::queue::ClosableQueue;
use crate::media::color::convert_into;
use crate::media::frame::RawFrame;
use crate::media::nalu::{AccessUnit, Nalu, parse_sync_sei};
use crate::observe::observer::{NaluEvent, PipelineObserver};
use crate::session::SessionContext;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

/// Sync counters waiting for their picture. Bounded so a stream that loses pictures cannot grow
/// it without limit.
const MAX_PENDING_SYNC_KEYS: usize = 16;

/// Slice NAL unit types, the ones that carry picture data.
const SLICE_TYPES: std::ops::RangeInclusive<u8> = 1..=5;

/// Receives every decoded, color-converted face frame. Called from decode threads, one per face
/// and eye, possibly all at once.
pub trait FaceFrameSink: Send + Sync {
    fn on_face_frame_decoded(&self, face: FaceIndex, eye: EyeIndex, frame: &RawFrame);
}

/// Options for one [`FaceDecodingPipeline`].
#[derive(Clone, Debug)]
pub struct DecodePipelineOpts {
    pub face: FaceIndex,
    pub eye: EyeIndex,
    /// NAL units buffered between the network and the decoder. Units arriving while it is full
    /// are dropped.
    pub nalu_queue_capacity: usize,
    pub output_format: PixelFormat,
    pub output_width: u32,
    pub output_height: u32,
    /// Pair decoded pictures with the sync counters carried in the stream.
    pub robust_syncing: bool,
}

impl DecodePipelineOpts {
    pub fn from_config(cfg: &ReceiverConfig, face: FaceIndex, eye: EyeIndex) -> Self {
        Self {
            face,
            eye,
            nalu_queue_capacity: cfg.nalu_queue_capacity,
            output_format: cfg.output_format,
            output_width: cfg.face_resolution,
            output_height: cfg.face_resolution,
            robust_syncing: cfg.robust_syncing,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodePipelineStats {
    pub nalus_received: u64,
    pub nalus_dropped: u64,
    pub frames_decoded: u64,
    pub frames_delivered: u64,
    pub decode_errors: u64,
}

#[derive(Default)]
struct Counters {
    nalus_received: AtomicU64,
    nalus_dropped: AtomicU64,
    frames_decoded: AtomicU64,
    frames_delivered: AtomicU64,
    decode_errors: AtomicU64,
}

struct Shared {
    opts: DecodePipelineOpts,
    queue: ClosableQueue<Nalu>,
    counters: Counters,
    observer: Arc<dyn PipelineObserver>,
    sink: Arc<dyn FaceFrameSink>,
}

impl Shared {
    fn event(&self, nalu: &Nalu) -> NaluEvent {
        NaluEvent {
            nalu_type: nalu.nalu_type(),
            size: nalu.len(),
            face: self.opts.face,
            eye: self.opts.eye,
        }
    }
}

/// NAL units of one face stream to decoded frames handed to a [`FaceFrameSink`].
///
/// `push_nalu` never blocks the network side. Decode faults drop the affected picture and are
/// counted; they never stop the pipeline.
pub struct FaceDecodingPipeline {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FaceDecodingPipeline {
    #[tracing::instrument(skip_all, fields(face = %opts.face, eye = %opts.eye))]
    pub fn start(
        ctx: &SessionContext,
        decoder: Box<dyn FaceDecoder>,
        sink: Arc<dyn FaceFrameSink>,
        opts: DecodePipelineOpts,
    ) -> StreamResult<Self> {
        opts.output_format
            .validate_dims(opts.output_width, opts.output_height)?;
        let shared = Arc::new(Shared {
            queue: ClosableQueue::new(opts.nalu_queue_capacity),
            counters: Counters::default(),
            observer: ctx.observer().clone(),
            sink,
            opts,
        });
        let thread = std::thread::Builder::new()
            .name(format!("decode-{}-{}", shared.opts.eye, shared.opts.face))
            .spawn({
                let shared = shared.clone();
                move || decode_loop(&shared, decoder)
            })
            .map_err(|e| StreamError::decode(format!("failed to spawn decode thread: {e}")))?;
        tracing::debug!("decode pipeline started");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn face(&self) -> FaceIndex {
        self.shared.opts.face
    }

    pub fn eye(&self) -> EyeIndex {
        self.shared.opts.eye
    }

    /// Hand one received unit to the decoder. Returns false when it was dropped because the
    /// queue is full or the pipeline is stopping.
    pub fn push_nalu(&self, nalu: Nalu) -> bool {
        let shared = &self.shared;
        let event = shared.event(&nalu);
        shared
            .counters
            .nalus_received
            .fetch_add(1, Ordering::Relaxed);
        shared.observer.nalu_received(event);
        if shared.queue.try_push(nalu).is_err() {
            shared
                .counters
                .nalus_dropped
                .fetch_add(1, Ordering::Relaxed);
            shared.observer.nalu_dropped(event);
            return false;
        }
        true
    }

    /// Push every unit of `au`. Returns how many were accepted.
    pub fn push_access_unit(&self, au: &AccessUnit) -> usize {
        au.nalus
            .iter()
            .filter(|n| self.push_nalu((*n).clone()))
            .count()
    }

    pub fn stats(&self) -> DecodePipelineStats {
        let c = &self.shared.counters;
        DecodePipelineStats {
            nalus_received: c.nalus_received.load(Ordering::Relaxed),
            nalus_dropped: c.nalus_dropped.load(Ordering::Relaxed),
            frames_decoded: c.frames_decoded.load(Ordering::Relaxed),
            frames_delivered: c.frames_delivered.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
        }
    }

    /// Decode everything already queued, flush the decoder and join the thread.
    pub fn finish(&self) {
        self.shared.queue.seal();
        self.join();
    }

    /// Stop now, discarding queued units.
    pub fn stop(&self) {
        self.shared.queue.close();
        self.join();
    }

    fn join(&self) {
        if let Some(t) = self.thread.lock().take() {
            let _ = t.join();
        }
    }
}

impl Drop for FaceDecodingPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Delivery {
    sync_keys: SyncKeys,
    out: RawFrame,
}

/// Binds each access unit's sync counter to the picture it produces.
///
/// An access unit queues one entry when its first slice is accepted by the decoder, carrying its
/// counter if it had one. An access unit whose slices are rejected or never arrive queues nothing,
/// so later pictures keep their own keys.
#[derive(Debug, Default)]
struct SyncKeys {
    open: bool,
    current: Option<u64>,
    queued: VecDeque<Option<u64>>,
}

impl SyncKeys {
    fn start_access_unit(&mut self) {
        self.open = true;
        self.current = None;
    }

    fn carried(&mut self, counter: u64) {
        self.open = true;
        self.current = Some(counter);
    }

    fn slice_decoded(&mut self) {
        if !std::mem::take(&mut self.open) {
            return;
        }
        if self.queued.len() == MAX_PENDING_SYNC_KEYS {
            self.queued.pop_front();
        }
        self.queued.push_back(self.current.take());
    }

    fn slice_rejected(&mut self) {
        self.open = false;
        self.current = None;
    }

    fn next_picture(&mut self) -> Option<u64> {
        self.queued.pop_front().flatten()
    }
}

fn decode_loop(shared: &Shared, mut decoder: Box<dyn FaceDecoder>) {
    let opts = &shared.opts;
    let mut delivery = Delivery {
        sync_keys: SyncKeys::default(),
        out: RawFrame::blank(opts.output_width, opts.output_height, opts.output_format),
    };

    while let Some(nalu) = shared.queue.pop() {
        if nalu.is_aud() {
            delivery.sync_keys.start_access_unit();
        }
        if let Some(counter) = parse_sync_sei(&nalu) {
            if opts.robust_syncing {
                delivery.sync_keys.carried(counter);
            }
            continue;
        }
        let is_slice = opts.robust_syncing && SLICE_TYPES.contains(&nalu.nalu_type());
        match decoder.decode(&nalu) {
            Ok(frames) => {
                if is_slice {
                    delivery.sync_keys.slice_decoded();
                }
                for f in frames {
                    deliver(shared, &mut delivery, f);
                }
            }
            Err(e) => {
                if is_slice {
                    delivery.sync_keys.slice_rejected();
                }
                shared
                    .counters
                    .decode_errors
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    face = %opts.face,
                    eye = %opts.eye,
                    nalu_type = nalu.nalu_type(),
                    error = %e,
                    "nal unit not decoded"
                );
            }
        }
    }

    if !shared.queue.is_closed() {
        match decoder.flush() {
            Ok(frames) => {
                for f in frames {
                    deliver(shared, &mut delivery, f);
                }
            }
            Err(e) => {
                tracing::warn!(face = %opts.face, eye = %opts.eye, error = %e, "decoder flush failed");
            }
        }
    }
    tracing::debug!(face = %opts.face, eye = %opts.eye, "decode pipeline stopped");
}

fn deliver(shared: &Shared, delivery: &mut Delivery, mut frame: RawFrame) {
    let opts = &shared.opts;
    shared
        .counters
        .frames_decoded
        .fetch_add(1, Ordering::Relaxed);
    shared.observer.frame_decoded(opts.face, opts.eye);

    frame.sequence = if opts.robust_syncing {
        delivery.sync_keys.next_picture()
    } else {
        None
    };
    if let Err(e) = convert_into(&frame, &mut delivery.out) {
        shared
            .counters
            .decode_errors
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(face = %opts.face, eye = %opts.eye, error = %e, "decoded frame not converted");
        return;
    }
    shared.observer.frame_color_converted(opts.face, opts.eye);
    shared.sink.on_face_frame_decoded(opts.face, opts.eye, &delivery.out);
    shared
        .counters
        .frames_delivered
        .fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_access_unit_leaves_no_key_behind() {
        let mut keys = SyncKeys::default();
        for (counter, accepted) in [(1, true), (2, false), (3, true)] {
            keys.start_access_unit();
            keys.carried(counter);
            if accepted {
                keys.slice_decoded();
                // the second slice of a picture queues nothing more
                keys.slice_decoded();
            } else {
                keys.slice_rejected();
            }
        }
        assert_eq!(keys.next_picture(), Some(1));
        assert_eq!(keys.next_picture(), Some(3));
        assert_eq!(keys.next_picture(), None);
    }

    #[test]
    fn picture_without_counter_does_not_take_the_next_key() {
        let mut keys = SyncKeys::default();
        keys.start_access_unit();
        keys.slice_decoded();
        keys.carried(8);
        keys.slice_decoded();
        assert_eq!(keys.next_picture(), None);
        assert_eq!(keys.next_picture(), Some(8));
    }

    #[test]
    fn pending_keys_are_bounded() {
        let mut keys = SyncKeys::default();
        for counter in 0..(MAX_PENDING_SYNC_KEYS as u64 + 4) {
            keys.start_access_unit();
            keys.carried(counter);
            keys.slice_decoded();
        }
        assert_eq!(keys.queued.len(), MAX_PENDING_SYNC_KEYS);
        assert_eq!(keys.next_picture(), Some(4));
    }
}
