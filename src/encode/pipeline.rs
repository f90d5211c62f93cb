use crate::config::EncoderConfig;
use crate::cubemap::frame::SharedFrame;
use crate::encode::encoder::FaceEncoder;
use crate::encode::pts::{PtsCorrector, PtsDecision};
use crate::foundation::core::{EyeIndex, FaceIndex, PixelFormat};
use crate::foundation::error::{StreamError, StreamResult};
use crate::foundation::queue::ClosableQueue;
use crate::media::color::convert_into;
use crate::media::frame::RawFrame;
use crate::media::nalu::{AccessUnit, sync_sei};
use crate::observe::observer::{NaluEvent, PipelineObserver};
use crate::session::SessionContext;
use crate::shm::signal::WaitOutcome;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Options for one [`FaceEncodingPipeline`].
#[derive(Clone, Debug)]
pub struct EncodePipelineOpts {
    pub face: FaceIndex,
    pub eye: EyeIndex,
    /// Spare raw-frame buffers. The content loop blocks when all are in use.
    pub frame_pool_size: usize,
    /// Encoded access units waiting for the wire. The encode loop blocks when full.
    pub packet_queue_capacity: usize,
    /// Upper bound on a single wait for the producer's signal.
    pub barrier_timeout: Duration,
    /// Prefix every access unit's payload with the sync counter SEI.
    pub robust_syncing: bool,
    /// Raised by whoever watches producer liveness; the pipeline stops when it sees it.
    pub producer_dead: Option<Arc<AtomicBool>>,
}

impl EncodePipelineOpts {
    pub fn from_config(cfg: &EncoderConfig, face: FaceIndex, eye: EyeIndex) -> Self {
        Self {
            face,
            eye,
            frame_pool_size: cfg.frame_pool_size,
            packet_queue_capacity: cfg.packet_queue_capacity,
            barrier_timeout: cfg.barrier_timeout(),
            robust_syncing: cfg.robust_syncing,
            producer_dead: None,
        }
    }
}

/// Where a pipeline currently is in its loop, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EncodeState {
    Idle = 0,
    WaitingForFrame = 1,
    ColorConverting = 2,
    Encoding = 3,
    QueuedForSend = 4,
    Stopped = 5,
}

impl EncodeState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::WaitingForFrame,
            2 => Self::ColorConverting,
            3 => Self::Encoding,
            4 => Self::QueuedForSend,
            5 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Counters for one pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncodePipelineStats {
    pub frames_captured: u64,
    pub frames_encoded: u64,
    pub access_units: u64,
    pub timestamps_rewritten: u64,
    pub encode_errors: u64,
}

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    frames_encoded: AtomicU64,
    access_units: AtomicU64,
    timestamps_rewritten: AtomicU64,
    encode_errors: AtomicU64,
}

struct Shared {
    face: FaceIndex,
    eye: EyeIndex,
    stop: AtomicBool,
    state: AtomicU8,
    counters: Counters,
    error: Mutex<Option<StreamError>>,
    frames: ClosableQueue<RawFrame>,
    pool: ClosableQueue<RawFrame>,
    packets: ClosableQueue<AccessUnit>,
    observer: Arc<dyn PipelineObserver>,
}

impl Shared {
    /// `Stopped` is final; a late update from the other thread must not revive the pipeline.
    fn set_state(&self, s: EncodeState) {
        let stopped = EncodeState::Stopped as u8;
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur != stopped).then_some(s as u8)
            });
    }

    fn fail(&self, e: StreamError) {
        tracing::error!(face = %self.face, eye = %self.eye, error = %e, "encode pipeline failed");
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(e);
        }
    }
}

/// Raw frames from one face's [`SharedFrame`] to a bounded queue of H.264 access units.
///
/// Two threads per face. The content thread waits on the frame's signal, copies the newest
/// content into a buffer taken from a fixed pool and queues it. The encode thread corrects the
/// timestamp, converts to `yuv420p`, encodes, returns the buffer to the pool and queues the access
/// units for [`next_access_unit`](Self::next_access_unit).
pub struct FaceEncodingPipeline {
    shared: Arc<Shared>,
    content: Mutex<Option<JoinHandle<()>>>,
    encode: Mutex<Option<JoinHandle<()>>>,
}

impl FaceEncodingPipeline {
    #[tracing::instrument(skip_all, fields(face = %opts.face, eye = %opts.eye))]
    pub fn start(
        ctx: &SessionContext,
        source: SharedFrame,
        encoder: Box<dyn FaceEncoder>,
        opts: EncodePipelineOpts,
    ) -> StreamResult<Self> {
        if opts.frame_pool_size == 0 || opts.packet_queue_capacity == 0 {
            return Err(StreamError::validation(
                "encode pipeline pools must hold at least one entry",
            ));
        }
        let pool = (0..opts.frame_pool_size)
            .map(|_| RawFrame::blank(source.width(), source.height(), source.format()));
        let shared = Arc::new(Shared {
            face: opts.face,
            eye: opts.eye,
            stop: AtomicBool::new(false),
            state: AtomicU8::new(EncodeState::Idle as u8),
            counters: Counters::default(),
            error: Mutex::new(None),
            frames: ClosableQueue::new(opts.frame_pool_size),
            pool: ClosableQueue::filled(pool),
            packets: ClosableQueue::new(opts.packet_queue_capacity),
            observer: ctx.observer().clone(),
        });

        let content = std::thread::Builder::new()
            .name(format!("content-{}-{}", opts.eye, opts.face))
            .spawn({
                let shared = shared.clone();
                let opts = opts.clone();
                move || content_loop(&shared, &source, &opts)
            })
            .map_err(|e| StreamError::encode(format!("failed to spawn content thread: {e}")))?;
        let encode = std::thread::Builder::new()
            .name(format!("encode-{}-{}", opts.eye, opts.face))
            .spawn({
                let shared = shared.clone();
                move || encode_loop(&shared, encoder, opts.robust_syncing)
            })
            .map_err(|e| StreamError::encode(format!("failed to spawn encode thread: {e}")))?;

        tracing::debug!("encode pipeline started");
        Ok(Self {
            shared,
            content: Mutex::new(Some(content)),
            encode: Mutex::new(Some(encode)),
        })
    }

    pub fn face(&self) -> FaceIndex {
        self.shared.face
    }

    pub fn eye(&self) -> EyeIndex {
        self.shared.eye
    }

    pub fn state(&self) -> EncodeState {
        EncodeState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Next encoded access unit, blocking until one is ready. `None` once the pipeline has
    /// stopped and everything queued was taken.
    pub fn next_access_unit(&self) -> Option<AccessUnit> {
        let au = self.shared.packets.pop()?;
        for n in &au.nalus {
            self.shared.observer.nalu_sent(NaluEvent {
                nalu_type: n.nalu_type(),
                size: n.len(),
                face: self.shared.face,
                eye: self.shared.eye,
            });
        }
        Some(au)
    }

    pub fn stats(&self) -> EncodePipelineStats {
        let c = &self.shared.counters;
        EncodePipelineStats {
            frames_captured: c.frames_captured.load(Ordering::Relaxed),
            frames_encoded: c.frames_encoded.load(Ordering::Relaxed),
            access_units: c.access_units.load(Ordering::Relaxed),
            timestamps_rewritten: c.timestamps_rewritten.load(Ordering::Relaxed),
            encode_errors: c.encode_errors.load(Ordering::Relaxed),
        }
    }

    /// The terminal error that stopped the pipeline, if any.
    pub fn take_error(&self) -> Option<StreamError> {
        self.shared.error.lock().take()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == EncodeState::Stopped
    }

    /// Stop capturing; frames already captured are still encoded and stay readable through
    /// [`next_access_unit`](Self::next_access_unit).
    pub fn finish(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.frames.seal();
    }

    /// Stop everything now, discarding queued work, and join both threads.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.frames.close();
        self.shared.pool.close();
        self.shared.packets.close();
        self.join();
    }

    /// Stop capturing because of `reason` and wait until the content thread no longer touches
    /// the source frame. Frames already captured are still encoded.
    pub fn halt_capture(&self, reason: StreamError) {
        self.shared.fail(reason);
        self.shared.stop.store(true, Ordering::Release);
        // a content thread waiting for a pool buffer would otherwise wait for the encoder
        self.shared.pool.close();
        if let Some(t) = self.content.lock().take() {
            let _ = t.join();
        }
    }

    pub fn join(&self) {
        for slot in [&self.content, &self.encode] {
            if let Some(t) = slot.lock().take() {
                let _ = t.join();
            }
        }
    }
}

impl Drop for FaceEncodingPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn content_loop(shared: &Shared, source: &SharedFrame, opts: &EncodePipelineOpts) {
    let mut seen = match source.generation() {
        Ok(g) => g,
        Err(e) => {
            shared.fail(e);
            shared.frames.seal();
            return;
        }
    };
    while !shared.stop.load(Ordering::Acquire) {
        shared.set_state(EncodeState::WaitingForFrame);
        match source.wait_newer(seen, opts.barrier_timeout) {
            Ok(WaitOutcome::Signaled(g)) => seen = g,
            Ok(WaitOutcome::TimedOut) => {
                if opts
                    .producer_dead
                    .as_ref()
                    .is_some_and(|d| d.load(Ordering::Acquire))
                {
                    shared.fail(StreamError::producer_death(format!(
                        "no producer for face {} eye {}",
                        opts.face, opts.eye
                    )));
                    break;
                }
                continue;
            }
            Err(e) => {
                shared.fail(e);
                break;
            }
        }
        // blocks while every pool buffer is queued or being encoded
        let Some(mut buf) = shared.pool.pop() else {
            break;
        };
        match source.read_into(&mut buf.data) {
            Ok(meta) => {
                buf.pts = meta.pts;
                buf.sequence = Some(meta.sequence);
            }
            Err(e) => {
                shared.fail(e);
                break;
            }
        }
        shared
            .counters
            .frames_captured
            .fetch_add(1, Ordering::Relaxed);
        if shared.frames.push(buf).is_err() {
            break;
        }
    }
    shared.frames.seal();
}

fn encode_loop(shared: &Shared, mut encoder: Box<dyn FaceEncoder>, robust_syncing: bool) {
    let mut pts = PtsCorrector::new();
    let mut yuv: Option<RawFrame> = None;
    let mut open = true;

    while open {
        let Some(frame) = shared.frames.pop() else {
            break;
        };
        shared.set_state(EncodeState::ColorConverting);
        let decision = pts.correct(frame.pts);
        if let PtsDecision::Rewritten { from, to } = decision {
            tracing::warn!(
                face = %shared.face,
                eye = %shared.eye,
                from = from.0,
                to = to.0,
                "non-monotonic capture timestamp rewritten"
            );
            shared
                .counters
                .timestamps_rewritten
                .fetch_add(1, Ordering::Relaxed);
            shared
                .observer
                .timestamp_rewritten(shared.face, shared.eye, from, to);
        }

        let target = yuv.get_or_insert_with(|| {
            RawFrame::blank(
                frame.width - frame.width % 2,
                frame.height - frame.height % 2,
                PixelFormat::Yuv420p,
            )
        });
        let converted = convert_into(&frame, target);
        // the pixels are copied out; hand the buffer back to the content loop
        let _ = shared.pool.push(frame);
        if let Err(e) = converted {
            shared.fail(e);
            break;
        }
        target.pts = decision.pts();

        shared.set_state(EncodeState::Encoding);
        match encoder.encode(target) {
            Ok(units) => open = emit(shared, units, robust_syncing),
            Err(e) if e.is_terminal() => {
                shared.fail(e);
                break;
            }
            Err(e) => {
                tracing::warn!(face = %shared.face, eye = %shared.eye, error = %e, "frame not encoded");
                shared
                    .counters
                    .encode_errors
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    if !shared.packets.is_closed() {
        match encoder.flush() {
            Ok(units) => {
                emit(shared, units, robust_syncing);
            }
            Err(e) => {
                tracing::warn!(face = %shared.face, eye = %shared.eye, error = %e, "encoder flush failed");
            }
        }
    }
    shared.packets.seal();
    // unblock a content loop still waiting for a pool buffer
    shared.pool.close();
    shared.frames.close();
    shared.set_state(EncodeState::Stopped);
    tracing::debug!(face = %shared.face, eye = %shared.eye, "encode pipeline stopped");
}

/// Queue access units for the wire. Returns false once the packet queue is closed.
fn emit(shared: &Shared, units: Vec<AccessUnit>, robust_syncing: bool) -> bool {
    for mut au in units {
        if robust_syncing {
            au.insert_after_aud(sync_sei(au.sequence));
        }
        shared
            .counters
            .frames_encoded
            .fetch_add(1, Ordering::Relaxed);
        shared.observer.frame_encoded(shared.face, shared.eye, au.pts);
        shared.set_state(EncodeState::QueuedForSend);
        if shared.packets.push(au).is_err() {
            return false;
        }
        shared
            .counters
            .access_units
            .fetch_add(1, Ordering::Relaxed);
    }
    true
}
