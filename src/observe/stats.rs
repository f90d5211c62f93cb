//! Windowed pipeline statistics.
//!
//! Writers append to the active buffer under a lock held for one push. `summary` moves the active
//! buffer's contents into the processing buffer (the only moment it touches the writers' lock),
//! aggregates the processing buffer and discards events older than the window.

use crate::foundation::core::{EyeIndex, FaceIndex, MAX_EYES, MAX_FACES, Pts};
use crate::observe::observer::{NaluEvent, PipelineObserver};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug)]
enum StatEvent {
    NaluReceived(NaluEvent),
    NaluDropped(NaluEvent),
    NaluSent(NaluEvent),
    FrameEncoded(FaceIndex, EyeIndex),
    FrameDecoded(FaceIndex, EyeIndex),
    FrameColorConverted(FaceIndex, EyeIndex),
    FaceAdded(FaceIndex, EyeIndex),
    CubemapDelivered,
    CubemapEvicted,
    TimestampRewritten,
}

#[derive(Clone, Copy, Debug)]
struct Datum {
    at: Instant,
    event: StatEvent,
}

#[derive(Default)]
pub struct StatsCollector {
    active: Mutex<Vec<Datum>>,
    processing: Mutex<Vec<Datum>>,
}

/// Aggregates over one window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatsSummary {
    pub window: Duration,
    pub nalus_received: u64,
    pub nalus_dropped: u64,
    pub nalus_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub frames_encoded: u64,
    pub frames_decoded: u64,
    pub frames_color_converted: u64,
    pub faces_added: u64,
    pub cubemaps_delivered: u64,
    pub cubemaps_evicted: u64,
    pub timestamps_rewritten: u64,
    /// Decoded frames per `[eye][face]`.
    pub decoded_per_face: [[u64; MAX_FACES]; MAX_EYES],
}

impl StatsSummary {
    fn per_second(&self, n: u64) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs > 0.0 { n as f64 / secs } else { 0.0 }
    }

    pub fn received_bit_rate(&self) -> f64 {
        self.per_second(self.bytes_received * 8)
    }

    pub fn sent_bit_rate(&self) -> f64 {
        self.per_second(self.bytes_sent * 8)
    }

    pub fn cubemap_fps(&self) -> f64 {
        self.per_second(self.cubemaps_delivered)
    }

    pub fn face_fps(&self, eye: EyeIndex, face: FaceIndex) -> f64 {
        self.per_second(self.decoded_per_face[eye.get()][face.get()])
    }
}

impl fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "stats over {:.1}s", self.window.as_secs_f64())?;
        writeln!(
            f,
            "  nalus: {} received ({:.0} kbit/s), {} dropped, {} sent ({:.0} kbit/s)",
            self.nalus_received,
            self.received_bit_rate() / 1000.0,
            self.nalus_dropped,
            self.nalus_sent,
            self.sent_bit_rate() / 1000.0,
        )?;
        writeln!(
            f,
            "  frames: {} encoded, {} decoded, {} color converted, {} pts rewrites",
            self.frames_encoded,
            self.frames_decoded,
            self.frames_color_converted,
            self.timestamps_rewritten,
        )?;
        for (eye, faces) in self.decoded_per_face.iter().enumerate() {
            if faces.iter().all(|n| *n == 0) {
                continue;
            }
            write!(f, "  eye {eye} fps:")?;
            for n in faces {
                write!(f, " {:.1}", self.per_second(*n))?;
            }
            writeln!(f)?;
        }
        write!(
            f,
            "  cubemaps: {} delivered ({:.1} fps), {} evicted, {} faces added",
            self.cubemaps_delivered,
            self.cubemap_fps(),
            self.cubemaps_evicted,
            self.faces_added,
        )
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, event: StatEvent) {
        self.active.lock().push(Datum {
            at: Instant::now(),
            event,
        });
    }

    /// Aggregate the events of the last `window`.
    pub fn summary(&self, window: Duration) -> StatsSummary {
        let mut processing = self.processing.lock();
        let fresh = std::mem::take(&mut *self.active.lock());
        processing.extend(fresh);

        let now = Instant::now();
        processing.retain(|d| now.duration_since(d.at) <= window);

        let mut s = StatsSummary {
            window,
            ..StatsSummary::default()
        };
        for d in processing.iter() {
            match d.event {
                StatEvent::NaluReceived(e) => {
                    s.nalus_received += 1;
                    s.bytes_received += e.size as u64;
                }
                StatEvent::NaluDropped(_) => s.nalus_dropped += 1,
                StatEvent::NaluSent(e) => {
                    s.nalus_sent += 1;
                    s.bytes_sent += e.size as u64;
                }
                StatEvent::FrameEncoded(..) => s.frames_encoded += 1,
                StatEvent::FrameDecoded(face, eye) => {
                    s.frames_decoded += 1;
                    s.decoded_per_face[eye.get()][face.get()] += 1;
                }
                StatEvent::FrameColorConverted(..) => s.frames_color_converted += 1,
                StatEvent::FaceAdded(..) => s.faces_added += 1,
                StatEvent::CubemapDelivered => s.cubemaps_delivered += 1,
                StatEvent::CubemapEvicted => s.cubemaps_evicted += 1,
                StatEvent::TimestampRewritten => s.timestamps_rewritten += 1,
            }
        }
        s
    }
}

impl PipelineObserver for StatsCollector {
    fn nalu_received(&self, event: NaluEvent) {
        self.store(StatEvent::NaluReceived(event));
    }

    fn nalu_dropped(&self, event: NaluEvent) {
        self.store(StatEvent::NaluDropped(event));
    }

    fn nalu_sent(&self, event: NaluEvent) {
        self.store(StatEvent::NaluSent(event));
    }

    fn frame_encoded(&self, face: FaceIndex, eye: EyeIndex, _pts: Pts) {
        self.store(StatEvent::FrameEncoded(face, eye));
    }

    fn frame_decoded(&self, face: FaceIndex, eye: EyeIndex) {
        self.store(StatEvent::FrameDecoded(face, eye));
    }

    fn frame_color_converted(&self, face: FaceIndex, eye: EyeIndex) {
        self.store(StatEvent::FrameColorConverted(face, eye));
    }

    fn face_added_to_cubemap(&self, face: FaceIndex, eye: EyeIndex, _key: u64) {
        self.store(StatEvent::FaceAdded(face, eye));
    }

    fn cubemap_delivered(&self, _key: u64, _faces: usize) {
        self.store(StatEvent::CubemapDelivered);
    }

    fn cubemap_evicted(&self, _key: u64, _faces: usize) {
        self.store(StatEvent::CubemapEvicted);
    }

    fn timestamp_rewritten(&self, _face: FaceIndex, _eye: EyeIndex, _from: Pts, _to: Pts) {
        self.store(StatEvent::TimestampRewritten);
    }
}

/// Logs a summary every `every` until dropped.
pub struct StatsReporter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StatsReporter {
    pub fn spawn(collector: Arc<StatsCollector>, every: Duration, window: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = std::thread::spawn({
            let stop = stop.clone();
            move || {
                let tick = Duration::from_millis(50).min(every);
                let mut last = Instant::now();
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(tick);
                    if last.elapsed() >= every {
                        last = Instant::now();
                        tracing::info!("{}", collector.summary(window));
                    }
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
