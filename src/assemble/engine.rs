use crate::assemble::handoff::{CubemapConsumer, DeliveryHandoff, DeliveryOutcome, SourceInfo};
use crate::assemble::policy::{AssemblyOpts, SyncKeyPolicy};
use crate::cubemap::model::{CubemapShape, StereoCubemap};
use crate::decode::pipeline::FaceFrameSink;
use crate::foundation::core::{EyeIndex, FaceIndex, FaceMask, MAX_EYES, MAX_FACES};
use crate::foundation::error::{StreamError, StreamResult};
use crate::media::frame::RawFrame;
use crate::observe::observer::PipelineObserver;
use crate::session::SessionContext;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Spare cubemaps kept for reuse, beyond those the consumer holds.
const POOL_CAPACITY: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Empty,
    Filling,
    Filled,
}

struct Entry {
    id: u64,
    cubemap: StereoCubemap,
    slots: [[Slot; MAX_FACES]; MAX_EYES],
    filled: [FaceMask; MAX_EYES],
    in_flight: u32,
}

impl Entry {
    fn faces(&self) -> usize {
        self.filled.iter().map(|m| m.len()).sum()
    }
}

struct Ready {
    key: u64,
    cubemap: StereoCubemap,
    faces: [FaceMask; MAX_EYES],
}

/// Counters kept by a [`CubemapAssemblyEngine`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    pub frames_received: u64,
    pub frames_added: u64,
    pub frames_late: u64,
    pub frames_duplicate: u64,
    pub frames_without_key: u64,
    pub frames_rejected: u64,
    /// Copies that finished after their cubemap was evicted.
    pub copies_discarded: u64,
    pub cubemaps_allocated: u64,
    pub cubemaps_delivered: u64,
    pub cubemaps_declined: u64,
    pub cubemaps_recycled: u64,
    pub cubemaps_evicted: u64,
    pub pending: usize,
    /// Complete cubemaps waiting for an older key to complete or be evicted.
    pub held: usize,
    pub pool_len: usize,
}

/// What happened to one face frame handed to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Added { key: u64, completed: bool },
    /// Its key already completed or was evicted, or it is older than everything in a full map.
    Late { key: u64 },
    Duplicate { key: u64 },
    /// Robust syncing is on and the frame carries no sync counter.
    NoSyncKey,
    /// Wrong eye or geometry for this engine.
    Rejected,
    /// The cubemap left the map while the frame was being copied in.
    Discarded { key: u64 },
    Failed { key: u64 },
    Closed,
}

#[derive(Default)]
struct State {
    /// Incomplete keys only.
    entries: BTreeMap<u64, Entry>,
    /// Completed keys queued behind an older incomplete one.
    held: BTreeMap<u64, Ready>,
    arrivals: [[u64; MAX_FACES]; MAX_EYES],
    /// Highest key delivered or evicted. Frames at or below it can no longer be used.
    floor: Option<u64>,
    ready: VecDeque<Ready>,
    pool: Vec<StereoCubemap>,
    next_id: u64,
    closed: bool,
    fatal: Option<StreamError>,
    stats: AssemblyStats,
}

impl State {
    fn is_late(&self, key: u64) -> bool {
        self.floor.is_some_and(|f| key <= f) || self.held.contains_key(&key)
    }

    /// Keys counted against `max_frame_map_size`.
    fn occupancy(&self) -> usize {
        self.entries.len() + self.held.len()
    }

    /// Queue for delivery every held cubemap that no incomplete key is older than.
    fn flush_held(&mut self) {
        let oldest_pending = self.entries.keys().next().copied();
        while let Some(first) = self.held.first_entry() {
            if oldest_pending.is_some_and(|k| k < *first.key()) {
                break;
            }
            let (key, ready) = first.remove_entry();
            self.raise_floor(key);
            self.ready.push_back(ready);
        }
    }

    fn raise_floor(&mut self, key: u64) {
        self.floor = Some(self.floor.map_or(key, |f| f.max(key)));
    }

    fn release(&mut self, cubemap: StereoCubemap) {
        if !self.closed && self.pool.len() < POOL_CAPACITY {
            self.pool.push(cubemap);
        }
    }

    /// Drop a partial entry. Its cubemap is reused unless a copy into it is still running.
    fn discard_entry(&mut self, entry: Entry) {
        if entry.in_flight == 0 {
            self.release(entry.cubemap);
        }
    }
}

/// Recombines independently decoded face frames into complete [`StereoCubemap`]s.
///
/// Frames are grouped by sync key ([`SyncKeyPolicy`]). A key's cubemap is handed to the
/// [`DeliveryHandoff`] once its coverage policy is met and no older key is still incomplete, so
/// keys leave strictly increasing. At most `max_frame_map_size` keys are held, complete or not;
/// inserting past that evicts the oldest incomplete one.
///
/// One lock guards the map and the recycle pool. Pixel copies and the consumer callback run
/// outside it.
pub struct CubemapAssemblyEngine {
    opts: AssemblyOpts,
    shape: CubemapShape,
    observer: Arc<dyn PipelineObserver>,
    state: Mutex<State>,
    delivery: Mutex<DeliveryHandoff>,
}

impl std::fmt::Debug for CubemapAssemblyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CubemapAssemblyEngine")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl CubemapAssemblyEngine {
    pub fn new(
        ctx: &SessionContext,
        opts: AssemblyOpts,
        source_name: impl Into<String>,
        consumer: Option<Box<dyn CubemapConsumer>>,
    ) -> StreamResult<Self> {
        opts.validate()?;
        let shape = opts.shape();
        shape.validate()?;
        let source = SourceInfo {
            name: source_name.into(),
            eyes: opts.coverage.eyes,
            face_width: opts.face_width,
            face_height: opts.face_height,
            format: opts.format,
        };
        let observer = ctx.observer().clone();
        Ok(Self {
            delivery: Mutex::new(DeliveryHandoff::new(source, consumer, observer.clone())),
            opts,
            shape,
            observer,
            state: Mutex::new(State::default()),
        })
    }

    /// Engine without a consumer: completed cubemaps are reported to the observer and dropped.
    pub fn headless(
        ctx: &SessionContext,
        opts: AssemblyOpts,
        source_name: impl Into<String>,
    ) -> StreamResult<Self> {
        Self::new(ctx, opts, source_name, None)
    }

    pub fn opts(&self) -> &AssemblyOpts {
        &self.opts
    }

    pub fn stats(&self) -> AssemblyStats {
        let st = self.state.lock();
        AssemblyStats {
            pending: st.entries.len(),
            held: st.held.len(),
            pool_len: st.pool.len(),
            ..st.stats
        }
    }

    /// Keys currently under construction, oldest first.
    pub fn pending_keys(&self) -> Vec<u64> {
        self.state.lock().entries.keys().copied().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Allocation failure that shut the engine down, if any.
    pub fn take_error(&self) -> Option<StreamError> {
        self.state.lock().fatal.take()
    }

    /// Forget every pending key and restart key numbering, for a reconnected stream. Pooled
    /// cubemaps are kept.
    pub fn reset(&self) {
        let mut st = self.state.lock();
        let entries = std::mem::take(&mut st.entries);
        for (_, e) in entries {
            st.discard_entry(e);
        }
        let held = std::mem::take(&mut st.held);
        for (_, r) in held {
            st.release(r.cubemap);
        }
        st.ready.clear();
        st.arrivals = [[0; MAX_FACES]; MAX_EYES];
        st.floor = None;
        tracing::debug!("assembly state reset");
    }

    /// Stop assembling. Pending and ready cubemaps are dropped.
    pub fn close(&self) {
        let mut st = self.state.lock();
        st.closed = true;
        st.entries.clear();
        st.held.clear();
        st.ready.clear();
        st.pool.clear();
    }

    /// Copy one decoded face frame into the cubemap for its key and deliver whatever became
    /// ready, which may include keys released by an eviction.
    pub fn add_frame(&self, face: FaceIndex, eye: EyeIndex, frame: &RawFrame) -> FrameOutcome {
        let outcome = self.assemble(face, eye, frame);
        self.drain_ready();
        outcome
    }

    fn assemble(&self, face: FaceIndex, eye: EyeIndex, frame: &RawFrame) -> FrameOutcome {
        let (e, f) = (eye.get(), face.get());
        let mut st = self.state.lock();
        if st.closed {
            return FrameOutcome::Closed;
        }
        st.stats.frames_received += 1;

        if e >= self.opts.coverage.eyes.get()
            || frame.width != self.opts.face_width
            || frame.height != self.opts.face_height
            || frame.format != self.opts.format
        {
            st.stats.frames_rejected += 1;
            return FrameOutcome::Rejected;
        }

        let key = match self.opts.key_policy {
            SyncKeyPolicy::ArrivalOrder => {
                let n = &mut st.arrivals[e][f];
                *n += 1;
                *n
            }
            SyncKeyPolicy::StreamCounter => match frame.sequence {
                Some(k) => k,
                None => {
                    st.stats.frames_without_key += 1;
                    return FrameOutcome::NoSyncKey;
                }
            },
        };

        // Reserve the slot, creating the key's entry if needed.
        let mut spare: Option<StereoCubemap> = None;
        let mut dropped: Vec<(u64, usize)> = Vec::new();
        let reserved = loop {
            if st.closed {
                break Err(FrameOutcome::Closed);
            }
            if st.is_late(key) {
                st.stats.frames_late += 1;
                break Err(FrameOutcome::Late { key });
            }
            let state = &mut *st;
            if let Some(entry) = state.entries.get_mut(&key) {
                if entry.slots[e][f] != Slot::Empty {
                    state.stats.frames_duplicate += 1;
                    break Err(FrameOutcome::Duplicate { key });
                }
                let target = entry
                    .cubemap
                    .eye(eye)
                    .map(|c| c.stored_face(face))
                    .transpose()
                    .map(Option::flatten);
                match target {
                    Ok(Some(target)) => {
                        entry.slots[e][f] = Slot::Filling;
                        entry.in_flight += 1;
                        break Ok((entry.id, target.content().clone()));
                    }
                    Ok(None) => break Err(FrameOutcome::Failed { key }),
                    Err(err) => {
                        tracing::warn!(%face, %eye, key, error = %err, "face slot unavailable");
                        break Err(FrameOutcome::Failed { key });
                    }
                }
            }

            if st.occupancy() >= self.opts.max_frame_map_size
                && let Some(&oldest) = st.entries.keys().next()
                && key < oldest
            {
                st.stats.frames_late += 1;
                break Err(FrameOutcome::Late { key });
            }

            let cubemap = match spare.take().or_else(|| st.pool.pop()) {
                Some(c) => c,
                None => {
                    drop(st);
                    let allocated = StereoCubemap::allocate_heap(&self.shape);
                    st = self.state.lock();
                    match allocated {
                        Ok(c) => {
                            st.stats.cubemaps_allocated += 1;
                            spare = Some(c);
                            continue;
                        }
                        Err(err) => {
                            tracing::error!(key, error = %err, "cubemap allocation failed");
                            st.closed = true;
                            st.fatal = Some(StreamError::allocation(err.to_string()));
                            break Err(FrameOutcome::Failed { key });
                        }
                    }
                }
            };

            while st.occupancy() >= self.opts.max_frame_map_size {
                let Some((old_key, old)) = st.entries.pop_first() else {
                    break;
                };
                st.stats.cubemaps_evicted += 1;
                st.raise_floor(old_key);
                dropped.push((old_key, old.faces()));
                st.discard_entry(old);
                st.flush_held();
            }
            if st.is_late(key) {
                spare = Some(cubemap);
                continue;
            }
            let id = st.next_id;
            st.next_id += 1;
            st.entries.insert(
                key,
                Entry {
                    id,
                    cubemap,
                    slots: [[Slot::Empty; MAX_FACES]; MAX_EYES],
                    filled: [FaceMask::EMPTY; MAX_EYES],
                    in_flight: 0,
                },
            );
        };
        if let Some(c) = spare {
            st.release(c);
        }
        drop(st);
        self.report_dropped(&dropped, "evicted incomplete cubemap");

        let (id, target) = match reserved {
            Ok(r) => r,
            Err(outcome) => return outcome,
        };

        let copied = target.write(&frame.data, frame.pts, key);

        let mut st = self.state.lock();
        let state = &mut *st;
        let Some(entry) = state.entries.get_mut(&key).filter(|en| en.id == id) else {
            state.stats.copies_discarded += 1;
            return FrameOutcome::Discarded { key };
        };
        entry.in_flight -= 1;
        if let Err(err) = copied {
            entry.slots[e][f] = Slot::Empty;
            drop(st);
            tracing::warn!(%face, %eye, key, error = %err, "face copy failed");
            return FrameOutcome::Failed { key };
        }
        entry.slots[e][f] = Slot::Filled;
        entry.filled[e] = entry.filled[e].with(face);
        let completed = if entry.in_flight == 0 {
            self.opts
                .coverage
                .evaluate(&entry.filled, self.opts.match_stereo_pairs)
        } else {
            None
        };
        state.stats.frames_added += 1;

        if let Some(faces) = completed
            && let Some(entry) = state.entries.remove(&key)
        {
            state.held.insert(
                key,
                Ready {
                    key,
                    cubemap: entry.cubemap,
                    faces,
                },
            );
            state.flush_held();
        }
        drop(st);

        self.observer.face_added_to_cubemap(face, eye, key);
        FrameOutcome::Added {
            key,
            completed: completed.is_some(),
        }
    }

    fn report_dropped(&self, dropped: &[(u64, usize)], what: &str) {
        for &(key, faces) in dropped {
            tracing::debug!(key, faces, "{what}");
            self.observer.cubemap_evicted(key, faces);
        }
    }

    /// Hand ready cubemaps to the consumer, one at a time and in key order. Whichever thread
    /// holds the delivery lock drains for everyone.
    fn drain_ready(&self) {
        loop {
            let Some(mut delivery) = self.delivery.try_lock() else {
                return;
            };
            loop {
                let next = self.state.lock().ready.pop_front();
                let Some(ready) = next else {
                    break;
                };
                if let Err(err) = publish_faces(&ready.cubemap, &ready.faces) {
                    tracing::warn!(key = ready.key, error = %err, "completed cubemap not published");
                    continue;
                }
                let faces = ready.faces.iter().map(|m| m.len()).sum();
                match delivery.deliver(ready.key, ready.cubemap, faces) {
                    DeliveryOutcome::Delivered { recycle, declined } => {
                        let mut st = self.state.lock();
                        st.stats.cubemaps_delivered += 1;
                        if declined {
                            st.stats.cubemaps_declined += 1;
                        }
                        if let Some(c) = recycle {
                            st.stats.cubemaps_recycled += 1;
                            st.release(c);
                        }
                    }
                    DeliveryOutcome::Closed => {
                        self.close();
                        break;
                    }
                }
            }
            drop(delivery);
            if self.state.lock().ready.is_empty() {
                return;
            }
        }
    }
}

/// Make exactly the faces in `faces` visible on each eye.
fn publish_faces(cubemap: &StereoCubemap, faces: &[FaceMask; MAX_EYES]) -> StreamResult<()> {
    for (eye, mask) in cubemap.eyes().iter().zip(faces) {
        for f in FaceIndex::ALL {
            if mask.contains(f) {
                eye.reattach_face(f)?;
            } else {
                eye.detach_face(f)?;
            }
        }
    }
    Ok(())
}

impl FaceFrameSink for CubemapAssemblyEngine {
    fn on_face_frame_decoded(&self, face: FaceIndex, eye: EyeIndex, frame: &RawFrame) {
        self.add_frame(face, eye, frame);
    }
}
