use crate::cubemap::frame::{FrameRaw, SharedFrame, frame_footprint};
use crate::foundation::core::{
    EyeCount, EyeIndex, FaceIndex, FaceMask, MAX_EYES, MAX_FACES, PixelFormat,
};
use crate::foundation::error::{StreamError, StreamResult};
use crate::shm::arena::{Arena, ArenaValue, Offset};
use crate::shm::signal::{SharedSignal, WaitOutcome};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Root name under which a producer publishes its [`StereoCubemap`].
pub const ROOT_NAME: &str = "cubemap";

#[repr(C)]
pub(crate) struct FaceRaw {
    index: AtomicU32,
    new_face: AtomicU32,
    frame: AtomicU64,
}

#[repr(C)]
pub(crate) struct CubemapRaw {
    signal: SharedSignal,
    faces: [AtomicU64; MAX_FACES],
    storage: [AtomicU64; MAX_FACES],
}

#[repr(C)]
pub(crate) struct StereoRaw {
    eyes_count: AtomicU32,
    _pad: AtomicU32,
    eyes: [AtomicU64; MAX_EYES],
}

// SAFETY: all three are repr(C), pointer-free and valid when zeroed.
#[allow(unsafe_code)]
unsafe impl ArenaValue for FaceRaw {}
#[allow(unsafe_code)]
unsafe impl ArenaValue for CubemapRaw {}
#[allow(unsafe_code)]
unsafe impl ArenaValue for StereoRaw {}

/// Geometry of a stereo cubemap: which faces exist per eye and their pixel layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CubemapShape {
    pub eyes: EyeCount,
    pub faces: FaceMask,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl CubemapShape {
    pub fn new(eyes: EyeCount, faces: FaceMask, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            eyes,
            faces,
            width,
            height,
            format,
        }
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.faces.is_empty() {
            return Err(StreamError::validation("cubemap shape has no faces"));
        }
        self.format.validate_dims(self.width, self.height)
    }

    /// Arena capacity needed to allocate one stereo cubemap of this shape.
    pub fn bytes_required(&self) -> usize {
        const SLACK: usize = 4096;
        let pad = |n: usize| n.next_multiple_of(64) + 64;
        let per_face =
            pad(std::mem::size_of::<FaceRaw>()) + frame_footprint(self.width, self.height, self.format);
        let per_eye = pad(std::mem::size_of::<CubemapRaw>()) + per_face * self.faces.len();
        SLACK + pad(std::mem::size_of::<StereoRaw>()) + per_eye * self.eyes.get()
    }
}

/// One face slot's content: its index and exactly one [`SharedFrame`].
#[derive(Clone, Debug)]
pub struct CubemapFace {
    arena: Arc<Arena>,
    off: Offset<FaceRaw>,
    index: FaceIndex,
    content: SharedFrame,
}

impl CubemapFace {
    pub fn create(arena: &Arc<Arena>, index: FaceIndex, content: SharedFrame) -> StreamResult<Self> {
        if !Arc::ptr_eq(arena, content.arena()) {
            return Err(StreamError::validation(
                "face content must live in the same arena as the face",
            ));
        }
        let off = arena.alloc::<FaceRaw>()?;
        let raw = arena.get(off)?;
        raw.index.store(index.get() as u32, Ordering::Relaxed);
        raw.frame.store(content.offset().raw(), Ordering::Release);
        Ok(Self {
            arena: arena.clone(),
            off,
            index,
            content,
        })
    }

    fn open(arena: &Arc<Arena>, off: Offset<FaceRaw>) -> StreamResult<Self> {
        let raw = arena.get(off)?;
        let index = FaceIndex::new(raw.index.load(Ordering::Relaxed) as usize)?;
        let frame = Offset::<FrameRaw>::from_raw(raw.frame.load(Ordering::Acquire));
        let content = SharedFrame::open(arena, frame)?;
        Ok(Self {
            arena: arena.clone(),
            off,
            index,
            content,
        })
    }

    pub fn index(&self) -> FaceIndex {
        self.index
    }

    pub fn content(&self) -> &SharedFrame {
        &self.content
    }

    /// True once after the face was attached; the first caller to observe it clears it.
    pub fn take_new_face_flag(&self) -> StreamResult<bool> {
        Ok(self.arena.get(self.off)?.new_face.swap(0, Ordering::AcqRel) != 0)
    }

    fn set_new_face_flag(&self) -> StreamResult<()> {
        self.arena.get(self.off)?.new_face.store(1, Ordering::Release);
        Ok(())
    }
}

/// Up to six face slots plus a signal raised whenever a slot is populated.
///
/// Every face ever attached is remembered in a backing slot, so a face can be detached (left
/// absent) and reattached later without reallocating its frame.
#[derive(Clone)]
pub struct Cubemap {
    arena: Arc<Arena>,
    off: Offset<CubemapRaw>,
}

impl std::fmt::Debug for Cubemap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cubemap").field("offset", &self.off).finish()
    }
}

impl Cubemap {
    /// Empty cubemap (no face populated).
    pub fn create(arena: &Arc<Arena>) -> StreamResult<Self> {
        let off = arena.alloc::<CubemapRaw>()?;
        arena.get(off)?.signal.init()?;
        Ok(Self {
            arena: arena.clone(),
            off,
        })
    }

    fn open(arena: &Arc<Arena>, off: Offset<CubemapRaw>) -> StreamResult<Self> {
        arena.get(off)?;
        Ok(Self {
            arena: arena.clone(),
            off,
        })
    }

    fn raw(&self) -> StreamResult<&CubemapRaw> {
        self.arena.get(self.off)
    }

    pub fn signal(&self) -> StreamResult<&SharedSignal> {
        Ok(&self.raw()?.signal)
    }

    /// Populate the face's slot and wake anyone waiting for new faces.
    pub fn set_face(&self, face: &CubemapFace) -> StreamResult<()> {
        if !Arc::ptr_eq(&self.arena, &face.arena) {
            return Err(StreamError::validation(
                "face must live in the same arena as its cubemap",
            ));
        }
        let raw = self.raw()?;
        let i = face.index().get();
        let guard = raw.signal.lock()?;
        raw.storage[i].store(face.off.raw(), Ordering::Release);
        raw.faces[i].store(face.off.raw(), Ordering::Release);
        face.set_new_face_flag()?;
        raw.signal.notify_locked(&guard);
        Ok(())
    }

    pub fn face(&self, index: FaceIndex) -> StreamResult<Option<CubemapFace>> {
        let off = self.raw()?.faces[index.get()].load(Ordering::Acquire);
        if off == 0 {
            return Ok(None);
        }
        CubemapFace::open(&self.arena, Offset::from_raw(off)).map(Some)
    }

    /// Face in the backing slot, populated or not.
    pub fn stored_face(&self, index: FaceIndex) -> StreamResult<Option<CubemapFace>> {
        let off = self.raw()?.storage[index.get()].load(Ordering::Acquire);
        if off == 0 {
            return Ok(None);
        }
        CubemapFace::open(&self.arena, Offset::from_raw(off)).map(Some)
    }

    pub fn populated(&self) -> StreamResult<FaceMask> {
        let raw = self.raw()?;
        Ok(FaceMask::of(
            FaceIndex::ALL
                .into_iter()
                .filter(|f| raw.faces[f.get()].load(Ordering::Acquire) != 0),
        ))
    }

    pub fn faces_count(&self) -> StreamResult<usize> {
        Ok(self.populated()?.len())
    }

    /// Leave the slot absent; its backing face stays allocated.
    pub fn detach_face(&self, index: FaceIndex) -> StreamResult<()> {
        let raw = self.raw()?;
        let _guard = raw.signal.lock()?;
        raw.faces[index.get()].store(0, Ordering::Release);
        Ok(())
    }

    /// Repopulate the slot from its backing face. Returns false when nothing was ever attached.
    pub fn reattach_face(&self, index: FaceIndex) -> StreamResult<bool> {
        let raw = self.raw()?;
        let guard = raw.signal.lock()?;
        let stored = raw.storage[index.get()].load(Ordering::Acquire);
        if stored == 0 {
            return Ok(false);
        }
        raw.faces[index.get()].store(stored, Ordering::Release);
        raw.signal.notify_locked(&guard);
        Ok(true)
    }

    /// Wait until a face outside `known` is populated or `timeout` passes. Returns the populated
    /// set at that point.
    pub fn wait_for_new_faces(&self, known: FaceMask, timeout: Duration) -> StreamResult<FaceMask> {
        let deadline = Instant::now() + timeout;
        let signal = self.signal()?;
        loop {
            let seen = signal.generation();
            let populated = self.populated()?;
            if !known.contains_all(populated) {
                return Ok(populated);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(populated);
            }
            if signal.wait_newer(seen, left)? == WaitOutcome::TimedOut {
                return self.populated();
            }
        }
    }

    /// Forced reset of this cubemap's signal and every attached face's frame signal.
    pub fn reset_signals(&self) -> StreamResult<()> {
        self.signal()?.reset()?;
        for f in FaceIndex::ALL {
            if let Some(face) = self.stored_face(f)? {
                face.content().reset_signal()?;
            }
        }
        Ok(())
    }
}

/// One or two [`Cubemap`] eyes. The eye count never changes after allocation.
///
/// Not `Clone`: a `StereoCubemap` is owned by whoever holds it, which is how the delivery
/// protocol tracks what may be recycled.
pub struct StereoCubemap {
    arena: Arc<Arena>,
    off: Offset<StereoRaw>,
    eyes: Vec<Cubemap>,
}

impl std::fmt::Debug for StereoCubemap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StereoCubemap")
            .field("offset", &self.off)
            .field("eyes", &self.eyes.len())
            .finish()
    }
}

impl StereoCubemap {
    /// Allocate every eye, face and frame of `shape` inside `arena`. All faces start populated.
    pub fn allocate(arena: &Arc<Arena>, shape: &CubemapShape) -> StreamResult<Self> {
        shape.validate()?;
        let mut eyes = Vec::with_capacity(shape.eyes.get());
        for _ in shape.eyes.eyes() {
            let cubemap = Cubemap::create(arena)?;
            for f in shape.faces.iter() {
                let frame = SharedFrame::allocate(arena, shape.width, shape.height, shape.format)?;
                let face = CubemapFace::create(arena, f, frame)?;
                cubemap.set_face(&face)?;
            }
            eyes.push(cubemap);
        }
        let off = arena.alloc::<StereoRaw>()?;
        let raw = arena.get(off)?;
        for (i, eye) in eyes.iter().enumerate() {
            raw.eyes[i].store(eye.off.raw(), Ordering::Release);
        }
        raw.eyes_count.store(eyes.len() as u32, Ordering::Release);
        Ok(Self {
            arena: arena.clone(),
            off,
            eyes,
        })
    }

    /// Allocate in a fresh process-local arena sized for `shape`.
    pub fn allocate_heap(shape: &CubemapShape) -> StreamResult<Self> {
        let arena = Arena::heap(shape.bytes_required())?;
        Self::allocate(&arena, shape)
    }

    fn open(arena: &Arc<Arena>, off: Offset<StereoRaw>) -> StreamResult<Self> {
        let raw = arena.get(off)?;
        let count = EyeCount::from_count(raw.eyes_count.load(Ordering::Acquire) as usize)?;
        let eyes = (0..count.get())
            .map(|i| Cubemap::open(arena, Offset::from_raw(raw.eyes[i].load(Ordering::Acquire))))
            .collect::<StreamResult<Vec<_>>>()?;
        Ok(Self {
            arena: arena.clone(),
            off,
            eyes,
        })
    }

    /// Resolve the cubemap a producer published under [`ROOT_NAME`].
    pub fn open_root(arena: &Arc<Arena>) -> StreamResult<Self> {
        let off = arena.root::<StereoRaw>(ROOT_NAME)?;
        Self::open(arena, off)
    }

    pub fn publish_root(&self) -> StreamResult<()> {
        self.arena.set_root(ROOT_NAME, self.off)
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn eye_count(&self) -> EyeCount {
        match self.eyes.len() {
            1 => EyeCount::Mono,
            _ => EyeCount::Stereo,
        }
    }

    pub fn eye(&self, eye: EyeIndex) -> Option<&Cubemap> {
        self.eyes.get(eye.get())
    }

    pub fn eyes(&self) -> &[Cubemap] {
        &self.eyes
    }

    pub fn face(&self, eye: EyeIndex, face: FaceIndex) -> StreamResult<Option<CubemapFace>> {
        match self.eye(eye) {
            Some(c) => c.face(face),
            None => Ok(None),
        }
    }

    pub fn reset_signals(&self) -> StreamResult<()> {
        for eye in &self.eyes {
            eye.reset_signals()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::core::Pts;

    fn shape(eyes: EyeCount, faces: FaceMask) -> CubemapShape {
        CubemapShape::new(eyes, faces, 4, 4, PixelFormat::Rgba8)
    }

    #[test]
    fn allocate_populates_requested_faces() {
        let faces = FaceMask::of([FaceIndex::ALL[0], FaceIndex::ALL[3]]);
        let sc = StereoCubemap::allocate_heap(&shape(EyeCount::Stereo, faces)).unwrap();
        assert_eq!(sc.eye_count(), EyeCount::Stereo);
        for eye in sc.eyes() {
            assert_eq!(eye.populated().unwrap(), faces);
            assert_eq!(eye.faces_count().unwrap(), 2);
        }
        assert!(sc.face(EyeIndex::RIGHT, FaceIndex::ALL[1]).unwrap().is_none());
        let f = sc.face(EyeIndex::RIGHT, FaceIndex::ALL[3]).unwrap().unwrap();
        assert_eq!(f.index(), FaceIndex::ALL[3]);
        assert!(f.take_new_face_flag().unwrap());
        assert!(!f.take_new_face_flag().unwrap());
    }

    #[test]
    fn detach_and_reattach_keep_backing_face() {
        let sc = StereoCubemap::allocate_heap(&shape(EyeCount::Mono, FaceMask::ALL)).unwrap();
        let eye = sc.eye(EyeIndex::LEFT).unwrap();
        let f2 = FaceIndex::ALL[2];
        eye.detach_face(f2).unwrap();
        assert!(eye.face(f2).unwrap().is_none());
        assert!(eye.stored_face(f2).unwrap().is_some());
        assert_eq!(eye.faces_count().unwrap(), 5);
        assert!(eye.reattach_face(f2).unwrap());
        assert_eq!(eye.populated().unwrap(), FaceMask::ALL);
    }

    #[test]
    fn late_face_wakes_waiter() {
        let arena = Arena::heap(1 << 20).unwrap();
        let cubemap = Cubemap::create(&arena).unwrap();
        let waiter = {
            let cubemap = cubemap.clone();
            std::thread::spawn(move || {
                cubemap
                    .wait_for_new_faces(FaceMask::EMPTY, Duration::from_secs(5))
                    .unwrap()
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        let frame = SharedFrame::allocate(&arena, 2, 2, PixelFormat::Rgba8).unwrap();
        let face = CubemapFace::create(&arena, FaceIndex::ALL[4], frame).unwrap();
        cubemap.set_face(&face).unwrap();
        assert_eq!(waiter.join().unwrap(), FaceMask::of([FaceIndex::ALL[4]]));
        let none = cubemap
            .wait_for_new_faces(FaceMask::of([FaceIndex::ALL[4]]), Duration::from_millis(10))
            .unwrap();
        assert_eq!(none.len(), 1);
    }

    #[test]
    fn root_round_trips_through_shared_segment() {
        let dir = tempfile::tempdir().unwrap();
        let s = shape(EyeCount::Stereo, FaceMask::ALL);
        let producer_arena = Arena::create_shared(dir.path(), "root", s.bytes_required()).unwrap();
        let produced = StereoCubemap::allocate(&producer_arena, &s).unwrap();
        produced.publish_root().unwrap();
        let face = produced.face(EyeIndex::LEFT, FaceIndex::ALL[5]).unwrap().unwrap();
        face.content().publish(&[3; 64], Pts(77)).unwrap();

        let consumer_arena = Arena::open_shared(dir.path(), "root").unwrap();
        let seen = StereoCubemap::open_root(&consumer_arena).unwrap();
        assert_eq!(seen.eye_count(), EyeCount::Stereo);
        let face = seen.face(EyeIndex::LEFT, FaceIndex::ALL[5]).unwrap().unwrap();
        let snap = face.content().snapshot().unwrap();
        assert_eq!(snap.pts, Pts(77));
        assert_eq!(snap.data, vec![3; 64]);
    }

    #[test]
    fn faces_from_another_arena_are_rejected() {
        let a = Arena::heap(1 << 16).unwrap();
        let b = Arena::heap(1 << 16).unwrap();
        let frame = SharedFrame::allocate(&b, 2, 2, PixelFormat::Rgba8).unwrap();
        assert!(CubemapFace::create(&a, FaceIndex::ALL[0], frame).is_err());
    }
}
