use crate::config::ReceiverConfig;
use crate::cubemap::model::CubemapShape;
use crate::foundation::core::{EyeCount, FaceMask, MAX_EYES, PixelFormat};
use crate::foundation::error::{StreamError, StreamResult};

/// How a decoded frame is mapped to the cubemap it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncKeyPolicy {
    /// The n-th frame decoded for a face belongs to cubemap n. Assumes every face stream delivers
    /// every picture; a face that loses a picture stays offset from the others afterwards.
    ArrivalOrder,
    /// The sync counter the encoder put on the stream (robust syncing). A lost picture only costs
    /// that one cubemap.
    StreamCounter,
}

/// Which faces must be present before a cubemap is delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoveragePolicy {
    pub eyes: EyeCount,
    /// Required faces per eye; entries past `eyes` are ignored.
    pub required: [FaceMask; MAX_EYES],
}

impl CoveragePolicy {
    /// Every face of every configured eye.
    pub fn full(eyes: EyeCount) -> Self {
        Self::uniform(eyes, FaceMask::ALL)
    }

    /// The same faces for every configured eye.
    pub fn uniform(eyes: EyeCount, faces: FaceMask) -> Self {
        let mut required = [FaceMask::EMPTY; MAX_EYES];
        for e in eyes.eyes() {
            required[e.get()] = faces;
        }
        Self { eyes, required }
    }

    pub fn union_required(&self) -> FaceMask {
        self.eyes
            .eyes()
            .fold(FaceMask::EMPTY, |m, e| m.union(self.required[e.get()]))
    }

    /// Faces to publish per eye if `filled` satisfies the policy, `None` otherwise.
    ///
    /// With `match_pairs` on a stereo session, a face counts only once both eyes have it; faces
    /// one eye has and the other lacks are left out of the result.
    pub fn evaluate(
        &self,
        filled: &[FaceMask; MAX_EYES],
        match_pairs: bool,
    ) -> Option<[FaceMask; MAX_EYES]> {
        if match_pairs && self.eyes == EyeCount::Stereo {
            let matched = filled[0].intersection(filled[1]);
            return matched
                .contains_all(self.union_required())
                .then_some([matched, matched]);
        }
        let mut out = [FaceMask::EMPTY; MAX_EYES];
        for e in self.eyes.eyes() {
            let i = e.get();
            if !filled[i].contains_all(self.required[i]) {
                return None;
            }
            out[i] = filled[i];
        }
        Some(out)
    }
}

/// Options for [`CubemapAssemblyEngine`](crate::assemble::engine::CubemapAssemblyEngine).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssemblyOpts {
    /// Cap on cubemaps under construction. Inserting past it evicts the oldest.
    pub max_frame_map_size: usize,
    pub match_stereo_pairs: bool,
    pub key_policy: SyncKeyPolicy,
    pub coverage: CoveragePolicy,
    pub face_width: u32,
    pub face_height: u32,
    pub format: PixelFormat,
}

impl AssemblyOpts {
    pub fn from_config(cfg: &ReceiverConfig, eyes: EyeCount) -> Self {
        Self {
            max_frame_map_size: cfg.cubemap_queue_size,
            match_stereo_pairs: cfg.match_stereo_pairs,
            key_policy: if cfg.robust_syncing {
                SyncKeyPolicy::StreamCounter
            } else {
                SyncKeyPolicy::ArrivalOrder
            },
            coverage: CoveragePolicy::full(eyes),
            face_width: cfg.face_resolution,
            face_height: cfg.face_resolution,
            format: cfg.output_format,
        }
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.max_frame_map_size == 0 {
            return Err(StreamError::validation(
                "max_frame_map_size must be at least 1",
            ));
        }
        if self.coverage.union_required().is_empty() {
            return Err(StreamError::validation("coverage policy requires no faces"));
        }
        self.format.validate_dims(self.face_width, self.face_height)
    }

    /// Shape of every cubemap the engine allocates.
    pub fn shape(&self) -> CubemapShape {
        CubemapShape::new(
            self.coverage.eyes,
            FaceMask::ALL,
            self.face_width,
            self.face_height,
            self.format,
        )
    }
}
