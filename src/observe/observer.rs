use crate::foundation::core::{EyeIndex, FaceIndex, Pts};

/// One NAL unit crossing a pipeline boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NaluEvent {
    pub nalu_type: u8,
    pub size: usize,
    pub face: FaceIndex,
    pub eye: EyeIndex,
}

/// Event sink for pipeline instrumentation.
///
/// Every method has a no-op default so implementors pick only the events they care about.
/// Callbacks run on pipeline threads and must not block; none of them affects control flow.
pub trait PipelineObserver: Send + Sync {
    fn nalu_received(&self, _event: NaluEvent) {}
    fn nalu_dropped(&self, _event: NaluEvent) {}
    fn nalu_sent(&self, _event: NaluEvent) {}
    fn frame_encoded(&self, _face: FaceIndex, _eye: EyeIndex, _pts: Pts) {}
    fn frame_decoded(&self, _face: FaceIndex, _eye: EyeIndex) {}
    fn frame_color_converted(&self, _face: FaceIndex, _eye: EyeIndex) {}
    fn face_added_to_cubemap(&self, _face: FaceIndex, _eye: EyeIndex, _key: u64) {}
    fn cubemap_delivered(&self, _key: u64, _faces: usize) {}
    fn cubemap_evicted(&self, _key: u64, _faces: usize) {}
    fn timestamp_rewritten(&self, _face: FaceIndex, _eye: EyeIndex, _from: Pts, _to: Pts) {}
}

/// Observer that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullObserver;

impl PipelineObserver for NullObserver {}
