use crate::foundation::core::PixelFormat;
use crate::foundation::error::{StreamError, StreamResult};
use crate::shm::arena::default_shm_dir;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Whole-process configuration, loaded from JSON. Missing keys take their defaults.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct StreamConfig {
    pub receiver: ReceiverConfig,
    pub encoder: EncoderConfig,
    pub shm: ShmConfig,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ReceiverConfig {
    /// Cap on cubemaps under assembly.
    pub cubemap_queue_size: usize,
    pub match_stereo_pairs: bool,
    pub robust_syncing: bool,
    /// Network receive buffer size, passed through to the transport.
    pub buffer_size: u64,
    /// Edge length of assembled faces.
    pub face_resolution: u32,
    pub output_format: PixelFormat,
    pub nalu_queue_capacity: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            cubemap_queue_size: 2,
            match_stereo_pairs: false,
            robust_syncing: false,
            buffer_size: 2_000_000_000,
            face_resolution: 1024,
            output_format: PixelFormat::Rgba8,
            nalu_queue_capacity: 64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct EncoderConfig {
    /// Target bit rate per face, bits per second.
    pub avg_bit_rate: u64,
    pub frame_pool_size: usize,
    pub packet_queue_capacity: usize,
    /// How long the content loop waits on a frame signal before checking producer liveness.
    pub barrier_timeout_ms: u64,
    /// Emit the sync counter SEI with every access unit.
    pub robust_syncing: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            avg_bit_rate: 4_000_000,
            frame_pool_size: 2,
            packet_queue_capacity: 16,
            barrier_timeout_ms: 100,
            robust_syncing: false,
        }
    }
}

impl EncoderConfig {
    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ShmConfig {
    pub name: String,
    /// Directory holding the segment and liveness lock files.
    pub dir: Option<PathBuf>,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            name: "cubestream".to_string(),
            dir: None,
        }
    }
}

impl ShmConfig {
    pub fn dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(default_shm_dir)
    }

    /// Liveness lock id of the producer owning this segment.
    pub fn producer_id(&self) -> String {
        format!("{}-producer", self.name)
    }
}

impl StreamConfig {
    pub fn from_json_str(s: &str) -> StreamResult<Self> {
        let cfg: Self = serde_json::from_str(s)
            .map_err(|e| StreamError::validation(format!("invalid config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> StreamResult<Self> {
        use anyhow::Context as _;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> StreamResult<()> {
        let r = &self.receiver;
        if r.cubemap_queue_size == 0 {
            return Err(StreamError::validation("cubemap-queue-size must be at least 1"));
        }
        if r.nalu_queue_capacity == 0 {
            return Err(StreamError::validation(
                "nalu-queue-capacity must be at least 1",
            ));
        }
        r.output_format
            .validate_dims(r.face_resolution, r.face_resolution)
            .map_err(|_| {
                StreamError::validation(format!(
                    "face-resolution {} is not usable with {:?} output",
                    r.face_resolution, r.output_format
                ))
            })?;
        // decoded frames are yuv420p before conversion
        if !r.face_resolution.is_multiple_of(2) {
            return Err(StreamError::validation("face-resolution must be even"));
        }
        let e = &self.encoder;
        if e.frame_pool_size == 0 || e.packet_queue_capacity == 0 {
            return Err(StreamError::validation(
                "frame-pool-size and packet-queue-capacity must be at least 1",
            ));
        }
        if e.avg_bit_rate == 0 {
            return Err(StreamError::validation("avg-bit-rate must be non-zero"));
        }
        if e.barrier_timeout_ms == 0 {
            return Err(StreamError::validation("barrier-timeout-ms must be non-zero"));
        }
        if self.shm.name.is_empty() || self.shm.name.contains('/') {
            return Err(StreamError::validation(format!(
                "invalid shm name '{}'",
                self.shm.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let cfg = StreamConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, StreamConfig::default());
        assert_eq!(cfg.receiver.cubemap_queue_size, 2);
        assert_eq!(cfg.receiver.buffer_size, 2_000_000_000);
        assert!(!cfg.receiver.match_stereo_pairs);
        assert_eq!(cfg.encoder.barrier_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn kebab_case_keys_are_read() {
        let cfg = StreamConfig::from_json_str(
            r#"{"receiver": {"cubemap-queue-size": 4, "match-stereo-pairs": true,
                 "robust-syncing": true, "output-format": "bgra"},
                "shm": {"name": "test-seg"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.receiver.cubemap_queue_size, 4);
        assert!(cfg.receiver.match_stereo_pairs);
        assert!(cfg.receiver.robust_syncing);
        assert_eq!(cfg.receiver.output_format, PixelFormat::Bgra8);
        assert_eq!(cfg.shm.producer_id(), "test-seg-producer");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(StreamConfig::from_json_str(r#"{"receiver": {"cubemap-queue-size": 0}}"#).is_err());
        assert!(StreamConfig::from_json_str(r#"{"receiver": {"face-resolution": 33}}"#).is_err());
        assert!(StreamConfig::from_json_str(r#"{"receiver": {"typo": 1}}"#).is_err());
        assert!(StreamConfig::from_json_str(r#"{"shm": {"name": "a/b"}}"#).is_err());
    }
}
