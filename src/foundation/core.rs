use crate::foundation::error::{StreamError, StreamResult};

/// Number of faces in one cubemap (±X, ±Y, ±Z).
pub const MAX_FACES: usize = 6;
/// Number of eyes in a stereo cubemap.
pub const MAX_EYES: usize = 2;

/// Index of a cubemap face, always in `[0, 6)`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub struct FaceIndex(u8);

impl FaceIndex {
    /// All six faces in index order.
    pub const ALL: [FaceIndex; MAX_FACES] = [
        FaceIndex(0),
        FaceIndex(1),
        FaceIndex(2),
        FaceIndex(3),
        FaceIndex(4),
        FaceIndex(5),
    ];

    pub fn new(index: usize) -> StreamResult<Self> {
        if index >= MAX_FACES {
            return Err(StreamError::validation(format!(
                "face index {index} out of range [0, {MAX_FACES})"
            )));
        }
        Ok(Self(index as u8))
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u8> for FaceIndex {
    type Error = StreamError;

    fn try_from(v: u8) -> StreamResult<Self> {
        Self::new(v as usize)
    }
}

impl From<FaceIndex> for u8 {
    fn from(f: FaceIndex) -> u8 {
        f.0
    }
}

impl std::fmt::Display for FaceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a stereo eye: 0 is left, 1 is right.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub struct EyeIndex(u8);

impl EyeIndex {
    pub const LEFT: EyeIndex = EyeIndex(0);
    pub const RIGHT: EyeIndex = EyeIndex(1);

    pub fn new(index: usize) -> StreamResult<Self> {
        if index >= MAX_EYES {
            return Err(StreamError::validation(format!(
                "eye index {index} out of range [0, {MAX_EYES})"
            )));
        }
        Ok(Self(index as u8))
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }

    /// The opposite eye of a stereo pair.
    pub fn other(self) -> Self {
        Self(1 - self.0)
    }
}

impl TryFrom<u8> for EyeIndex {
    type Error = StreamError;

    fn try_from(v: u8) -> StreamResult<Self> {
        Self::new(v as usize)
    }
}

impl From<EyeIndex> for u8 {
    fn from(e: EyeIndex) -> u8 {
        e.0
    }
}

impl std::fmt::Display for EyeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of eyes a session carries. Fixed for the lifetime of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EyeCount {
    Mono,
    Stereo,
}

impl EyeCount {
    pub fn get(self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
        }
    }

    pub fn from_count(n: usize) -> StreamResult<Self> {
        match n {
            1 => Ok(Self::Mono),
            2 => Ok(Self::Stereo),
            _ => Err(StreamError::validation(format!(
                "eye count must be 1 or 2, got {n}"
            ))),
        }
    }

    pub fn eyes(self) -> impl Iterator<Item = EyeIndex> {
        (0..self.get()).map(|e| EyeIndex(e as u8))
    }
}

/// Bit set over the six faces of one cubemap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FaceMask(u8);

impl FaceMask {
    pub const EMPTY: FaceMask = FaceMask(0);
    pub const ALL: FaceMask = FaceMask(0b11_1111);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn of(faces: impl IntoIterator<Item = FaceIndex>) -> Self {
        faces.into_iter().fold(Self::EMPTY, |m, f| m.with(f))
    }

    pub fn with(self, face: FaceIndex) -> Self {
        Self(self.0 | (1 << face.0))
    }

    pub fn without(self, face: FaceIndex) -> Self {
        Self(self.0 & !(1 << face.0))
    }

    pub fn contains(self, face: FaceIndex) -> bool {
        self.0 & (1 << face.0) != 0
    }

    pub fn contains_all(self, other: FaceMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: FaceMask) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersection(self, other: FaceMask) -> Self {
        Self(self.0 & other.0)
    }

    pub fn difference(self, other: FaceMask) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = FaceIndex> {
        FaceIndex::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

/// Presentation timestamp in microseconds.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize,
    serde::Deserialize,
)]
pub struct Pts(pub i64);

impl Pts {
    pub fn from_duration_since_epoch(d: std::time::Duration) -> Self {
        Self(i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
    }

    /// Wall-clock now, as the capture side stamps frames.
    pub fn now() -> Self {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(Self::from_duration_since_epoch)
            .unwrap_or_default()
    }
}

/// Pixel layouts that cross the producer/encoder and decoder/consumer boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum PixelFormat {
    /// Packed 8-bit RGBA, straight alpha.
    #[serde(rename = "rgba")]
    Rgba8 = 1,
    /// Packed 8-bit BGRA, straight alpha.
    #[serde(rename = "bgra")]
    Bgra8 = 2,
    /// Planar 4:2:0 Y'CbCr, BT.601 limited range. Width and height must be even.
    #[serde(rename = "yuv420p")]
    Yuv420p = 3,
}

impl PixelFormat {
    pub fn from_raw(raw: u32) -> StreamResult<Self> {
        match raw {
            1 => Ok(Self::Rgba8),
            2 => Ok(Self::Bgra8),
            3 => Ok(Self::Yuv420p),
            _ => Err(StreamError::validation(format!(
                "unknown pixel format tag {raw}"
            ))),
        }
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Byte length of one `width` x `height` image in this format.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let px = (width as usize).saturating_mul(height as usize);
        match self {
            Self::Rgba8 | Self::Bgra8 => px.saturating_mul(4),
            Self::Yuv420p => {
                let chroma = (width as usize).div_ceil(2) * (height as usize).div_ceil(2);
                px.saturating_add(chroma.saturating_mul(2))
            }
        }
    }

    pub fn validate_dims(self, width: u32, height: u32) -> StreamResult<()> {
        if width == 0 || height == 0 {
            return Err(StreamError::validation("frame width/height must be non-zero"));
        }
        if self == Self::Yuv420p && (!width.is_multiple_of(2) || !height.is_multiple_of(2)) {
            return Err(StreamError::validation(
                "yuv420p frames require even width/height",
            ));
        }
        Ok(())
    }

    /// Name understood by ffmpeg's `-pix_fmt`.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            Self::Rgba8 => "rgba",
            Self::Bgra8 => "bgra",
            Self::Yuv420p => "yuv420p",
        }
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = StreamError;

    fn from_str(s: &str) -> StreamResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rgba" => Ok(Self::Rgba8),
            "bgra" => Ok(Self::Bgra8),
            "yuv420p" => Ok(Self::Yuv420p),
            other => Err(StreamError::validation(format!(
                "unknown pixel format '{other}' (expected rgba, bgra or yuv420p)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn face_and_eye_indices_are_range_checked() {
        assert!(FaceIndex::new(5).is_ok());
        assert!(FaceIndex::new(6).is_err());
        assert!(EyeIndex::new(1).is_ok());
        assert!(EyeIndex::new(2).is_err());
        assert_eq!(EyeIndex::LEFT.other(), EyeIndex::RIGHT);
    }

    #[test]
    fn face_mask_set_operations() {
        let f = |i| FaceIndex::new(i).unwrap();
        let m = FaceMask::of([f(0), f(2), f(5)]);
        assert_eq!(m.len(), 3);
        assert!(m.contains(f(2)));
        assert!(!m.contains(f(1)));
        assert!(FaceMask::ALL.contains_all(m));
        assert_eq!(m.without(f(2)).len(), 2);
        assert_eq!(
            m.iter().map(FaceIndex::get).collect::<Vec<_>>(),
            vec![0, 2, 5]
        );
        assert_eq!(FaceMask::ALL.difference(m).len(), 3);
    }

    #[test]
    fn frame_len_matches_layouts() {
        assert_eq!(PixelFormat::Rgba8.frame_len(4, 2), 32);
        assert_eq!(PixelFormat::Yuv420p.frame_len(4, 2), 8 + 2 + 2);
        assert!(PixelFormat::Yuv420p.validate_dims(3, 2).is_err());
        assert!(PixelFormat::Rgba8.validate_dims(3, 2).is_ok());
    }

    #[test]
    fn face_index_deserializes_with_validation() {
        let ok: FaceIndex = serde_json::from_str("4").unwrap();
        assert_eq!(ok.get(), 4);
        assert!(serde_json::from_str::<FaceIndex>("9").is_err());
    }

    #[test]
    fn pixel_format_names_match_ffmpeg() {
        for f in [PixelFormat::Rgba8, PixelFormat::Bgra8, PixelFormat::Yuv420p] {
            assert_eq!(f.ffmpeg_name().parse::<PixelFormat>().unwrap(), f);
            let json = serde_json::to_string(&f).unwrap();
            assert_eq!(json, format!("\"{}\"", f.ffmpeg_name()));
        }
        assert!("nv12".parse::<PixelFormat>().is_err());
    }
}
