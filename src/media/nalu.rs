//! H.264 elementary stream framing.
//!
//! NAL units are stored without their Annex-B start code. Every access unit produced by the
//! encoder begins with an access unit delimiter (AUD); with robust syncing enabled an SEI
//! `user_data_unregistered` message carrying the face's sync counter follows the AUD.

use crate::foundation::core::Pts;
use smallvec::SmallVec;

pub const NALU_TYPE_IDR: u8 = 5;
pub const NALU_TYPE_SEI: u8 = 6;
pub const NALU_TYPE_SPS: u8 = 7;
pub const NALU_TYPE_PPS: u8 = 8;
pub const NALU_TYPE_AUD: u8 = 9;

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const SEI_USER_DATA_UNREGISTERED: u8 = 5;

/// Identifies the sync counter SEI among other user data.
pub const SYNC_SEI_UUID: [u8; 16] = *b"cubestream-sync!";

#[derive(Clone, PartialEq, Eq)]
pub struct Nalu {
    data: Vec<u8>,
}

impl std::fmt::Debug for Nalu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nalu")
            .field("type", &self.nalu_type())
            .field("len", &self.data.len())
            .finish()
    }
}

impl Nalu {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Low five bits of the header byte; 0 for an empty unit.
    pub fn nalu_type(&self) -> u8 {
        self.data.first().map_or(0, |b| b & 0x1f)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_aud(&self) -> bool {
        self.nalu_type() == NALU_TYPE_AUD
    }

    pub fn aud() -> Self {
        // primary_pic_type = 7 (any slice type), then the rbsp stop bit
        Self::new(vec![NALU_TYPE_AUD, 0xf0])
    }

    /// Append to an Annex-B byte stream.
    pub fn write_annexb(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&self.data);
    }
}

/// All NAL units of one encoded picture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessUnit {
    pub pts: Pts,
    pub sequence: u64,
    pub nalus: SmallVec<[Nalu; 4]>,
}

impl AccessUnit {
    pub fn new(pts: Pts, sequence: u64, nalus: impl IntoIterator<Item = Nalu>) -> Self {
        Self {
            pts,
            sequence,
            nalus: nalus.into_iter().collect(),
        }
    }

    /// Insert `nalu` right after the leading AUD, or at the front when there is none.
    pub fn insert_after_aud(&mut self, nalu: Nalu) {
        let at = usize::from(self.nalus.first().is_some_and(Nalu::is_aud));
        self.nalus.insert(at, nalu);
    }

    pub fn byte_len(&self) -> usize {
        self.nalus.iter().map(|n| n.len() + START_CODE.len()).sum()
    }

    pub fn to_annexb(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for n in &self.nalus {
            n.write_annexb(&mut out);
        }
        out
    }
}

/// Position and length of the next start code at or after `from`.
fn find_start_code(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 {
            if buf[i + 2] == 1 {
                return Some((i, 3));
            }
            if buf[i + 2] == 0 && i + 4 <= buf.len() && buf[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Split a complete Annex-B buffer into NAL units.
pub fn split_annexb(buf: &[u8]) -> Vec<Nalu> {
    let mut parser = AnnexBParser::default();
    let mut out = parser.push(buf);
    out.extend(parser.finish());
    out
}

/// Incremental Annex-B splitter for a byte stream that arrives in arbitrary chunks.
#[derive(Debug, Default)]
pub struct AnnexBParser {
    buf: Vec<u8>,
}

impl AnnexBParser {
    /// Feed bytes; returns every unit whose end is now known.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Nalu> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        let Some((first, first_len)) = find_start_code(&self.buf, 0) else {
            return out;
        };
        let mut code_at = first;
        let mut start = first + first_len;
        while let Some((next, next_len)) = find_start_code(&self.buf, start) {
            let body = trim_trailing_zeros(&self.buf[start..next]);
            if !body.is_empty() {
                out.push(Nalu::new(body.to_vec()));
            }
            code_at = next;
            start = next + next_len;
        }
        // the last unit may still be incomplete; keep it with its start code
        self.buf.drain(..code_at);
        out
    }

    /// Flush the trailing unit at end of stream.
    pub fn finish(&mut self) -> Option<Nalu> {
        let buf = std::mem::take(&mut self.buf);
        let (s, l) = find_start_code(&buf, 0)?;
        let body = trim_trailing_zeros(&buf[s + l..]);
        (!body.is_empty()).then(|| Nalu::new(body.to_vec()))
    }
}

fn trim_trailing_zeros(b: &[u8]) -> &[u8] {
    let end = b.iter().rposition(|v| *v != 0).map_or(0, |p| p + 1);
    &b[..end]
}

/// Groups a NALU stream into access units, using the AUD as the boundary.
#[derive(Debug, Default)]
pub struct AccessUnitSplitter {
    pending: Vec<Nalu>,
}

impl AccessUnitSplitter {
    /// Returns the previous access unit when `nalu` opens a new one.
    pub fn push(&mut self, nalu: Nalu) -> Option<Vec<Nalu>> {
        if nalu.is_aud() && !self.pending.is_empty() {
            let done = std::mem::replace(&mut self.pending, vec![nalu]);
            return Some(done);
        }
        self.pending.push(nalu);
        None
    }

    pub fn finish(&mut self) -> Option<Vec<Nalu>> {
        (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
    }
}

/// Insert emulation prevention bytes into an RBSP.
pub fn escape_rbsp(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64 + 1);
    let mut zeros = 0;
    for &b in rbsp {
        if zeros >= 2 && b <= 3 {
            out.push(3);
            zeros = 0;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
    out
}

/// Strip emulation prevention bytes.
pub fn unescape_rbsp(ebsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ebsp.len());
    let mut zeros = 0;
    for &b in ebsp {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
    out
}

/// SEI NALU carrying `counter` for robust syncing.
pub fn sync_sei(counter: u64) -> Nalu {
    let mut rbsp = Vec::with_capacity(2 + 16 + 8 + 1);
    rbsp.push(SEI_USER_DATA_UNREGISTERED);
    rbsp.push((SYNC_SEI_UUID.len() + 8) as u8);
    rbsp.extend_from_slice(&SYNC_SEI_UUID);
    rbsp.extend_from_slice(&counter.to_be_bytes());
    rbsp.push(0x80);
    let mut data = vec![NALU_TYPE_SEI];
    data.extend(escape_rbsp(&rbsp));
    Nalu::new(data)
}

/// The counter of a sync SEI, or `None` for any other unit.
pub fn parse_sync_sei(nalu: &Nalu) -> Option<u64> {
    if nalu.nalu_type() != NALU_TYPE_SEI {
        return None;
    }
    let rbsp = unescape_rbsp(&nalu.data()[1..]);
    let [payload_type, size, rest @ ..] = rbsp.as_slice() else {
        return None;
    };
    if *payload_type != SEI_USER_DATA_UNREGISTERED || *size as usize != SYNC_SEI_UUID.len() + 8 {
        return None;
    }
    let (uuid, rest) = rest.split_at_checked(SYNC_SEI_UUID.len())?;
    if uuid != SYNC_SEI_UUID {
        return None;
    }
    let counter: [u8; 8] = rest.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(counter))
}
