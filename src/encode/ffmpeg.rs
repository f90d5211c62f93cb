use crate::encode::encoder::{EncoderSetup, FaceEncoder};
use crate::foundation::core::{PixelFormat, Pts};
use crate::foundation::error::{StreamError, StreamResult};
use crate::media::frame::RawFrame;
use crate::media::nalu::{AccessUnit, AccessUnitSplitter, AnnexBParser, Nalu};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc;
use std::thread::JoinHandle;

/// A running `ffmpeg` with piped stdin/stdout and a thread draining stderr.
pub(crate) struct FfmpegProcess {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr_drain: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
}

impl FfmpegProcess {
    pub(crate) fn spawn(args: &[String], what: &str) -> StreamResult<(Self, ChildStdout)> {
        if !is_ffmpeg_on_path() {
            return Err(StreamError::encode(format!(
                "ffmpeg is required for {what}, but was not found on PATH"
            )));
        }
        let mut child = Command::new("ffmpeg")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                StreamError::encode(format!(
                    "failed to spawn ffmpeg (is it installed and on PATH?): {e}"
                ))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StreamError::encode("failed to open ffmpeg stdin (unexpected)"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::encode("failed to open ffmpeg stdout (unexpected)"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| StreamError::encode("failed to open ffmpeg stderr (unexpected)"))?;
        let stderr_drain = std::thread::spawn(move || {
            let mut bytes = Vec::new();
            stderr.read_to_end(&mut bytes)?;
            Ok(bytes)
        });
        Ok((
            Self {
                child: Some(child),
                stdin: Some(stdin),
                stderr_drain: Some(stderr_drain),
            },
            stdout,
        ))
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) -> StreamResult<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(StreamError::encode("ffmpeg input is already closed"));
        };
        stdin
            .write_all(bytes)
            .map_err(|e| StreamError::encode(format!("failed to write to ffmpeg stdin: {e}")))
    }

    pub(crate) fn close_input(&mut self) {
        drop(self.stdin.take());
    }

    /// Wait for exit; a non-zero status becomes an error carrying ffmpeg's stderr.
    pub(crate) fn finish(&mut self) -> StreamResult<()> {
        self.close_input();
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .map_err(|e| StreamError::encode(format!("failed to wait for ffmpeg: {e}")))?;
        let stderr_bytes = match self.stderr_drain.take() {
            Some(h) => h
                .join()
                .map_err(|_| StreamError::encode("ffmpeg stderr drain thread panicked"))?
                .map_err(|e| StreamError::encode(format!("ffmpeg stderr read failed: {e}")))?,
            None => Vec::new(),
        };
        if !status.success() {
            return Err(StreamError::encode(format!(
                "ffmpeg exited with status {}: {}",
                status,
                String::from_utf8_lossy(&stderr_bytes).trim()
            )));
        }
        Ok(())
    }
}

impl Drop for FfmpegProcess {
    fn drop(&mut self) {
        self.close_input();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// `libx264` through an `ffmpeg` subprocess: raw `yuv420p` in, Annex-B H.264 out.
///
/// Output is low-latency (no B-frames, zerolatency tune) with an AUD in front of every picture,
/// which is how the stdout reader splits the stream into access units. Timestamps do not survive
/// the round trip through ffmpeg, so they are queued here and paired with access units in order.
pub struct FfmpegFaceEncoder {
    setup: EncoderSetup,
    process: FfmpegProcess,
    units: mpsc::Receiver<Vec<Nalu>>,
    reader: Option<JoinHandle<()>>,
    pending: VecDeque<(Pts, u64)>,
}

impl FfmpegFaceEncoder {
    pub fn new(setup: EncoderSetup) -> StreamResult<Self> {
        PixelFormat::Yuv420p.validate_dims(setup.width, setup.height)?;
        if setup.avg_bit_rate == 0 {
            return Err(StreamError::validation("encoder bit rate must be non-zero"));
        }
        let args: Vec<String> = [
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "yuv420p",
            "-s",
            &format!("{}x{}", setup.width, setup.height),
            "-r",
            &setup.fps_hint.max(1).to_string(),
            "-i",
            "pipe:0",
            "-an",
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-bf",
            "0",
            "-b:v",
            &setup.avg_bit_rate.to_string(),
            "-x264-params",
            "aud=1:repeat-headers=1",
            "-f",
            "h264",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let (process, stdout) = FfmpegProcess::spawn(&args, "H.264 encoding")?;
        let (tx, units) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name("ffmpeg-h264-reader".to_string())
            .spawn(move || read_access_units(stdout, tx))
            .map_err(|e| StreamError::encode(format!("failed to spawn reader thread: {e}")))?;
        Ok(Self {
            setup,
            process,
            units,
            reader: Some(reader),
            pending: VecDeque::new(),
        })
    }

    fn pair(&mut self, nalus: Vec<Nalu>) -> Option<AccessUnit> {
        let Some((pts, sequence)) = self.pending.pop_front() else {
            tracing::warn!("ffmpeg produced an access unit with no pending frame");
            return None;
        };
        Some(AccessUnit::new(pts, sequence, nalus))
    }
}

fn read_access_units(mut stdout: ChildStdout, tx: mpsc::Sender<Vec<Nalu>>) {
    let mut parser = AnnexBParser::default();
    let mut splitter = AccessUnitSplitter::default();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match stdout.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "ffmpeg stdout read failed");
                break;
            }
        };
        for nalu in parser.push(&buf[..n]) {
            if let Some(au) = splitter.push(nalu)
                && tx.send(au).is_err()
            {
                return;
            }
        }
    }
    if let Some(nalu) = parser.finish()
        && let Some(au) = splitter.push(nalu)
    {
        let _ = tx.send(au);
    }
    if let Some(au) = splitter.finish() {
        let _ = tx.send(au);
    }
}

impl FaceEncoder for FfmpegFaceEncoder {
    fn encode(&mut self, frame: &RawFrame) -> StreamResult<Vec<AccessUnit>> {
        if !frame.same_shape(self.setup.width, self.setup.height, PixelFormat::Yuv420p) {
            return Err(StreamError::validation(format!(
                "encoder expects {}x{} yuv420p, got {}x{} {:?}",
                self.setup.width, self.setup.height, frame.width, frame.height, frame.format
            )));
        }
        self.pending
            .push_back((frame.pts, frame.sequence.unwrap_or_default()));
        self.process.write(&frame.data)?;
        let mut out = Vec::new();
        while let Ok(nalus) = self.units.try_recv() {
            out.extend(self.pair(nalus));
        }
        Ok(out)
    }

    fn flush(&mut self) -> StreamResult<Vec<AccessUnit>> {
        self.process.close_input();
        let mut out = Vec::new();
        while let Ok(nalus) = self.units.recv() {
            out.extend(self.pair(nalus));
        }
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
        self.process.finish()?;
        Ok(out)
    }
}

/// Return `true` when `ffmpeg` can be invoked from `PATH`.
pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_odd_dimensions_before_spawning() {
        let err = FfmpegFaceEncoder::new(EncoderSetup {
            width: 63,
            height: 64,
            avg_bit_rate: 1_000_000,
            fps_hint: 30,
        })
        .err()
        .unwrap();
        assert!(err.to_string().contains("even"));
    }
}
