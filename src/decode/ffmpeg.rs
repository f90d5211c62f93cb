use crate::decode::decoder::FaceDecoder;
use crate::encode::ffmpeg::FfmpegProcess;
use crate::foundation::core::{PixelFormat, Pts};
use crate::foundation::error::{StreamError, StreamResult};
use crate::media::frame::RawFrame;
use crate::media::nalu::Nalu;
use std::io::Read;
use std::process::ChildStdout;
use std::sync::mpsc;
use std::thread::JoinHandle;

/// H.264 decoding through an `ffmpeg` subprocess.
///
/// Annex-B goes in on stdin; fixed-size `yuv420p` pictures scaled to `width` x `height` come out
/// on stdout and are collected by a reader thread. Pictures are stamped with the wall clock when
/// they are read back.
pub struct FfmpegFaceDecoder {
    width: u32,
    height: u32,
    process: FfmpegProcess,
    frames: mpsc::Receiver<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
    scratch: Vec<u8>,
}

impl FfmpegFaceDecoder {
    pub fn new(width: u32, height: u32) -> StreamResult<Self> {
        PixelFormat::Yuv420p.validate_dims(width, height)?;
        let args: Vec<String> = [
            "-loglevel",
            "error",
            "-fflags",
            "nobuffer",
            "-flags",
            "low_delay",
            "-f",
            "h264",
            "-i",
            "pipe:0",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "yuv420p",
            "-s",
            &format!("{width}x{height}"),
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let (process, stdout) = FfmpegProcess::spawn(&args, "H.264 decoding")?;
        let frame_len = PixelFormat::Yuv420p.frame_len(width, height);
        let (tx, frames) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name("ffmpeg-yuv-reader".to_string())
            .spawn(move || read_frames(stdout, frame_len, tx))
            .map_err(|e| StreamError::decode(format!("failed to spawn reader thread: {e}")))?;
        Ok(Self {
            width,
            height,
            process,
            frames,
            reader: Some(reader),
            scratch: Vec::new(),
        })
    }

    fn frame(&self, data: Vec<u8>) -> RawFrame {
        RawFrame {
            width: self.width,
            height: self.height,
            format: PixelFormat::Yuv420p,
            pts: Pts::now(),
            sequence: None,
            data,
        }
    }
}

fn read_frames(mut stdout: ChildStdout, frame_len: usize, tx: mpsc::Sender<Vec<u8>>) {
    loop {
        let mut buf = vec![0u8; frame_len];
        if stdout.read_exact(&mut buf).is_err() || tx.send(buf).is_err() {
            return;
        }
    }
}

impl FaceDecoder for FfmpegFaceDecoder {
    fn decode(&mut self, nalu: &Nalu) -> StreamResult<Vec<RawFrame>> {
        self.scratch.clear();
        nalu.write_annexb(&mut self.scratch);
        let bytes = std::mem::take(&mut self.scratch);
        let written = self.process.write(&bytes);
        self.scratch = bytes;
        written.map_err(|e| StreamError::decode(e.to_string()))?;
        let mut out = Vec::new();
        while let Ok(data) = self.frames.try_recv() {
            out.push(self.frame(data));
        }
        Ok(out)
    }

    fn flush(&mut self) -> StreamResult<Vec<RawFrame>> {
        self.process.close_input();
        let mut out = Vec::new();
        while let Ok(data) = self.frames.recv() {
            out.push(self.frame(data));
        }
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
        self.process
            .finish()
            .map_err(|e| StreamError::decode(e.to_string()))?;
        Ok(out)
    }
}
