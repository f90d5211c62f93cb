#![allow(dead_code)]

use std::sync::mpsc;
use std::time::{Duration, Instant};

use cubestream::media::nalu::{NALU_TYPE_AUD, NALU_TYPE_IDR, NALU_TYPE_PPS, NALU_TYPE_SPS};
use cubestream::{
    AccessUnit, FaceDecoder, FaceEncoder, Nalu, PixelFormat, Pts, RawFrame, StreamError,
    StreamResult,
};

pub const WAIT: Duration = Duration::from_secs(10);

/// Poll `cond` until it holds or `WAIT` passes.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// One IDR per frame whose only payload is the frame's first luma sample.
#[derive(Default)]
pub struct FakeEncoder {
    /// Each `encode` waits for one message; a dropped sender releases it for good.
    pub gate: Option<mpsc::Receiver<()>>,
}

impl FakeEncoder {
    pub fn gated(gate: mpsc::Receiver<()>) -> Self {
        Self { gate: Some(gate) }
    }
}

impl FaceEncoder for FakeEncoder {
    fn encode(&mut self, frame: &RawFrame) -> StreamResult<Vec<AccessUnit>> {
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }
        let luma = frame.data.first().copied().unwrap_or(0);
        Ok(vec![AccessUnit::new(
            frame.pts,
            frame.sequence.unwrap_or_default(),
            [Nalu::aud(), Nalu::new(vec![0x60 | NALU_TYPE_IDR, luma])],
        )])
    }

    fn flush(&mut self) -> StreamResult<Vec<AccessUnit>> {
        Ok(Vec::new())
    }
}

/// Inverse of [`FakeEncoder`]: every IDR becomes a flat `yuv420p` picture.
pub struct FakeDecoder {
    pub width: u32,
    pub height: u32,
    pub gate: Option<mpsc::Receiver<()>>,
}

impl FakeDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            gate: None,
        }
    }
}

impl FaceDecoder for FakeDecoder {
    fn decode(&mut self, nalu: &Nalu) -> StreamResult<Vec<RawFrame>> {
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }
        match nalu.nalu_type() {
            NALU_TYPE_IDR => {
                let luma = nalu.data().get(1).copied().unwrap_or(16);
                let mut frame = RawFrame::blank(self.width, self.height, PixelFormat::Yuv420p);
                let y_len = (self.width * self.height) as usize;
                frame.data[..y_len].fill(luma);
                frame.data[y_len..].fill(128);
                frame.pts = Pts::now();
                Ok(vec![frame])
            }
            NALU_TYPE_AUD | NALU_TYPE_SPS | NALU_TYPE_PPS => Ok(Vec::new()),
            t => Err(StreamError::decode(format!("unsupported nal unit type {t}"))),
        }
    }

    fn flush(&mut self) -> StreamResult<Vec<RawFrame>> {
        Ok(Vec::new())
    }
}

/// Flat RGBA picture.
pub fn gray_rgba(width: u32, height: u32, value: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity((width * height * 4) as usize);
    for _ in 0..width * height {
        out.extend_from_slice(&[value, value, value, 255]);
    }
    out
}

/// What a loopback run delivered: `(key, red value of eye 0 face 0)` per cubemap.
pub struct LoopbackRun {
    pub delivered: Vec<(u64, u8)>,
    pub stats: cubestream::AssemblyStats,
}

/// Publish `ticks` flat frames per face through encode, decode and assembly in-process. Tick `t`
/// is published with gray value `shade(t)`.
pub fn run_loopback(
    cfg: cubestream::StreamConfig,
    eyes: cubestream::EyeCount,
    ticks: u64,
    shade: impl Fn(u64) -> u8,
    encoders: cubestream::EncoderFactory,
    decoders: impl Fn(u32) -> Box<dyn FaceDecoder>,
) -> LoopbackRun {
    use cubestream::decode::DecodePipelineOpts;
    use cubestream::encode::EncodeState;
    use cubestream::{
        AssemblyOpts, CubemapAssemblyEngine, CubemapEncoderSession, CubemapShape, EyeIndex,
        FaceDecodingPipeline, FaceEncodingPipeline, FaceFrameSink, FaceIndex, FaceMask, Handoff,
        SessionContext, SourceInfo, StereoCubemap,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    let res = cfg.receiver.face_resolution;
    let ctx = SessionContext::headless(cfg.clone()).unwrap();

    let delivered: Arc<Mutex<Vec<(u64, u8)>>> = Arc::default();
    let consumer = {
        let delivered = delivered.clone();
        move |_: &SourceInfo, c: StereoCubemap| {
            let face = c.face(EyeIndex::LEFT, FaceIndex::ALL[0]).unwrap().unwrap();
            let snap = face.content().snapshot().unwrap();
            delivered
                .lock()
                .push((snap.sequence.unwrap_or_default(), snap.data[0]));
            Handoff::Declined(c)
        }
    };
    let engine = Arc::new(
        CubemapAssemblyEngine::new(
            &ctx,
            AssemblyOpts::from_config(&cfg.receiver, eyes),
            "loopback",
            Some(Box::new(consumer)),
        )
        .unwrap(),
    );

    let mut pipes = Vec::new();
    for eye in eyes.eyes() {
        for face in FaceIndex::ALL {
            let sink: Arc<dyn FaceFrameSink> = engine.clone();
            pipes.push(Arc::new(
                FaceDecodingPipeline::start(
                    &ctx,
                    decoders(res),
                    sink,
                    DecodePipelineOpts::from_config(&cfg.receiver, face, eye),
                )
                .unwrap(),
            ));
        }
    }
    let pipes = Arc::new(pipes);

    let shape = CubemapShape::new(eyes, FaceMask::ALL, res, res, PixelFormat::Rgba8);
    let source = StereoCubemap::allocate_heap(&shape).unwrap();
    let mut frames = Vec::new();
    for eye in eyes.eyes() {
        for face in FaceIndex::ALL {
            let f = source.face(eye, face).unwrap().unwrap();
            frames.push(f.content().clone());
        }
    }

    let forwarders: Arc<Mutex<Vec<std::thread::JoinHandle<()>>>> = Arc::default();
    let on_pipeline = {
        let forwarders = forwarders.clone();
        let pipes = pipes.clone();
        Box::new(move |p: Arc<FaceEncodingPipeline>| {
            let decoder = pipes[p.eye().get() * FaceIndex::ALL.len() + p.face().get()].clone();
            forwarders.lock().push(std::thread::spawn(move || {
                while let Some(au) = p.next_access_unit() {
                    decoder.push_access_unit(&au);
                }
            }));
        })
    };
    let mut session = CubemapEncoderSession::start(&ctx, source, encoders, None, on_pipeline).unwrap();
    let wanted = frames.len();
    assert!(wait_until(|| {
        let ps = session.pipelines();
        ps.len() == wanted && ps.iter().all(|p| p.state() == EncodeState::WaitingForFrame)
    }));

    for tick in 1..=ticks {
        let pixels = gray_rgba(res, res, shade(tick));
        for f in &frames {
            f.publish(&pixels, Pts(tick as i64 * 33_333)).unwrap();
        }
        assert!(wait_until(|| session
            .pipelines()
            .iter()
            .all(|p| p.stats().frames_captured >= tick)));
    }

    let pipelines = session.pipelines();
    for p in &pipelines {
        p.finish();
    }
    for p in &pipelines {
        p.join();
    }
    for h in std::mem::take(&mut *forwarders.lock()) {
        h.join().unwrap();
    }
    session.stop();
    for d in pipes.iter() {
        d.finish();
    }

    let delivered = delivered.lock().clone();
    LoopbackRun {
        delivered,
        stats: engine.stats(),
    }
}
