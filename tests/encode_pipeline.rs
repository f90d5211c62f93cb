mod common;

use std::sync::{Arc, mpsc};
use std::time::Duration;

use common::{FakeEncoder, gray_rgba, wait_until};
use cubestream::encode::{EncodePipelineOpts, EncodeState, ProducerWatch};
use cubestream::media::nalu::parse_sync_sei;
use cubestream::shm::{Arena, ProcessLock};
use cubestream::{
    AccessUnit, CubemapEncoderSession, CubemapFace, CubemapShape, EncoderFactory, EyeCount,
    EyeIndex, FaceEncoder, FaceEncodingPipeline, FaceIndex, FaceMask, PixelFormat, Pts,
    SessionContext, SharedFrame, StreamConfig, StreamError, StreamResult,
};
use parking_lot::Mutex;

const RES: u32 = 4;

fn ctx() -> SessionContext {
    SessionContext::headless(StreamConfig::default()).unwrap()
}

fn source() -> SharedFrame {
    let arena = Arena::heap(1 << 16).unwrap();
    SharedFrame::allocate(&arena, RES, RES, PixelFormat::Rgba8).unwrap()
}

fn start(
    ctx: &SessionContext,
    source: &SharedFrame,
    encoder: FakeEncoder,
    tweak: impl FnOnce(&mut EncodePipelineOpts),
) -> FaceEncodingPipeline {
    let mut opts =
        EncodePipelineOpts::from_config(&ctx.config().encoder, FaceIndex::ALL[0], EyeIndex::LEFT);
    tweak(&mut opts);
    let p = FaceEncodingPipeline::start(ctx, source.clone(), Box::new(encoder), opts).unwrap();
    assert!(wait_until(|| p.state() == EncodeState::WaitingForFrame));
    p
}

fn publish_and_wait(p: &FaceEncodingPipeline, source: &SharedFrame, value: u8, pts: Pts) {
    let before = p.stats().frames_captured;
    source.publish(&gray_rgba(RES, RES, value), pts).unwrap();
    assert!(wait_until(|| p.stats().frames_captured > before));
}

fn drain(p: &FaceEncodingPipeline) -> Vec<AccessUnit> {
    p.finish();
    let mut out = Vec::new();
    while let Some(au) = p.next_access_unit() {
        out.push(au);
    }
    out
}

fn fake_factory() -> EncoderFactory {
    Arc::new(
        |_: FaceIndex, _: EyeIndex, _: &cubestream::EncoderSetup| -> StreamResult<Box<dyn FaceEncoder>> {
            Ok(Box::new(FakeEncoder::default()))
        },
    )
}

#[test]
fn backwards_capture_timestamp_is_rewritten() {
    let ctx = ctx();
    let src = source();
    let p = start(&ctx, &src, FakeEncoder::default(), |_| {});

    publish_and_wait(&p, &src, 100, Pts(1_000));
    publish_and_wait(&p, &src, 120, Pts(999));
    let aus = drain(&p);

    assert_eq!(aus.len(), 2);
    assert_eq!(aus[0].pts, Pts(1_000));
    assert_eq!(aus[1].pts, Pts(1_001));
    assert_eq!(p.stats().timestamps_rewritten, 1);
    assert!(p.is_stopped());
    assert!(p.take_error().is_none());
}

#[test]
fn robust_syncing_puts_counter_right_after_aud() {
    let ctx = ctx();
    let src = source();
    let p = start(&ctx, &src, FakeEncoder::default(), |o| o.robust_syncing = true);

    publish_and_wait(&p, &src, 50, Pts(10));
    publish_and_wait(&p, &src, 60, Pts(20));
    let aus = drain(&p);

    assert_eq!(aus.len(), 2);
    for (i, au) in aus.iter().enumerate() {
        assert!(au.nalus[0].is_aud());
        assert_eq!(parse_sync_sei(&au.nalus[1]), Some(au.sequence));
        assert_eq!(au.sequence, i as u64 + 1);
    }
}

#[test]
fn slow_encoder_applies_backpressure_to_capture() {
    let ctx = ctx();
    let src = source();
    let (release, gate) = mpsc::channel();
    let p = start(&ctx, &src, FakeEncoder::gated(gate), |o| o.frame_pool_size = 2);

    for i in 0..20u8 {
        src.publish(&gray_rgba(RES, RES, i), Pts(i64::from(i) + 1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(50));
    let captured = p.stats().frames_captured;
    assert!((1..=3).contains(&captured), "captured {captured}");

    drop(release);
    let aus = drain(&p);
    assert!(!aus.is_empty());
    assert!(p.stats().frames_encoded <= p.stats().frames_captured);
}

#[test]
fn session_starts_pipelines_for_faces_attached_later() {
    let ctx = ctx();
    let arena = Arena::heap(1 << 20).unwrap();
    let shape = CubemapShape::new(
        EyeCount::Mono,
        FaceMask::of([FaceIndex::ALL[0]]),
        RES,
        RES,
        PixelFormat::Rgba8,
    );
    let cubemap = cubestream::StereoCubemap::allocate(&arena, &shape).unwrap();
    let eye = cubemap.eyes()[0].clone();

    let started: Arc<Mutex<Vec<FaceIndex>>> = Arc::default();
    let on_pipeline = {
        let started = started.clone();
        Box::new(move |p: Arc<FaceEncodingPipeline>| started.lock().push(p.face()))
    };
    let mut session =
        CubemapEncoderSession::start(&ctx, cubemap, fake_factory(), None, on_pipeline).unwrap();
    assert!(wait_until(|| session.pipelines().len() == 1));

    let frame = SharedFrame::allocate(&arena, RES, RES, PixelFormat::Rgba8).unwrap();
    let face = CubemapFace::create(&arena, FaceIndex::ALL[3], frame).unwrap();
    eye.set_face(&face).unwrap();

    assert!(wait_until(|| session.pipelines().len() == 2));
    assert_eq!(*started.lock(), vec![FaceIndex::ALL[0], FaceIndex::ALL[3]]);
    session.stop();
}

#[test]
fn producer_death_stops_every_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let lock = ProcessLock::acquire(dir.path(), "producer").unwrap();

    let ctx = ctx();
    let shape = CubemapShape::new(
        EyeCount::Mono,
        FaceMask::of([FaceIndex::ALL[0], FaceIndex::ALL[1]]),
        RES,
        RES,
        PixelFormat::Rgba8,
    );
    let cubemap = cubestream::StereoCubemap::allocate_heap(&shape).unwrap();
    let watch = ProducerWatch {
        dir: dir.path().to_path_buf(),
        id: "producer".to_string(),
        poll: Duration::from_millis(10),
    };
    let mut session =
        CubemapEncoderSession::start(&ctx, cubemap, fake_factory(), Some(watch), Box::new(|_: Arc<FaceEncodingPipeline>| {}))
            .unwrap();
    assert!(wait_until(|| session.pipelines().len() == 2));

    drop(lock);
    assert!(wait_until(|| session.producer_dead()));
    let pipelines = session.pipelines();
    assert!(wait_until(|| pipelines.iter().all(|p| p.is_stopped())));
    for p in &pipelines {
        assert!(matches!(p.take_error(), Some(StreamError::ProducerDeath(_))));
    }

    // the signals were re-created once nothing local was waiting on them
    let frame = session
        .cubemap()
        .face(EyeIndex::LEFT, FaceIndex::ALL[0])
        .unwrap()
        .unwrap()
        .content()
        .clone();
    let seen = frame.generation().unwrap();
    frame.publish(&gray_rgba(RES, RES, 9), Pts(1)).unwrap();
    assert!(frame.generation().unwrap() > seen);
    session.stop();
}
