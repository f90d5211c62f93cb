mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{gray_rgba, wait_until};
use cubestream::shm::{Arena, LivenessMonitor, ProcessLock, WaitOutcome};
use cubestream::{
    CubemapShape, EyeCount, EyeIndex, FaceIndex, FaceMask, PixelFormat, Pts, StereoCubemap,
};

const RES: u32 = 8;

fn shape() -> CubemapShape {
    CubemapShape::new(
        EyeCount::Stereo,
        FaceMask::ALL,
        RES,
        RES,
        PixelFormat::Rgba8,
    )
}

#[test]
fn second_mapping_sees_published_frames() {
    let dir = tempfile::tempdir().unwrap();
    let shape = shape();
    let producer = Arena::create_shared(dir.path(), "seg", shape.bytes_required()).unwrap();
    let cubemap = StereoCubemap::allocate(&producer, &shape).unwrap();
    cubemap.publish_root().unwrap();

    let consumer = Arena::open_shared(dir.path(), "seg").unwrap();
    let opened = StereoCubemap::open_root(&consumer).unwrap();
    assert_eq!(opened.eye_count(), EyeCount::Stereo);
    assert_eq!(opened.eyes()[1].populated().unwrap(), FaceMask::ALL);

    let face = FaceIndex::ALL[4];
    let written = cubemap.face(EyeIndex::RIGHT, face).unwrap().unwrap();
    let read = opened.face(EyeIndex::RIGHT, face).unwrap().unwrap();
    let seq = written
        .content()
        .publish(&gray_rgba(RES, RES, 77), Pts(1234))
        .unwrap();

    let snap = read.content().snapshot().unwrap();
    assert_eq!(snap.pts, Pts(1234));
    assert_eq!(snap.sequence, Some(seq));
    assert_eq!(snap.data, gray_rgba(RES, RES, 77));
}

#[test]
fn publish_wakes_a_waiter_on_another_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let shape = shape();
    let producer = Arena::create_shared(dir.path(), "wake", shape.bytes_required()).unwrap();
    let cubemap = StereoCubemap::allocate(&producer, &shape).unwrap();
    cubemap.publish_root().unwrap();

    let consumer = Arena::open_shared(dir.path(), "wake").unwrap();
    let opened = StereoCubemap::open_root(&consumer).unwrap();
    let frame = opened
        .face(EyeIndex::LEFT, FaceIndex::ALL[0])
        .unwrap()
        .unwrap()
        .content()
        .clone();
    let seen = frame.generation().unwrap();

    let waiter = std::thread::spawn(move || frame.wait_newer(seen, Duration::from_secs(10)));
    std::thread::sleep(Duration::from_millis(20));
    cubemap
        .face(EyeIndex::LEFT, FaceIndex::ALL[0])
        .unwrap()
        .unwrap()
        .content()
        .publish(&gray_rgba(RES, RES, 1), Pts(1))
        .unwrap();

    let outcome = waiter.join().unwrap().unwrap();
    assert!(matches!(outcome, WaitOutcome::Signaled(g) if g > seen));
}

#[test]
fn forced_reset_keeps_signals_usable() {
    let cubemap = StereoCubemap::allocate_heap(&shape()).unwrap();
    cubemap.reset_signals().unwrap();

    let frame = cubemap
        .face(EyeIndex::LEFT, FaceIndex::ALL[1])
        .unwrap()
        .unwrap()
        .content()
        .clone();
    let seen = frame.generation().unwrap();
    frame.publish(&gray_rgba(RES, RES, 3), Pts(5)).unwrap();
    assert!(matches!(
        frame.wait_newer(seen, Duration::from_millis(10)).unwrap(),
        WaitOutcome::Signaled(_)
    ));
}

#[test]
fn liveness_monitor_fires_once_the_lock_holder_exits() {
    let dir = tempfile::tempdir().unwrap();
    let lock = ProcessLock::acquire(dir.path(), "partner").unwrap();
    assert!(ProcessLock::is_alive(dir.path(), "partner").unwrap());
    assert!(ProcessLock::acquire(dir.path(), "partner").is_err());

    let died = Arc::new(AtomicBool::new(false));
    let mut monitor = LivenessMonitor::spawn(
        dir.path().to_path_buf(),
        "partner".to_string(),
        Duration::from_millis(5),
        {
            let died = died.clone();
            move || died.store(true, Ordering::Release)
        },
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(30));
    assert!(!died.load(Ordering::Acquire));
    drop(lock);
    assert!(wait_until(|| died.load(Ordering::Acquire)));
    assert!(wait_until(|| monitor.is_finished()));
    monitor.stop();
    assert!(!ProcessLock::is_alive(dir.path(), "partner").unwrap());
}
