use std::sync::Arc;

use cubestream::{
    AssemblyOpts, CoveragePolicy, CubemapAssemblyEngine, EyeCount, EyeIndex, FaceIndex, FaceMask,
    FrameOutcome, Handoff, PipelineObserver, PixelFormat, Pts, RawFrame, SessionContext,
    SourceInfo, StatsCollector, StereoCubemap, StreamConfig, SyncKeyPolicy,
};
use parking_lot::Mutex;

const RES: u32 = 2;

fn opts(eyes: EyeCount, cap: usize, key_policy: SyncKeyPolicy) -> AssemblyOpts {
    AssemblyOpts {
        max_frame_map_size: cap,
        match_stereo_pairs: false,
        key_policy,
        coverage: CoveragePolicy::full(eyes),
        face_width: RES,
        face_height: RES,
        format: PixelFormat::Rgba8,
    }
}

fn frame(key: Option<u64>) -> RawFrame {
    let mut f = RawFrame::blank(RES, RES, PixelFormat::Rgba8);
    f.data.fill(0x80);
    f.pts = Pts(key.unwrap_or_default() as i64);
    f.sequence = key;
    f
}

fn ctx() -> SessionContext {
    SessionContext::headless(StreamConfig::default()).unwrap()
}

fn face(i: usize) -> FaceIndex {
    FaceIndex::ALL[i]
}

fn mask(faces: &[usize]) -> FaceMask {
    FaceMask::of(faces.iter().map(|f| face(*f)))
}

/// Key stored with the first populated face of eye 0.
fn key_of(c: &StereoCubemap) -> u64 {
    let eye = &c.eyes()[0];
    FaceIndex::ALL
        .into_iter()
        .find_map(|f| eye.face(f).unwrap())
        .map(|f| f.content().meta().unwrap().sequence)
        .unwrap_or(0)
}

/// Consumer that records every delivered key and keeps the newest cubemap, giving back the one
/// it held before.
fn recording_engine(
    ctx: &SessionContext,
    opts: AssemblyOpts,
) -> (CubemapAssemblyEngine, Arc<Mutex<Vec<u64>>>) {
    let keys = Arc::new(Mutex::new(Vec::new()));
    let held: Arc<Mutex<Option<StereoCubemap>>> = Arc::default();
    let consumer = {
        let keys = keys.clone();
        move |_: &SourceInfo, c: StereoCubemap| {
            keys.lock().push(key_of(&c));
            match held.lock().replace(c) {
                Some(old) => Handoff::Recycle(old),
                None => Handoff::Retained,
            }
        }
    };
    let engine = CubemapAssemblyEngine::new(ctx, opts, "test", Some(Box::new(consumer))).unwrap();
    (engine, keys)
}

fn add(engine: &CubemapAssemblyEngine, key: u64, faces: &[usize]) {
    for f in faces {
        let out = engine.add_frame(face(*f), EyeIndex::LEFT, &frame(Some(key)));
        assert!(
            matches!(out, FrameOutcome::Added { key: k, .. } if k == key),
            "key {key} face {f}: {out:?}"
        );
    }
}

#[test]
fn oldest_partial_cubemap_is_evicted_when_map_is_full() {
    let (engine, keys) = recording_engine(
        &ctx(),
        opts(EyeCount::Mono, 2, SyncKeyPolicy::StreamCounter),
    );

    add(&engine, 1, &[0, 1, 2, 3, 4]);
    add(&engine, 2, &[0, 1, 2]);
    assert_eq!(engine.pending_keys(), vec![1, 2]);

    // key 3 does not fit next to 1 and 2
    add(&engine, 3, &[0]);
    assert_eq!(engine.pending_keys(), vec![2, 3]);
    assert_eq!(engine.stats().cubemaps_evicted, 1);

    add(&engine, 2, &[3, 4, 5]);
    add(&engine, 3, &[1, 2, 3, 4, 5]);

    assert_eq!(*keys.lock(), vec![2, 3]);
    let stats = engine.stats();
    assert_eq!(stats.cubemaps_delivered, 2);
    assert_eq!(stats.pending, 0);

    assert_eq!(
        engine.add_frame(face(5), EyeIndex::LEFT, &frame(Some(1))),
        FrameOutcome::Late { key: 1 }
    );
    assert_eq!(*keys.lock(), vec![2, 3]);
}

#[test]
fn repeated_eviction_neither_delivers_nor_allocates() {
    let (engine, keys) = recording_engine(
        &ctx(),
        opts(EyeCount::Mono, 1, SyncKeyPolicy::StreamCounter),
    );
    for key in 1..=100 {
        add(&engine, key, &[0]);
    }
    let stats = engine.stats();
    assert_eq!(stats.cubemaps_evicted, 99);
    assert_eq!(stats.cubemaps_delivered, 0);
    assert!(stats.cubemaps_allocated <= 2, "{stats:?}");
    assert_eq!(engine.pending_keys(), vec![100]);
    assert!(keys.lock().is_empty());

    assert_eq!(
        engine.add_frame(face(1), EyeIndex::LEFT, &frame(Some(50))),
        FrameOutcome::Late { key: 50 }
    );
}

#[test]
fn recycling_keeps_allocations_bounded() {
    let (engine, keys) = recording_engine(
        &ctx(),
        opts(EyeCount::Mono, 2, SyncKeyPolicy::ArrivalOrder),
    );
    for _ in 0..10_000 {
        for f in FaceIndex::ALL {
            engine.add_frame(f, EyeIndex::LEFT, &frame(None));
        }
    }
    let stats = engine.stats();
    assert_eq!(stats.cubemaps_delivered, 10_000);
    assert!(stats.cubemaps_allocated <= 3, "{stats:?}");
    assert!(stats.pool_len <= 1);
    assert_eq!(keys.lock().len(), 10_000);
    assert_eq!(keys.lock().last(), Some(&10_000));
}

#[test]
fn declined_cubemaps_are_reused() {
    let declined = Arc::new(Mutex::new(0u32));
    let consumer = {
        let declined = declined.clone();
        move |_: &SourceInfo, c: StereoCubemap| {
            *declined.lock() += 1;
            Handoff::Declined(c)
        }
    };
    let engine = CubemapAssemblyEngine::new(
        &ctx(),
        opts(EyeCount::Mono, 2, SyncKeyPolicy::ArrivalOrder),
        "busy",
        Some(Box::new(consumer)),
    )
    .unwrap();
    for _ in 0..3 {
        for f in FaceIndex::ALL {
            engine.add_frame(f, EyeIndex::LEFT, &frame(None));
        }
    }
    let stats = engine.stats();
    assert_eq!(*declined.lock(), 3);
    assert_eq!(stats.cubemaps_declined, 3);
    assert_eq!(stats.cubemaps_allocated, 1);
    assert_eq!(stats.pool_len, 1);
}

#[test]
fn matched_stereo_pairs_publish_only_faces_both_eyes_have() {
    let delivered: Arc<Mutex<Vec<(FaceMask, FaceMask)>>> = Arc::default();
    let consumer = {
        let delivered = delivered.clone();
        move |_: &SourceInfo, c: StereoCubemap| {
            let eyes = c.eyes();
            delivered
                .lock()
                .push((eyes[0].populated().unwrap(), eyes[1].populated().unwrap()));
            Handoff::Declined(c)
        }
    };
    let mut o = opts(EyeCount::Stereo, 2, SyncKeyPolicy::StreamCounter);
    o.match_stereo_pairs = true;
    o.coverage = CoveragePolicy::uniform(EyeCount::Stereo, mask(&[0, 1]));
    let engine =
        CubemapAssemblyEngine::new(&ctx(), o, "pairs", Some(Box::new(consumer))).unwrap();

    for f in [0, 1, 2] {
        engine.add_frame(face(f), EyeIndex::LEFT, &frame(Some(1)));
    }
    for f in [0, 3] {
        engine.add_frame(face(f), EyeIndex::RIGHT, &frame(Some(1)));
    }
    assert!(delivered.lock().is_empty());

    let out = engine.add_frame(face(1), EyeIndex::RIGHT, &frame(Some(1)));
    assert_eq!(
        out,
        FrameOutcome::Added {
            key: 1,
            completed: true
        }
    );
    assert_eq!(*delivered.lock(), vec![(mask(&[0, 1]), mask(&[0, 1]))]);
}

#[test]
fn unmatched_stereo_needs_every_face_of_both_eyes() {
    let (engine, keys) = recording_engine(
        &ctx(),
        opts(EyeCount::Stereo, 2, SyncKeyPolicy::ArrivalOrder),
    );
    for f in FaceIndex::ALL {
        engine.add_frame(f, EyeIndex::LEFT, &frame(None));
    }
    for f in &FaceIndex::ALL[..5] {
        engine.add_frame(*f, EyeIndex::RIGHT, &frame(None));
    }
    assert!(keys.lock().is_empty());
    engine.add_frame(face(5), EyeIndex::RIGHT, &frame(None));
    assert_eq!(*keys.lock(), vec![1]);
}

#[test]
fn headless_engine_reports_deliveries_and_drops_cubemaps() {
    let collector = Arc::new(StatsCollector::new());
    let observer: Arc<dyn PipelineObserver> = collector.clone();
    let ctx = SessionContext::new(StreamConfig::default(), observer).unwrap();
    let engine = CubemapAssemblyEngine::headless(
        &ctx,
        opts(EyeCount::Mono, 2, SyncKeyPolicy::ArrivalOrder),
        "headless",
    )
    .unwrap();
    for _ in 0..2 {
        for f in FaceIndex::ALL {
            engine.add_frame(f, EyeIndex::LEFT, &frame(None));
        }
    }
    let stats = engine.stats();
    assert_eq!(stats.cubemaps_delivered, 2);
    assert_eq!(stats.pool_len, 0);
    let summary = collector.summary(std::time::Duration::from_secs(60));
    assert_eq!(summary.cubemaps_delivered, 2);
    assert_eq!(summary.faces_added, 12);
}

#[test]
fn closing_consumer_stops_assembly() {
    let consumer = |_: &SourceInfo, _c: StereoCubemap| Handoff::Closed;
    let engine = CubemapAssemblyEngine::new(
        &ctx(),
        opts(EyeCount::Mono, 2, SyncKeyPolicy::ArrivalOrder),
        "closing",
        Some(Box::new(consumer)),
    )
    .unwrap();
    for f in FaceIndex::ALL {
        engine.add_frame(f, EyeIndex::LEFT, &frame(None));
    }
    assert!(engine.is_closed());
    assert_eq!(
        engine.add_frame(face(0), EyeIndex::LEFT, &frame(None)),
        FrameOutcome::Closed
    );
    assert_eq!(engine.stats().pending, 0);
}

#[test]
fn frames_for_delivered_keys_are_late() {
    let (engine, keys) = recording_engine(
        &ctx(),
        opts(EyeCount::Mono, 4, SyncKeyPolicy::StreamCounter),
    );
    add(&engine, 5, &[0, 1, 2, 3, 4, 5]);
    assert_eq!(*keys.lock(), vec![5]);
    for key in [4, 5] {
        assert_eq!(
            engine.add_frame(face(0), EyeIndex::LEFT, &frame(Some(key))),
            FrameOutcome::Late { key }
        );
    }
    assert_eq!(engine.stats().frames_late, 2);
}

#[test]
fn skewed_face_completes_older_key_after_newer_one() {
    let (engine, keys) = recording_engine(
        &ctx(),
        opts(EyeCount::Mono, 4, SyncKeyPolicy::StreamCounter),
    );
    add(&engine, 1, &[0, 1, 2, 3, 4]);
    add(&engine, 2, &[0, 1, 2, 3, 4, 5]);
    // key 2 is complete but waits behind key 1
    assert!(keys.lock().is_empty());
    assert_eq!(engine.pending_keys(), vec![1]);
    assert_eq!(engine.stats().held, 1);

    add(&engine, 1, &[5]);
    assert_eq!(*keys.lock(), vec![1, 2]);
    let stats = engine.stats();
    assert_eq!(stats.cubemaps_delivered, 2);
    assert_eq!(stats.cubemaps_evicted, 0);
    assert_eq!((stats.pending, stats.held), (0, 0));
}

#[test]
fn eviction_releases_completed_keys_held_behind_it() {
    let (engine, keys) = recording_engine(
        &ctx(),
        opts(EyeCount::Mono, 2, SyncKeyPolicy::StreamCounter),
    );
    add(&engine, 1, &[0, 1]);
    add(&engine, 2, &[0, 1, 2, 3, 4, 5]);
    assert!(keys.lock().is_empty());
    assert_eq!(
        engine.add_frame(face(0), EyeIndex::LEFT, &frame(Some(2))),
        FrameOutcome::Late { key: 2 }
    );

    // the map is full, so key 3 pushes key 1 out and key 2 goes first
    add(&engine, 3, &[0]);
    assert_eq!(*keys.lock(), vec![2]);
    assert_eq!(engine.pending_keys(), vec![3]);
    assert_eq!(engine.stats().cubemaps_evicted, 1);
}

#[test]
fn reset_restarts_arrival_keys() {
    let engine = CubemapAssemblyEngine::headless(
        &ctx(),
        opts(EyeCount::Mono, 4, SyncKeyPolicy::ArrivalOrder),
        "reset",
    )
    .unwrap();
    engine.add_frame(face(0), EyeIndex::LEFT, &frame(None));
    engine.add_frame(face(0), EyeIndex::LEFT, &frame(None));
    assert_eq!(engine.pending_keys(), vec![1, 2]);

    engine.reset();
    assert!(engine.pending_keys().is_empty());
    assert!(matches!(
        engine.add_frame(face(0), EyeIndex::LEFT, &frame(None)),
        FrameOutcome::Added { key: 1, .. }
    ));
}

#[test]
fn concurrent_faces_deliver_in_key_order() {
    const ROUNDS: u64 = 200;
    let (engine, keys) = recording_engine(
        &ctx(),
        opts(EyeCount::Mono, 256, SyncKeyPolicy::ArrivalOrder),
    );
    let engine = Arc::new(engine);
    let threads: Vec<_> = FaceIndex::ALL
        .into_iter()
        .map(|f| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    engine.add_frame(f, EyeIndex::LEFT, &frame(None));
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(*keys.lock(), (1..=ROUNDS).collect::<Vec<_>>());
    assert_eq!(engine.stats().cubemaps_delivered, ROUNDS);
}
