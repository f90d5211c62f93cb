use crate::cubemap::model::{Cubemap, StereoCubemap};
use crate::encode::encoder::{EncoderFactory, EncoderSetup};
use crate::encode::pipeline::{EncodePipelineOpts, FaceEncodingPipeline};
use crate::foundation::core::{EyeIndex, FaceIndex, FaceMask, MAX_EYES};
use crate::foundation::error::{StreamError, StreamResult};
use crate::session::SessionContext;
use crate::shm::process::LivenessMonitor;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Called with every pipeline the session starts, e.g. to hook it up to the wire.
pub type PipelineCallback = Box<dyn Fn(Arc<FaceEncodingPipeline>) + Send + 'static>;

/// Where to probe the producer's liveness lock.
#[derive(Clone, Debug)]
pub struct ProducerWatch {
    pub dir: PathBuf,
    pub id: String,
    pub poll: Duration,
}

/// Server side of one stereo cubemap: one [`FaceEncodingPipeline`] per populated face.
///
/// Faces may be attached by the producer after the session starts; a watcher thread waits on each
/// eye's cubemap signal and starts a pipeline for every face it has not seen yet.
pub struct CubemapEncoderSession {
    cubemap: Arc<StereoCubemap>,
    pipelines: Arc<Mutex<Vec<Arc<FaceEncodingPipeline>>>>,
    stop: Arc<AtomicBool>,
    /// Set once a dead producer has been fully handled and the signals are usable again.
    producer_gone: Arc<AtomicBool>,
    watcher: Arc<Mutex<Option<JoinHandle<()>>>>,
    liveness: Option<LivenessMonitor>,
}

impl CubemapEncoderSession {
    #[tracing::instrument(skip_all)]
    pub fn start(
        ctx: &SessionContext,
        cubemap: StereoCubemap,
        factory: EncoderFactory,
        producer: Option<ProducerWatch>,
        on_pipeline: PipelineCallback,
    ) -> StreamResult<Self> {
        let cubemap = Arc::new(cubemap);
        let stop = Arc::new(AtomicBool::new(false));
        let producer_dead = Arc::new(AtomicBool::new(false));
        let producer_gone = Arc::new(AtomicBool::new(false));
        let pipelines = Arc::new(Mutex::new(Vec::new()));
        let watcher_slot: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::default();

        let watcher = std::thread::Builder::new()
            .name("face-watcher".to_string())
            .spawn({
                let ctx = ctx.clone();
                let eyes: Vec<Cubemap> = cubemap.eyes().to_vec();
                let pipelines = pipelines.clone();
                let stop = stop.clone();
                let producer_dead = producer_dead.clone();
                move || {
                    watch_faces(
                        &ctx,
                        &eyes,
                        &factory,
                        &pipelines,
                        &stop,
                        &producer_dead,
                        &on_pipeline,
                    )
                }
            })
            .map_err(|e| StreamError::encode(format!("failed to spawn face watcher: {e}")))?;
        *watcher_slot.lock() = Some(watcher);

        let liveness = match producer {
            Some(w) => {
                let cubemap = cubemap.clone();
                let pipelines = pipelines.clone();
                let watcher = watcher_slot.clone();
                let dead = producer_dead;
                let gone = producer_gone.clone();
                Some(LivenessMonitor::spawn(w.dir, w.id, w.poll, move || {
                    dead.store(true, Ordering::Release);
                    quiesce(&watcher, &pipelines);
                    // a dead producer may have left a frame or cubemap mutex locked
                    if let Err(e) = cubemap.reset_signals() {
                        tracing::error!(error = %e, "forced signal reset failed");
                    }
                    gone.store(true, Ordering::Release);
                })?)
            }
            None => None,
        };

        Ok(Self {
            cubemap,
            pipelines,
            stop,
            producer_gone,
            watcher: watcher_slot,
            liveness,
        })
    }

    pub fn cubemap(&self) -> &StereoCubemap {
        &self.cubemap
    }

    pub fn pipelines(&self) -> Vec<Arc<FaceEncodingPipeline>> {
        self.pipelines.lock().clone()
    }

    /// True once the watched producer died and every local waiter on its signals was stopped.
    pub fn producer_dead(&self) -> bool {
        self.producer_gone.load(Ordering::Acquire)
    }

    /// Stop watching and stop every pipeline.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let watcher = self.watcher.lock().take();
        if let Some(h) = watcher {
            let _ = h.join();
        }
        if let Some(mut l) = self.liveness.take() {
            l.stop();
        }
        for p in self.pipelines.lock().drain(..) {
            p.stop();
        }
    }
}

impl Drop for CubemapEncoderSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stop every thread of this session that may wait on the cubemap's signals: the face watcher,
/// which exits once it sees the dead flag, and each pipeline's content thread.
fn quiesce(
    watcher: &Mutex<Option<JoinHandle<()>>>,
    pipelines: &Mutex<Vec<Arc<FaceEncodingPipeline>>>,
) {
    let handle = watcher.lock().take();
    if let Some(h) = handle {
        let _ = h.join();
    }
    let pipelines = pipelines.lock().clone();
    for p in &pipelines {
        p.halt_capture(StreamError::producer_death(format!(
            "no producer for face {} eye {}",
            p.face(),
            p.eye()
        )));
    }
}

fn watch_faces(
    ctx: &SessionContext,
    eyes: &[Cubemap],
    factory: &EncoderFactory,
    pipelines: &Mutex<Vec<Arc<FaceEncodingPipeline>>>,
    stop: &AtomicBool,
    producer_dead: &Arc<AtomicBool>,
    on_pipeline: &PipelineCallback,
) {
    let cfg = &ctx.config().encoder;
    let mut known = [FaceMask::EMPTY; MAX_EYES];
    let wait = cfg.barrier_timeout() / eyes.len().max(1) as u32;

    while !stop.load(Ordering::Acquire) && !producer_dead.load(Ordering::Acquire) {
        for (e, cubemap) in eyes.iter().enumerate() {
            let populated = match cubemap.wait_for_new_faces(known[e], wait) {
                Ok(m) => m,
                Err(err) => {
                    tracing::error!(eye = e, error = %err, "face watcher failed");
                    return;
                }
            };
            let Ok(eye) = EyeIndex::new(e) else {
                return;
            };
            for f in populated.difference(known[e]).iter() {
                match start_face(ctx, cubemap, eye, f, factory, producer_dead) {
                    Ok(p) => {
                        tracing::info!(face = %f, eye = %eye, "face attached, encoding started");
                        pipelines.lock().push(p.clone());
                        on_pipeline(p);
                    }
                    Err(err) => {
                        tracing::error!(face = %f, eye = %eye, error = %err, "failed to start face pipeline");
                    }
                }
            }
            known[e] = known[e].union(populated);
        }
    }
}

fn start_face(
    ctx: &SessionContext,
    cubemap: &Cubemap,
    eye: EyeIndex,
    face: FaceIndex,
    factory: &EncoderFactory,
    producer_dead: &Arc<AtomicBool>,
) -> StreamResult<Arc<FaceEncodingPipeline>> {
    let cfg = &ctx.config().encoder;
    let handle = cubemap
        .face(face)?
        .ok_or_else(|| StreamError::shm(format!("face {face} vanished before it was opened")))?;
    // consume the attach notification
    handle.take_new_face_flag()?;
    let source = handle.content().clone();
    let setup = EncoderSetup {
        width: source.width(),
        height: source.height(),
        avg_bit_rate: cfg.avg_bit_rate,
        fps_hint: 30,
    };
    let encoder = factory(face, eye, &setup)?;
    let mut opts = EncodePipelineOpts::from_config(cfg, face, eye);
    opts.producer_dead = Some(producer_dead.clone());
    Ok(Arc::new(FaceEncodingPipeline::start(
        ctx, source, encoder, opts,
    )?))
}
