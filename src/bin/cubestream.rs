use std::{
    fs::File,
    io::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use cubestream::{
    AssemblyOpts, CubemapAssemblyEngine, CubemapEncoderSession, CubemapShape, EncoderFactory,
    EncoderSetup, EyeCount, EyeIndex, FaceDecodingPipeline, FaceEncoder, FaceFrameSink, FaceIndex, FaceMask,
    FfmpegFaceDecoder, FfmpegFaceEncoder, Handoff, PixelFormat, Pts, SessionContext, SharedFrame,
    StatsCollector, StereoCubemap, StreamConfig, StreamResult,
    decode::DecodePipelineOpts,
    observe::StatsReporter,
    encode::{FaceEncodingPipeline, ProducerWatch},
    shm::{Arena, ProcessLock},
};
use parking_lot::Mutex;

#[derive(Parser, Debug)]
#[command(name = "cubestream", version)]
struct Cli {
    /// JSON configuration file. Missing keys take their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Assemble cubemaps by the sync counter carried in each stream.
    #[arg(long, global = true)]
    robust_syncing: bool,

    /// Only publish faces both eyes delivered.
    #[arg(long, global = true)]
    match_stereo_pairs: bool,

    /// Override the receiver's cubemap queue size.
    #[arg(long, global = true)]
    cubemap_queue_size: Option<usize>,

    /// Network receive buffer size handed to the transport.
    #[arg(long, global = true)]
    buffer_size: Option<u64>,

    /// Per-face decode queue capacity, in NAL units.
    #[arg(long, global = true)]
    nalu_queue_capacity: Option<usize>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a synthetic stereo cubemap into shared memory.
    Produce(ProduceArgs),
    /// Encode the cubemap a producer published into one `.h264` file per face.
    Encode(EncodeArgs),
    /// Encode, decode and reassemble a synthetic cubemap in-process (requires `ffmpeg` on PATH).
    Loopback(LoopbackArgs),
}

#[derive(Parser, Debug)]
struct ProduceArgs {
    /// 1 for mono, 2 for stereo.
    #[arg(long, default_value_t = 2)]
    eyes: usize,

    /// Face edge length in pixels.
    #[arg(long, default_value_t = 256)]
    resolution: u32,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Stop after this many frames. Runs until killed otherwise.
    #[arg(long)]
    frames: Option<u64>,
}

#[derive(Parser, Debug)]
struct EncodeArgs {
    /// Directory receiving `eye<E>-face<F>.h264`.
    #[arg(long)]
    out_dir: PathBuf,

    /// Stop after this many seconds. Runs until the producer exits otherwise.
    #[arg(long)]
    seconds: Option<u64>,

    #[arg(long, default_value_t = 30)]
    fps: u32,
}

#[derive(Parser, Debug)]
struct LoopbackArgs {
    #[arg(long, default_value_t = 2)]
    eyes: usize,

    #[arg(long, default_value_t = 128)]
    resolution: u32,

    #[arg(long, default_value_t = 60)]
    frames: u64,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Write face 0 of the last delivered cubemap as a PNG.
    #[arg(long)]
    png: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli)?;
    match cli.cmd {
        Command::Produce(args) => cmd_produce(cfg, args),
        Command::Encode(args) => cmd_encode(cfg, args),
        Command::Loopback(args) => cmd_loopback(cfg, args),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<StreamConfig> {
    let mut cfg = match &cli.config {
        Some(path) => StreamConfig::from_path(path)?,
        None => StreamConfig::default(),
    };
    if cli.robust_syncing {
        cfg.receiver.robust_syncing = true;
        cfg.encoder.robust_syncing = true;
    }
    if cli.match_stereo_pairs {
        cfg.receiver.match_stereo_pairs = true;
    }
    if let Some(n) = cli.cubemap_queue_size {
        cfg.receiver.cubemap_queue_size = n;
    }
    if let Some(n) = cli.buffer_size {
        cfg.receiver.buffer_size = n;
    }
    if let Some(n) = cli.nalu_queue_capacity {
        cfg.receiver.nalu_queue_capacity = n;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs(1) / fps.max(1)
}

/// Moving diagonal gradient, tinted per eye and face so mixed-up tiles are easy to spot.
fn gradient(res: u32, eye: EyeIndex, face: FaceIndex, tick: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(res as usize * res as usize * 4);
    let shift = (tick % 256) as u32;
    for y in 0..res {
        for x in 0..res {
            let v = ((x + y) * 255 / (2 * res).max(1) + shift) % 256;
            out.extend_from_slice(&[
                v as u8,
                (face.get() as u32 * 40) as u8,
                (eye.get() as u32 * 200) as u8,
                255,
            ]);
        }
    }
    out
}

fn face_frames(cubemap: &StereoCubemap) -> anyhow::Result<Vec<(EyeIndex, FaceIndex, SharedFrame)>> {
    let mut out = Vec::new();
    for eye in cubemap.eye_count().eyes() {
        for face in FaceIndex::ALL {
            if let Some(f) = cubemap.face(eye, face)? {
                out.push((eye, face, f.content().clone()));
            }
        }
    }
    Ok(out)
}

fn publish_tick(
    frames: &[(EyeIndex, FaceIndex, SharedFrame)],
    res: u32,
    tick: u64,
) -> anyhow::Result<()> {
    for (eye, face, frame) in frames {
        frame.publish(&gradient(res, *eye, *face, tick), Pts::now())?;
    }
    Ok(())
}

fn ffmpeg_factory() -> EncoderFactory {
    Arc::new(
        |_face: FaceIndex, _eye: EyeIndex, setup: &EncoderSetup| -> StreamResult<Box<dyn FaceEncoder>> {
            let encoder = FfmpegFaceEncoder::new(setup.clone())?;
            Ok(Box::new(encoder))
        },
    )
}

fn cmd_produce(cfg: StreamConfig, args: ProduceArgs) -> anyhow::Result<()> {
    let eyes = EyeCount::from_count(args.eyes)?;
    let shape = CubemapShape::new(
        eyes,
        FaceMask::ALL,
        args.resolution,
        args.resolution,
        PixelFormat::Rgba8,
    );
    let dir = cfg.shm.dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("create shm dir '{}'", dir.display()))?;

    let _lock = ProcessLock::acquire(&dir, &cfg.shm.producer_id())?;
    let arena = Arena::create_shared(&dir, &cfg.shm.name, shape.bytes_required())?;
    let cubemap = StereoCubemap::allocate(&arena, &shape)?;
    cubemap.publish_root()?;
    let frames = face_frames(&cubemap)?;
    tracing::info!(name = %cfg.shm.name, dir = %dir.display(), "producing");

    let interval = frame_interval(args.fps);
    let mut tick = 0u64;
    while args.frames.is_none_or(|n| tick < n) {
        let started = Instant::now();
        publish_tick(&frames, args.resolution, tick)?;
        tick += 1;
        std::thread::sleep(interval.saturating_sub(started.elapsed()));
    }
    eprintln!("published {tick} frames");
    Ok(())
}

fn write_face_stream(pipeline: &FaceEncodingPipeline, path: &Path) -> anyhow::Result<()> {
    let mut out = File::create(path).with_context(|| format!("create '{}'", path.display()))?;
    while let Some(au) = pipeline.next_access_unit() {
        out.write_all(&au.to_annexb())
            .with_context(|| format!("write '{}'", path.display()))?;
    }
    Ok(())
}

fn cmd_encode(cfg: StreamConfig, args: EncodeArgs) -> anyhow::Result<()> {
    let dir = cfg.shm.dir();
    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("create output dir '{}'", args.out_dir.display()))?;
    let arena = Arena::open_shared(&dir, &cfg.shm.name)?;
    let cubemap = StereoCubemap::open_root(&arena)?;
    let watch = ProducerWatch {
        dir: dir.clone(),
        id: cfg.shm.producer_id(),
        poll: Duration::from_millis(200),
    };

    let ctx = SessionContext::headless(cfg)?;
    let writers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();
    let on_pipeline = {
        let writers = writers.clone();
        let out_dir = args.out_dir.clone();
        Box::new(move |p: Arc<FaceEncodingPipeline>| {
            let path = out_dir.join(format!("eye{}-face{}.h264", p.eye(), p.face()));
            let h = std::thread::spawn(move || {
                if let Err(e) = write_face_stream(&p, &path) {
                    tracing::warn!(error = %e, "face stream writer stopped");
                }
            });
            writers.lock().push(h);
        })
    };
    let mut session =
        CubemapEncoderSession::start(&ctx, cubemap, ffmpeg_factory(), Some(watch), on_pipeline)?;

    let started = Instant::now();
    let limit = args.seconds.map(Duration::from_secs);
    while !session.producer_dead() && limit.is_none_or(|l| started.elapsed() < l) {
        std::thread::sleep(frame_interval(args.fps));
    }
    if session.producer_dead() {
        tracing::warn!("producer exited");
    }
    let pipelines = session.pipelines();
    for p in &pipelines {
        p.finish();
    }
    for p in &pipelines {
        p.join();
    }
    for h in std::mem::take(&mut *writers.lock()) {
        let _ = h.join();
    }
    session.stop();
    eprintln!("wrote {}", args.out_dir.display());
    Ok(())
}

fn cmd_loopback(cfg: StreamConfig, args: LoopbackArgs) -> anyhow::Result<()> {
    anyhow::ensure!(
        cubestream::encode::is_ffmpeg_on_path(),
        "loopback requires `ffmpeg` on PATH"
    );
    let eyes = EyeCount::from_count(args.eyes)?;
    let mut cfg = cfg;
    cfg.receiver.face_resolution = args.resolution;
    cfg.validate()?;

    let collector = Arc::new(StatsCollector::new());
    let ctx = SessionContext::new(cfg.clone(), collector.clone())?;
    let _reporter = StatsReporter::spawn(
        collector.clone(),
        Duration::from_secs(5),
        Duration::from_secs(5),
    );

    let last: Arc<Mutex<Option<StereoCubemap>>> = Arc::default();
    let consumer = {
        let last = last.clone();
        move |_: &cubestream::SourceInfo, c: StereoCubemap| match last.lock().replace(c) {
            Some(old) => Handoff::Recycle(old),
            None => Handoff::Retained,
        }
    };
    let engine = Arc::new(CubemapAssemblyEngine::new(
        &ctx,
        AssemblyOpts::from_config(&cfg.receiver, eyes),
        "loopback",
        Some(Box::new(consumer)),
    )?);

    let mut decoders = Vec::new();
    for eye in eyes.eyes() {
        for face in FaceIndex::ALL {
            let sink: Arc<dyn FaceFrameSink> = engine.clone();
            decoders.push(Arc::new(FaceDecodingPipeline::start(
                &ctx,
                Box::new(FfmpegFaceDecoder::new(args.resolution, args.resolution)?),
                sink,
                DecodePipelineOpts::from_config(&cfg.receiver, face, eye),
            )?));
        }
    }
    let decoders = Arc::new(decoders);

    let shape = CubemapShape::new(
        eyes,
        FaceMask::ALL,
        args.resolution,
        args.resolution,
        PixelFormat::Rgba8,
    );
    let source = StereoCubemap::allocate_heap(&shape)?;
    let frames = face_frames(&source)?;

    let forwarders: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();
    let on_pipeline = {
        let forwarders = forwarders.clone();
        let decoders = decoders.clone();
        Box::new(move |p: Arc<FaceEncodingPipeline>| {
            let decoder = decoders[p.eye().get() * FaceIndex::ALL.len() + p.face().get()].clone();
            let h = std::thread::spawn(move || {
                while let Some(au) = p.next_access_unit() {
                    decoder.push_access_unit(&au);
                }
            });
            forwarders.lock().push(h);
        })
    };
    let mut session = CubemapEncoderSession::start(&ctx, source, ffmpeg_factory(), None, on_pipeline)?;

    let interval = frame_interval(args.fps);
    let started = Instant::now();
    for tick in 0..args.frames {
        let t = Instant::now();
        publish_tick(&frames, args.resolution, tick)?;
        std::thread::sleep(interval.saturating_sub(t.elapsed()));
    }

    let pipelines = session.pipelines();
    for p in &pipelines {
        p.finish();
    }
    for p in &pipelines {
        p.join();
    }
    for h in std::mem::take(&mut *forwarders.lock()) {
        let _ = h.join();
    }
    session.stop();
    for d in decoders.iter() {
        d.finish();
    }

    eprintln!("{}", collector.summary(started.elapsed()));
    eprintln!("{:?}", engine.stats());

    if let Some(path) = args.png {
        let Some(cubemap) = last.lock().take() else {
            anyhow::bail!("no cubemap was delivered");
        };
        let face = cubemap
            .face(EyeIndex::LEFT, FaceIndex::ALL[0])?
            .context("face 0 missing from the last cubemap")?;
        let frame = face.content().snapshot()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create output dir '{}'", parent.display()))?;
        }
        image::save_buffer_with_format(
            &path,
            &frame.data,
            frame.width,
            frame.height,
            image::ColorType::Rgba8,
            image::ImageFormat::Png,
        )
        .with_context(|| format!("write png '{}'", path.display()))?;
        eprintln!("wrote {}", path.display());
    }
    Ok(())
}
