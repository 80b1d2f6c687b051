//! braw-reader Demo Application
//!
//! Plays a simulated BRAW clip through the reader into a frame queue and
//! reports what was delivered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;

use braw_reader::engine::PipelineKind;
use braw_reader::frame_queue::FrameQueue;
use braw_reader::registry;
use braw_reader::simulated::{SimulatedClip, SimulatedConfig, SimulatedEngine};
use braw_reader::{BrawReader, ReaderEvent, ReaderOptions, SeekFlags};

#[derive(Parser, Debug)]
#[command(about = "Play a simulated BRAW clip through braw-reader")]
struct Args {
    /// Clip locator handed to the reader.
    #[arg(default_value = "A001_C001_0101AB.braw")]
    clip: String,

    /// Number of frames in the simulated clip.
    #[arg(long, default_value_t = 48)]
    frames: u64,

    /// Frame rate of the simulated clip.
    #[arg(long, default_value_t = 24.0)]
    fps: f32,

    /// Clip width in pixels.
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Clip height in pixels.
    #[arg(long, default_value_t = 360)]
    height: u32,

    /// Simulate this GPU pipeline in addition to the CPU one
    /// (metal, cuda, opencl).
    #[arg(long)]
    gpu: Option<String>,

    /// Reader options as `key=value` pairs separated by `:`
    /// (e.g. `format=bgra:copy=1:scale=1/2`).
    #[arg(long, default_value = "")]
    options: String,

    /// Seek to this position (milliseconds) after the first frame.
    #[arg(long)]
    seek: Option<i64>,

    /// Frame queue capacity.
    #[arg(long, default_value_t = 5)]
    queue: usize,

    /// Per-job decode delay in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

fn engine_config(args: &Args) -> anyhow::Result<SimulatedConfig> {
    let mut config = match args.gpu.as_deref() {
        None => SimulatedConfig::cpu(),
        Some(name) => {
            let pipeline = match name.to_ascii_lowercase().as_str() {
                "metal" => PipelineKind::Metal,
                "cuda" => PipelineKind::Cuda,
                "opencl" => PipelineKind::OpenCl,
                other => anyhow::bail!("unknown GPU pipeline '{other}'"),
            };
            SimulatedConfig::gpu(pipeline)
        }
    };
    config = config.with_clip(SimulatedClip::new(args.width, args.height, args.fps, args.frames));
    config.job_delay = Duration::from_millis(args.delay_ms);
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("braw_reader=info".parse()?)
                .add_directive("braw_reader_demo=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let options = ReaderOptions::parse(&args.options).context("invalid reader options")?;
    let engine = SimulatedEngine::new(engine_config(&args)?);
    let queue = Arc::new(FrameQueue::new(args.queue));

    registry::register_braw();
    let candidates = registry::readers_for(&args.clip);
    anyhow::ensure!(
        candidates.iter().any(|name| name == "braw"),
        "'{}' is not a BRAW clip",
        args.clip
    );

    let braw = BrawReader::new(Arc::new(engine), queue.clone(), options);
    let events = braw.events();

    let started = Instant::now();
    braw.try_load(&args.clip)
        .with_context(|| format!("failed to load '{}'", args.clip))?;

    let mut delivered = 0u64;
    let mut seek_pending = args.seek;
    while let Some(frame) = queue.pop_blocking(Duration::from_secs(2)) {
        delivered += 1;
        tracing::debug!(
            "frame at {:.3}s ({}x{}, {:?}, gpu={})",
            frame.timestamp,
            frame.width,
            frame.height,
            frame.format,
            frame.frame.is_gpu_surface()
        );
        if let Some(target) = seek_pending.take() {
            tracing::info!("seeking to {} ms", target);
            braw.seek_to(target, SeekFlags::DEFAULT, 1);
        }
    }

    for event in events.try_iter() {
        match event {
            ReaderEvent::DecoderSelected {
                name,
                pipeline,
                device,
            } => tracing::info!("decoder {} on {} ({})", name, pipeline.name(), device),
            ReaderEvent::MediaInfoChanged(info) => tracing::info!(
                "{} streams, {} ms, video {:?}",
                info.streams,
                info.duration,
                info.video_stream().map(|v| (v.width, v.height, v.frame_rate))
            ),
            ReaderEvent::SeekCompleted { seek_id, outcome } => {
                tracing::info!("seek {} finished: {:?}", seek_id, outcome)
            }
            ReaderEvent::StatusChanged(status) => tracing::debug!("status {:?}", status),
        }
    }

    let stats = braw.stats();
    tracing::info!(
        "delivered {} frames in {:.2?}; rejected {}, stale {}, failed {}",
        delivered,
        started.elapsed(),
        stats.frames_rejected,
        stats.stale_drops,
        stats.failed_jobs
    );
    tracing::info!(
        "host copies {}, direct maps {}, zero-copy {:.1}%",
        stats.host_copies,
        stats.direct_maps,
        stats.zero_copy_percentage()
    );
    Ok(())
}
