//! PoseFeed producer
//!
//! Runs one thread per requested camera, each opening its own channel and
//! then its capture loop, until SIGINT/SIGTERM.
//!
//! The camera driver and the pose model are provided by the embedding
//! application; this binary feeds a synthetic test pattern with no
//! landmarks so consumers can be exercised without hardware.

use clap::Parser;
use posefeed::capture::{launch_camera, FrameSource, PoseEstimator};
use posefeed::{ChannelConfig, Landmark, PoseFeedError, ProducerConfig, Result, StopSignal};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "posefeed")]
#[command(about = "Publish camera frames and pose landmarks to shared memory")]
struct Args {
    /// Camera indices to publish (0 => CAM1, others => CAM2)
    #[arg(required = true)]
    cameras: Vec<u32>,

    /// Configuration file shared with the consumer
    #[arg(long, default_value = "config/poseConfig.json")]
    config: PathBuf,

    /// Directory for readiness markers (overrides READY_DIR)
    #[arg(long)]
    ready_dir: Option<PathBuf>,

    /// Frame rate of the test pattern
    #[arg(long, default_value_t = 30)]
    fps: u32,
}

/// Moving RGB gradient at a fixed rate
struct TestPattern {
    config: ChannelConfig,
    interval: Duration,
    next_due: Instant,
    tick: u8,
}

impl TestPattern {
    fn new(config: ChannelConfig, fps: u32) -> Self {
        Self {
            config,
            interval: Duration::from_secs(1) / fps.max(1),
            next_due: Instant::now(),
            tick: 0,
        }
    }
}

impl FrameSource for TestPattern {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        if now < self.next_due {
            return Ok(None);
        }
        self.next_due = now + self.interval;
        self.tick = self.tick.wrapping_add(1);

        let width = self.config.frame_width;
        let mut frame = Vec::with_capacity(self.config.frame_size());
        for y in 0..self.config.frame_height {
            for x in 0..width {
                frame.push((x * 255 / width) as u8);
                frame.push(y as u8);
                frame.push(self.tick);
            }
        }
        Ok(Some(frame))
    }
}

/// Nobody in view
struct NoPose;

impl PoseEstimator for NoPose {
    fn estimate(&mut self, _frame: &[u8]) -> Result<Vec<(u32, Landmark)>> {
        Ok(Vec::new())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match ProducerConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Some(dir) = args.ready_dir {
        config.ready_dir = dir;
    }
    info!(
        width = config.channel.frame_width,
        height = config.channel.frame_height,
        json_size = config.channel.metadata_capacity,
        frame_size = config.channel.frame_size(),
        total_size = config.channel.total_size(),
        "configuration loaded"
    );

    let stop = StopSignal::new();
    let on_interrupt = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("stop requested");
        on_interrupt.stop();
    }) {
        error!(error = %e, "failed to install signal handler");
        std::process::exit(1);
    }

    let mut handles = Vec::new();
    for &camera in &args.cameras {
        let source = TestPattern::new(config.channel, args.fps);
        match launch_camera(config.clone(), camera, source, NoPose, stop.clone()) {
            Ok(handle) => handles.push((camera, handle)),
            Err(e) => error!(camera, error = %e, "failed to start capture thread"),
        }
    }

    let mut failed = handles.is_empty();
    for (camera, handle) in handles {
        match handle.join() {
            Ok(Ok(stats)) => info!(camera, published = stats.published, "camera finished"),
            Ok(Err(PoseFeedError::ChannelUnavailable { .. })) if stop.is_stopped() => {
                info!(camera, "stopped before the channel opened");
            }
            Ok(Err(e)) => {
                error!(camera, error = %e, "camera failed");
                failed = true;
            }
            Err(_) => {
                error!(camera, "capture thread panicked");
                failed = true;
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
}
