//! Per-camera capture loop
//!
//! The camera and the pose model live outside this crate; they plug in
//! through [`FrameSource`] and [`PoseEstimator`].

use crate::channel::FramePoseChannel;
use crate::config::ProducerConfig;
use crate::error::{PoseFeedError, Result};
use crate::pose::{Landmark, PoseFrame};
use crate::stop::StopSignal;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Delay before polling a source that had no frame ready
const IDLE_BACKOFF: Duration = Duration::from_millis(5);

/// Delivers packed RGB frames of the channel's frame size
pub trait FrameSource: Send {
    /// `Ok(None)` when no frame is ready yet
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>>;

    /// Give the device back
    fn release(&mut self) {}
}

/// Maps a frame to body landmarks
pub trait PoseEstimator: Send {
    /// Empty when nobody is in view
    fn estimate(&mut self, frame: &[u8]) -> Result<Vec<(u32, Landmark)>>;
}

/// Counters reported when a loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub published: u64,
    pub dropped_frames: u64,
    pub dropped_metadata: u64,
    pub idle_polls: u64,
}

/// Pull, estimate, publish; one instance per camera
pub struct CaptureDriver<S, E> {
    channel: FramePoseChannel,
    source: S,
    estimator: E,
    stop: StopSignal,
    stats: CaptureStats,
}

impl<S: FrameSource, E: PoseEstimator> CaptureDriver<S, E> {
    pub fn new(channel: FramePoseChannel, source: S, estimator: E, stop: StopSignal) -> Self {
        Self {
            channel,
            source,
            estimator,
            stop,
            stats: CaptureStats::default(),
        }
    }

    /// Run until stopped or a fatal error
    ///
    /// The cycle in progress always completes before the stop request is
    /// honoured. The channel is closed and the source released on every
    /// exit path.
    pub fn run(mut self) -> Result<CaptureStats> {
        let camera = self.channel.camera();
        info!(camera, "capture loop started");

        let outcome = loop {
            if self.stop.is_stopped() {
                break Ok(());
            }
            match self.cycle() {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => {}
                Err(e) => {
                    error!(camera, error = %e, "capture loop stopped");
                    break Err(e);
                }
            }
        };

        self.channel.close();
        self.source.release();
        info!(
            camera,
            published = self.stats.published,
            dropped_frames = self.stats.dropped_frames,
            dropped_metadata = self.stats.dropped_metadata,
            "capture loop finished"
        );
        outcome.map(|()| self.stats)
    }

    fn cycle(&mut self) -> Result<()> {
        let camera = self.channel.camera();
        let frame = match self.source.next_frame()? {
            Some(frame) => frame,
            None => {
                self.stats.idle_polls += 1;
                thread::sleep(IDLE_BACKOFF);
                return Ok(());
            }
        };

        let landmarks = match self.estimator.estimate(&frame) {
            Ok(landmarks) => landmarks,
            Err(e) => {
                warn!(camera, error = %e, "pose estimation failed, frame dropped");
                self.stats.dropped_frames += 1;
                return Err(e);
            }
        };

        let pose = PoseFrame::now(landmarks);
        match self.channel.publish(&frame, &pose) {
            Ok(()) => {
                self.stats.published += 1;
                Ok(())
            }
            Err(e @ (PoseFeedError::PayloadTooLarge { .. } | PoseFeedError::Metadata(_))) => {
                self.stats.published += 1;
                self.stats.dropped_metadata += 1;
                Err(e)
            }
            Err(e @ PoseFeedError::FrameSizeMismatch { .. }) => {
                self.stats.dropped_frames += 1;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

/// Run a driver on its own named OS thread
pub fn spawn_camera<S, E>(
    driver: CaptureDriver<S, E>,
) -> std::io::Result<JoinHandle<Result<CaptureStats>>>
where
    S: FrameSource + 'static,
    E: PoseEstimator + 'static,
{
    capture_thread(driver.channel.camera()).spawn(move || driver.run())
}

/// Open a camera's channel and run its loop, all on the camera's thread
///
/// Waiting for the peer to create or size the region only holds up this
/// camera. The wait is abandoned when `stop` is requested; the thread
/// then returns `ChannelUnavailable`.
pub fn launch_camera<S, E>(
    config: ProducerConfig,
    camera: u32,
    source: S,
    estimator: E,
    stop: StopSignal,
) -> std::io::Result<JoinHandle<Result<CaptureStats>>>
where
    S: FrameSource + 'static,
    E: PoseEstimator + 'static,
{
    capture_thread(camera).spawn(move || {
        let channel = match FramePoseChannel::open_with(&config, camera, &stop) {
            Ok(channel) => channel,
            Err(e) => {
                error!(camera, error = %e, "channel unavailable");
                return Err(e);
            }
        };
        CaptureDriver::new(channel, source, estimator, stop).run()
    })
}

fn capture_thread(camera: u32) -> thread::Builder {
    thread::Builder::new().name(format!("capture-cam{camera}"))
}
