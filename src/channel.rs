//! Producer side of a frame/pose channel
//!
//! One channel per camera: a shared memory region holding the latest frame
//! and its landmarks, a named semaphore serializing writers, and a
//! readiness marker for the consumer.
//!
//! # Consumer contract
//!
//! The lock only excludes other writers. A consumer that wants a frame
//! and the metadata from the same publish must hold the same named lock
//! while it copies both sub-regions (see [`FramePoseChannel::read_locked`]).
//! Reading without it may pair a frame with another publish's metadata.

use crate::config::{CameraNames, ChannelConfig, ProducerConfig, RetryPolicy};
use crate::error::{PoseFeedError, Result};
use crate::layout::ChannelLayout;
use crate::pose::{pad_metadata, trim_padding, PoseFrame};
use crate::readiness::ReadinessSignal;
use crate::semaphore::NamedMutex;
use crate::shm::SharedRegion;
use crate::stop::StopSignal;
use tracing::{debug, info, warn};

/// Lifecycle of a channel handle
///
/// There is no unopened or opening state: [`FramePoseChannel::open`] is
/// the constructor and only returns a handle once both objects are
/// attached, so a live handle starts `Open` and ends `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

/// Resources held while open
struct Attached {
    lock: NamedMutex,
    region: SharedRegion,
}

/// Frame and metadata copied out under the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub frame: Vec<u8>,
    /// Metadata without its zero padding
    pub metadata: Vec<u8>,
}

impl ChannelSnapshot {
    pub fn pose(&self) -> Result<PoseFrame> {
        PoseFrame::decode(&self.metadata)
    }
}

/// Producer handle for one camera's channel
pub struct FramePoseChannel {
    camera: u32,
    names: CameraNames,
    layout: ChannelLayout,
    attached: Option<Attached>,
    readiness: ReadinessSignal,
    published: u64,
}

impl FramePoseChannel {
    /// Open the channel for `camera`, creating or attaching its objects
    ///
    /// Waits for the shared memory according to `retry`; fails with
    /// `ChannelUnavailable` once the policy gives up.
    pub fn open(
        camera: u32,
        names: CameraNames,
        config: &ChannelConfig,
        retry: &RetryPolicy,
    ) -> Result<Self> {
        Self::open_until(camera, names, config, retry, &StopSignal::new())
    }

    /// Like [`open`](Self::open), abandoning the wait once `stop` is set
    pub fn open_until(
        camera: u32,
        names: CameraNames,
        config: &ChannelConfig,
        retry: &RetryPolicy,
        stop: &StopSignal,
    ) -> Result<Self> {
        let layout = ChannelLayout::compute(config)?;
        info!(
            camera,
            shm = %names.shm_name,
            lock = %names.lock_name,
            frame_size = layout.frame_size,
            metadata_size = layout.metadata_size,
            total_size = layout.total_size,
            "opening channel"
        );

        let lock = NamedMutex::acquire_or_create(&names.lock_name)?;
        let region =
            SharedRegion::create_or_attach_until(&names.shm_name, layout.total_size, retry, stop)?;
        info!(
            camera,
            shm = %names.shm_name,
            created = region.is_creator(),
            "channel open"
        );

        let readiness = ReadinessSignal::new(names.ready_path.clone());
        Ok(Self {
            camera,
            names,
            layout,
            attached: Some(Attached { lock, region }),
            readiness,
            published: 0,
        })
    }

    /// Open using the names and geometry from a producer configuration
    pub fn open_with(config: &ProducerConfig, camera: u32, stop: &StopSignal) -> Result<Self> {
        Self::open_until(
            camera,
            config.camera(camera),
            &config.channel,
            &config.retry,
            stop,
        )
    }

    /// Publish a frame and its landmarks
    ///
    /// If the encoded landmarks do not fit, the frame is still written,
    /// the previous metadata is left in place and `PayloadTooLarge` is
    /// returned.
    pub fn publish(&mut self, frame: &[u8], pose: &PoseFrame) -> Result<()> {
        let capacity = self.layout.metadata_size;
        let metadata = pose
            .encode()
            .and_then(|payload| pad_metadata(&payload, capacity));
        self.publish_padded(frame, metadata)
    }

    /// Publish a frame with already serialized metadata
    pub fn publish_raw(&mut self, frame: &[u8], metadata: &[u8]) -> Result<()> {
        let metadata = pad_metadata(metadata, self.layout.metadata_size);
        self.publish_padded(frame, metadata)
    }

    fn publish_padded(&mut self, frame: &[u8], metadata: Result<Vec<u8>>) -> Result<()> {
        let attached = self
            .attached
            .as_ref()
            .ok_or_else(|| PoseFeedError::ChannelClosed(self.names.shm_name.clone()))?;

        if frame.len() != self.layout.frame_size {
            warn!(
                camera = self.camera,
                expected = self.layout.frame_size,
                got = frame.len(),
                "frame size mismatch, frame dropped"
            );
            return Err(PoseFeedError::FrameSizeMismatch {
                expected: self.layout.frame_size,
                got: frame.len(),
            });
        }

        let (metadata, dropped) = match metadata {
            Ok(padded) => (Some(padded), None),
            Err(e) => {
                warn!(camera = self.camera, error = %e, "metadata dropped, publishing frame only");
                (None, Some(e))
            }
        };

        let guard = attached.lock.lock()?;
        attached.region.write(self.layout.frame(), frame)?;
        if let Some(padded) = &metadata {
            attached.region.write(self.layout.metadata(), padded)?;
        }
        guard.unlock()?;

        self.published += 1;
        debug!(
            camera = self.camera,
            frame_bytes = frame.len(),
            metadata_bytes = metadata.as_ref().map_or(0, Vec::len),
            "published"
        );

        if let Err(e) = self.readiness.mark_ready_once() {
            warn!(
                camera = self.camera,
                path = %self.readiness.path().display(),
                error = %e,
                "failed to create readiness marker"
            );
        }

        match dropped {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Copy frame and metadata while holding the channel lock
    ///
    /// This is what a consumer has to do to never observe a torn pair.
    pub fn read_locked(&self) -> Result<ChannelSnapshot> {
        let attached = self
            .attached
            .as_ref()
            .ok_or_else(|| PoseFeedError::ChannelClosed(self.names.shm_name.clone()))?;

        let guard = attached.lock.lock()?;
        let frame = attached.region.read(self.layout.frame())?;
        let metadata = attached.region.read(self.layout.metadata())?;
        guard.unlock()?;

        let len = trim_padding(&metadata).len();
        let mut metadata = metadata;
        metadata.truncate(len);
        Ok(ChannelSnapshot { frame, metadata })
    }

    /// Release the lock handle, unmap and clear readiness
    ///
    /// The named objects are left in place. Calling this twice is harmless.
    pub fn close(&mut self) {
        if let Some(Attached { lock, region }) = self.attached.take() {
            region.close();
            drop(lock);
            self.readiness.clear();
            info!(
                camera = self.camera,
                shm = %self.names.shm_name,
                published = self.published,
                "channel closed"
            );
        }
    }

    pub fn state(&self) -> ChannelState {
        if self.attached.is_some() {
            ChannelState::Open
        } else {
            ChannelState::Closed
        }
    }

    #[inline]
    pub fn camera(&self) -> u32 {
        self.camera
    }

    #[inline]
    pub fn names(&self) -> &CameraNames {
        &self.names
    }

    #[inline]
    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// Number of frames written since open
    #[inline]
    pub fn publish_count(&self) -> u64 {
        self.published
    }
}

impl Drop for FramePoseChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::Landmark;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn names(tag: &str, dir: &Path) -> CameraNames {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let pid = std::process::id();
        CameraNames::new(
            &format!("/posefeed_ch_{tag}_{pid}_{n}"),
            &format!("/posefeed_chsem_{tag}_{pid}_{n}"),
            dir,
        )
    }

    fn cleanup(names: &CameraNames) {
        let _ = SharedRegion::unlink(&names.shm_name);
        let _ = NamedMutex::unlink(&names.lock_name);
    }

    fn tiny() -> ChannelConfig {
        ChannelConfig::new(2, 1, 16)
    }

    #[test]
    fn test_publish_layout() {
        let dir = tempfile::tempdir().unwrap();
        let names = names("layout", dir.path());
        let mut channel =
            FramePoseChannel::open(0, names.clone(), &tiny(), &RetryPolicy::once()).unwrap();
        assert_eq!(channel.layout().total_size, 22);

        let metadata = br#"{"t":1,"p":[]}"#;
        channel.publish_raw(&[1, 2, 3, 4, 5, 6], metadata).unwrap();

        let region = SharedRegion::create_or_attach(&names.shm_name, 22, &RetryPolicy::once())
            .unwrap();
        let bytes = region.read(crate::layout::Span { offset: 0, len: 22 }).unwrap();
        assert_eq!(&bytes[..6], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&bytes[6..6 + metadata.len()], metadata);
        assert!(bytes[6 + metadata.len()..].iter().all(|b| *b == 0));

        drop(region);
        drop(channel);
        cleanup(&names);
    }

    #[test]
    fn test_frame_size_mismatch_leaves_region() {
        let dir = tempfile::tempdir().unwrap();
        let names = names("mismatch", dir.path());
        let mut channel =
            FramePoseChannel::open(0, names.clone(), &tiny(), &RetryPolicy::once()).unwrap();
        channel.publish_raw(&[9; 6], b"{}").unwrap();

        let err = channel.publish_raw(&[1; 5], b"{\"a\":1}").unwrap_err();
        assert!(matches!(err, PoseFeedError::FrameSizeMismatch { expected: 6, got: 5 }));

        let snapshot = channel.read_locked().unwrap();
        assert_eq!(snapshot.frame, vec![9; 6]);
        assert_eq!(snapshot.metadata, b"{}");
        assert_eq!(channel.publish_count(), 1);

        drop(channel);
        cleanup(&names);
    }

    #[test]
    fn test_oversized_metadata_still_publishes_frame() {
        let dir = tempfile::tempdir().unwrap();
        let names = names("oversize", dir.path());
        let mut channel =
            FramePoseChannel::open(0, names.clone(), &tiny(), &RetryPolicy::once()).unwrap();
        channel.publish_raw(&[1; 6], b"old").unwrap();

        let err = channel.publish_raw(&[2; 6], &[b'x'; 17]).unwrap_err();
        assert!(matches!(err, PoseFeedError::PayloadTooLarge { max: 16, got: 17 }));

        let snapshot = channel.read_locked().unwrap();
        assert_eq!(snapshot.frame, vec![2; 6]);
        assert_eq!(snapshot.metadata, b"old");
        assert_eq!(channel.publish_count(), 2);

        drop(channel);
        cleanup(&names);
    }

    #[test]
    fn test_publish_pose_frame() {
        let dir = tempfile::tempdir().unwrap();
        let names = names("pose", dir.path());
        let config = ChannelConfig::new(2, 2, 256);
        let mut channel =
            FramePoseChannel::open(3, names.clone(), &config, &RetryPolicy::once()).unwrap();

        let pose = PoseFrame::new(77, [(0, Landmark::new(0.5, 0.5).with_visibility(0.99))]);
        channel.publish(&[7; 12], &pose).unwrap();
        assert_eq!(channel.read_locked().unwrap().pose().unwrap(), pose);

        let empty = PoseFrame::new(78, []);
        channel.publish(&[8; 12], &empty).unwrap();
        let snapshot = channel.read_locked().unwrap();
        assert_eq!(snapshot.frame, vec![8; 12]);
        assert_eq!(snapshot.pose().unwrap(), empty);

        drop(channel);
        cleanup(&names);
    }

    #[test]
    fn test_readiness_follows_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let names = names("ready", dir.path());
        let mut channel =
            FramePoseChannel::open(0, names.clone(), &tiny(), &RetryPolicy::once()).unwrap();
        assert!(!names.ready_path.exists());

        // A dropped frame does not make the channel ready
        let _ = channel.publish_raw(&[0; 3], b"");
        assert!(!names.ready_path.exists());

        channel.publish_raw(&[0; 6], b"").unwrap();
        assert_eq!(std::fs::read(&names.ready_path).unwrap(), b"ready");

        channel.close();
        assert!(!names.ready_path.exists());
        assert_eq!(channel.state(), ChannelState::Closed);

        cleanup(&names);
    }

    #[test]
    fn test_publish_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let names = names("closed", dir.path());
        let mut channel =
            FramePoseChannel::open(0, names.clone(), &tiny(), &RetryPolicy::once()).unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        channel.close();
        channel.close();

        let err = channel.publish_raw(&[0; 6], b"").unwrap_err();
        assert!(matches!(err, PoseFeedError::ChannelClosed(_)));
        assert!(matches!(channel.read_locked(), Err(PoseFeedError::ChannelClosed(_))));

        cleanup(&names);
    }

    #[test]
    fn test_invalid_config_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let names = names("invalid", dir.path());
        let err = FramePoseChannel::open(
            0,
            names,
            &ChannelConfig::new(0, 1, 16),
            &RetryPolicy::once(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PoseFeedError::InvalidConfig(_)));
    }
}
