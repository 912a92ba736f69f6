//! SLAM System - Main entry point and thread orchestration.
//!
//! The `SlamSystem` is the top-level struct that users interact with.
//! It owns the shared state, runs Tracking in the caller's thread and spawns
//! the Local Mapping thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use image::GrayImage;

use crate::config::TrackingConfig;
use crate::geometry::SE3;
use crate::imu::ImuSample;
use crate::local_mapping::LocalMapper;
use crate::tracking::frame::{DepthImage, FeatureExtractor};
use crate::tracking::result::TrackingResult;
use crate::tracking::{Tracker, TrackingState};
use crate::vocabulary::Vocabulary;

use super::messages::{NewKeyFrameMsg, TrackingEvent};
use super::shared_state::SharedState;

/// Capacity of the keyframe channel between Tracking and Local Mapping.
/// When the channel is full, Tracking blocks until the mapper catches up.
pub const KEYFRAME_CHANNEL_CAPACITY: usize = 5;

/// Capacity of the event channel. Events beyond it are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Main SLAM system orchestrating Tracking and Local Mapping.
pub struct SlamSystem {
    /// Shared state (Atlas, flags) accessible by all threads.
    shared: Arc<SharedState>,

    /// The tracker runs in the calling thread.
    tracker: Tracker,

    /// Lifecycle events for a viewer or loop closer.
    events: Receiver<TrackingEvent>,

    /// Handle to the Local Mapping thread.
    local_mapping_handle: Option<JoinHandle<()>>,
}

impl SlamSystem {
    /// Create a new SLAM system and spawn the Local Mapping thread.
    pub fn new(
        config: TrackingConfig,
        extractor: Box<dyn FeatureExtractor>,
        right_extractor: Option<Box<dyn FeatureExtractor>>,
        vocabulary: Arc<dyn Vocabulary>,
    ) -> Result<Self> {
        let shared = SharedState::new();

        let (kf_sender, kf_receiver) = bounded::<NewKeyFrameMsg>(KEYFRAME_CHANNEL_CAPACITY);
        let (event_sender, events) = bounded::<TrackingEvent>(EVENT_CHANNEL_CAPACITY);

        let tracker = Tracker::new(
            config,
            extractor,
            right_extractor,
            vocabulary,
            Arc::clone(&shared),
            kf_sender,
        )?
        .with_event_sender(event_sender);

        let local_mapping_handle = Self::spawn_local_mapping(Arc::clone(&shared), kf_receiver)?;

        Ok(Self {
            shared,
            tracker,
            events,
            local_mapping_handle: Some(local_mapping_handle),
        })
    }

    /// Spawn the Local Mapping thread.
    fn spawn_local_mapping(
        shared: Arc<SharedState>,
        kf_receiver: Receiver<NewKeyFrameMsg>,
    ) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("local-mapping".into())
            .spawn(move || {
                let mut local_mapper = LocalMapper::new();
                local_mapper.run(kf_receiver, shared);
            })
            .context("failed to spawn the local mapping thread")
    }

    pub fn track_stereo(
        &mut self,
        left: &GrayImage,
        right: &GrayImage,
        timestamp: f64,
        imu: &[ImuSample],
    ) -> Result<TrackingResult> {
        self.tracker.grab_image_stereo(left, right, timestamp, imu)
    }

    pub fn track_rgbd(
        &mut self,
        image: &GrayImage,
        depth: &DepthImage,
        timestamp: f64,
        imu: &[ImuSample],
    ) -> Result<TrackingResult> {
        self.tracker.grab_image_rgbd(image, depth, timestamp, imu)
    }

    pub fn track_monocular(
        &mut self,
        image: &GrayImage,
        timestamp: f64,
        imu: &[ImuSample],
    ) -> Result<TrackingResult> {
        self.tracker.grab_image_monocular(image, timestamp, imu)
    }

    /// Localization mode: keep tracking against the map, stop adding keyframes.
    pub fn activate_localization_mode(&mut self) {
        self.tracker.set_only_tracking(true);
    }

    pub fn deactivate_localization_mode(&mut self) {
        self.tracker.set_only_tracking(false);
    }

    pub fn reset(&mut self) {
        self.tracker.reset();
    }

    pub fn tracking_state(&self) -> TrackingState {
        self.tracker.state()
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut Tracker {
        &mut self.tracker
    }

    /// Get a reference to the shared state for visualization.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn events(&self) -> &Receiver<TrackingEvent> {
        &self.events
    }

    /// `(timestamp, T_cw)` of every recorded frame, using the current
    /// keyframe poses.
    pub fn trajectory(&self) -> Vec<(f64, Option<SE3>)> {
        self.tracker.absolute_trajectory()
    }

    /// Shutdown the system gracefully.
    ///
    /// Signals the Local Mapping thread to finish and waits for it. The
    /// thread polls the flag between receive timeouts.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        if let Some(handle) = self.local_mapping_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sender half for callers that drive a [`Tracker`] directly and run
/// [`LocalMapper::run`] themselves.
pub fn keyframe_channel() -> (Sender<NewKeyFrameMsg>, Receiver<NewKeyFrameMsg>) {
    bounded(KEYFRAME_CHANNEL_CAPACITY)
}
