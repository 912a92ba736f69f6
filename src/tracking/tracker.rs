//! Main tracker: orchestrates frame processing and pose estimation.
//!
//! This implementation follows the ORB-SLAM3 design:
//! - Uses shared `Atlas` via RwLock, holding one read guard per cycle
//! - Builds the initial map from one depth frame or two monocular views
//! - Gets an initial pose from an ordered list of strategies, then refines it
//!   against the local map
//! - Relocalizes against the keyframe database while lost
//! - Sends new keyframes to Local Mapping via a bounded channel

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, ensure, Context, Result};
use crossbeam_channel::Sender;
use image::GrayImage;
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, Map};
use crate::atlas::Atlas;
use crate::config::{CameraConfig, SensorType, TrackingConfig};
use crate::geometry::frames::FrameConverter;
use crate::geometry::SE3;
use crate::imu::{estimate_gyro_bias, BiasWindowEntry, ImuBias, ImuSample, NavState, Preintegrator};
use crate::system::messages::{NewKeyFrameMsg, TrackingEvent};
use crate::system::shared_state::SharedState;
use crate::tracking::frame::{CalibrationContext, DepthImage, FeatureExtractor, ScaleLevels};
use crate::tracking::initializer::{create_initial_map_monocular, create_initial_map_stereo, MonocularInitializer};
use crate::tracking::keyframe_decision::{count_close_points, KeyFrameContext, KeyFrameDecision};
use crate::tracking::local_map::track_local_map;
use crate::tracking::motion_model::{track_from_prediction, track_with_motion_model, MotionModel};
use crate::tracking::relocalization::relocalize;
use crate::tracking::result::{TimingStats, TrackingMetrics, TrackingResult};
use crate::tracking::state::CycleOutcome;
use crate::tracking::strategy::{plan, track_reference_keyframe, AttemptOutcome, PlanConditions, TrackingStrategy};
use crate::tracking::tracking_frame::Frame;
use crate::tracking::trajectory::Trajectory;
use crate::tracking::TrackingState;
use crate::vocabulary::Vocabulary;

const RNG_SEED: u64 = 0x0b51_a3;
/// Losing track with this many keyframes or fewer resets the map.
const EARLY_LOSS_MAX_KEYFRAMES: usize = 5;
/// Frame pairs buffered after a relocalization before the gyro bias is refit.
const BIAS_WINDOW_LEN: usize = 20;
/// Previous keyframes added to the local map when inertial.
const INERTIAL_TEMPORAL_WINDOW: usize = 20;
/// Motion-model map matches below which localization mode is visual odometry.
const VO_MIN_MAP_MATCHES: usize = 10;

/// What the tracking part of a cycle decided while holding the map guard.
struct MapCycle {
    outcome: CycleOutcome,
    need_keyframe: bool,
    keyframes_in_map: usize,
}

/// Main tracking structure.
pub struct Tracker {
    config: TrackingConfig,
    extractor: Box<dyn FeatureExtractor>,
    right_extractor: Option<Box<dyn FeatureExtractor>>,
    vocabulary: Arc<dyn Vocabulary>,

    /// Built from the first image of a calibration epoch.
    calib: Option<Arc<CalibrationContext>>,
    scale: Arc<ScaleLevels>,
    /// Body/camera extrinsic for the inertial state.
    frames: FrameConverter,

    /// Shared state (Atlas, flags) - thread-safe access.
    shared: Arc<SharedState>,

    /// Channel to send keyframes to Local Mapping.
    kf_sender: Sender<NewKeyFrameMsg>,

    /// Optional viewer/loop-closer notifications, never blocking.
    event_sender: Option<Sender<TrackingEvent>>,

    state: TrackingState,
    /// State of the last frame that went through a full cycle. Used to
    /// resume after `SystemNotReady`.
    last_processed_state: TrackingState,
    next_frame_id: u64,
    last_frame: Option<Frame>,

    /// Reference keyframe used for tracking.
    reference_kf: Option<KeyFrameId>,
    /// Last keyframe proposed by this tracker.
    last_keyframe: Option<KeyFrameId>,
    last_kf_frame_id: u64,
    last_kf_timestamp: f64,
    last_reloc_frame_id: Option<u64>,

    motion_model: MotionModel,
    mono_init: MonocularInitializer,

    /// Keyframe creation decision logic.
    kf_decision: KeyFrameDecision,

    only_tracking: bool,
    /// Localization mode is tracking with too few map points.
    visual_odometry: bool,

    /// Samples between the last frame and the current one.
    preintegrator: Preintegrator,
    /// Separate preintegrator for accumulating IMU since last keyframe.
    /// Reset when a new keyframe is created.
    kf_preintegrator: Preintegrator,
    imu_bias: ImuBias,
    /// The bias estimated by the map's inertial initialization was adopted.
    map_bias_adopted: bool,
    /// Collected after a relocalization while inertial.
    bias_window: Option<Vec<BiasWindowEntry>>,
    force_keyframe: bool,

    trajectory: Trajectory,
    last_inliers: usize,
    rng: StdRng,
}

impl Tracker {
    /// Build a tracker. Rejects configurations no frame could be processed
    /// with, and a stereo configuration without a right-image extractor.
    pub fn new(
        config: TrackingConfig,
        extractor: Box<dyn FeatureExtractor>,
        right_extractor: Option<Box<dyn FeatureExtractor>>,
        vocabulary: Arc<dyn Vocabulary>,
        shared: Arc<SharedState>,
        kf_sender: Sender<NewKeyFrameMsg>,
    ) -> Result<Self> {
        config.validate()?;
        if config.sensor == SensorType::Stereo {
            ensure!(
                right_extractor.is_some(),
                "stereo tracking needs a right-image extractor"
            );
        }
        extractor
            .scale_levels()
            .validate()
            .context("extractor scale levels")?;
        if let Some(right) = &right_extractor {
            right
                .scale_levels()
                .validate()
                .context("right extractor scale levels")?;
            ensure!(
                right.scale_levels() == extractor.scale_levels(),
                "left and right extractors must share one pyramid"
            );
        }

        let scale = Arc::new(extractor.scale_levels().clone());
        let noise = config.imu.as_ref().map(|imu| imu.noise()).unwrap_or_default();
        let frames = config
            .imu
            .as_ref()
            .map(|imu| FrameConverter::new(imu.body_from_camera()))
            .unwrap_or_default();
        let mut kf_decision = KeyFrameDecision::new(config.min_frames, config.max_frames());
        if let Some(imu) = &config.imu {
            kf_decision.inertial_gap_uninitialized = imu.keyframe_gap_uninitialized;
            kf_decision.inertial_gap_initialized = imu.keyframe_gap_initialized;
        }
        let mono_init = MonocularInitializer::new(config.mono_init_min_features);

        Ok(Self {
            config,
            extractor,
            right_extractor,
            vocabulary,
            calib: None,
            scale,
            frames,
            shared,
            kf_sender,
            event_sender: None,
            state: TrackingState::NoImagesYet,
            last_processed_state: TrackingState::NoImagesYet,
            next_frame_id: 0,
            last_frame: None,
            reference_kf: None,
            last_keyframe: None,
            last_kf_frame_id: 0,
            last_kf_timestamp: 0.0,
            last_reloc_frame_id: None,
            motion_model: MotionModel::new(),
            mono_init,
            kf_decision,
            only_tracking: false,
            visual_odometry: false,
            preintegrator: Preintegrator::new(ImuBias::zero(), noise),
            kf_preintegrator: Preintegrator::new(ImuBias::zero(), noise),
            imu_bias: ImuBias::zero(),
            map_bias_adopted: false,
            bias_window: None,
            force_keyframe: false,
            trajectory: Trajectory::new(),
            last_inliers: 0,
            rng: StdRng::seed_from_u64(RNG_SEED),
        })
    }

    /// Publish lifecycle events on `sender`. A full channel drops events.
    pub fn with_event_sender(mut self, sender: Sender<TrackingEvent>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Frame Input
    // ─────────────────────────────────────────────────────────────────────────

    /// Track a rectified stereo pair. Left and right features are extracted
    /// concurrently.
    pub fn grab_image_stereo(
        &mut self,
        left: &GrayImage,
        right: &GrayImage,
        timestamp: f64,
        imu: &[ImuSample],
    ) -> Result<TrackingResult> {
        self.check_sensor(SensorType::Stereo)?;
        let t_start = Instant::now();
        let calib = self.calibration(left);

        let extractor = &mut self.extractor;
        let right_extractor = self
            .right_extractor
            .as_mut()
            .ok_or_else(|| anyhow!("stereo tracking needs a right-image extractor"))?;
        let (left_features, right_features) = std::thread::scope(|s| {
            let right_task = s.spawn(move || right_extractor.extract(right));
            let left_features = extractor.extract(left);
            let right_features = right_task
                .join()
                .map_err(|_| anyhow!("right-image feature extraction panicked"));
            (left_features, right_features)
        });
        let left_features = left_features?;
        let right_features = right_features??;

        let id = self.take_frame_id();
        let frame = Frame::new_stereo(
            id,
            timestamp,
            left_features,
            &right_features,
            Arc::clone(&self.scale),
            calib,
        );
        let extract_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        Ok(self.track(frame, imu, t_start, extract_ms))
    }

    /// Track an image with a registered depth map.
    pub fn grab_image_rgbd(
        &mut self,
        image: &GrayImage,
        depth: &DepthImage,
        timestamp: f64,
        imu: &[ImuSample],
    ) -> Result<TrackingResult> {
        self.check_sensor(SensorType::Rgbd)?;
        let t_start = Instant::now();
        let calib = self.calibration(image);
        let features = self.extractor.extract(image)?;

        let id = self.take_frame_id();
        let frame = Frame::new_rgbd(id, timestamp, features, depth, Arc::clone(&self.scale), calib);
        let extract_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        Ok(self.track(frame, imu, t_start, extract_ms))
    }

    pub fn grab_image_monocular(
        &mut self,
        image: &GrayImage,
        timestamp: f64,
        imu: &[ImuSample],
    ) -> Result<TrackingResult> {
        self.check_sensor(SensorType::Monocular)?;
        let t_start = Instant::now();
        let calib = self.calibration(image);
        let features = self.extractor.extract(image)?;

        let id = self.take_frame_id();
        let frame = Frame::new_monocular(id, timestamp, features, Arc::clone(&self.scale), calib);
        let extract_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        Ok(self.track(frame, imu, t_start, extract_ms))
    }

    fn check_sensor(&self, expected: SensorType) -> Result<()> {
        ensure!(
            self.config.sensor == expected,
            "tracker configured for {:?} was given {:?} input",
            self.config.sensor,
            expected
        );
        Ok(())
    }

    /// Calibration of the current epoch, built from this image's size if
    /// there is none yet.
    fn calibration(&mut self, image: &GrayImage) -> Arc<CalibrationContext> {
        let (width, height) = image.dimensions();
        let camera = &self.config.camera;
        let calib = self.calib.get_or_insert_with(|| {
            info!("[Tracking] calibration context built for {}x{} images", width, height);
            Arc::new(CalibrationContext::new(camera, width, height))
        });
        Arc::clone(calib)
    }

    fn take_frame_id(&mut self) -> u64 {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tracking Cycle
    // ─────────────────────────────────────────────────────────────────────────

    fn track(&mut self, mut frame: Frame, imu: &[ImuSample], t_start: Instant, extract_ms: f64) -> TrackingResult {
        let t_track = Instant::now();
        let mut metrics = TrackingMetrics {
            n_features: frame.num_features(),
            ..Default::default()
        };

        if frame.is_empty() {
            debug!("[Tracking] frame {} has no features, skipped", frame.id);
            return self.finish(frame, CycleOutcome::EmptyFrame, metrics, t_start, t_track, extract_ms);
        }

        if let Some(last) = self.last_frame.as_ref() {
            if frame.timestamp < last.timestamp {
                warn!(
                    "[Tracking] frame {} at {:.6} is older than frame {} at {:.6}, skipped",
                    frame.id, frame.timestamp, last.id, last.timestamp
                );
                return self.finish(frame, CycleOutcome::OutOfOrder, metrics, t_start, t_track, extract_ms);
            }
        }

        if self.config.is_inertial() {
            if imu.is_empty() && self.last_frame.is_some() {
                warn!("[Tracking] frame {} arrived without IMU samples", frame.id);
                return self.finish(frame, CycleOutcome::ImuMissing, metrics, t_start, t_track, extract_ms);
            }
            self.preintegrate(&mut frame, imu);
        }
        let map_updated = self.shared.take_map_updated();

        let effective = if self.state == TrackingState::SystemNotReady {
            self.last_processed_state
        } else {
            self.state
        };

        let outcome = if effective.needs_initialization() {
            let outcome = self.initialize(&mut frame);
            if outcome == CycleOutcome::Initialized {
                metrics.n_inliers = frame.num_matches();
                metrics.n_matches = metrics.n_inliers;
                if let (Some(kf_id), Some(t_cw)) = (self.reference_kf, frame.pose().copied()) {
                    self.trajectory.push_tracked(frame.id, frame.timestamp, kf_id, &t_cw, &t_cw);
                }
            }
            outcome
        } else {
            let cycle = self.track_in_map(&mut frame, effective, map_updated, &mut metrics);

            if cycle.need_keyframe {
                metrics.keyframe_created = self.create_new_keyframe(&mut frame);
            }
            let lost = matches!(
                cycle.outcome,
                CycleOutcome::TrackingFailed | CycleOutcome::RelocalizationFailed
            );
            if lost && !self.only_tracking && cycle.keyframes_in_map <= EARLY_LOSS_MAX_KEYFRAMES {
                warn!(
                    "[Tracking] lost with only {} keyframes, resetting map",
                    cycle.keyframes_in_map
                );
                self.send_event(TrackingEvent::ResetRequested);
                self.reset();
                self.last_inliers = metrics.n_inliers;
                let timing = Self::timing(t_start, t_track, extract_ms);
                return TrackingResult {
                    frame_id: frame.id,
                    timestamp: frame.timestamp,
                    state: self.state,
                    pose: None,
                    reference_kf_id: None,
                    metrics,
                    timing,
                };
            }
            cycle.outcome
        };

        self.finish(frame, outcome, metrics, t_start, t_track, extract_ms)
    }

    /// Preintegrate the samples since the last frame, both for the frame
    /// interval and for the interval since the last keyframe.
    fn preintegrate(&mut self, frame: &mut Frame, imu: &[ImuSample]) {
        frame.imu_samples = imu.to_vec();
        frame.imu_bias = self.imu_bias;
        let Some(last) = self.last_frame.as_ref() else {
            return;
        };
        self.preintegrator.reset(self.imu_bias);
        self.preintegrator.integrate_between(imu, last.timestamp, frame.timestamp);
        self.kf_preintegrator.integrate_between(imu, last.timestamp, frame.timestamp);
        frame.preint_from_last_frame = Some(self.preintegrator.state.clone());
        frame.preint_from_last_kf = Some(self.kf_preintegrator.state.clone());
    }

    fn initialize(&mut self, frame: &mut Frame) -> CycleOutcome {
        match self.config.sensor {
            SensorType::Monocular => self.initialize_monocular(frame),
            SensorType::Stereo | SensorType::Rgbd => self.initialize_stereo(frame),
        }
    }

    fn initialize_stereo(&mut self, frame: &mut Frame) -> CycleOutcome {
        if frame.num_features() <= self.config.stereo_init_min_features {
            debug!(
                "[Tracking] frame {}: {} features, not enough to initialize",
                frame.id,
                frame.num_features()
            );
            return CycleOutcome::InitializationPending;
        }

        if self.config.is_inertial() {
            frame.nav_state = Some(NavState::from_camera_pose(
                &SE3::identity(),
                Vector3::zeros(),
                self.imu_bias,
                &self.frames,
            ));
            frame.preint_from_last_kf = None;
        }

        let kf_id = self.shared.reserve_keyframe_id();
        let shared = Arc::clone(&self.shared);
        let mut atlas = shared.atlas.write();
        let n_points = create_initial_map_stereo(frame, &mut atlas, kf_id, self.vocabulary.as_ref());
        if n_points == 0 {
            atlas.clear();
            frame.reset_matches();
            frame.clear_pose();
            return CycleOutcome::InitializationPending;
        }
        drop(atlas);

        self.keyframe_inserted(kf_id, frame);
        CycleOutcome::Initialized
    }

    fn initialize_monocular(&mut self, frame: &mut Frame) -> CycleOutcome {
        let Some(init) = self.mono_init.try_initialize(frame, &mut self.rng) else {
            return CycleOutcome::InitializationPending;
        };
        let Some(mut reference) = self.mono_init.take_reference() else {
            return CycleOutcome::InitializationPending;
        };

        let ref_kf_id = self.shared.reserve_keyframe_id();
        let cur_kf_id = self.shared.reserve_keyframe_id();
        let shared = Arc::clone(&self.shared);
        let mut atlas = shared.atlas.write();
        let ok = create_initial_map_monocular(
            &mut reference,
            frame,
            &init,
            &mut atlas,
            ref_kf_id,
            cur_kf_id,
            self.vocabulary.as_ref(),
        );
        drop(atlas);
        if !ok {
            return CycleOutcome::InitializationPending;
        }

        self.keyframe_inserted(cur_kf_id, frame);
        CycleOutcome::Initialized
    }

    /// Estimate the pose against the existing map and decide on a keyframe,
    /// all under one read guard.
    fn track_in_map(
        &mut self,
        frame: &mut Frame,
        effective: TrackingState,
        map_updated: bool,
        metrics: &mut TrackingMetrics,
    ) -> MapCycle {
        let shared = Arc::clone(&self.shared);
        let atlas = shared.atlas.read();
        let map = atlas.active_map();

        // Local mapping may have fused points the last frame still refers to.
        if let Some(last) = self.last_frame.as_mut() {
            for mp in last.map_points.iter_mut() {
                if let Some(id) = *mp {
                    *mp = map.resolve_replaced(id);
                }
            }
        }

        let pose_ok = if effective == TrackingState::Lost {
            self.relocalize(frame, &atlas, metrics)
        } else if self.only_tracking && self.visual_odometry {
            self.track_visual_odometry(frame, &atlas, metrics)
        } else {
            self.estimate_pose(frame, map, map_updated, metrics)
        };

        let mut ok = pose_ok;
        if pose_ok {
            if self.only_tracking && self.visual_odometry {
                metrics.n_inliers = frame.num_matches();
            } else {
                let frames_since_reloc = self.last_reloc_frame_id.map(|r| frame.id.saturating_sub(r));
                let temporal_window = if self.config.is_inertial() {
                    INERTIAL_TEMPORAL_WINDOW
                } else {
                    0
                };
                let local = track_local_map(
                    frame,
                    map,
                    self.config.sensor,
                    self.only_tracking,
                    frames_since_reloc,
                    self.config.max_frames(),
                    temporal_window,
                );
                debug!(
                    "[Tracking] frame {}: local map {} inliers (ok={})",
                    frame.id, local.n_inliers, local.success
                );
                metrics.n_inliers = local.n_inliers;
                if let Some(kf_id) = local.reference_kf {
                    self.reference_kf = Some(kf_id);
                }
                ok = local.success;
            }
        }
        if self.reference_kf.and_then(|id| map.get_keyframe(id)).is_none() {
            self.reference_kf = map.last_keyframe_id();
        }
        frame.reference_kf = self.reference_kf;

        let outcome = match (effective == TrackingState::Lost, ok) {
            (true, true) => CycleOutcome::Relocalized,
            (true, false) => CycleOutcome::RelocalizationFailed,
            (false, true) => CycleOutcome::Tracked,
            (false, false) => CycleOutcome::TrackingFailed,
        };
        let keyframes_in_map = map.num_keyframes();
        if !ok {
            frame.clear_pose();
            self.trajectory.push_lost(frame.id, frame.timestamp);
            return MapCycle {
                outcome,
                need_keyframe: false,
                keyframes_in_map,
            };
        }

        if self.config.is_inertial() {
            self.update_nav_state(frame);
            self.collect_bias_window(frame);
        }

        if let (Some(t_cw), Some(kf)) = (
            frame.pose().copied(),
            self.reference_kf.and_then(|id| map.get_keyframe(id)),
        ) {
            self.trajectory
                .push_tracked(frame.id, frame.timestamp, kf.id, &t_cw, &kf.t_cw);
        }

        let need_keyframe = self.need_new_keyframe(frame, map, metrics.n_inliers);
        MapCycle {
            outcome,
            need_keyframe,
            keyframes_in_map,
        }
    }

    /// Run the planned strategies until one succeeds.
    fn estimate_pose(
        &mut self,
        frame: &mut Frame,
        map: &Map,
        map_updated: bool,
        metrics: &mut TrackingMetrics,
    ) -> bool {
        if self.config.is_inertial() && !self.map_bias_adopted {
            if let Some(bias) = map.imu_bias() {
                info!(
                    "[Tracking] map inertially initialized, gyro bias [{:.5}, {:.5}, {:.5}]",
                    bias.gyro.x, bias.gyro.y, bias.gyro.z
                );
                self.imu_bias = *bias;
                self.map_bias_adopted = true;
            }
        }
        let cond = PlanConditions {
            frame_id: frame.id,
            last_reloc_frame_id: self.last_reloc_frame_id,
            has_velocity: self.motion_model.has_velocity(),
            imu_ready: self.config.is_inertial() && map.is_imu_initialized(),
            frames_to_reset_imu: self.config.max_frames(),
        };
        let monocular = self.config.sensor == SensorType::Monocular;

        for strategy in plan(&cond) {
            let attempt = match strategy {
                TrackingStrategy::ImuPrediction => {
                    match (self.predict_state_imu(frame, map, map_updated), self.last_frame.as_ref()) {
                        (Some(predicted), Some(last)) => {
                            track_from_prediction(frame, last, predicted, map, monocular, self.only_tracking)
                        }
                        _ => AttemptOutcome::Failure("no inertial prediction"),
                    }
                }
                TrackingStrategy::MotionModel => match self.last_frame.as_ref() {
                    Some(last) => {
                        track_with_motion_model(frame, last, &self.motion_model, map, monocular, self.only_tracking)
                    }
                    None => AttemptOutcome::Failure("no last frame"),
                },
                TrackingStrategy::ReferenceKeyFrame => {
                    let reference = self
                        .reference_kf
                        .and_then(|id| map.get_keyframe(id))
                        .or_else(|| map.last_keyframe_id().and_then(|id| map.get_keyframe(id)));
                    match reference {
                        Some(kf) => {
                            let start = self.last_frame.as_ref().and_then(Frame::pose);
                            track_reference_keyframe(frame, kf, start, map, self.vocabulary.as_ref())
                        }
                        None => AttemptOutcome::Failure("no reference keyframe"),
                    }
                }
            };

            match attempt {
                AttemptOutcome::Success {
                    n_matches,
                    n_map_matches,
                } => {
                    debug!("[Tracking] frame {}: {} gave {} matches", frame.id, strategy, n_matches);
                    metrics.strategy = Some(strategy);
                    metrics.n_matches = n_matches;
                    if self.only_tracking && strategy == TrackingStrategy::MotionModel {
                        self.visual_odometry = n_map_matches < VO_MIN_MAP_MATCHES;
                    }
                    return true;
                }
                AttemptOutcome::Failure(reason) => {
                    debug!("[Tracking] frame {}: {} failed ({})", frame.id, strategy, reason);
                }
            }
        }
        false
    }

    /// Localization mode with too few map points: run the motion model and
    /// relocalization, preferring relocalization when it succeeds.
    fn track_visual_odometry(&mut self, frame: &mut Frame, atlas: &Atlas, metrics: &mut TrackingMetrics) -> bool {
        let map = atlas.active_map();
        let monocular = self.config.sensor == SensorType::Monocular;

        let motion = match self.last_frame.as_ref() {
            Some(last) if self.motion_model.has_velocity() => {
                track_with_motion_model(frame, last, &self.motion_model, map, monocular, true)
            }
            _ => AttemptOutcome::Failure("no velocity"),
        };
        let motion_frame = match motion {
            AttemptOutcome::Success {
                n_matches,
                n_map_matches,
            } => {
                metrics.strategy = Some(TrackingStrategy::MotionModel);
                metrics.n_matches = n_matches;
                self.visual_odometry = n_map_matches < VO_MIN_MAP_MATCHES;
                Some(frame.clone())
            }
            AttemptOutcome::Failure(_) => None,
        };

        if self.relocalize(frame, atlas, metrics) {
            self.visual_odometry = false;
            return true;
        }
        match motion_frame {
            Some(tracked) => {
                *frame = tracked;
                true
            }
            None => false,
        }
    }

    fn relocalize(&mut self, frame: &mut Frame, atlas: &Atlas, metrics: &mut TrackingMetrics) -> bool {
        metrics.relocalization_attempted = true;
        let outcome = relocalize(
            frame,
            atlas.active_map(),
            &atlas.keyframe_db,
            self.vocabulary.as_ref(),
            &mut self.rng,
        );
        if !outcome.is_success() {
            return false;
        }
        metrics.n_matches = outcome.n_inliers;
        self.last_reloc_frame_id = Some(frame.id);
        if let Some(kf_id) = outcome.keyframe {
            self.reference_kf = Some(kf_id);
        }
        if self.config.is_inertial() {
            self.bias_window = Some(Vec::with_capacity(BIAS_WINDOW_LEN));
        }
        self.send_event(TrackingEvent::Relocalized { frame_id: frame.id });
        true
    }

    /// Propagate the inertial state to the current frame.
    ///
    /// Starts from the last keyframe when local mapping changed the map,
    /// and from the last frame otherwise.
    fn predict_state_imu(&self, frame: &Frame, map: &Map, map_updated: bool) -> Option<SE3> {
        if map_updated {
            let from_kf = self.last_keyframe.and_then(|id| map.get_keyframe(id)).and_then(|kf| {
                let nav = kf.nav_state?;
                let preint = frame.preint_from_last_kf.as_ref()?;
                Some(nav.predict(preint).camera_pose(&self.frames))
            });
            if from_kf.is_some() {
                return from_kf;
            }
        }
        let last = self.last_frame.as_ref()?;
        let nav = last.nav_state?;
        let preint = frame.preint_from_last_frame.as_ref()?;
        Some(nav.predict(preint).camera_pose(&self.frames))
    }

    /// Body state of a tracked frame. Velocity is the finite difference of
    /// body positions with the last frame.
    fn update_nav_state(&self, frame: &mut Frame) {
        let Some(t_cw) = frame.pose().copied() else {
            return;
        };
        let mut nav = NavState::from_camera_pose(&t_cw, Vector3::zeros(), self.imu_bias, &self.frames);
        if let Some(prev) = self.last_frame.as_ref().and_then(|f| f.nav_state.map(|n| (f.timestamp, n))) {
            let dt = frame.timestamp - prev.0;
            if dt > 0.0 {
                nav.velocity = (nav.position - prev.1.position) / dt;
            }
        }
        frame.nav_state = Some(nav);
    }

    /// Buffer consecutive tracked frames after a relocalization and refit
    /// the gyro bias once the window is full.
    fn collect_bias_window(&mut self, frame: &Frame) {
        let Some(window) = self.bias_window.as_mut() else {
            return;
        };
        let entry = self.last_frame.as_ref().and_then(|last| {
            let r_wb_i = last.nav_state?.rotation.to_rotation_matrix().into_inner();
            let r_wb_j = frame.nav_state?.rotation.to_rotation_matrix().into_inner();
            let preint = frame.preint_from_last_frame.clone()?;
            Some(BiasWindowEntry {
                r_wb_i,
                r_wb_j,
                preint,
            })
        });
        if let Some(entry) = entry {
            window.push(entry);
        }
        if window.len() < BIAS_WINDOW_LEN {
            return;
        }

        if let Some(bias) = estimate_gyro_bias(window, &self.imu_bias) {
            info!(
                "[Tracking] gyro bias re-estimated: [{:.5}, {:.5}, {:.5}]",
                bias.gyro.x, bias.gyro.y, bias.gyro.z
            );
            self.imu_bias = bias;
            self.force_keyframe = true;
        }
        self.bias_window = None;
    }

    fn need_new_keyframe(&self, frame: &Frame, map: &Map, n_inliers: usize) -> bool {
        let keyframes_in_map = map.num_keyframes();
        let min_obs = if keyframes_in_map <= 2 { 2 } else { 3 };
        let ref_matches = self
            .reference_kf
            .map_or(0, |id| map.tracked_map_points(id, min_obs));
        let ctx = KeyFrameContext {
            sensor: self.config.sensor,
            frame_id: frame.id,
            timestamp: frame.timestamp,
            n_inliers,
            ref_matches,
            close_points: count_close_points(frame, frame.calib.th_depth),
            last_kf_frame_id: self.last_kf_frame_id,
            last_kf_timestamp: self.last_kf_timestamp,
            last_reloc_frame_id: self.last_reloc_frame_id,
            keyframes_in_map,
            only_tracking: self.only_tracking,
            mapping_stopped: self.shared.should_stop_keyframe_creation(),
            mapping_idle: self.shared.is_accepting_keyframes(),
            queued_keyframes: self.kf_sender.len(),
            inertial: self.config.is_inertial().then(|| map.is_imu_initialized()),
            force: self.force_keyframe,
        };
        self.kf_decision.need_new_keyframe(&ctx)
    }

    /// Hand the current frame to Local Mapping as a keyframe.
    ///
    /// Blocks while the mapper's queue is full.
    fn create_new_keyframe(&mut self, frame: &mut Frame) -> bool {
        frame.compute_bow(self.vocabulary.as_ref());
        let kf_id = self.shared.reserve_keyframe_id();
        let Some(keyframe) = frame.to_keyframe(kf_id) else {
            return false;
        };
        let matched_map_points = frame
            .map_points
            .iter()
            .zip(&frame.outliers)
            .map(|(mp, &outlier)| if outlier { None } else { *mp })
            .collect();
        let msg = NewKeyFrameMsg {
            keyframe,
            matched_map_points,
            epoch: self.shared.map_epoch(),
        };
        if self.kf_sender.send(msg).is_err() {
            warn!("[Tracking] local mapping is gone, {} not inserted", kf_id);
            return false;
        }
        debug!("[Tracking] frame {} proposed as {}", frame.id, kf_id);
        self.keyframe_inserted(kf_id, frame);
        self.send_event(TrackingEvent::KeyFrameProposed { id: kf_id });
        true
    }

    fn keyframe_inserted(&mut self, kf_id: KeyFrameId, frame: &mut Frame) {
        self.reference_kf = Some(kf_id);
        self.last_keyframe = Some(kf_id);
        self.last_kf_frame_id = frame.id;
        self.last_kf_timestamp = frame.timestamp;
        self.force_keyframe = false;
        self.kf_preintegrator.reset(self.imu_bias);
        frame.reference_kf = Some(kf_id);
    }

    /// State update and bookkeeping shared by every path of a cycle.
    fn finish(
        &mut self,
        frame: Frame,
        outcome: CycleOutcome,
        metrics: TrackingMetrics,
        t_start: Instant,
        t_track: Instant,
        extract_ms: f64,
    ) -> TrackingResult {
        let next = self.state.next(outcome);
        if next != self.state {
            info!("[Tracking] frame {}: {} -> {}", frame.id, self.state, next);
        }
        self.state = next;

        let tracked = next == TrackingState::Ok;
        let pose = if tracked { frame.pose().copied() } else { None };
        let timing = Self::timing(t_start, t_track, extract_ms);
        let result = TrackingResult {
            frame_id: frame.id,
            timestamp: frame.timestamp,
            state: next,
            pose,
            reference_kf_id: self.reference_kf,
            metrics,
            timing,
        };

        if matches!(
            outcome,
            CycleOutcome::EmptyFrame | CycleOutcome::OutOfOrder | CycleOutcome::ImuMissing
        ) {
            return result;
        }
        self.last_processed_state = next;
        self.last_inliers = result.metrics.n_inliers;

        match (self.last_frame.as_ref().and_then(Frame::pose), pose.as_ref()) {
            (Some(last_t_cw), Some(t_cw)) if outcome == CycleOutcome::Tracked => {
                self.motion_model.update(last_t_cw, t_cw);
            }
            _ => self.motion_model.reset(),
        }
        self.last_frame = Some(frame);

        self.send_event(TrackingEvent::FrameTracked {
            frame_id: result.frame_id,
            timestamp: result.timestamp,
            state: next,
            pose,
            n_inliers: result.metrics.n_inliers,
        });
        result
    }

    fn timing(t_start: Instant, t_track: Instant, extract_ms: f64) -> TimingStats {
        TimingStats {
            total_ms: t_start.elapsed().as_secs_f64() * 1000.0,
            extract_ms,
            track_ms: t_track.elapsed().as_secs_f64() * 1000.0,
        }
    }

    fn send_event(&self, event: TrackingEvent) {
        if let Some(sender) = &self.event_sender {
            if sender.try_send(event).is_err() {
                debug!("[Tracking] event queue full, event dropped");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Control
    // ─────────────────────────────────────────────────────────────────────────

    /// Drop the map and all session state and start over from
    /// `NoImagesYet`. Keyframes still queued for Local Mapping belong to the
    /// old epoch and are discarded there.
    pub fn reset(&mut self) {
        let epoch = self.shared.reset_map();
        info!("[Tracking] reset, map epoch {}", epoch);
        self.state = TrackingState::NoImagesYet;
        self.last_processed_state = TrackingState::NoImagesYet;
        self.last_frame = None;
        self.reference_kf = None;
        self.last_keyframe = None;
        self.last_kf_frame_id = 0;
        self.last_kf_timestamp = 0.0;
        self.last_reloc_frame_id = None;
        self.motion_model.reset();
        self.mono_init.reset();
        self.visual_odometry = false;
        self.imu_bias = ImuBias::zero();
        self.map_bias_adopted = false;
        self.preintegrator.reset(self.imu_bias);
        self.kf_preintegrator.reset(self.imu_bias);
        self.bias_window = None;
        self.force_keyframe = false;
        self.trajectory.clear();
        self.last_inliers = 0;
    }

    /// Localization mode: track against the map without proposing keyframes.
    pub fn set_only_tracking(&mut self, only_tracking: bool) {
        if only_tracking != self.only_tracking {
            info!("[Tracking] localization mode {}", if only_tracking { "on" } else { "off" });
        }
        self.only_tracking = only_tracking;
        if !only_tracking {
            self.visual_odometry = false;
        }
    }

    /// Replace the camera calibration. The context is rebuilt from the next
    /// image.
    pub fn change_calibration(&mut self, camera: CameraConfig) -> Result<()> {
        let config = TrackingConfig {
            camera,
            ..self.config.clone()
        };
        config.validate()?;
        self.config = config;
        self.calib = None;
        info!("[Tracking] calibration changed");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn calibration_context(&self) -> Option<&Arc<CalibrationContext>> {
        self.calib.as_ref()
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// `(timestamp, T_cw)` for every recorded frame, resolved against the
    /// current keyframe poses.
    pub fn absolute_trajectory(&self) -> Vec<(f64, Option<SE3>)> {
        let atlas = self.shared.atlas.read();
        self.trajectory.absolute_poses(atlas.active_map())
    }

    pub fn last_inliers(&self) -> usize {
        self.last_inliers
    }

    pub fn is_only_tracking(&self) -> bool {
        self.only_tracking
    }

    pub fn is_visual_odometry(&self) -> bool {
        self.visual_odometry
    }

    pub fn imu_bias(&self) -> &ImuBias {
        &self.imu_bias
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }
}
