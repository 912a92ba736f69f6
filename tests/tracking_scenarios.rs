//! End-to-end tracking scenarios on a synthetic scene.
//!
//! A scripted extractor hands the tracker exact projections of a fixed point
//! cloud, so every scenario is deterministic.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use approx::assert_relative_eq;
use crossbeam_channel::{bounded, Receiver};
use image::{GrayImage, Luma};
use nalgebra::{Matrix3, Vector3};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use orbslam_frontend::config::{CameraConfig, ImuConfig, SensorType, TrackingConfig};
use orbslam_frontend::geometry::SE3;
use orbslam_frontend::imu::{ImuSample, GRAVITY};
use orbslam_frontend::local_mapping::LocalMapper;
use orbslam_frontend::system::{keyframe_channel, NewKeyFrameMsg, SharedState, TrackingEvent};
use orbslam_frontend::tracking::frame::{
    Descriptor, DepthImage, ExtractedFeatures, FeatureExtractor, KeyPoint, ScaleLevels,
};
use orbslam_frontend::tracking::{Tracker, TrackingState, TrackingStrategy};
use orbslam_frontend::vocabulary::OrbVocabulary;

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

// ─────────────────────────────────────────────────────────────────────────────
// Synthetic Scene
// ─────────────────────────────────────────────────────────────────────────────

struct Scene {
    points: Vec<Vector3<f64>>,
    descriptors: Vec<Descriptor>,
}

impl Scene {
    /// 20x15 grid of points between 2.0 and 3.4 m in front of the origin.
    fn grid() -> Self {
        Self::build(20, 15, |rng| 2.0 + 1.4 * rng.gen::<f64>())
    }

    /// 30x20 grid over the same field of view.
    fn dense() -> Self {
        Self::build(30, 20, |rng| 2.0 + 1.4 * rng.gen::<f64>())
    }

    /// The 20x15 grid on a fronto-parallel plane, so every point has the
    /// same stereo disparity.
    fn plane(z: f64) -> Self {
        Self::build(20, 15, |_| z)
    }

    fn build(cols: usize, rows: usize, mut depth: impl FnMut(&mut StdRng) -> f64) -> Self {
        let mut rng = StdRng::seed_from_u64(7);
        let mut points = Vec::new();
        let mut descriptors = Vec::new();
        for iy in 0..rows {
            for ix in 0..cols {
                let z = depth(&mut rng);
                let x = (-1.0 + 2.0 * ix as f64 / (cols - 1) as f64) * 0.9 * z / 2.0;
                let y = (-1.0 + 2.0 * iy as f64 / (rows - 1) as f64) * 0.7 * z / 2.0;
                points.push(Vector3::new(x, y, z));
                descriptors.push(random_descriptor(&mut rng));
            }
        }
        Self { points, descriptors }
    }

    /// Keypoints and depth map seen from `t_cw`.
    fn render(&self, t_cw: &SE3) -> (ExtractedFeatures, DepthImage) {
        self.render_where(t_cw, |_| true)
    }

    /// Render only the points whose index passes `keep`.
    fn render_where(&self, t_cw: &SE3, keep: impl Fn(usize) -> bool) -> (ExtractedFeatures, DepthImage) {
        let mut features = ExtractedFeatures::default();
        let mut depth = DepthImage::new(WIDTH, HEIGHT);
        for (i, (p_w, desc)) in self.points.iter().zip(&self.descriptors).enumerate() {
            if !keep(i) {
                continue;
            }
            let p_c = t_cw.transform_point(p_w);
            if p_c.z <= 0.0 {
                continue;
            }
            let u = 400.0 * p_c.x / p_c.z + 320.0;
            let v = 400.0 * p_c.y / p_c.z + 240.0;
            if u < 1.0 || v < 1.0 || u >= (WIDTH - 1) as f64 || v >= (HEIGHT - 1) as f64 {
                continue;
            }
            features.keypoints.push(KeyPoint::new(u as f32, v as f32, 0));
            features.descriptors.push(*desc);
            depth.put_pixel(u as f32 as u32, v as f32 as u32, image::Luma([p_c.z as f32]));
        }
        (features, depth)
    }

    /// Same keypoints with descriptors unrelated to the scene.
    fn render_unrelated(&self, t_cw: &SE3) -> (ExtractedFeatures, DepthImage) {
        let (mut features, depth) = self.render(t_cw);
        let mut rng = StdRng::seed_from_u64(99);
        for desc in features.descriptors.iter_mut() {
            *desc = random_descriptor(&mut rng);
        }
        (features, depth)
    }

    /// Left and right features of a rectified pair with `disparity` pixels
    /// between them, on integer pixel positions, with textured pyramids.
    fn render_stereo(&self, t_cw: &SE3, disparity: u32) -> (ExtractedFeatures, ExtractedFeatures) {
        let (mut left, _) = self.render(t_cw);
        for kp in left.keypoints.iter_mut() {
            *kp = kp.with_position(kp.x.round(), kp.y.round());
        }
        let mut right = left.clone();
        for kp in right.keypoints.iter_mut() {
            kp.x -= disparity as f32;
        }
        left.pyramid = vec![texture(0)];
        right.pyramid = vec![texture(disparity)];
        (left, right)
    }

    fn vocabulary(&self) -> Arc<OrbVocabulary> {
        Arc::new(OrbVocabulary::flat(&self.descriptors))
    }
}

fn random_descriptor(rng: &mut StdRng) -> Descriptor {
    let mut desc = [0u8; 32];
    rng.fill(&mut desc[..]);
    desc
}

/// Hashed texture shifted left by `offset` columns.
fn texture(offset: u32) -> GrayImage {
    GrayImage::from_fn(WIDTH, HEIGHT, |x, y| {
        let h = (x + offset).wrapping_mul(0x9E37_79B1) ^ y.wrapping_mul(0x85EB_CA77);
        Luma([(h.rotate_left(13).wrapping_mul(0xC2B2_AE3D) >> 24) as u8])
    })
}

/// Samples of a static body between two frames: the accelerometer reads the
/// reaction to gravity and the gyro reads `gyro`.
fn static_imu(t0: f64, t1: f64, gyro: Vector3<f64>) -> Vec<ImuSample> {
    (1..=5)
        .map(|k| ImuSample::new(t0 + (t1 - t0) * k as f64 / 5.0, -GRAVITY, gyro))
        .collect()
}

/// Camera displaced by `x` meters along its own x axis.
fn shifted(x: f64) -> SE3 {
    SE3::from_rt(Matrix3::identity(), Vector3::new(-x, 0.0, 0.0))
}

/// Extractor that returns whatever the test queued last.
struct ScriptedExtractor {
    queue: Arc<Mutex<VecDeque<ExtractedFeatures>>>,
    scale: ScaleLevels,
}

impl FeatureExtractor for ScriptedExtractor {
    fn extract(&mut self, _image: &GrayImage) -> Result<ExtractedFeatures> {
        Ok(self.queue.lock().pop_front().unwrap_or_default())
    }

    fn scale_levels(&self) -> &ScaleLevels {
        &self.scale
    }
}

fn scripted() -> (Box<dyn FeatureExtractor>, Arc<Mutex<VecDeque<ExtractedFeatures>>>) {
    let queue = Arc::new(Mutex::new(VecDeque::new()));
    let extractor = ScriptedExtractor {
        queue: Arc::clone(&queue),
        scale: ScaleLevels::default(),
    };
    (Box::new(extractor), queue)
}

fn camera() -> CameraConfig {
    CameraConfig {
        fx: 400.0,
        fy: 400.0,
        cx: 320.0,
        cy: 240.0,
        bf: 40.0,
        ..Default::default()
    }
}

fn config(sensor: SensorType) -> TrackingConfig {
    TrackingConfig {
        sensor,
        camera: camera(),
        stereo_init_min_features: 100,
        ..Default::default()
    }
}

/// RGB-D with inertial fusion, body frame on the camera.
fn inertial_config() -> TrackingConfig {
    TrackingConfig {
        imu: Some(ImuConfig::default()),
        ..config(SensorType::Rgbd)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

struct Harness {
    scene: Scene,
    tracker: Tracker,
    queue: Arc<Mutex<VecDeque<ExtractedFeatures>>>,
    keyframes: Receiver<NewKeyFrameMsg>,
    events: Receiver<TrackingEvent>,
    image: GrayImage,
    timestamp: f64,
    /// Timestamp the last IMU batch ran up to.
    imu_timestamp: f64,
}

impl Harness {
    fn new(sensor: SensorType) -> Self {
        Self::with_config(config(sensor))
    }

    fn with_config(config: TrackingConfig) -> Self {
        Self::with_scene(config, Scene::grid())
    }

    fn with_scene(config: TrackingConfig, scene: Scene) -> Self {
        let (extractor, queue) = scripted();
        let (kf_sender, keyframes) = keyframe_channel();
        let (event_sender, events) = bounded(64);
        let tracker = Tracker::new(
            config,
            extractor,
            None,
            scene.vocabulary(),
            SharedState::new(),
            kf_sender,
        )
        .unwrap()
        .with_event_sender(event_sender);
        Self {
            scene,
            tracker,
            queue,
            keyframes,
            events,
            image: GrayImage::new(WIDTH, HEIGHT),
            timestamp: 0.0,
            imu_timestamp: 0.0,
        }
    }

    fn grab_rgbd(&mut self, rendered: (ExtractedFeatures, DepthImage)) -> orbslam_frontend::tracking::TrackingResult {
        let (features, depth) = rendered;
        self.queue.lock().push_back(features);
        self.timestamp += 1.0 / 30.0;
        self.tracker
            .grab_image_rgbd(&self.image, &depth, self.timestamp, &[])
            .unwrap()
    }

    /// RGB-D frame with the IMU samples of a static body since the last batch.
    fn grab_rgbd_inertial(
        &mut self,
        rendered: (ExtractedFeatures, DepthImage),
        gyro: Vector3<f64>,
    ) -> orbslam_frontend::tracking::TrackingResult {
        let (features, depth) = rendered;
        self.queue.lock().push_back(features);
        self.timestamp += 1.0 / 30.0;
        let imu = static_imu(self.imu_timestamp, self.timestamp, gyro);
        self.imu_timestamp = self.timestamp;
        self.tracker
            .grab_image_rgbd(&self.image, &depth, self.timestamp, &imu)
            .unwrap()
    }

    fn grab_mono(&mut self, features: ExtractedFeatures) -> orbslam_frontend::tracking::TrackingResult {
        self.queue.lock().push_back(features);
        self.timestamp += 1.0 / 30.0;
        self.tracker
            .grab_image_monocular(&self.image, self.timestamp, &[])
            .unwrap()
    }

    fn drain_events(&self) -> Vec<TrackingEvent> {
        self.events.try_iter().collect()
    }

    /// Insert every proposed keyframe, as the mapping thread would.
    fn run_mapping(&self, mapper: &mut LocalMapper) {
        let shared = Arc::clone(self.tracker.shared());
        while let Ok(msg) = self.keyframes.try_recv() {
            mapper.process_keyframe(msg, &shared);
        }
    }

    fn num_keyframes(&self) -> usize {
        self.tracker.shared().atlas.read().num_keyframes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_empty_frame_is_skipped() {
    let mut h = Harness::new(SensorType::Rgbd);
    let result = h.grab_rgbd((ExtractedFeatures::default(), DepthImage::new(WIDTH, HEIGHT)));

    assert_eq!(result.state, TrackingState::NoImagesYet);
    assert!(result.pose.is_none());
    assert!(h.tracker.last_frame().is_none());
    assert!(h.tracker.trajectory().is_empty());
    assert_eq!(h.tracker.shared().atlas.read().num_keyframes(), 0);
}

#[test]
fn test_sparse_frame_waits_for_initialization() {
    let mut h = Harness::new(SensorType::Rgbd);
    let (mut features, depth) = h.scene.render(&SE3::identity());
    features.keypoints.truncate(50);
    features.descriptors.truncate(50);

    let result = h.grab_rgbd((features, depth));
    assert_eq!(result.state, TrackingState::NotInitialized);
    assert!(result.pose.is_none());
    assert!(h.tracker.trajectory().is_empty());
}

#[test]
fn test_rgbd_initialization_builds_map() {
    let mut h = Harness::new(SensorType::Rgbd);
    let rendered = h.scene.render(&SE3::identity());
    let n_features = rendered.0.len();

    let result = h.grab_rgbd(rendered);
    assert_eq!(result.state, TrackingState::Ok);
    let pose = result.pose.unwrap();
    assert_relative_eq!(pose.translation, Vector3::zeros(), epsilon = 1e-12);
    assert!(result.reference_kf_id.is_some());

    let atlas = h.tracker.shared().atlas.read();
    assert_eq!(atlas.num_keyframes(), 1);
    assert_eq!(atlas.active_map().num_map_points(), n_features);
    drop(atlas);

    assert_eq!(h.tracker.trajectory().len(), 1);
    let events = h.drain_events();
    assert!(matches!(
        events.as_slice(),
        [TrackingEvent::FrameTracked { state: TrackingState::Ok, .. }]
    ));
}

#[test]
fn test_tracks_static_camera_against_map() {
    let mut h = Harness::new(SensorType::Rgbd);
    h.grab_rgbd(h.scene.render(&SE3::identity()));

    let second = h.grab_rgbd(h.scene.render(&SE3::identity()));
    assert_eq!(second.state, TrackingState::Ok);
    assert_eq!(second.metrics.strategy, Some(TrackingStrategy::ReferenceKeyFrame));
    assert!(second.metrics.n_inliers >= 30);
    let pose = second.pose.unwrap();
    assert_relative_eq!(pose.translation, Vector3::zeros(), epsilon = 1e-3);

    // The motion model is available once a frame was tracked.
    let third = h.grab_rgbd(h.scene.render(&SE3::identity()));
    assert_eq!(third.state, TrackingState::Ok);
    assert_eq!(third.metrics.strategy, Some(TrackingStrategy::MotionModel));

    let poses = h.tracker.absolute_trajectory();
    assert_eq!(poses.len(), 3);
    assert!(poses.iter().all(|(_, p)| p.is_some()));
    assert!(h.keyframes.try_recv().is_err());
}

#[test]
fn test_early_loss_resets_map() {
    let mut h = Harness::new(SensorType::Rgbd);
    h.grab_rgbd(h.scene.render(&SE3::identity()));
    let epoch = h.tracker.shared().map_epoch();
    h.drain_events();

    let lost = h.grab_rgbd(h.scene.render_unrelated(&SE3::identity()));
    assert_eq!(lost.state, TrackingState::NoImagesYet);
    assert!(lost.pose.is_none());
    assert_eq!(h.tracker.state(), TrackingState::NoImagesYet);
    assert_eq!(h.tracker.shared().atlas.read().num_keyframes(), 0);
    assert_eq!(h.tracker.shared().map_epoch(), epoch + 1);
    assert!(h.tracker.trajectory().is_empty());
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, TrackingEvent::ResetRequested)));

    // A new map is bootstrapped from the next good frame.
    let again = h.grab_rgbd(h.scene.render(&SE3::identity()));
    assert_eq!(again.state, TrackingState::Ok);
    assert_eq!(h.tracker.shared().atlas.read().num_keyframes(), 1);
}

#[test]
fn test_localization_mode_relocalizes_after_loss() {
    let mut h = Harness::new(SensorType::Rgbd);
    h.grab_rgbd(h.scene.render(&SE3::identity()));
    h.tracker.set_only_tracking(true);

    let lost = h.grab_rgbd(h.scene.render_unrelated(&SE3::identity()));
    assert_eq!(lost.state, TrackingState::Lost);
    assert!(lost.pose.is_none());
    assert!(!lost.metrics.relocalization_attempted);
    assert_eq!(h.tracker.shared().atlas.read().num_keyframes(), 1);

    let recovered = h.grab_rgbd(h.scene.render(&shifted(0.02)));
    assert!(recovered.metrics.relocalization_attempted);
    assert_eq!(recovered.state, TrackingState::Ok);
    let pose = recovered.pose.unwrap();
    assert_relative_eq!(pose.translation.x, -0.02, epsilon = 1e-2);
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, TrackingEvent::Relocalized { .. })));
    // Localization mode never proposes keyframes.
    assert!(h.keyframes.try_recv().is_err());
}

#[test]
fn test_monocular_initialization_from_two_views() {
    let mut h = Harness::new(SensorType::Monocular);
    let (first, _) = h.scene.render(&SE3::identity());
    let result = h.grab_mono(first);
    assert_eq!(result.state, TrackingState::NotInitialized);
    assert!(result.pose.is_none());

    let (second, _) = h.scene.render(&shifted(0.2));
    let result = h.grab_mono(second);
    assert_eq!(result.state, TrackingState::Ok);
    assert!(result.pose.is_some());
    assert_eq!(h.tracker.shared().atlas.read().num_keyframes(), 2);
}

#[test]
fn test_queued_keyframe_from_reset_epoch_is_dropped() {
    let scene = Scene::grid();
    let shared = SharedState::new();
    let (kf_sender, kf_receiver) = keyframe_channel();
    let (extractor, queue) = scripted();
    let mut tracker = Tracker::new(
        config(SensorType::Rgbd),
        extractor,
        None,
        scene.vocabulary(),
        Arc::clone(&shared),
        kf_sender,
    )
    .unwrap();

    let (features, depth) = scene.render(&SE3::identity());
    queue.lock().push_back(features);
    tracker
        .grab_image_rgbd(&GrayImage::new(WIDTH, HEIGHT), &depth, 0.0, &[])
        .unwrap();

    let kf = {
        let atlas = shared.atlas.read();
        let id = atlas.active_map().last_keyframe_id().unwrap();
        atlas.active_map().get_keyframe(id).unwrap().clone()
    };
    let stale = NewKeyFrameMsg {
        matched_map_points: vec![None; kf.keypoints_un.len()],
        keyframe: kf,
        epoch: shared.map_epoch(),
    };
    tracker.reset();

    let mut mapper = LocalMapper::new();
    assert_eq!(mapper.process_keyframe(stale, &shared), None);
    assert_eq!(shared.atlas.read().num_keyframes(), 0);
    assert!(kf_receiver.try_recv().is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// Construction and Input Errors
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_invalid_configuration_rejected() {
    let scene = Scene::grid();
    let (kf_sender, _rx) = keyframe_channel();

    let mut bad = config(SensorType::Rgbd);
    bad.camera.bf = 0.0;
    let (extractor, _) = scripted();
    assert!(Tracker::new(bad, extractor, None, scene.vocabulary(), SharedState::new(), kf_sender.clone()).is_err());

    let mut bad = config(SensorType::Monocular);
    bad.camera.fx = -1.0;
    let (extractor, _) = scripted();
    assert!(Tracker::new(bad, extractor, None, scene.vocabulary(), SharedState::new(), kf_sender.clone()).is_err());

    let (extractor, _) = scripted();
    let stereo = Tracker::new(
        config(SensorType::Stereo),
        extractor,
        None,
        scene.vocabulary(),
        SharedState::new(),
        kf_sender,
    );
    assert!(stereo.is_err());
}

#[test]
fn test_input_for_other_sensor_rejected() {
    let mut h = Harness::new(SensorType::Rgbd);
    let image = GrayImage::new(WIDTH, HEIGHT);
    assert!(h.tracker.grab_image_monocular(&image, 0.0, &[]).is_err());
    assert!(h.tracker.grab_image_stereo(&image, &image, 0.0, &[]).is_err());
    assert_eq!(h.tracker.state(), TrackingState::NoImagesYet);
}

#[test]
fn test_calibration_change_rebuilds_context() {
    let mut h = Harness::new(SensorType::Rgbd);
    h.grab_rgbd(h.scene.render(&SE3::identity()));
    assert!(h.tracker.calibration_context().is_some());

    let bad = CameraConfig { fx: 0.0, ..camera() };
    assert!(h.tracker.change_calibration(bad).is_err());
    assert!(h.tracker.calibration_context().is_some());

    let wider = CameraConfig { bf: 80.0, ..camera() };
    h.tracker.change_calibration(wider).unwrap();
    assert!(h.tracker.calibration_context().is_none());
    h.grab_rgbd(h.scene.render(&SE3::identity()));
    let calib = h.tracker.calibration_context().unwrap();
    assert_relative_eq!(calib.mb, 0.2, epsilon = 1e-12);
}

#[test]
fn test_extractor_without_pyramid_levels_rejected() {
    let scene = Scene::grid();
    let (kf_sender, _rx) = keyframe_channel();

    let flat = ScriptedExtractor {
        queue: Arc::new(Mutex::new(VecDeque::new())),
        scale: ScaleLevels {
            n_levels: 0,
            scale_factors: Vec::new(),
            inv_scale_factors: Vec::new(),
            level_sigma2: Vec::new(),
            inv_level_sigma2: Vec::new(),
            ..ScaleLevels::default()
        },
    };
    let tracker = Tracker::new(
        config(SensorType::Rgbd),
        Box::new(flat),
        None,
        scene.vocabulary(),
        SharedState::new(),
        kf_sender.clone(),
    );
    assert!(tracker.is_err());

    // Both sides of a stereo pair must use one pyramid.
    let (left, _) = scripted();
    let shallow = ScriptedExtractor {
        queue: Arc::new(Mutex::new(VecDeque::new())),
        scale: ScaleLevels::new(4, 1.2).unwrap(),
    };
    let stereo = Tracker::new(
        config(SensorType::Stereo),
        left,
        Some(Box::new(shallow)),
        scene.vocabulary(),
        SharedState::new(),
        kf_sender,
    );
    assert!(stereo.is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame Order and Relocalization
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_out_of_order_frame_is_skipped() {
    let mut h = Harness::new(SensorType::Rgbd);
    h.grab_rgbd(h.scene.render(&SE3::identity()));
    h.grab_rgbd(h.scene.render(&SE3::identity()));
    let last_id = h.tracker.last_frame().unwrap().id;
    h.drain_events();

    let (features, depth) = h.scene.render(&SE3::identity());
    h.queue.lock().push_back(features);
    let stale = h
        .tracker
        .grab_image_rgbd(&h.image, &depth, h.timestamp - 0.5, &[])
        .unwrap();
    assert_eq!(stale.state, TrackingState::Ok);
    assert!(stale.pose.is_none());
    assert_eq!(h.tracker.last_frame().unwrap().id, last_id);
    assert_eq!(h.tracker.trajectory().len(), 2);
    assert!(h.drain_events().is_empty());

    // The next frame in order tracks with the motion model as before.
    let next = h.grab_rgbd(h.scene.render(&SE3::identity()));
    assert_eq!(next.state, TrackingState::Ok);
    assert_eq!(next.metrics.strategy, Some(TrackingStrategy::MotionModel));
    assert_eq!(h.tracker.trajectory().len(), 3);
}

#[test]
fn test_normal_mode_relocalizes_after_loss() {
    // The first 90 points are always in view. Each frame after the first adds
    // a batch of 80 unseen close points, which makes it a keyframe.
    const CORE: usize = 90;
    const BATCH: usize = 80;
    let batch = |k: usize| move |i: usize| i < CORE || (i >= CORE + k * BATCH && i < CORE + (k + 1) * BATCH);

    let config = TrackingConfig {
        stereo_init_min_features: 50,
        ..config(SensorType::Rgbd)
    };
    let mut h = Harness::with_scene(config, Scene::dense());
    h.tracker.shared().set_accept_keyframes(true);
    let mut mapper = LocalMapper::new();

    let init = h.grab_rgbd(h.scene.render_where(&SE3::identity(), |i| i < CORE));
    assert_eq!(init.state, TrackingState::Ok);
    for k in 0..6 {
        let result = h.grab_rgbd(h.scene.render_where(&SE3::identity(), batch(k)));
        assert_eq!(result.state, TrackingState::Ok);
        assert!(result.metrics.keyframe_created);
        h.run_mapping(&mut mapper);
    }
    let n_keyframes = h.num_keyframes();
    assert_eq!(n_keyframes, 7);
    h.drain_events();

    let lost = h.grab_rgbd(h.scene.render_unrelated(&SE3::identity()));
    assert_eq!(lost.state, TrackingState::Lost);
    assert!(lost.pose.is_none());
    assert!(!h
        .drain_events()
        .iter()
        .any(|e| matches!(e, TrackingEvent::ResetRequested)));
    assert_eq!(h.num_keyframes(), n_keyframes);
    assert_eq!(h.tracker.shared().map_epoch(), 0);

    let recovered = h.grab_rgbd(h.scene.render_where(&SE3::identity(), batch(0)));
    assert!(recovered.metrics.relocalization_attempted);
    assert_eq!(recovered.state, TrackingState::Ok);
    assert_relative_eq!(recovered.pose.unwrap().translation, Vector3::zeros(), epsilon = 1e-2);
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, TrackingEvent::Relocalized { .. })));
}

// ─────────────────────────────────────────────────────────────────────────────
// Stereo
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_stereo_pair_initializes_and_tracks() {
    let scene = Scene::plane(2.5);
    let (left, left_queue) = scripted();
    let (right, right_queue) = scripted();
    let (kf_sender, _keyframes) = keyframe_channel();
    let mut tracker = Tracker::new(
        config(SensorType::Stereo),
        left,
        Some(right),
        scene.vocabulary(),
        SharedState::new(),
        kf_sender,
    )
    .unwrap();
    let image = GrayImage::new(WIDTH, HEIGHT);

    // bf / z = 40 / 2.5
    let mut results = Vec::new();
    for i in 1..=3 {
        let (l, r) = scene.render_stereo(&SE3::identity(), 16);
        left_queue.lock().push_back(l);
        right_queue.lock().push_back(r);
        results.push(tracker.grab_image_stereo(&image, &image, i as f64 / 30.0, &[]).unwrap());
    }
    assert!(results.iter().all(|r| r.state == TrackingState::Ok));
    assert_eq!(results[2].metrics.strategy, Some(TrackingStrategy::MotionModel));
    assert_relative_eq!(results[2].pose.unwrap().translation, Vector3::zeros(), epsilon = 1e-3);

    let frame = tracker.last_frame().unwrap();
    let valid: Vec<f64> = frame.depth.iter().copied().filter(|&z| z > 0.0).collect();
    assert!(valid.len() >= 250);
    assert!(valid.iter().all(|z| (z - 2.5).abs() < 0.1));
    assert_eq!(
        tracker.shared().atlas.read().active_map().num_map_points(),
        valid.len()
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Inertial
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_inertial_frame_without_samples_waits() {
    let mut h = Harness::with_config(inertial_config());
    let first = h.grab_rgbd_inertial(h.scene.render(&SE3::identity()), Vector3::zeros());
    assert_eq!(first.state, TrackingState::Ok);
    assert!(h.tracker.last_frame().unwrap().preint_from_last_frame.is_none());

    let second = h.grab_rgbd_inertial(h.scene.render(&SE3::identity()), Vector3::zeros());
    assert_eq!(second.state, TrackingState::Ok);
    let preint = h.tracker.last_frame().unwrap().preint_from_last_frame.clone().unwrap();
    assert_relative_eq!(preint.dt, second.timestamp - first.timestamp, epsilon = 1e-9);
    assert_relative_eq!(preint.delta_vel, -GRAVITY * preint.dt, epsilon = 1e-9);
    let last_id = h.tracker.last_frame().unwrap().id;

    let missing = h.grab_rgbd(h.scene.render(&SE3::identity()));
    assert_eq!(missing.state, TrackingState::SystemNotReady);
    assert!(missing.pose.is_none());
    assert_eq!(h.tracker.last_frame().unwrap().id, last_id);
    assert_eq!(h.tracker.trajectory().len(), 2);

    // Tracking resumes, integrating over the skipped frame.
    let resumed = h.grab_rgbd_inertial(h.scene.render(&SE3::identity()), Vector3::zeros());
    assert_eq!(resumed.state, TrackingState::Ok);
    let preint = h.tracker.last_frame().unwrap().preint_from_last_frame.clone().unwrap();
    assert_relative_eq!(preint.dt, resumed.timestamp - second.timestamp, epsilon = 1e-9);

    // A keyframe follows the time gap, carrying the integration since the
    // first keyframe.
    for _ in 0..6 {
        if !h.keyframes.is_empty() {
            break;
        }
        h.grab_rgbd_inertial(h.scene.render(&SE3::identity()), Vector3::zeros());
    }
    let msg = h.keyframes.try_recv().unwrap();
    assert!(msg.keyframe.nav_state.is_some());
    assert!(msg.keyframe.timestamp - first.timestamp >= 0.1 - 1e-9);
    let preint = msg.keyframe.imu_preintegrated.unwrap();
    assert_relative_eq!(preint.dt, msg.keyframe.timestamp - first.timestamp, epsilon = 1e-9);
}

#[test]
fn test_inertial_map_initializes_and_predicts() {
    let mut h = Harness::with_config(inertial_config());
    let mut mapper = LocalMapper::new();

    let mut predicted = None;
    for _ in 0..90 {
        let result = h.grab_rgbd_inertial(h.scene.render(&SE3::identity()), Vector3::zeros());
        assert_eq!(result.state, TrackingState::Ok);
        h.run_mapping(&mut mapper);
        if result.metrics.strategy == Some(TrackingStrategy::ImuPrediction) {
            predicted = Some(result);
            break;
        }
    }
    let predicted = predicted.unwrap();
    assert_relative_eq!(predicted.pose.unwrap().translation, Vector3::zeros(), epsilon = 1e-3);
    assert!(predicted.metrics.n_inliers >= 30);

    let atlas = h.tracker.shared().atlas.read();
    assert!(atlas.active_map().is_imu_initialized());
    assert!(atlas.num_keyframes() >= 10);
    drop(atlas);
    assert_relative_eq!(h.tracker.imu_bias().gyro, Vector3::zeros(), epsilon = 1e-9);
}

#[test]
fn test_gyro_bias_refit_after_relocalization() {
    let gyro = Vector3::new(0.002, -0.001, 0.0015);
    let mut h = Harness::with_config(inertial_config());
    let mut mapper = LocalMapper::new();

    // Enough keyframes to survive a loss, too few for inertial initialization.
    for _ in 0..40 {
        if h.num_keyframes() >= 7 {
            break;
        }
        let result = h.grab_rgbd_inertial(h.scene.render(&SE3::identity()), gyro);
        assert_eq!(result.state, TrackingState::Ok);
        h.run_mapping(&mut mapper);
    }
    let n_keyframes = h.num_keyframes();
    assert!(n_keyframes >= 7);
    assert!(!h.tracker.shared().atlas.read().active_map().is_imu_initialized());

    let lost = h.grab_rgbd_inertial(h.scene.render_unrelated(&SE3::identity()), gyro);
    assert_eq!(lost.state, TrackingState::Lost);
    assert_eq!(h.num_keyframes(), n_keyframes);

    let recovered = h.grab_rgbd_inertial(h.scene.render(&SE3::identity()), gyro);
    assert!(recovered.metrics.relocalization_attempted);
    assert_eq!(recovered.state, TrackingState::Ok);
    assert_relative_eq!(h.tracker.imu_bias().gyro, Vector3::zeros(), epsilon = 1e-12);

    // Keyframes stay queued from here on, so the bias can only come from the
    // window collected after the relocalization.
    for _ in 0..25 {
        let result = h.grab_rgbd_inertial(h.scene.render(&SE3::identity()), gyro);
        assert_eq!(result.state, TrackingState::Ok);
    }
    assert!(!h.tracker.shared().atlas.read().active_map().is_imu_initialized());
    assert_relative_eq!(h.tracker.imu_bias().gyro, gyro, epsilon = 1e-6);
}
