//! Tracking `Frame` representation.
//!
//! A `Frame` is what the Tracker operates on: raw and undistorted keypoints
//! (index-parallel), descriptors, the spatial grid, per-keypoint stereo depth,
//! a Bag-of-Words vector and temporary associations to `MapPoint`s by id.

use std::sync::Arc;

use nalgebra::Vector3;

use crate::atlas::map::{KeyFrame, KeyFrameId, MapPoint, MapPointId};
use crate::geometry::SE3;
use crate::imu::{ImuBias, ImuSample, NavState, PreintegratedState};
use crate::tracking::frame::{
    compute_depth_from_rgbd, compute_stereo_matches, CalibrationContext, DepthImage, Descriptor,
    ExtractedFeatures, ImageBounds, KeyPoint, ScaleLevels, StereoDepth, StereoView,
};
use crate::vocabulary::{BowVector, FeatureVector, Vocabulary, FEATURE_VECTOR_LEVELS_UP};

/// Projection of a map point into a frame, cached for one tracking cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackView {
    pub u: f64,
    /// Projection into the virtual right camera.
    pub u_right: f64,
    pub v: f64,
    /// Predicted pyramid level.
    pub level: i32,
    /// Cosine between the viewing ray and the point's mean viewing direction.
    pub view_cos: f64,
}

/// Search radius multiplier for a viewing-angle cosine.
pub fn radius_by_viewing_cos(view_cos: f64) -> f64 {
    if view_cos > 0.998 {
        2.5
    } else {
        4.0
    }
}

/// Spatial grid over the undistorted image bounds.
///
/// The grid divides the valid region into GRID_COLS × GRID_ROWS cells, each
/// holding the indices of the keypoints that fall inside it. Keypoints
/// outside the bounds are not inserted.
#[derive(Debug, Clone)]
pub struct FeatureGrid {
    /// Row-major: cells[row * GRID_COLS + col]
    cells: Vec<Vec<usize>>,
    bounds: ImageBounds,
    grid_element_width_inv: f64,
    grid_element_height_inv: f64,
}

impl FeatureGrid {
    pub const GRID_COLS: usize = 64;
    pub const GRID_ROWS: usize = 48;

    /// Index undistorted keypoints.
    pub fn new(keypoints_un: &[KeyPoint], calib: &CalibrationContext) -> Self {
        let mut grid = Self {
            cells: vec![Vec::new(); Self::GRID_COLS * Self::GRID_ROWS],
            bounds: calib.bounds,
            grid_element_width_inv: calib.grid_element_width_inv,
            grid_element_height_inv: calib.grid_element_height_inv,
        };
        for (idx, kp) in keypoints_un.iter().enumerate() {
            if let Some((col, row)) = grid.cell_of(kp.x as f64, kp.y as f64) {
                grid.cells[row * Self::GRID_COLS + col].push(idx);
            }
        }
        grid
    }

    /// Grid with no cells filled, for frames without features.
    pub fn empty(calib: &CalibrationContext) -> Self {
        Self::new(&[], calib)
    }

    /// Cell containing a position, `None` outside the grid.
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.bounds.min_x) * self.grid_element_width_inv).floor();
        let row = ((y - self.bounds.min_y) * self.grid_element_height_inv).floor();
        if col < 0.0 || row < 0.0 || col >= Self::GRID_COLS as f64 || row >= Self::GRID_ROWS as f64 {
            return None;
        }
        Some((col as usize, row as usize))
    }

    /// Keypoints within the axis-aligned square of half side `r` around
    /// `(x, y)`, optionally restricted to octaves `[min_level, max_level]`.
    ///
    /// A negative `max_level` means no upper bound; the level test is skipped
    /// entirely when `min_level <= 0` and `max_level < 0`.
    pub fn get_features_in_area(
        &self,
        keypoints_un: &[KeyPoint],
        x: f64,
        y: f64,
        r: f64,
        min_level: i32,
        max_level: i32,
    ) -> Vec<usize> {
        let mut indices = Vec::new();

        let min_cell_x = ((x - self.bounds.min_x - r) * self.grid_element_width_inv).floor() as i64;
        if min_cell_x >= Self::GRID_COLS as i64 {
            return indices;
        }
        let max_cell_x = ((x - self.bounds.min_x + r) * self.grid_element_width_inv).ceil() as i64;
        if max_cell_x < 0 {
            return indices;
        }
        let min_cell_y = ((y - self.bounds.min_y - r) * self.grid_element_height_inv).floor() as i64;
        if min_cell_y >= Self::GRID_ROWS as i64 {
            return indices;
        }
        let max_cell_y = ((y - self.bounds.min_y + r) * self.grid_element_height_inv).ceil() as i64;
        if max_cell_y < 0 {
            return indices;
        }

        let min_cell_x = min_cell_x.max(0) as usize;
        let max_cell_x = max_cell_x.min(Self::GRID_COLS as i64 - 1) as usize;
        let min_cell_y = min_cell_y.max(0) as usize;
        let max_cell_y = max_cell_y.min(Self::GRID_ROWS as i64 - 1) as usize;

        let check_levels = min_level > 0 || max_level >= 0;

        for row in min_cell_y..=max_cell_y {
            for col in min_cell_x..=max_cell_x {
                for &idx in &self.cells[row * Self::GRID_COLS + col] {
                    let kp = &keypoints_un[idx];
                    if check_levels {
                        if kp.octave < min_level {
                            continue;
                        }
                        if max_level >= 0 && kp.octave > max_level {
                            continue;
                        }
                    }
                    let dx = kp.x as f64 - x;
                    let dy = kp.y as f64 - y;
                    if dx.abs() < r && dy.abs() < r {
                        indices.push(idx);
                    }
                }
            }
        }

        indices
    }

    /// Number of indexed keypoints.
    pub fn len(&self) -> usize {
        self.cells.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(Vec::is_empty)
    }
}

/// A frame being tracked (not yet a KeyFrame).
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    /// Seconds.
    pub timestamp: f64,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    pub keypoints: Vec<KeyPoint>,
    /// Same length and order as `keypoints`.
    pub keypoints_un: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    /// Virtual right-camera x, `-1` when there is no depth.
    pub u_right: Vec<f64>,
    /// Meters, `-1` when invalid.
    pub depth: Vec<f64>,
    pub grid: FeatureGrid,
    pub scale: Arc<ScaleLevels>,
    pub calib: Arc<CalibrationContext>,
    pub bow: Option<BowVector>,
    pub feature_vector: Option<FeatureVector>,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    pub map_points: Vec<Option<MapPointId>>,
    pub outliers: Vec<bool>,
    pub reference_kf: Option<KeyFrameId>,

    /// World-to-camera.
    t_cw: Option<SE3>,

    // ─────────────────────────────────────────────────────────────────────────
    // IMU Data
    // ─────────────────────────────────────────────────────────────────────────
    /// Samples received since the previous frame.
    pub imu_samples: Vec<ImuSample>,
    pub imu_bias: ImuBias,
    pub nav_state: Option<NavState>,
    pub preint_from_last_frame: Option<PreintegratedState>,
    pub preint_from_last_kf: Option<PreintegratedState>,
}

impl Frame {
    /// Build a frame from extracted features. Depth is left invalid.
    fn from_features(
        id: u64,
        timestamp: f64,
        features: ExtractedFeatures,
        scale: Arc<ScaleLevels>,
        calib: Arc<CalibrationContext>,
    ) -> Self {
        let n = features.keypoints.len();
        let keypoints_un = undistort_keypoints(&features.keypoints, &calib);
        let grid = if n == 0 {
            FeatureGrid::empty(&calib)
        } else {
            FeatureGrid::new(&keypoints_un, &calib)
        };
        Self {
            id,
            timestamp,
            keypoints: features.keypoints,
            keypoints_un,
            descriptors: features.descriptors,
            u_right: vec![-1.0; n],
            depth: vec![-1.0; n],
            grid,
            scale,
            calib,
            bow: None,
            feature_vector: None,
            map_points: vec![None; n],
            outliers: vec![false; n],
            reference_kf: None,
            t_cw: None,
            imu_samples: Vec::new(),
            imu_bias: ImuBias::zero(),
            nav_state: None,
            preint_from_last_frame: None,
            preint_from_last_kf: None,
        }
    }

    pub fn new_monocular(
        id: u64,
        timestamp: f64,
        features: ExtractedFeatures,
        scale: Arc<ScaleLevels>,
        calib: Arc<CalibrationContext>,
    ) -> Self {
        Self::from_features(id, timestamp, features, scale, calib)
    }

    /// Left features plus depth resolved against the right image.
    pub fn new_stereo(
        id: u64,
        timestamp: f64,
        left: ExtractedFeatures,
        right: &ExtractedFeatures,
        scale: Arc<ScaleLevels>,
        calib: Arc<CalibrationContext>,
    ) -> Self {
        let pyramid = left.pyramid.clone();
        let mut frame = Self::from_features(id, timestamp, left, scale, calib);
        if frame.is_empty() {
            return frame;
        }
        let StereoDepth { u_right, depth } = compute_stereo_matches(
            &StereoView {
                keypoints: &frame.keypoints,
                descriptors: &frame.descriptors,
                pyramid: &pyramid,
            },
            &StereoView {
                keypoints: &right.keypoints,
                descriptors: &right.descriptors,
                pyramid: &right.pyramid,
            },
            &frame.keypoints_un,
            &frame.scale,
            &frame.calib,
        );
        frame.u_right = u_right;
        frame.depth = depth;
        frame
    }

    /// Features plus depth read from a registered depth map.
    pub fn new_rgbd(
        id: u64,
        timestamp: f64,
        features: ExtractedFeatures,
        depth_map: &DepthImage,
        scale: Arc<ScaleLevels>,
        calib: Arc<CalibrationContext>,
    ) -> Self {
        let mut frame = Self::from_features(id, timestamp, features, scale, calib);
        if frame.is_empty() {
            return frame;
        }
        let StereoDepth { u_right, depth } =
            compute_depth_from_rgbd(&frame.keypoints, &frame.keypoints_un, depth_map, &frame.calib);
        frame.u_right = u_right;
        frame.depth = depth;
        frame
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    /// No keypoints were extracted.
    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pose
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_pose(&mut self, t_cw: SE3) {
        self.t_cw = Some(t_cw);
    }

    pub fn clear_pose(&mut self) {
        self.t_cw = None;
    }

    pub fn pose(&self) -> Option<&SE3> {
        self.t_cw.as_ref()
    }

    pub fn has_pose(&self) -> bool {
        self.t_cw.is_some()
    }

    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.t_cw.as_ref().map(SE3::camera_center)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Geometry
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_features_in_area(&self, x: f64, y: f64, r: f64, min_level: i32, max_level: i32) -> Vec<usize> {
        self.grid
            .get_features_in_area(&self.keypoints_un, x, y, r, min_level, max_level)
    }

    pub fn is_in_image(&self, u: f64, v: f64) -> bool {
        self.calib.bounds.contains(u, v)
    }

    /// Visibility of a map point from this frame's pose.
    ///
    /// Rejects points behind the camera, outside the image, outside the
    /// point's valid distance range, viewed at a cosine below
    /// `view_cos_limit` from its mean direction, or predicted at a level
    /// outside the pyramid.
    pub fn is_in_frustum(&self, mp: &MapPoint, view_cos_limit: f64) -> Option<TrackView> {
        let t_cw = self.t_cw.as_ref()?;
        let p_c = t_cw.transform_point(&mp.position);
        if p_c.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / p_c.z;
        let uv = self.calib.project(&p_c);
        if !self.is_in_image(uv.x, uv.y) {
            return None;
        }

        let po = mp.position - t_cw.camera_center();
        let dist = po.norm();
        if dist < mp.min_distance || dist > mp.max_distance {
            return None;
        }
        let view_cos = po.dot(&mp.normal) / dist;
        if view_cos < view_cos_limit {
            return None;
        }

        let level = mp.predict_scale(dist, &self.scale);
        if level < 0 || level >= self.scale.n_levels as i32 {
            return None;
        }

        Some(TrackView {
            u: uv.x,
            u_right: uv.x - self.calib.bf * inv_z,
            v: uv.y,
            level,
            view_cos,
        })
    }

    /// World position of keypoint `i` from its depth, given a pose.
    pub fn unproject_stereo(&self, i: usize) -> Option<Vector3<f64>> {
        let z = *self.depth.get(i)?;
        if z <= 0.0 {
            return None;
        }
        let kp = &self.keypoints_un[i];
        let p_c = self.calib.unproject(kp.x as f64, kp.y as f64, z);
        Some(self.t_cw.as_ref()?.inverse().transform_point(&p_c))
    }

    /// Compute BoW and feature vectors once.
    pub fn compute_bow(&mut self, vocabulary: &dyn Vocabulary) {
        if self.bow.is_some() {
            return;
        }
        let (bow, fv) = vocabulary.transform(&self.descriptors, FEATURE_VECTOR_LEVELS_UP);
        self.bow = Some(bow);
        self.feature_vector = Some(fv);
    }

    /// Drop associations flagged as outliers. Returns how many were dropped.
    pub fn discard_outliers(&mut self) -> usize {
        let mut n = 0;
        for (mp, outlier) in self.map_points.iter_mut().zip(self.outliers.iter_mut()) {
            if *outlier && mp.is_some() {
                *mp = None;
                n += 1;
            }
            *outlier = false;
        }
        n
    }

    pub fn num_matches(&self) -> usize {
        self.map_points.iter().filter(|mp| mp.is_some()).count()
    }

    pub fn reset_matches(&mut self) {
        self.map_points.iter_mut().for_each(|mp| *mp = None);
        self.outliers.iter_mut().for_each(|o| *o = false);
    }

    /// Promote to a keyframe with a reserved id. `None` without a pose.
    ///
    /// Associations are not copied; they are made through the map so that
    /// observations and covisibility stay consistent.
    pub fn to_keyframe(&self, id: KeyFrameId) -> Option<KeyFrame> {
        let t_cw = *self.t_cw.as_ref()?;
        let mut kf = KeyFrame::new(
            id,
            self.id,
            self.timestamp,
            t_cw,
            self.keypoints_un.clone(),
            self.descriptors.clone(),
            self.u_right.clone(),
            self.depth.clone(),
            Arc::clone(&self.scale),
            Arc::clone(&self.calib),
        );
        kf.bow = self.bow.clone().unwrap_or_default();
        kf.feature_vector = self.feature_vector.clone().unwrap_or_default();
        kf.nav_state = self.nav_state;
        kf.imu_preintegrated = self.preint_from_last_kf.clone();
        Some(kf)
    }
}

fn undistort_keypoints(keypoints: &[KeyPoint], calib: &CalibrationContext) -> Vec<KeyPoint> {
    if !calib.is_distorted() {
        return keypoints.to_vec();
    }
    keypoints
        .iter()
        .map(|kp| {
            let (u, v) = calib.undistort_point(kp.x as f64, kp.y as f64);
            kp.with_position(u as f32, v as f32)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::KeyFrameId;
    use crate::config::CameraConfig;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn calib() -> Arc<CalibrationContext> {
        let cam = CameraConfig {
            fx: 400.0,
            fy: 400.0,
            cx: 320.0,
            cy: 240.0,
            bf: 40.0,
            ..CameraConfig::default()
        };
        Arc::new(CalibrationContext::new(&cam, 640, 480))
    }

    fn frame_with(keypoints: Vec<KeyPoint>) -> Frame {
        let n = keypoints.len();
        let features = ExtractedFeatures {
            keypoints,
            descriptors: vec![[0u8; 32]; n],
            pyramid: Vec::new(),
        };
        Frame::new_monocular(0, 0.0, features, Arc::new(ScaleLevels::default()), calib())
    }

    #[test]
    fn test_grid_matches_linear_scan() {
        let mut rng = StdRng::seed_from_u64(7);
        let kps: Vec<KeyPoint> = (0..400)
            .map(|_| KeyPoint::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0), rng.gen_range(0..8)))
            .collect();
        let frame = frame_with(kps.clone());

        for _ in 0..200 {
            let x = rng.gen_range(-20.0..660.0);
            let y = rng.gen_range(-20.0..500.0);
            let r = rng.gen_range(1.0..80.0);
            let (min_level, max_level) = match rng.gen_range(0..3) {
                0 => (0, -1),
                1 => (2, -1),
                _ => (1, 4),
            };
            let mut got = frame.get_features_in_area(x, y, r, min_level, max_level);
            got.sort_unstable();
            let expected: Vec<usize> = kps
                .iter()
                .enumerate()
                .filter(|(_, kp)| {
                    let in_box = (kp.x as f64 - x).abs() < r && (kp.y as f64 - y).abs() < r;
                    let level_ok = kp.octave >= min_level && (max_level < 0 || kp.octave <= max_level);
                    in_box && level_ok
                })
                .map(|(i, _)| i)
                .collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn test_out_of_bounds_keypoint_not_indexed() {
        let frame = frame_with(vec![KeyPoint::new(10.0, 10.0, 0), KeyPoint::new(700.0, 10.0, 0)]);
        assert_eq!(frame.grid.len(), 1);
        assert_eq!(frame.keypoints_un.len(), frame.keypoints.len());
        assert!(frame.get_features_in_area(700.0, 10.0, 50.0, 0, -1).is_empty());
    }

    #[test]
    fn test_empty_frame() {
        let frame = frame_with(Vec::new());
        assert!(frame.is_empty());
        assert!(frame.grid.is_empty());
        assert!(frame.get_features_in_area(320.0, 240.0, 1000.0, 0, -1).is_empty());
    }

    fn map_point_at(position: Vector3<f64>) -> MapPoint {
        let mut mp = MapPoint::new(MapPointId::new(1), position, [0u8; 32], KeyFrameId::new(0));
        mp.normal = Vector3::new(0.0, 0.0, 1.0);
        mp.max_distance = 10.0;
        mp.min_distance = 10.0 / 1.2f64.powi(7);
        mp
    }

    #[test]
    fn test_frustum_round_trip() {
        let mut frame = frame_with(Vec::new());
        frame.set_pose(SE3::identity());
        let mp = map_point_at(Vector3::new(0.5, -0.2, 5.0));

        let view = frame.is_in_frustum(&mp, 0.5).unwrap();
        let expected = frame.calib.project(&mp.position);
        assert_relative_eq!(view.u, expected.x, epsilon = 1e-9);
        assert_relative_eq!(view.v, expected.y, epsilon = 1e-9);
        assert_relative_eq!(view.u - view.u_right, 40.0 / 5.0, epsilon = 1e-9);

        let far = map_point_at(Vector3::new(0.5, -0.2, 12.0));
        assert!(frame.is_in_frustum(&far, 0.5).is_none());
        let behind = map_point_at(Vector3::new(0.0, 0.0, -3.0));
        assert!(frame.is_in_frustum(&behind, 0.5).is_none());
    }

    #[test]
    fn test_unproject_stereo() {
        let mut frame = frame_with(vec![KeyPoint::new(420.0, 240.0, 0)]);
        frame.depth[0] = 2.0;
        assert!(frame.unproject_stereo(0).is_none());
        frame.set_pose(SE3::identity());
        assert_relative_eq!(frame.unproject_stereo(0).unwrap(), Vector3::new(0.5, 0.0, 2.0), epsilon = 1e-9);
    }
}
