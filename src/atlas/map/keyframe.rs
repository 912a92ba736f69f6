//! KeyFrame - A frame promoted to permanent map membership.
//!
//! KeyFrames are the nodes of the SLAM graph. They contain:
//! - Undistorted features with stereo depth, and the BoW representation
//! - Pose estimate (T_cw) and optional inertial state
//! - Graph relationships (covisibility, spanning tree)
//!
//! The covisibility graph connects KeyFrames that share MapPoint observations.
//! The best-covisibles order is kept up to date on every edge change so it can
//! be read through a shared map guard.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::imu::{NavState, PreintegratedState};
use crate::tracking::frame::{CalibrationContext, Descriptor, KeyPoint, ScaleLevels};
use crate::vocabulary::{BowVector, FeatureVector};

use super::types::{KeyFrameId, MapPointId};

/// A KeyFrame in the SLAM map.
#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,
    /// Id of the frame this keyframe was built from.
    pub frame_id: u64,
    /// Seconds.
    pub timestamp: f64,

    /// World-to-camera transform.
    pub t_cw: SE3,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    pub keypoints_un: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    /// `-1` where no depth is available.
    pub u_right: Vec<f64>,
    pub depth: Vec<f64>,
    pub scale: Arc<ScaleLevels>,
    pub calib: Arc<CalibrationContext>,
    pub bow: BowVector,
    pub feature_vector: FeatureVector,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// map_point_ids[i] = Some(mp_id) if feature i is associated.
    pub map_point_ids: Vec<Option<MapPointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // IMU Data
    // ─────────────────────────────────────────────────────────────────────────
    pub nav_state: Option<NavState>,
    /// Preintegration from the previous KeyFrame to this one.
    pub imu_preintegrated: Option<PreintegratedState>,
    pub prev_kf: Option<KeyFrameId>,
    pub next_kf: Option<KeyFrameId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Connected KeyFrame → number of shared MapPoints.
    covisibility_weights: HashMap<KeyFrameId, usize>,
    /// Covisibles sorted by weight, best first.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────
    pub parent_id: Option<KeyFrameId>,
    pub children_ids: HashSet<KeyFrameId>,

    pub is_bad: bool,
}

impl KeyFrame {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: KeyFrameId,
        frame_id: u64,
        timestamp: f64,
        t_cw: SE3,
        keypoints_un: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
        u_right: Vec<f64>,
        depth: Vec<f64>,
        scale: Arc<ScaleLevels>,
        calib: Arc<CalibrationContext>,
    ) -> Self {
        let n = keypoints_un.len();
        Self {
            id,
            frame_id,
            timestamp,
            t_cw,
            keypoints_un,
            descriptors,
            u_right,
            depth,
            scale,
            calib,
            bow: BowVector::new(),
            feature_vector: FeatureVector::new(),
            map_point_ids: vec![None; n],
            nav_state: None,
            imu_preintegrated: None,
            prev_kf: None,
            next_kf: None,
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            parent_id: None,
            children_ids: HashSet::new(),
            is_bad: false,
        }
    }

    pub fn camera_center(&self) -> Vector3<f64> {
        self.t_cw.camera_center()
    }

    pub fn num_features(&self) -> usize {
        self.keypoints_un.len()
    }

    /// World position of feature `i` from its depth.
    pub fn unproject_stereo(&self, i: usize) -> Option<Vector3<f64>> {
        let z = *self.depth.get(i)?;
        if z <= 0.0 {
            return None;
        }
        let kp = &self.keypoints_un[i];
        let p_c = self.calib.unproject(kp.x as f64, kp.y as f64, z);
        Some(self.t_cw.inverse().transform_point(&p_c))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Returns the previous MapPoint ID if there was one.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    /// All (feature index, MapPoint) associations.
    pub fn get_map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Add or update a covisibility connection.
    pub fn add_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
        self.update_best_covisibles();
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        if self.covisibility_weights.remove(&kf_id).is_some() {
            self.update_best_covisibles();
        }
    }

    pub fn get_covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn get_covisibles(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.covisibility_weights.keys()
    }

    /// The N best covisible KeyFrames (most shared points first).
    pub fn best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles.iter().take(n).map(|(id, _)| *id).collect()
    }

    pub fn covisibles_above_weight(&self, min_weight: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    fn update_best_covisibles(&mut self) {
        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        // Ties broken by id so the order does not depend on hashing.
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.remove(&child_id);
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("num_features", &self.num_features())
            .field("num_map_points", &self.num_map_points())
            .field("covisibles", &self.covisibility_weights.len())
            .field("parent", &self.parent_id)
            .field("num_children", &self.children_ids.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}
