//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! Each MapPoint tracks which KeyFrames observe it and stores the viewing
//! geometry used by the visibility test: mean viewing direction, valid
//! distance range and a representative descriptor. Per-frame projections are
//! not stored here; tracking keeps them in its own side table.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::tracking::frame::{descriptor_distance, Descriptor, ScaleLevels};

use super::types::{KeyFrameId, MapPointId};

/// A 3D map point (landmark) observed by one or more KeyFrames.
#[derive(Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative descriptor, the observation with the smallest median
    /// distance to all others.
    pub descriptor: Descriptor,

    /// observations[kf_id] = feature_idx means keyframe kf_id sees this point at feature_idx.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Scale-invariance distance limits.
    pub min_distance: f64,
    pub max_distance: f64,

    /// KeyFrame that created this MapPoint.
    pub first_kf_id: KeyFrameId,

    /// Set when the point was fused into another one.
    pub replaced_by: Option<MapPointId>,

    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            first_kf_id,
            replaced_by: None,
            is_bad: false,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_distance && distance <= self.max_distance
    }

    /// Pyramid level at which the point should be detected from `distance`.
    ///
    /// Closer views map to coarser levels; the result is clamped to the
    /// pyramid.
    pub fn predict_scale(&self, distance: f64, scale: &ScaleLevels) -> i32 {
        let ratio = self.max_distance / distance;
        let level = (ratio.ln() / scale.log_scale_factor).ceil();
        if level.is_nan() || level < 0.0 {
            0
        } else {
            (level as i32).min(scale.n_levels as i32 - 1)
        }
    }

    /// Recompute the mean viewing direction and the valid distance range.
    ///
    /// # Arguments
    /// * `observer_centers` - camera centers of all observing KeyFrames
    /// * `reference_center` - camera center of the reference KeyFrame
    /// * `reference_level` - octave of the point in the reference KeyFrame
    pub fn update_normal_and_depth(
        &mut self,
        observer_centers: impl Iterator<Item = Vector3<f64>>,
        reference_center: &Vector3<f64>,
        reference_level: i32,
        scale: &ScaleLevels,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut n = 0usize;
        for center in observer_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                n += 1;
            }
        }
        if n == 0 {
            return;
        }

        let norm = normal_sum.norm();
        if norm > 1e-10 {
            self.normal = normal_sum / norm;
        }

        let dist = (self.position - reference_center).norm();
        let level_scale = scale.factor(reference_level);
        let top_scale = scale.factor(scale.n_levels as i32 - 1);
        self.max_distance = dist * level_scale;
        self.min_distance = self.max_distance / top_scale;
    }
}

/// Descriptor with the least median Hamming distance to the rest.
pub fn compute_distinctive_descriptor(descriptors: &[Descriptor]) -> Option<Descriptor> {
    match descriptors.len() {
        0 => return None,
        1 | 2 => return Some(descriptors[0]),
        _ => {}
    }
    let n = descriptors.len();
    let mut distances = vec![vec![0u32; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = descriptor_distance(&descriptors[i], &descriptors[j]);
            distances[i][j] = d;
            distances[j][i] = d;
        }
    }

    let mut best_median = u32::MAX;
    let mut best_idx = 0;
    for (i, row) in distances.iter_mut().enumerate() {
        row.sort_unstable();
        let median = row[(n - 1) / 2];
        if median < best_median {
            best_median = median;
            best_idx = i;
        }
    }
    Some(descriptors[best_idx])
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("replaced_by", &self.replaced_by)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}
