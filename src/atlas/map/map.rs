//! Map - Container for KeyFrames and MapPoints.
//!
//! The Map holds the SLAM graph:
//! - KeyFrames with their poses and features
//! - MapPoints (3D landmarks) with their observations
//! - Covisibility and spanning-tree relationships between KeyFrames
//!
//! Tracking reads it through a shared guard; local mapping is the writer.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::imu::ImuBias;
use crate::tracking::frame::Descriptor;

use super::keyframe::KeyFrame;
use super::map_point::{compute_distinctive_descriptor, MapPoint};
use super::types::{KeyFrameId, MapPointId};

/// Upper bound on `replaced_by` hops followed when resolving a point.
const MAX_REPLACEMENT_CHAIN: usize = 32;

/// The SLAM map containing KeyFrames and MapPoints.
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,

    next_mp_id: u64,

    /// Bias estimated at inertial initialization, `None` until then.
    imu_bias: Option<ImuBias>,

    /// Tail of the temporal keyframe chain.
    last_keyframe_id: Option<KeyFrameId>,

    /// First keyframe, root of the spanning tree.
    origin_keyframe_id: Option<KeyFrameId>,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            next_mp_id: 0,
            imu_bias: None,
            last_keyframe_id: None,
            origin_keyframe_id: None,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // IMU State
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_imu_initialized(&self) -> bool {
        self.imu_bias.is_some()
    }

    pub fn imu_bias(&self) -> Option<&ImuBias> {
        self.imu_bias.as_ref()
    }

    /// Mark the map inertially initialized with the estimated bias.
    pub fn set_imu_initialized(&mut self, bias: ImuBias) {
        self.imu_bias = Some(bias);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a KeyFrame and link it after the previous one in temporal order.
    pub fn add_keyframe(&mut self, mut kf: KeyFrame) -> KeyFrameId {
        let id = kf.id;
        if let Some(prev_id) = self.last_keyframe_id {
            kf.prev_kf = Some(prev_id);
            if let Some(prev_kf) = self.keyframes.get_mut(&prev_id) {
                prev_kf.next_kf = Some(id);
            }
        }
        if self.origin_keyframe_id.is_none() {
            self.origin_keyframe_id = Some(id);
        }
        self.keyframes.insert(id, kf);
        self.last_keyframe_id = Some(id);
        id
    }

    pub fn last_keyframe_id(&self) -> Option<KeyFrameId> {
        self.last_keyframe_id
    }

    pub fn origin_keyframe_id(&self) -> Option<KeyFrameId> {
        self.origin_keyframe_id
    }

    /// A KeyFrame by ID. Bad keyframes are treated as absent.
    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id).filter(|kf| !kf.is_bad)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values().filter(|kf| !kf.is_bad)
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, first_kf_id));
        id
    }

    /// A MapPoint by ID. Erased and bad points are `None`.
    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id).filter(|mp| !mp.is_bad)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    /// Follow `replaced_by` links to the live point that stands for `id`.
    ///
    /// Returns `None` when the chain ends in an erased or bad point.
    pub fn resolve_replaced(&self, id: MapPointId) -> Option<MapPointId> {
        let mut current = id;
        for _ in 0..MAX_REPLACEMENT_CHAIN {
            let mp = self.map_points.get(&current)?;
            match mp.replaced_by {
                Some(next) => current = next,
                None if mp.is_bad => return None,
                None => return Some(current),
            }
        }
        None
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values().filter(|mp| !mp.is_bad)
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.values().filter(|mp| !mp.is_bad).count()
    }

    /// Fuse `old` into `new`: observations move over unless the keyframe
    /// already sees `new`, and `old` is marked bad with a forward link.
    pub fn replace_map_point(&mut self, old: MapPointId, new: MapPointId) {
        if old == new {
            return;
        }
        let observations: Vec<(KeyFrameId, usize)> = match self.map_points.get_mut(&old) {
            Some(mp) => {
                mp.set_bad();
                mp.replaced_by = Some(new);
                mp.observations.drain().collect()
            }
            None => return,
        };

        for (kf_id, feature_idx) in observations {
            let already_seen = self
                .map_points
                .get(&new)
                .map_or(true, |mp| mp.observations.contains_key(&kf_id));
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                if already_seen {
                    kf.erase_map_point(feature_idx);
                } else {
                    kf.set_map_point(feature_idx, new);
                }
            }
            if !already_seen {
                if let Some(mp) = self.map_points.get_mut(&new) {
                    mp.add_observation(kf_id, feature_idx);
                }
            }
        }
        self.compute_distinctive_descriptor(new);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a KeyFrame feature and a MapPoint.
    ///
    /// This:
    /// 1. Links the KeyFrame's feature to the MapPoint
    /// 2. Adds an observation in the MapPoint
    /// 3. Updates covisibility with other KeyFrames observing this MapPoint
    ///
    /// Returns true if the association was created.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        if !self.keyframes.contains_key(&kf_id) {
            return false;
        }
        let existing_observers: Vec<KeyFrameId> = match self.map_points.get_mut(&mp_id) {
            Some(mp) if !mp.is_bad => {
                if mp.observations.contains_key(&kf_id) {
                    return false;
                }
                let observers = mp.observations.keys().copied().collect();
                mp.add_observation(kf_id, feature_idx);
                observers
            }
            _ => return false,
        };

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }

        for other_kf_id in existing_observers {
            let new_weight = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.get_covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;

            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other_kf_id, new_weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                other_kf.add_covisibility(kf_id, new_weight);
            }
        }

        true
    }

    /// Remove the association between a KeyFrame feature and its MapPoint,
    /// decrementing covisibility with the other observers.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get_mut(&kf_id)?.erase_map_point(feature_idx)?;

        let other_observers: Vec<KeyFrameId> = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                mp.erase_observation(kf_id);
                mp.observations.keys().copied().collect()
            }
            None => Vec::new(),
        };

        for other_kf_id in other_observers {
            let current_weight = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.get_covisibility_weight(kf_id))
                .unwrap_or(0);

            if current_weight <= 1 {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_covisibility(other_kf_id);
                }
                if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                    other_kf.erase_covisibility(kf_id);
                }
            } else {
                let new_weight = current_weight - 1;
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.add_covisibility(other_kf_id, new_weight);
                }
                if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                    other_kf.add_covisibility(kf_id, new_weight);
                }
            }
        }

        Some(mp_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Number of live MapPoints of a KeyFrame seen by at least `min_obs` KeyFrames.
    pub fn tracked_map_points(&self, kf_id: KeyFrameId, min_obs: usize) -> usize {
        let Some(kf) = self.get_keyframe(kf_id) else {
            return 0;
        };
        kf.get_map_point_indices()
            .filter_map(|(_, mp_id)| self.get_map_point(mp_id))
            .filter(|mp| mp.num_observations() >= min_obs)
            .count()
    }

    /// All live MapPoints observed by a set of KeyFrames.
    pub fn get_map_points_from_keyframes(&self, kf_ids: &[KeyFrameId]) -> HashSet<MapPointId> {
        kf_ids
            .iter()
            .filter_map(|&kf_id| self.get_keyframe(kf_id))
            .flat_map(|kf| kf.get_map_point_indices())
            .filter(|(_, mp_id)| self.get_map_point(*mp_id).is_some())
            .map(|(_, mp_id)| mp_id)
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach a KeyFrame to its best covisible as spanning-tree parent.
    pub fn update_spanning_parent(&mut self, kf_id: KeyFrameId) {
        let parent = match self.keyframes.get(&kf_id) {
            Some(kf) if kf.parent_id.is_none() && self.origin_keyframe_id != Some(kf_id) => {
                kf.best_covisibles(1).first().copied().or(kf.prev_kf)
            }
            _ => None,
        };
        if let Some(parent_id) = parent {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.set_parent(parent_id);
            }
            if let Some(parent_kf) = self.keyframes.get_mut(&parent_id) {
                parent_kf.add_child(kf_id);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Update the normal and depth bounds for a MapPoint from its observers.
    ///
    /// The reference observation is the one of the point's first KeyFrame, or
    /// any observer when that KeyFrame no longer sees it.
    pub fn update_map_point_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let centers: Vec<Vector3<f64>> = mp
            .observations
            .keys()
            .filter_map(|kf_id| self.keyframes.get(kf_id))
            .map(KeyFrame::camera_center)
            .collect();

        let reference = mp
            .observations
            .get(&mp.first_kf_id)
            .map(|&idx| (mp.first_kf_id, idx))
            .or_else(|| mp.observations.iter().next().map(|(&kf, &idx)| (kf, idx)));
        let Some((ref_kf_id, ref_idx)) = reference else {
            return;
        };
        let Some(ref_kf) = self.keyframes.get(&ref_kf_id) else {
            return;
        };
        let ref_center = ref_kf.camera_center();
        let ref_level = ref_kf.keypoints_un.get(ref_idx).map_or(0, |kp| kp.octave);
        let scale = ref_kf.scale.clone();

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.update_normal_and_depth(centers.into_iter(), &ref_center, ref_level, &scale);
        }
    }

    /// Pick the representative descriptor among all observations.
    pub fn compute_distinctive_descriptor(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let descriptors: Vec<Descriptor> = mp
            .observations
            .iter()
            .filter_map(|(kf_id, &idx)| self.keyframes.get(kf_id)?.descriptors.get(idx).copied())
            .collect();
        if let Some(best) = compute_distinctive_descriptor(&descriptors) {
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                mp.descriptor = best;
            }
        }
    }

    /// Clear the entire map.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.next_mp_id = 0;
        self.imu_bias = None;
        self.last_keyframe_id = None;
        self.origin_keyframe_id = None;
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("imu_initialized", &self.is_imu_initialized())
            .finish()
    }
}
