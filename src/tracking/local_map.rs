//! Track Local Map: projection-based search for map point correspondences.
//!
//! Given an initial pose for the current frame, the local map is the set of
//! keyframes that observe the frame's tracked points plus their graph
//! neighbors, and the points those keyframes observe. Every local point that
//! passes the frustum test is projected and matched, and the pose is refined
//! against the enlarged correspondence set.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::config::SensorType;
use crate::optimizer::optimize_pose;
use crate::tracking::matching::OrbMatcher;
use crate::tracking::tracking_frame::{Frame, TrackView};

/// Upper bound on local keyframes.
const MAX_LOCAL_KEYFRAMES: usize = 80;
/// Covisibles considered per voter keyframe.
const NEIGHBORS_PER_KEYFRAME: usize = 10;
/// Viewing-angle cosine below which a point is not projected.
const VIEW_COS_LIMIT: f64 = 0.5;

/// Local keyframes and points around the current frame.
#[derive(Debug, Clone, Default)]
pub struct LocalMap {
    pub keyframes: Vec<KeyFrameId>,
    pub points: Vec<MapPointId>,
    /// Keyframe sharing the most points with the frame.
    pub reference_kf: Option<KeyFrameId>,
}

impl LocalMap {
    /// Build the local map from the frame's current associations.
    ///
    /// `temporal_window` extra keyframes are walked back from the newest one
    /// through the temporal chain, used when inertial fusion is active.
    pub fn build(frame: &Frame, map: &Map, temporal_window: usize) -> Self {
        let mut votes: HashMap<KeyFrameId, usize> = HashMap::new();
        for mp_id in frame.map_points.iter().flatten() {
            let Some(mp) = map.get_map_point(*mp_id) else {
                continue;
            };
            for kf_id in mp.observations.keys() {
                *votes.entry(*kf_id).or_insert(0) += 1;
            }
        }

        let mut voters: Vec<(KeyFrameId, usize)> = votes
            .into_iter()
            .filter(|(kf_id, _)| map.get_keyframe(*kf_id).is_some())
            .collect();
        // Deterministic order: most votes first, ties by id.
        voters.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let reference_kf = voters.first().map(|(kf_id, _)| *kf_id);
        let mut included: HashSet<KeyFrameId> = voters.iter().map(|(kf_id, _)| *kf_id).collect();
        let mut keyframes: Vec<KeyFrameId> = voters.iter().map(|(kf_id, _)| *kf_id).collect();

        let mut add = |kf_id: KeyFrameId, keyframes: &mut Vec<KeyFrameId>| -> bool {
            if map.get_keyframe(kf_id).is_some() && included.insert(kf_id) {
                keyframes.push(kf_id);
                true
            } else {
                false
            }
        };

        let voter_ids: Vec<KeyFrameId> = keyframes.clone();
        for kf_id in voter_ids {
            if keyframes.len() >= MAX_LOCAL_KEYFRAMES {
                break;
            }
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            for neighbor in kf.best_covisibles(NEIGHBORS_PER_KEYFRAME) {
                if add(neighbor, &mut keyframes) {
                    break;
                }
            }
            let mut children: Vec<KeyFrameId> = kf.children_ids.iter().copied().collect();
            children.sort_unstable();
            for child in children {
                if add(child, &mut keyframes) {
                    break;
                }
            }
            if let Some(parent) = kf.parent_id {
                add(parent, &mut keyframes);
            }
        }

        if temporal_window > 0 {
            let mut cursor = map.last_keyframe_id();
            for _ in 0..temporal_window {
                let Some(kf_id) = cursor else {
                    break;
                };
                add(kf_id, &mut keyframes);
                cursor = map.get_keyframe(kf_id).and_then(|kf| kf.prev_kf);
            }
        }

        let tracked: HashSet<MapPointId> = frame.map_points.iter().flatten().copied().collect();
        let mut seen = HashSet::new();
        let mut points = Vec::new();
        for kf_id in &keyframes {
            let Some(kf) = map.get_keyframe(*kf_id) else {
                continue;
            };
            for (_, mp_id) in kf.get_map_point_indices() {
                if tracked.contains(&mp_id) || !seen.insert(mp_id) {
                    continue;
                }
                if map.get_map_point(mp_id).is_some() {
                    points.push(mp_id);
                }
            }
        }

        Self {
            keyframes,
            points,
            reference_kf,
        }
    }

    /// Project local points into `frame` and match them.
    ///
    /// Points already associated with the frame are excluded when the local
    /// map is built. Returns the number of new matches.
    pub fn search_local_points(&self, frame: &mut Frame, map: &Map, th: f64) -> usize {
        let mut views: HashMap<MapPointId, TrackView> = HashMap::new();
        for mp_id in &self.points {
            let Some(mp) = map.get_map_point(*mp_id) else {
                continue;
            };
            if let Some(view) = frame.is_in_frustum(mp, VIEW_COS_LIMIT) {
                views.insert(*mp_id, view);
            }
        }
        if views.is_empty() {
            return 0;
        }
        OrbMatcher::default().search_by_projection(frame, map, &views, th)
    }
}

/// Projection threshold for the local map search.
pub fn search_threshold(sensor: SensorType, frames_since_reloc: Option<u64>) -> f64 {
    if frames_since_reloc.map_or(false, |n| n < 2) {
        5.0
    } else if sensor == SensorType::Rgbd {
        3.0
    } else {
        1.0
    }
}

/// Outcome of local map tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMapOutcome {
    pub n_inliers: usize,
    pub reference_kf: Option<KeyFrameId>,
    pub success: bool,
}

/// Run the local map step on a frame that already has an initial pose.
///
/// Outliers from pose optimization are cleared for stereo/RGB-D frames and
/// kept (flagged) for monocular ones, so monocular bookkeeping can still see
/// them. Inliers are associations whose point is observed by a keyframe; in
/// localization mode every surviving association counts.
pub fn track_local_map(
    frame: &mut Frame,
    map: &Map,
    sensor: SensorType,
    only_tracking: bool,
    frames_since_reloc: Option<u64>,
    max_frames: u64,
    temporal_window: usize,
) -> LocalMapOutcome {
    let local = LocalMap::build(frame, map, temporal_window);
    let th = search_threshold(sensor, frames_since_reloc);
    let n_new = local.search_local_points(frame, map, th);

    optimize_pose(frame, map);

    let mut n_inliers = 0;
    for i in 0..frame.num_features() {
        let Some(mp_id) = frame.map_points[i] else {
            continue;
        };
        if frame.outliers[i] {
            if sensor != SensorType::Monocular {
                frame.map_points[i] = None;
            }
            continue;
        }
        if only_tracking
            || map
                .get_map_point(mp_id)
                .map_or(false, |mp| mp.num_observations() > 0)
        {
            n_inliers += 1;
        }
    }

    let recently_relocalized = frames_since_reloc.map_or(false, |n| n < max_frames);
    let required = if recently_relocalized { 50 } else { 30 };
    debug!(
        "[LocalMap] frame {}: {} local KFs, {} local points, {} new matches, {} inliers (need {})",
        frame.id,
        local.keyframes.len(),
        local.points.len(),
        n_new,
        n_inliers,
        required
    );

    LocalMapOutcome {
        n_inliers,
        reference_kf: local.reference_kf,
        success: n_inliers >= required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use nalgebra::Vector3;

    use crate::atlas::map::keyframe::tests::{create_keyframe_with_features, test_calib};
    use crate::tracking::frame::{ExtractedFeatures, KeyPoint, ScaleLevels};

    fn empty_frame(n: usize) -> Frame {
        Frame::new_monocular(
            9,
            0.0,
            ExtractedFeatures {
                keypoints: vec![KeyPoint::new(50.0, 50.0, 0); n],
                descriptors: vec![[0u8; 32]; n],
                pyramid: Vec::new(),
            },
            Arc::new(ScaleLevels::default()),
            test_calib(),
        )
    }

    #[test]
    fn test_reference_is_top_voter_and_neighbors_added() {
        let mut map = Map::new();
        for id in 0..3 {
            map.add_keyframe(create_keyframe_with_features(id, 10));
        }
        let (a, b, c) = (KeyFrameId::new(0), KeyFrameId::new(1), KeyFrameId::new(2));

        let mut points = Vec::new();
        for i in 0..6 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], a);
            map.associate(a, i, mp);
            if i < 2 {
                map.associate(b, i, mp);
            }
            points.push(mp);
        }
        // Point seen only by KF 1 and KF 2, so KF 2 is a neighbor of KF 1.
        let shared = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], b);
        map.associate(b, 7, shared);
        map.associate(c, 7, shared);
        let only_c = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], c);
        map.associate(c, 8, only_c);

        let mut frame = empty_frame(10);
        for (i, mp) in points.iter().enumerate() {
            frame.map_points[i] = Some(*mp);
        }

        let local = LocalMap::build(&frame, &map, 0);
        assert_eq!(local.reference_kf, Some(a));
        assert!(local.keyframes.contains(&b));
        assert!(local.keyframes.contains(&c));
        // Tracked points are not candidates.
        assert!(!local.points.iter().any(|p| points.contains(p)));
        assert!(local.points.contains(&shared));
        assert!(local.points.contains(&only_c));
    }

    #[test]
    fn test_localization_mode_counts_unobserved_points() {
        let mut map = Map::new();
        let a = map.add_keyframe(create_keyframe_with_features(0, 10));
        let mut frame = empty_frame(10);
        for i in 0..10 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), [0u8; 32], a);
            // Only the first four keep a keyframe observation.
            if i < 4 {
                map.associate(a, i, mp);
            }
            frame.map_points[i] = Some(mp);
        }

        let mapping = track_local_map(&mut frame.clone(), &map, SensorType::Monocular, false, None, 30, 0);
        assert_eq!(mapping.n_inliers, 4);
        assert!(!mapping.success);

        let localization = track_local_map(&mut frame, &map, SensorType::Monocular, true, None, 30, 0);
        assert_eq!(localization.n_inliers, 10);
        assert_eq!(localization.reference_kf, Some(a));
    }

    #[test]
    fn test_search_threshold() {
        assert_eq!(search_threshold(SensorType::Stereo, None), 1.0);
        assert_eq!(search_threshold(SensorType::Rgbd, Some(10)), 3.0);
        assert_eq!(search_threshold(SensorType::Monocular, Some(1)), 5.0);
    }
}
