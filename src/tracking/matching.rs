//! ORB descriptor matching for tracking.
//!
//! Every search restricts candidates geometrically (grid window around a
//! projection, or a shared vocabulary node) before comparing descriptors,
//! then optionally filters the matches by rotation consistency.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector2;

use crate::atlas::map::{KeyFrame, Map, MapPointId};
use crate::tracking::frame::descriptor_distance;
use crate::tracking::tracking_frame::{radius_by_viewing_cos, Frame, TrackView};

/// Max descriptor distance for acceptance.
pub const TH_HIGH: u32 = 100;
/// Stricter threshold.
pub const TH_LOW: u32 = 50;
/// Ratio test threshold (best/second_best).
pub const NN_RATIO: f64 = 0.75;
/// Rotation histogram bins.
pub const HISTO_LENGTH: usize = 30;

/// Histogram of keypoint angle differences between matched features.
///
/// Matches outside the three dominant bins are treated as inconsistent.
pub struct RotationHistogram {
    bins: Vec<Vec<usize>>,
}

impl RotationHistogram {
    pub fn new() -> Self {
        Self {
            bins: vec![Vec::new(); HISTO_LENGTH],
        }
    }

    /// Record match `idx` with angles in degrees.
    pub fn add(&mut self, angle1: f32, angle2: f32, idx: usize) {
        let mut rot = (angle1 - angle2) as f64;
        if rot < 0.0 {
            rot += 360.0;
        }
        let mut bin = (rot * HISTO_LENGTH as f64 / 360.0).round() as usize;
        if bin >= HISTO_LENGTH {
            bin = 0;
        }
        self.bins[bin].push(idx);
    }

    /// Indices whose bin is not one of the three strongest.
    ///
    /// The second and third bins only count when they hold at least 10% of
    /// the strongest one.
    pub fn outliers(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..HISTO_LENGTH).collect();
        order.sort_by(|&a, &b| self.bins[b].len().cmp(&self.bins[a].len()).then(a.cmp(&b)));
        let max1 = self.bins[order[0]].len();
        if max1 == 0 {
            return Vec::new();
        }
        let mut keep = vec![order[0]];
        let (max2, max3) = (self.bins[order[1]].len(), self.bins[order[2]].len());
        if (max2 as f64) >= 0.1 * max1 as f64 {
            keep.push(order[1]);
            if (max3 as f64) >= 0.1 * max1 as f64 {
                keep.push(order[2]);
            }
        }
        self.bins
            .iter()
            .enumerate()
            .filter(|(bin, _)| !keep.contains(bin))
            .flat_map(|(_, idxs)| idxs.iter().copied())
            .collect()
    }
}

impl Default for RotationHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Best and second best descriptor distances over a candidate set.
struct BestTwo {
    best_dist: u32,
    best_level: i32,
    best_idx: Option<usize>,
    second_dist: u32,
    second_level: i32,
}

impl BestTwo {
    fn new() -> Self {
        Self {
            best_dist: 256,
            best_level: -1,
            best_idx: None,
            second_dist: 256,
            second_level: -1,
        }
    }

    fn push(&mut self, dist: u32, level: i32, idx: usize) {
        if dist < self.best_dist {
            self.second_dist = self.best_dist;
            self.second_level = self.best_level;
            self.best_dist = dist;
            self.best_level = level;
            self.best_idx = Some(idx);
        } else if dist < self.second_dist {
            self.second_dist = dist;
            self.second_level = level;
        }
    }
}

/// ORB matcher with a ratio test and optional rotation filtering.
#[derive(Debug, Clone, Copy)]
pub struct OrbMatcher {
    pub nn_ratio: f64,
    pub check_orientation: bool,
}

impl OrbMatcher {
    pub fn new(nn_ratio: f64, check_orientation: bool) -> Self {
        Self {
            nn_ratio,
            check_orientation,
        }
    }

    /// Feature `idx` of `frame` already holds a point observed by the map.
    fn slot_taken(frame: &Frame, idx: usize, map: &Map) -> bool {
        frame.map_points[idx]
            .and_then(|id| map.get_map_point(id))
            .map_or(false, |mp| mp.num_observations() > 0)
    }

    /// Match local map points, already projected into `frame`, against its
    /// features. Returns the number of new associations.
    pub fn search_by_projection(
        &self,
        frame: &mut Frame,
        map: &Map,
        views: &HashMap<MapPointId, TrackView>,
        th: f64,
    ) -> usize {
        let mut n_matches = 0;
        let mut candidates_ids: Vec<&MapPointId> = views.keys().collect();
        candidates_ids.sort_unstable();

        for mp_id in candidates_ids {
            let view = &views[mp_id];
            let Some(mp) = map.get_map_point(*mp_id) else {
                continue;
            };
            let level = view.level;
            let mut r = radius_by_viewing_cos(view.view_cos);
            if th != 1.0 {
                r *= th;
            }
            let radius = r * frame.scale.factor(level);
            let indices = frame.get_features_in_area(view.u, view.v, radius, level - 1, level);
            if indices.is_empty() {
                continue;
            }

            let mut best = BestTwo::new();
            for idx in indices {
                if Self::slot_taken(frame, idx, map) {
                    continue;
                }
                if frame.u_right[idx] > 0.0 {
                    let er = (view.u_right - frame.u_right[idx]).abs();
                    if er > radius {
                        continue;
                    }
                }
                let dist = descriptor_distance(&mp.descriptor, &frame.descriptors[idx]);
                best.push(dist, frame.keypoints_un[idx].octave, idx);
            }

            if let Some(best_idx) = best.best_idx {
                if best.best_dist <= TH_HIGH {
                    if best.best_level == best.second_level
                        && best.best_dist as f64 > self.nn_ratio * best.second_dist as f64
                    {
                        continue;
                    }
                    frame.map_points[best_idx] = Some(*mp_id);
                    n_matches += 1;
                }
            }
        }
        n_matches
    }

    /// Project the previous frame's tracked points into `current` (which
    /// must have a predicted pose) and match them in a window of `th` pixels
    /// scaled by octave.
    pub fn search_by_projection_last_frame(
        &self,
        current: &mut Frame,
        last: &Frame,
        map: &Map,
        th: f64,
        monocular: bool,
    ) -> usize {
        let (Some(t_cw), Some(t_lw)) = (current.pose().cloned(), last.pose().cloned()) else {
            return 0;
        };
        let t_lc = t_lw.compose(&t_cw.inverse());
        let mb = current.calib.mb;
        let forward = t_lc.translation.z > mb && !monocular;
        let backward = -t_lc.translation.z > mb && !monocular;

        let mut rot_hist = RotationHistogram::new();
        let mut n_matches = 0;

        for i in 0..last.num_features() {
            let Some(mp_id) = last.map_points[i] else {
                continue;
            };
            if last.outliers[i] {
                continue;
            }
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };

            let p_c = t_cw.transform_point(&mp.position);
            if p_c.z <= 0.0 {
                continue;
            }
            let inv_z = 1.0 / p_c.z;
            let uv = current.calib.project(&p_c);
            if !current.is_in_image(uv.x, uv.y) {
                continue;
            }

            let last_octave = last.keypoints_un[i].octave;
            let radius = th * current.scale.factor(last_octave);
            let indices = if forward {
                current.get_features_in_area(uv.x, uv.y, radius, last_octave, -1)
            } else if backward {
                current.get_features_in_area(uv.x, uv.y, radius, 0, last_octave)
            } else {
                current.get_features_in_area(uv.x, uv.y, radius, last_octave - 1, last_octave + 1)
            };
            if indices.is_empty() {
                continue;
            }

            let ur = uv.x - current.calib.bf * inv_z;
            let mut best_dist = 256u32;
            let mut best_idx = None;
            for idx in indices {
                if Self::slot_taken(current, idx, map) {
                    continue;
                }
                if current.u_right[idx] > 0.0 && (ur - current.u_right[idx]).abs() > radius {
                    continue;
                }
                let dist = descriptor_distance(&mp.descriptor, &current.descriptors[idx]);
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx);
                }
            }

            if let Some(idx) = best_idx {
                if best_dist <= TH_HIGH {
                    current.map_points[idx] = Some(mp_id);
                    n_matches += 1;
                    if self.check_orientation {
                        rot_hist.add(last.keypoints_un[i].angle, current.keypoints_un[idx].angle, idx);
                    }
                }
            }
        }

        if self.check_orientation {
            for idx in rot_hist.outliers() {
                current.map_points[idx] = None;
                n_matches -= 1;
            }
        }
        n_matches
    }

    /// Match a keyframe's map points to frame features sharing a vocabulary
    /// node. Returns matches indexed by frame feature.
    pub fn search_by_bow(&self, kf: &KeyFrame, frame: &Frame, map: &Map) -> (usize, Vec<Option<MapPointId>>) {
        let mut matches: Vec<Option<MapPointId>> = vec![None; frame.num_features()];
        let Some(frame_fv) = frame.feature_vector.as_ref() else {
            return (0, matches);
        };
        let mut rot_hist = RotationHistogram::new();
        let mut n_matches = 0;

        let mut kf_iter = kf.feature_vector.iter().peekable();
        let mut f_iter = frame_fv.iter().peekable();
        loop {
            let (Some((kf_node, kf_indices)), Some((f_node, f_indices))) =
                (kf_iter.peek().copied(), f_iter.peek().copied())
            else {
                break;
            };
            if kf_node < f_node {
                kf_iter.next();
                continue;
            }
            if f_node < kf_node {
                f_iter.next();
                continue;
            }

            for &kf_idx in kf_indices {
                let Some(mp_id) = kf.get_map_point(kf_idx).and_then(|id| map.resolve_replaced(id)) else {
                    continue;
                };
                let kf_desc = &kf.descriptors[kf_idx];

                let mut best = BestTwo::new();
                for &f_idx in f_indices {
                    if matches[f_idx].is_some() {
                        continue;
                    }
                    let dist = descriptor_distance(kf_desc, &frame.descriptors[f_idx]);
                    best.push(dist, 0, f_idx);
                }

                if let Some(best_idx) = best.best_idx {
                    if best.best_dist <= TH_LOW
                        && (best.best_dist as f64) < self.nn_ratio * best.second_dist as f64
                    {
                        matches[best_idx] = Some(mp_id);
                        n_matches += 1;
                        if self.check_orientation {
                            rot_hist.add(kf.keypoints_un[kf_idx].angle, frame.keypoints_un[best_idx].angle, best_idx);
                        }
                    }
                }
            }
            kf_iter.next();
            f_iter.next();
        }

        if self.check_orientation {
            for idx in rot_hist.outliers() {
                if matches[idx].take().is_some() {
                    n_matches -= 1;
                }
            }
        }
        (n_matches, matches)
    }

    /// Project a keyframe's map points (except `already_found`) into a frame
    /// with a pose and match them within `th` pixels scaled by the predicted
    /// level, accepting distances up to `orb_dist`.
    pub fn search_by_projection_keyframe(
        &self,
        frame: &mut Frame,
        kf: &KeyFrame,
        map: &Map,
        already_found: &HashSet<MapPointId>,
        th: f64,
        orb_dist: u32,
    ) -> usize {
        let Some(t_cw) = frame.pose().cloned() else {
            return 0;
        };
        let center = t_cw.camera_center();
        let mut rot_hist = RotationHistogram::new();
        let mut n_matches = 0;

        for (kf_idx, mp_id) in kf.get_map_point_indices() {
            if already_found.contains(&mp_id) {
                continue;
            }
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            let p_c = t_cw.transform_point(&mp.position);
            if p_c.z <= 0.0 {
                continue;
            }
            let uv = frame.calib.project(&p_c);
            if !frame.is_in_image(uv.x, uv.y) {
                continue;
            }
            let dist_3d = (mp.position - center).norm();
            if dist_3d < 0.8 * mp.min_distance || dist_3d > 1.2 * mp.max_distance {
                continue;
            }
            let level = mp.predict_scale(dist_3d, &frame.scale);
            let radius = th * frame.scale.factor(level);
            let indices = frame.get_features_in_area(uv.x, uv.y, radius, level - 1, level + 1);

            let mut best_dist = 256u32;
            let mut best_idx = None;
            for idx in indices {
                if frame.map_points[idx].is_some() {
                    continue;
                }
                let dist = descriptor_distance(&mp.descriptor, &frame.descriptors[idx]);
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx);
                }
            }

            if let Some(idx) = best_idx {
                if best_dist <= orb_dist {
                    frame.map_points[idx] = Some(mp_id);
                    n_matches += 1;
                    if self.check_orientation {
                        rot_hist.add(kf.keypoints_un[kf_idx].angle, frame.keypoints_un[idx].angle, idx);
                    }
                }
            }
        }

        if self.check_orientation {
            for idx in rot_hist.outliers() {
                if frame.map_points[idx].take().is_some() {
                    n_matches -= 1;
                }
            }
        }
        n_matches
    }

    /// Level-0 matching between the initial and the current frame for
    /// monocular initialization.
    ///
    /// `prev_matched` holds, per feature of `f1`, the position to search
    /// around; it is updated to the matched position in `f2`.
    pub fn search_for_initialization(
        &self,
        f1: &Frame,
        f2: &Frame,
        prev_matched: &mut [Vector2<f64>],
        window: f64,
    ) -> (usize, Vec<Option<usize>>) {
        let mut matches12: Vec<Option<usize>> = vec![None; f1.num_features()];
        let mut matches21: Vec<Option<usize>> = vec![None; f2.num_features()];
        let mut matched_distance = vec![u32::MAX; f2.num_features()];
        let mut rot_hist = RotationHistogram::new();
        let mut n_matches = 0usize;

        for (i1, kp1) in f1.keypoints_un.iter().enumerate() {
            if kp1.octave > 0 {
                continue;
            }
            let target = prev_matched[i1];
            let indices = f2.get_features_in_area(target.x, target.y, window, kp1.octave, kp1.octave);
            if indices.is_empty() {
                continue;
            }

            let d1 = &f1.descriptors[i1];
            let mut best = BestTwo::new();
            for i2 in indices {
                let dist = descriptor_distance(d1, &f2.descriptors[i2]);
                if matched_distance[i2] <= dist {
                    continue;
                }
                best.push(dist, 0, i2);
            }

            let Some(i2) = best.best_idx else {
                continue;
            };
            let best_dist = best.best_dist;
            if best_dist <= TH_LOW && (best_dist as f64) < self.nn_ratio * best.second_dist as f64 {
                if let Some(prev_i1) = matches21[i2] {
                    matches12[prev_i1] = None;
                    n_matches -= 1;
                }
                matches12[i1] = Some(i2);
                matches21[i2] = Some(i1);
                matched_distance[i2] = best_dist;
                n_matches += 1;
                if self.check_orientation {
                    rot_hist.add(kp1.angle, f2.keypoints_un[i2].angle, i1);
                }
            }
        }

        if self.check_orientation {
            for i1 in rot_hist.outliers() {
                if matches12[i1].take().is_some() {
                    n_matches -= 1;
                }
            }
        }

        for (i1, m) in matches12.iter().enumerate() {
            if let Some(i2) = m {
                let kp = &f2.keypoints_un[*i2];
                prev_matched[i1] = Vector2::new(kp.x as f64, kp.y as f64);
            }
        }

        (n_matches, matches12)
    }
}

impl Default for OrbMatcher {
    fn default() -> Self {
        Self::new(NN_RATIO, true)
    }
}
