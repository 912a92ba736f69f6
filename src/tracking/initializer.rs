//! Initial map construction.
//!
//! Stereo and RGB-D frames seed the map from a single frame: every keypoint
//! with valid depth becomes a map point. Monocular tracking needs two views
//! with enough baseline; the first frame is kept as reference until a later
//! frame matches it well enough for a fundamental-matrix reconstruction.

use nalgebra::{Vector2, Vector3};
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::atlas::Atlas;
use crate::geometry::two_view::{find_fundamental, reconstruct_from_fundamental};
use crate::geometry::SE3;
use crate::tracking::matching::OrbMatcher;
use crate::tracking::tracking_frame::Frame;
use crate::vocabulary::Vocabulary;

/// Both frames need more keypoints than this.
const MONO_MIN_FEATURES: usize = 100;
/// Search window around the reference keypoint position, in pixels.
const MONO_SEARCH_WINDOW: f64 = 100.0;
const MONO_MIN_MATCHES: usize = 100;
const RANSAC_ITERATIONS: usize = 200;
const SIGMA: f64 = 1.0;
const MIN_PARALLAX_DEG: f64 = 1.0;
const MIN_TRIANGULATED: usize = 50;
/// Points the second keyframe must track after scaling.
const MIN_INITIAL_TRACKED: usize = 100;

/// Relative pose and structure accepted for monocular initialization.
#[derive(Debug, Clone)]
pub struct TwoViewInit {
    /// Pose of the current frame. The reference frame sits at the origin.
    pub t_cw: SE3,
    /// `(reference feature, current feature, world position)`.
    pub correspondences: Vec<(usize, usize, Vector3<f64>)>,
}

/// Holds the monocular reference frame between attempts.
#[derive(Debug)]
pub struct MonocularInitializer {
    reference: Option<Frame>,
    /// Per reference feature, where to search in the next frame.
    prev_matched: Vec<Vector2<f64>>,
    min_features: usize,
}

impl MonocularInitializer {
    pub fn new(min_features: usize) -> Self {
        Self {
            reference: None,
            prev_matched: Vec::new(),
            min_features: min_features.max(MONO_MIN_FEATURES),
        }
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub fn reset(&mut self) {
        self.reference = None;
        self.prev_matched.clear();
    }

    /// The stored reference frame, consumed once initialization succeeds.
    pub fn take_reference(&mut self) -> Option<Frame> {
        self.prev_matched.clear();
        self.reference.take()
    }

    /// Feed one frame. Returns the reconstruction once the current frame and
    /// the stored reference agree on a well-conditioned geometry.
    pub fn try_initialize(&mut self, frame: &Frame, rng: &mut StdRng) -> Option<TwoViewInit> {
        let Some(reference) = self.reference.as_ref() else {
            if frame.num_features() > self.min_features {
                self.prev_matched = frame
                    .keypoints_un
                    .iter()
                    .map(|kp| Vector2::new(kp.x as f64, kp.y as f64))
                    .collect();
                self.reference = Some(frame.clone());
                debug!("[MonoInit] reference frame {} stored", frame.id);
            }
            return None;
        };

        if frame.num_features() <= self.min_features {
            self.reset();
            return None;
        }

        let matcher = OrbMatcher::new(0.9, true);
        let (n_matches, matches12) =
            matcher.search_for_initialization(reference, frame, &mut self.prev_matched, MONO_SEARCH_WINDOW);
        if n_matches < MONO_MIN_MATCHES {
            debug!("[MonoInit] {} matches, dropping reference", n_matches);
            self.reset();
            return None;
        }

        let pairs: Vec<(usize, usize)> = matches12
            .iter()
            .enumerate()
            .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
            .collect();
        let p1: Vec<Vector2<f64>> = pairs
            .iter()
            .map(|&(i1, _)| {
                let kp = &reference.keypoints_un[i1];
                Vector2::new(kp.x as f64, kp.y as f64)
            })
            .collect();
        let p2: Vec<Vector2<f64>> = pairs
            .iter()
            .map(|&(_, i2)| {
                let kp = &frame.keypoints_un[i2];
                Vector2::new(kp.x as f64, kp.y as f64)
            })
            .collect();

        let (f21, inliers, _) = find_fundamental(&p1, &p2, RANSAC_ITERATIONS, SIGMA, rng)?;
        let recon = reconstruct_from_fundamental(
            &f21,
            &frame.calib.k(),
            &p1,
            &p2,
            &inliers,
            SIGMA,
            MIN_PARALLAX_DEG,
            MIN_TRIANGULATED,
        )?;

        let correspondences: Vec<(usize, usize, Vector3<f64>)> = pairs
            .iter()
            .enumerate()
            .filter(|(k, _)| recon.triangulated[*k])
            .filter_map(|(k, &(i1, i2))| recon.points[k].map(|p| (i1, i2, p)))
            .collect();

        info!(
            "[MonoInit] frames {} and {}: {} points, parallax {:.2} deg",
            reference.id,
            frame.id,
            correspondences.len(),
            recon.parallax_deg
        );
        Some(TwoViewInit {
            t_cw: SE3::from_rt(recon.r21, recon.t21),
            correspondences,
        })
    }
}

/// Build the first keyframe and its points from a frame with depth.
///
/// The frame is placed at the origin and gets its associations set.
/// Returns the number of points created.
pub fn create_initial_map_stereo(
    frame: &mut Frame,
    atlas: &mut Atlas,
    kf_id: KeyFrameId,
    vocabulary: &dyn Vocabulary,
) -> usize {
    frame.set_pose(SE3::identity());
    frame.compute_bow(vocabulary);
    let Some(kf) = frame.to_keyframe(kf_id) else {
        return 0;
    };
    let (map, db) = atlas.map_and_db_mut();
    map.add_keyframe(kf);

    let mut created = Vec::new();
    for i in 0..frame.num_features() {
        let Some(position) = frame.unproject_stereo(i) else {
            continue;
        };
        let mp_id = map.create_map_point(position, frame.descriptors[i], kf_id);
        map.associate(kf_id, i, mp_id);
        frame.map_points[i] = Some(mp_id);
        created.push(mp_id);
    }
    refresh_points(map, &created);

    if let Some(kf) = map.get_keyframe(kf_id) {
        db.add(kf_id, &kf.bow);
    }
    frame.reference_kf = Some(kf_id);
    info!("[StereoInit] new map with {} points from frame {}", created.len(), frame.id);
    created.len()
}

/// Build the two initial keyframes from an accepted reconstruction.
///
/// The map is scaled so the median scene depth of the reference keyframe is
/// one. Returns `false`, leaving the atlas empty, when the median depth is
/// not positive or the current keyframe tracks too few points.
#[allow(clippy::too_many_arguments)]
pub fn create_initial_map_monocular(
    reference: &mut Frame,
    frame: &mut Frame,
    init: &TwoViewInit,
    atlas: &mut Atlas,
    ref_kf_id: KeyFrameId,
    cur_kf_id: KeyFrameId,
    vocabulary: &dyn Vocabulary,
) -> bool {
    reference.set_pose(SE3::identity());
    frame.set_pose(init.t_cw);
    reference.compute_bow(vocabulary);
    frame.compute_bow(vocabulary);
    let (Some(ref_kf), Some(cur_kf)) = (reference.to_keyframe(ref_kf_id), frame.to_keyframe(cur_kf_id)) else {
        return false;
    };

    let (map, db) = atlas.map_and_db_mut();
    map.add_keyframe(ref_kf);
    map.add_keyframe(cur_kf);

    frame.reset_matches();
    let mut created = Vec::with_capacity(init.correspondences.len());
    for &(i1, i2, position) in &init.correspondences {
        let mp_id = map.create_map_point(position, frame.descriptors[i2], cur_kf_id);
        map.associate(ref_kf_id, i1, mp_id);
        map.associate(cur_kf_id, i2, mp_id);
        frame.map_points[i2] = Some(mp_id);
        created.push(mp_id);
    }
    refresh_points(map, &created);
    map.update_spanning_parent(cur_kf_id);

    let median_depth = scene_median_depth(map, ref_kf_id);
    let tracked = map.tracked_map_points(cur_kf_id, 1);
    let Some(median_depth) = median_depth.filter(|d| *d > 0.0 && tracked >= MIN_INITIAL_TRACKED) else {
        warn!(
            "[MonoInit] wrong initialization (median depth {:?}, {} tracked), resetting",
            median_depth, tracked
        );
        map.clear();
        frame.reset_matches();
        frame.clear_pose();
        return false;
    };

    let inv_median = 1.0 / median_depth;
    let mut t_cw = init.t_cw;
    t_cw.translation *= inv_median;
    if let Some(kf) = map.get_keyframe_mut(cur_kf_id) {
        kf.t_cw = t_cw;
    }
    for mp_id in &created {
        if let Some(mp) = map.get_map_point_mut(*mp_id) {
            mp.position *= inv_median;
        }
    }
    refresh_points(map, &created);
    frame.set_pose(t_cw);

    for kf_id in [ref_kf_id, cur_kf_id] {
        if let Some(kf) = map.get_keyframe(kf_id) {
            db.add(kf_id, &kf.bow);
        }
    }
    frame.reference_kf = Some(cur_kf_id);
    info!("[MonoInit] new map with {} points", created.len());
    true
}

fn refresh_points(map: &mut Map, points: &[MapPointId]) {
    for mp_id in points {
        map.compute_distinctive_descriptor(*mp_id);
        map.update_map_point_normal_and_depth(*mp_id);
    }
}

/// Median depth of a keyframe's points in its camera frame.
fn scene_median_depth(map: &Map, kf_id: KeyFrameId) -> Option<f64> {
    let kf = map.get_keyframe(kf_id)?;
    let mut depths: Vec<f64> = kf
        .get_map_point_indices()
        .filter_map(|(_, mp_id)| map.get_map_point(mp_id))
        .map(|mp| kf.t_cw.transform_point(&mp.position).z)
        .collect();
    if depths.is_empty() {
        return None;
    }
    depths.sort_by(|a, b| a.total_cmp(b));
    Some(depths[(depths.len() - 1) / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use approx::assert_relative_eq;
    use rand::SeedableRng;

    use crate::atlas::map::keyframe::tests::test_calib;
    use crate::tracking::frame::{ExtractedFeatures, KeyPoint, ScaleLevels};
    use crate::vocabulary::OrbVocabulary;

    fn rgbd_frame(depths: &[f64]) -> Frame {
        let n = depths.len();
        let calib = test_calib();
        let keypoints: Vec<KeyPoint> = (0..n)
            .map(|i| KeyPoint::new(40.0 + 5.0 * i as f32, 200.0, 0))
            .collect();
        let descriptors = (0..n).map(|i| [i as u8; 32]).collect();
        let mut frame = Frame::new_monocular(
            0,
            0.0,
            ExtractedFeatures {
                keypoints,
                descriptors,
                pyramid: Vec::new(),
            },
            Arc::new(ScaleLevels::default()),
            calib,
        );
        for (i, &d) in depths.iter().enumerate() {
            frame.depth[i] = d;
            if d > 0.0 {
                frame.u_right[i] = frame.keypoints_un[i].x as f64 - frame.calib.bf / d;
            }
        }
        frame
    }

    #[test]
    fn test_stereo_initial_map_uses_valid_depth_only() {
        let mut frame = rgbd_frame(&[2.0, -1.0, 3.0, 4.0, 0.0]);
        let vocab = OrbVocabulary::flat(&[[0u8; 32], [255u8; 32]]);
        let mut atlas = Atlas::new();

        let n = create_initial_map_stereo(&mut frame, &mut atlas, KeyFrameId::new(0), &vocab);
        assert_eq!(n, 3);
        assert_eq!(atlas.num_keyframes(), 1);
        assert_eq!(frame.num_matches(), 3);
        assert!(frame.map_points[1].is_none());

        let map = atlas.active_map();
        let mp = map.get_map_point(frame.map_points[2].unwrap()).unwrap();
        assert_relative_eq!(mp.position.z, 3.0, epsilon = 1e-9);
        assert_eq!(mp.num_observations(), 1);
        assert_eq!(frame.reference_kf, Some(KeyFrameId::new(0)));
    }

    #[test]
    fn test_reference_needs_enough_features() {
        let mut init = MonocularInitializer::new(100);
        let mut rng = StdRng::seed_from_u64(0);
        let small = rgbd_frame(&[1.0; 20]);
        assert!(init.try_initialize(&small, &mut rng).is_none());
        assert!(!init.has_reference());

        let large = rgbd_frame(&[1.0; 101]);
        assert!(init.try_initialize(&large, &mut rng).is_none());
        assert!(init.has_reference());

        // A poor follow-up frame drops the reference.
        assert!(init.try_initialize(&small, &mut rng).is_none());
        assert!(!init.has_reference());
    }

    #[test]
    fn test_median_depth() {
        let mut frame = rgbd_frame(&[2.0, 5.0, 3.0, 9.0]);
        let vocab = OrbVocabulary::flat(&[[0u8; 32]]);
        let mut atlas = Atlas::new();
        create_initial_map_stereo(&mut frame, &mut atlas, KeyFrameId::new(0), &vocab);
        let median = scene_median_depth(atlas.active_map(), KeyFrameId::new(0)).unwrap();
        assert_relative_eq!(median, 3.0, epsilon = 1e-9);
    }
}
