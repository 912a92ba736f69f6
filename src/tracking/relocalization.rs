//! Relocalization against the keyframe database.

use std::collections::HashSet;

use nalgebra::{Vector2, Vector3};
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::atlas::keyframe_db::KeyFrameDatabase;
use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::pnp::{solve_pnp_ransac, PnPParams};
use crate::optimizer::optimize_pose;
use crate::tracking::matching::OrbMatcher;
use crate::tracking::tracking_frame::Frame;
use crate::vocabulary::Vocabulary;

/// BoW matches a candidate needs before a PnP hypothesis is attempted.
const MIN_BOW_MATCHES: usize = 15;
/// Inliers after the first pose optimization.
const MIN_OPTIMIZED_INLIERS: usize = 10;
/// Inliers needed to accept the relocalized pose.
const MIN_FINAL_INLIERS: usize = 50;

/// Outcome of a relocalization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocalizationOutcome {
    pub candidates: usize,
    /// Keyframe the frame was relocalized against.
    pub keyframe: Option<KeyFrameId>,
    pub n_inliers: usize,
}

impl RelocalizationOutcome {
    pub fn is_success(&self) -> bool {
        self.keyframe.is_some()
    }
}

/// Try to recover the pose of a frame that lost track.
///
/// On success the frame holds the recovered pose and its inlier
/// associations. On failure its associations are cleared and the pose is
/// left unset.
pub fn relocalize(
    frame: &mut Frame,
    map: &Map,
    keyframe_db: &KeyFrameDatabase,
    vocabulary: &dyn Vocabulary,
    rng: &mut StdRng,
) -> RelocalizationOutcome {
    frame.compute_bow(vocabulary);
    let Some(bow) = frame.bow.as_ref() else {
        return RelocalizationOutcome {
            candidates: 0,
            keyframe: None,
            n_inliers: 0,
        };
    };
    let candidates = keyframe_db.detect_relocalization_candidates(bow, map, vocabulary);
    let mut outcome = RelocalizationOutcome {
        candidates: candidates.len(),
        keyframe: None,
        n_inliers: 0,
    };
    if candidates.is_empty() {
        debug!("[Reloc] frame {}: no candidates", frame.id);
        return outcome;
    }

    let matcher = OrbMatcher::new(0.75, true);
    let params = PnPParams::default();

    for kf_id in candidates {
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };
        let (n_bow, matches) = matcher.search_by_bow(kf, frame, map);
        if n_bow < MIN_BOW_MATCHES {
            continue;
        }

        let mut feature_indices = Vec::with_capacity(n_bow);
        let mut points3d: Vec<Vector3<f64>> = Vec::with_capacity(n_bow);
        let mut points2d: Vec<Vector2<f64>> = Vec::with_capacity(n_bow);
        let mut sigma2 = Vec::with_capacity(n_bow);
        for (idx, mp_id) in matches.iter().enumerate() {
            let Some(mp) = mp_id.and_then(|id| map.get_map_point(id)) else {
                continue;
            };
            let kp = &frame.keypoints_un[idx];
            feature_indices.push(idx);
            points3d.push(mp.position);
            points2d.push(Vector2::new(kp.x as f64, kp.y as f64));
            sigma2.push(frame.scale.sigma2(kp.octave));
        }

        let Some(pnp) = solve_pnp_ransac(&points3d, &points2d, &sigma2, &frame.calib, &params, rng) else {
            continue;
        };

        frame.reset_matches();
        for (k, &idx) in feature_indices.iter().enumerate() {
            if pnp.inliers[k] {
                frame.map_points[idx] = matches[idx];
            }
        }
        frame.set_pose(pnp.t_cw);

        let mut n_good = optimize_pose(frame, map);
        if n_good < MIN_OPTIMIZED_INLIERS {
            continue;
        }
        frame.discard_outliers();

        if n_good < MIN_FINAL_INLIERS {
            n_good = extend_by_projection(frame, map, kf_id, n_good);
        }

        if n_good >= MIN_FINAL_INLIERS {
            info!(
                "[Reloc] frame {} relocalized against {} with {} inliers",
                frame.id, kf_id, n_good
            );
            outcome.keyframe = Some(kf_id);
            outcome.n_inliers = n_good;
            return outcome;
        }
    }

    frame.reset_matches();
    frame.clear_pose();
    debug!("[Reloc] frame {}: {} candidates, none verified", frame.id, outcome.candidates);
    outcome
}

/// Guided search in the candidate keyframe for more correspondences, first
/// with a wide window, then with a narrow one and a tighter descriptor bound.
fn extend_by_projection(frame: &mut Frame, map: &Map, kf_id: KeyFrameId, mut n_good: usize) -> usize {
    let Some(kf) = map.get_keyframe(kf_id) else {
        return n_good;
    };
    let matcher = OrbMatcher::new(0.9, true);

    let found = matched_set(frame);
    let n_additional = matcher.search_by_projection_keyframe(frame, kf, map, &found, 10.0, 100);
    if n_additional + n_good < MIN_FINAL_INLIERS {
        return n_good;
    }
    n_good = optimize_pose(frame, map);

    if n_good > 30 && n_good < MIN_FINAL_INLIERS {
        frame.discard_outliers();
        let found = matched_set(frame);
        let n_additional = matcher.search_by_projection_keyframe(frame, kf, map, &found, 3.0, 64);
        if n_good + n_additional >= MIN_FINAL_INLIERS {
            n_good = optimize_pose(frame, map);
        }
    }
    frame.discard_outliers();
    n_good
}

fn matched_set(frame: &Frame) -> HashSet<MapPointId> {
    frame.map_points.iter().flatten().copied().collect()
}
