//! Motion-only optimization of a tracked frame.
//!
//! Refines the frame's `T_cw` against its matched map points, which stay
//! fixed. Runs several rounds of Gauss-Newton; after each round every
//! observation is re-classified as inlier or outlier by its chi-squared error,
//! and outliers do not contribute to the next round.

use nalgebra::{Matrix2x6, Matrix3, Matrix3x6, Matrix6, Vector2, Vector3, Vector6};
use tracing::debug;

use crate::atlas::map::Map;
use crate::geometry::so3::skew;
use crate::geometry::SE3;
use crate::tracking::frame::CalibrationContext;
use crate::tracking::tracking_frame::Frame;

/// Configuration for pose-only optimization.
#[derive(Debug, Clone)]
pub struct PoseOptimConfig {
    /// Classification rounds.
    pub rounds: usize,
    /// Gauss-Newton iterations per round.
    pub iterations_per_round: usize,
    /// 95% chi2 with 2 DOF.
    pub chi2_mono: f64,
    /// 95% chi2 with 3 DOF.
    pub chi2_stereo: f64,
    /// Rounds from this index on drop the Huber kernel.
    pub robust_rounds: usize,
}

impl Default for PoseOptimConfig {
    fn default() -> Self {
        Self {
            rounds: 4,
            iterations_per_round: 10,
            chi2_mono: 5.991,
            chi2_stereo: 7.815,
            robust_rounds: 2,
        }
    }
}

/// Below this many observations the pose is left untouched.
const MIN_OBSERVATIONS: usize = 3;

/// A fixed 3D point observed by one frame feature.
struct PoseObservation {
    feature_idx: usize,
    point_world: Vector3<f64>,
    uv: Vector2<f64>,
    /// Present for features with depth.
    u_right: Option<f64>,
    inv_sigma2: f64,
}

impl PoseObservation {
    /// Residual (observed minus projected) and its Jacobian with respect to a
    /// left increment `[omega, upsilon]`. `None` behind the camera.
    fn linearize(&self, t_cw: &SE3, calib: &CalibrationContext) -> Option<(Vec<f64>, Vec<Vector6<f64>>)> {
        let p_c = t_cw.transform_point(&self.point_world);
        if p_c.z <= 1e-6 {
            return None;
        }
        let inv_z = 1.0 / p_c.z;
        let inv_z2 = inv_z * inv_z;
        let u = calib.fx * p_c.x * inv_z + calib.cx;
        let v = calib.fy * p_c.y * inv_z + calib.cy;

        // d p_c / d [omega, upsilon]
        let mut dp = Matrix3x6::zeros();
        dp.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-skew(&p_c)));
        dp.fixed_view_mut::<3, 3>(0, 3).copy_from(&Matrix3::identity());

        let mut proj = Matrix2x6::zeros();
        let du = Vector3::new(calib.fx * inv_z, 0.0, -calib.fx * p_c.x * inv_z2);
        let dv = Vector3::new(0.0, calib.fy * inv_z, -calib.fy * p_c.y * inv_z2);
        proj.row_mut(0).copy_from(&(du.transpose() * dp));
        proj.row_mut(1).copy_from(&(dv.transpose() * dp));

        let mut residual = vec![self.uv.x - u, self.uv.y - v];
        let mut jacobian = vec![-proj.row(0).transpose(), -proj.row(1).transpose()];

        if let Some(ur_obs) = self.u_right {
            let ur = u - calib.bf * inv_z;
            let dur = Vector3::new(
                calib.fx * inv_z,
                0.0,
                (-calib.fx * p_c.x + calib.bf) * inv_z2,
            );
            residual.push(ur_obs - ur);
            jacobian.push(-(dur.transpose() * dp).transpose());
        }
        Some((residual, jacobian))
    }

    fn chi2(&self, t_cw: &SE3, calib: &CalibrationContext) -> f64 {
        match self.linearize(t_cw, calib) {
            Some((residual, _)) => residual.iter().map(|r| r * r).sum::<f64>() * self.inv_sigma2,
            None => f64::INFINITY,
        }
    }
}

/// Huber weight for a whitened error norm.
fn huber_weight(error_norm: f64, delta: f64) -> f64 {
    if error_norm <= delta {
        1.0
    } else {
        delta / error_norm
    }
}

/// Optimize the pose of `frame` with default settings.
///
/// Updates the frame pose and its outlier flags and returns the number of
/// inlier correspondences. Returns 0 without touching the frame when it has
/// no pose or fewer than three usable matches.
pub fn optimize_pose(frame: &mut Frame, map: &Map) -> usize {
    optimize_pose_with(frame, map, &PoseOptimConfig::default())
}

pub fn optimize_pose_with(frame: &mut Frame, map: &Map, config: &PoseOptimConfig) -> usize {
    let Some(mut t_cw) = frame.pose().cloned() else {
        return 0;
    };

    let mut observations = Vec::new();
    for (i, mp_id) in frame.map_points.iter().enumerate() {
        let Some(mp) = mp_id.and_then(|id| map.get_map_point(id)) else {
            continue;
        };
        let kp = &frame.keypoints_un[i];
        let u_right = (frame.u_right[i] >= 0.0).then_some(frame.u_right[i]);
        observations.push(PoseObservation {
            feature_idx: i,
            point_world: mp.position,
            uv: Vector2::new(kp.x as f64, kp.y as f64),
            u_right,
            inv_sigma2: frame.scale.inv_sigma2(kp.octave),
        });
        frame.outliers[i] = false;
    }

    if observations.len() < MIN_OBSERVATIONS {
        return 0;
    }

    let delta_mono = config.chi2_mono.sqrt();
    let delta_stereo = config.chi2_stereo.sqrt();
    let calib = frame.calib.clone();
    let mut is_outlier = vec![false; observations.len()];
    let mut n_bad = 0;

    for round in 0..config.rounds {
        let robust = round < config.robust_rounds;

        for _ in 0..config.iterations_per_round {
            let mut h = Matrix6::<f64>::zeros();
            let mut b = Vector6::<f64>::zeros();
            let mut n_active = 0;

            for (obs, _) in observations.iter().zip(&is_outlier).filter(|(_, out)| !**out) {
                let Some((residual, jacobian)) = obs.linearize(&t_cw, &calib) else {
                    continue;
                };
                let chi2 = residual.iter().map(|r| r * r).sum::<f64>() * obs.inv_sigma2;
                let delta = if obs.u_right.is_some() { delta_stereo } else { delta_mono };
                let w = if robust { huber_weight(chi2.sqrt(), delta) } else { 1.0 };
                let info = obs.inv_sigma2 * w;
                for (r, j) in residual.iter().zip(&jacobian) {
                    h += info * j * j.transpose();
                    b -= info * j * *r;
                }
                n_active += 1;
            }
            if n_active < MIN_OBSERVATIONS {
                break;
            }

            let Some(step) = h.cholesky().map(|c| c.solve(&b)) else {
                break;
            };
            t_cw = t_cw.retract_left(&step);
            if step.norm() < 1e-10 {
                break;
            }
        }

        n_bad = 0;
        for (obs, outlier) in observations.iter().zip(is_outlier.iter_mut()) {
            let chi2 = obs.chi2(&t_cw, &calib);
            let th = if obs.u_right.is_some() { config.chi2_stereo } else { config.chi2_mono };
            *outlier = chi2 > th;
            if *outlier {
                n_bad += 1;
            }
        }

        if observations.len() - n_bad < 10 {
            break;
        }
    }

    for (obs, outlier) in observations.iter().zip(&is_outlier) {
        frame.outliers[obs.feature_idx] = *outlier;
    }
    frame.set_pose(t_cw);

    let n_inliers = observations.len() - n_bad;
    debug!(
        "Pose optimization frame {}: {}/{} inliers",
        frame.id,
        n_inliers,
        observations.len()
    );
    n_inliers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::atlas::map::keyframe::tests::test_calib;
    use crate::atlas::map::KeyFrameId;
    use crate::tracking::frame::{ExtractedFeatures, KeyPoint, ScaleLevels};

    /// Frame observing `n` random points from `t_true`, with depth when
    /// `stereo` is set.
    fn scene(n: usize, t_true: &SE3, stereo: bool) -> (Frame, Map) {
        let calib = test_calib();
        let mut rng = StdRng::seed_from_u64(11);
        let mut map = Map::new();
        let mut kps = Vec::new();
        let mut ids = Vec::new();
        let mut u_right = Vec::new();
        let t_wc = t_true.inverse();
        while kps.len() < n {
            let p_c = Vector3::new(rng.gen_range(-2.0..2.0), rng.gen_range(-1.5..1.5), rng.gen_range(3.0..8.0));
            let uv = calib.project(&p_c);
            if !calib.bounds.contains(uv.x, uv.y) {
                continue;
            }
            kps.push(KeyPoint::new(uv.x as f32, uv.y as f32, 0));
            u_right.push(uv.x - calib.bf / p_c.z);
            let p_w = t_wc.transform_point(&p_c);
            ids.push(map.create_map_point(p_w, [0u8; 32], KeyFrameId::new(0)));
        }
        let mut frame = Frame::new_monocular(
            1,
            0.0,
            ExtractedFeatures {
                keypoints: kps,
                descriptors: vec![[0u8; 32]; n],
                pyramid: Vec::new(),
            },
            Arc::new(ScaleLevels::default()),
            calib,
        );
        if stereo {
            frame.u_right = u_right;
        }
        frame.map_points = ids.into_iter().map(Some).collect();
        (frame, map)
    }

    fn true_pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.02, -0.05, 0.01),
            translation: Vector3::new(0.1, -0.05, 0.2),
        }
    }

    #[test]
    fn test_recovers_pose_from_perturbed_guess() {
        let t_true = true_pose();
        let (mut frame, map) = scene(60, &t_true, false);
        frame.set_pose(SE3::identity());

        let n = optimize_pose(&mut frame, &map);
        assert_eq!(n, 60);
        let est = frame.pose().unwrap();
        assert_relative_eq!(est.translation, t_true.translation, epsilon = 1e-6);
        assert!(est.rotation.angle_to(&t_true.rotation) < 1e-6);
    }

    #[test]
    fn test_flags_gross_outliers() {
        let t_true = true_pose();
        let (mut frame, map) = scene(50, &t_true, true);
        for i in 0..5 {
            let kp = frame.keypoints_un[i];
            frame.keypoints_un[i] = kp.with_position(kp.x + 40.0, kp.y - 30.0);
        }
        frame.set_pose(t_true);

        let n = optimize_pose(&mut frame, &map);
        assert_eq!(n, 45);
        assert!(frame.outliers[..5].iter().all(|&o| o));
        assert!(frame.outliers[5..].iter().all(|&o| !o));
        assert_eq!(frame.discard_outliers(), 5);
    }

    #[test]
    fn test_too_few_observations() {
        let (mut frame, map) = scene(2, &SE3::identity(), false);
        frame.set_pose(SE3::identity());
        assert_eq!(optimize_pose(&mut frame, &map), 0);

        frame.clear_pose();
        assert_eq!(optimize_pose(&mut frame, &map), 0);
    }
}
