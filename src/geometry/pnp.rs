//! PnP (Perspective-n-Point) solver: RANSAC over linear 6-point DLT
//! hypotheses, followed by a DLT refit on the consensus set.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use tracing::debug;

use crate::geometry::two_view::smallest_eigenvector;
use crate::geometry::SE3;
use crate::tracking::frame::CalibrationContext;

/// Minimal correspondence set of the linear solver.
const DLT_MIN_SET: usize = 6;

/// RANSAC parameters.
#[derive(Debug, Clone, Copy)]
pub struct PnPParams {
    pub probability: f64,
    pub min_inliers: usize,
    pub max_iterations: usize,
    /// Expected inlier ratio used to size the iteration budget.
    pub epsilon: f64,
    /// Chi-square threshold, scaled by each observation's level sigma².
    pub th2: f64,
}

impl Default for PnPParams {
    fn default() -> Self {
        Self {
            probability: 0.99,
            min_inliers: 10,
            max_iterations: 300,
            epsilon: 0.5,
            th2: 5.991,
        }
    }
}

/// Result of PnP solving.
#[derive(Debug, Clone)]
pub struct PnPResult {
    /// Estimated camera pose (T_cw).
    pub t_cw: SE3,
    /// Inlier mask per correspondence.
    pub inliers: Vec<bool>,
    pub n_inliers: usize,
}

/// Pose from a linear DLT fit in normalized coordinates. `None` when the
/// configuration is degenerate.
fn dlt_pose(points3d: &[Vector3<f64>], bearings: &[Vector2<f64>], idx: &[usize]) -> Option<SE3> {
    let mut a = DMatrix::zeros(2 * idx.len(), 12);
    for (row, &i) in idx.iter().enumerate() {
        let p = points3d[i];
        let (x, y) = (bearings[i].x, bearings[i].y);
        let hp = [p.x, p.y, p.z, 1.0];
        for j in 0..4 {
            a[(2 * row, j)] = hp[j];
            a[(2 * row, 8 + j)] = -x * hp[j];
            a[(2 * row + 1, 4 + j)] = hp[j];
            a[(2 * row + 1, 8 + j)] = -y * hp[j];
        }
    }
    let sol = smallest_eigenvector(&a);
    let mut m = Matrix3::new(
        sol[0], sol[1], sol[2],
        sol[4], sol[5], sol[6],
        sol[8], sol[9], sol[10],
    );
    let mut t = Vector3::new(sol[3], sol[7], sol[11]);
    if m.determinant() < 0.0 {
        m = -m;
        t = -t;
    }

    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let scale = svd.singular_values.mean();
    if scale.abs() < 1e-12 {
        return None;
    }
    let r = u * v_t;
    if r.determinant() < 0.0 {
        return None;
    }
    Some(SE3::from_rt(r, t / scale))
}

/// Inlier flags of a pose under the per-observation chi-square test.
fn classify(
    t_cw: &SE3,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    sigma2: &[f64],
    calib: &CalibrationContext,
    th2: f64,
) -> (Vec<bool>, usize) {
    let mut inliers = vec![false; points3d.len()];
    let mut n = 0;
    for i in 0..points3d.len() {
        let p_c = t_cw.transform_point(&points3d[i]);
        if p_c.z <= 0.0 {
            continue;
        }
        let err = calib.project(&p_c) - points2d[i];
        if err.norm_squared() < th2 * sigma2[i] {
            inliers[i] = true;
            n += 1;
        }
    }
    (inliers, n)
}

/// Solve PnP with RANSAC given 3D-2D correspondences.
///
/// # Arguments
/// * `points3d` - world points
/// * `points2d` - undistorted pixel observations
/// * `sigma2` - pyramid level variance of each observation
/// * `calib` - camera intrinsics
pub fn solve_pnp_ransac(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    sigma2: &[f64],
    calib: &CalibrationContext,
    params: &PnPParams,
    rng: &mut StdRng,
) -> Option<PnPResult> {
    let n = points3d.len();
    if n < DLT_MIN_SET || points2d.len() != n || sigma2.len() != n {
        return None;
    }

    let bearings: Vec<Vector2<f64>> = points2d
        .iter()
        .map(|p| {
            let b = calib.normalized(p.x, p.y);
            Vector2::new(b.x, b.y)
        })
        .collect();

    let min_inliers = params
        .min_inliers
        .max(DLT_MIN_SET)
        .max((params.epsilon * n as f64) as usize);
    let epsilon = (min_inliers as f64 / n as f64).max(params.epsilon);
    let iterations = if min_inliers == n {
        1
    } else {
        let needed = (1.0 - params.probability).ln() / (1.0 - epsilon.powi(DLT_MIN_SET as i32)).ln();
        (needed.ceil().max(1.0) as usize).min(params.max_iterations)
    };

    let mut best: Option<(SE3, Vec<bool>, usize)> = None;
    for _ in 0..iterations {
        let idx = sample(rng, n, DLT_MIN_SET).into_vec();
        let Some(pose) = dlt_pose(points3d, &bearings, &idx) else {
            continue;
        };
        let (inliers, n_in) = classify(&pose, points3d, points2d, sigma2, calib, params.th2);
        if best.as_ref().map_or(true, |b| n_in > b.2) {
            best = Some((pose, inliers, n_in));
        }
    }

    let (mut pose, mut inliers, mut n_in) = best?;
    if n_in < min_inliers {
        debug!("[PnP] best hypothesis has {} inliers, need {}", n_in, min_inliers);
        return None;
    }

    // Refit on the consensus set.
    let consensus: Vec<usize> = (0..n).filter(|&i| inliers[i]).collect();
    if let Some(refined) = dlt_pose(points3d, &bearings, &consensus) {
        let (r_inliers, r_n) = classify(&refined, points3d, points2d, sigma2, calib, params.th2);
        if r_n >= n_in {
            pose = refined;
            inliers = r_inliers;
            n_in = r_n;
        }
    }

    Some(PnPResult {
        t_cw: pose,
        inliers,
        n_inliers: n_in,
    })
}
