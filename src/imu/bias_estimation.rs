//! Gyroscope bias re-estimation from a short window of tracked frames.
//!
//! Each entry pairs the body orientations of two consecutive frames with the
//! preintegration between them. The bias minimizes the rotation residuals
//! `Log(ΔR(b)^T R_i^T R_j)` by Gauss-Newton, linearizing `ΔR(b)` through the
//! preintegrated bias Jacobian.

use nalgebra::{Matrix3, Vector3};
use tracing::debug;

use crate::geometry::so3::log_so3;

use super::preintegration::PreintegratedState;
use super::sample::ImuBias;

const MAX_ITERATIONS: usize = 5;
const CONVERGENCE_THRESHOLD: f64 = 1e-9;

/// Consecutive frame pair of the estimation window.
#[derive(Debug, Clone)]
pub struct BiasWindowEntry {
    /// `R_wb` at the earlier frame.
    pub r_wb_i: Matrix3<f64>,
    /// `R_wb` at the later frame.
    pub r_wb_j: Matrix3<f64>,
    pub preint: PreintegratedState,
}

/// Refine the gyro bias starting from `initial`. The accelerometer bias is kept.
///
/// Returns `None` when the window is empty or the normal equations are singular.
pub fn estimate_gyro_bias(window: &[BiasWindowEntry], initial: &ImuBias) -> Option<ImuBias> {
    if window.is_empty() {
        return None;
    }
    let mut bias = *initial;

    for iter in 0..MAX_ITERATIONS {
        let mut h = Matrix3::zeros();
        let mut g = Vector3::zeros();
        let mut cost = 0.0;
        for entry in window {
            let d_r = entry.preint.delta_rotation(&bias);
            let r = log_so3(&(d_r.transpose() * entry.r_wb_i.transpose() * entry.r_wb_j));
            let j = entry.preint.j_rot_gyro;
            h += j.transpose() * j;
            g += j.transpose() * r;
            cost += r.norm_squared();
        }

        let delta = h.cholesky()?.solve(&g);
        bias.gyro += delta;
        debug!(
            "[GyroBias] iter {} cost {:.3e} |delta| {:.3e}",
            iter,
            cost,
            delta.norm()
        );
        if delta.norm() < CONVERGENCE_THRESHOLD {
            break;
        }
    }

    Some(bias)
}
