//! SO(3) Lie group utilities for IMU preintegration and bias estimation.
//!
//! Provides the exponential/logarithm maps, skew-symmetric matrix construction
//! and the right Jacobian Jr(φ) following the convention in Forster et al.
//! "IMU Preintegration on Manifold".

use nalgebra::{Matrix3, Rotation3, Vector3};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map so(3) -> SO(3) as a rotation matrix.
pub fn exp_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::from_scaled_axis(*phi).into_inner()
}

/// Logarithm map SO(3) -> so(3).
///
/// The input is projected onto SO(3) first, so accumulated products of
/// rotation matrices can be passed without renormalizing.
pub fn log_so3(r: &Matrix3<f64>) -> Vector3<f64> {
    Rotation3::from_matrix(r).scaled_axis()
}

/// Re-orthonormalize a drifting rotation matrix.
pub fn normalize_rotation(r: &Matrix3<f64>) -> Matrix3<f64> {
    Rotation3::from_matrix(r).into_inner()
}

/// Computes the right Jacobian Jr(φ) of SO(3).
///
/// The right Jacobian relates the derivative of the exponential map to the
/// Lie algebra element:
///
/// ```text
/// Jr(φ) = I - (1 - cos|φ|)/|φ|² [φ]× + (|φ| - sin|φ|)/|φ|³ [φ]×²
/// ```
///
/// For small angles (|φ| < ε):
/// ```text
/// Jr(φ) ≈ I - 0.5 [φ]×
/// ```
pub fn right_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();

    if theta < SMALL_ANGLE_THRESHOLD {
        // First-order approximation for small angles
        return Matrix3::identity() - 0.5 * skew(phi);
    }

    let theta_sq = theta * theta;
    let theta_cu = theta_sq * theta;
    let sin_theta = theta.sin();
    let cos_theta = theta.cos();

    let skew_phi = skew(phi);
    let skew_phi_sq = skew_phi * skew_phi;

    // Jr(φ) = I - (1 - cos θ)/θ² [φ]× + (θ - sin θ)/θ³ [φ]×²
    Matrix3::identity()
        - ((1.0 - cos_theta) / theta_sq) * skew_phi
        + ((theta - sin_theta) / theta_cu) * skew_phi_sq
}
