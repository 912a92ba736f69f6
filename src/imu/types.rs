//! Fixed-size matrices of the preintegration error state `[δθ, δv, δp]`.

use nalgebra::SMatrix;

/// Covariance of the preintegrated deltas.
pub type Matrix9 = SMatrix<f64, 9, 9>;

/// Error-state sensitivity to the gyro/accel measurement noise.
pub type Matrix9x6 = SMatrix<f64, 9, 6>;

/// Discrete gyro/accel measurement noise.
pub type Matrix6 = SMatrix<f64, 6, 6>;
