//! On-manifold IMU preintegration (Forster et al.).
//!
//! Accumulates rotation, velocity and position deltas between two anchors
//! together with their Jacobians w.r.t. the gyro/accel biases, so a bias
//! update can be applied to the deltas to first order without re-integrating.
//! The 9x9 covariance is ordered `[δθ, δv, δp]`.

use nalgebra::{Matrix3, Vector3};
use tracing::warn;

use crate::geometry::so3::{exp_so3, normalize_rotation, right_jacobian_so3, skew};

use super::sample::{ImuBias, ImuNoise, ImuSample};
use super::types::{Matrix6, Matrix9, Matrix9x6};

/// Preintegrated motion between two anchors.
#[derive(Debug, Clone, PartialEq)]
pub struct PreintegratedState {
    pub delta_rot: Matrix3<f64>,
    pub delta_vel: Vector3<f64>,
    pub delta_pos: Vector3<f64>,
    pub dt: f64,

    pub j_rot_gyro: Matrix3<f64>,
    pub j_vel_gyro: Matrix3<f64>,
    pub j_vel_accel: Matrix3<f64>,
    pub j_pos_gyro: Matrix3<f64>,
    pub j_pos_accel: Matrix3<f64>,

    pub covariance: Matrix9,
    /// Linearization bias the deltas were integrated with.
    pub bias: ImuBias,
}

impl PreintegratedState {
    pub fn identity(bias: ImuBias) -> Self {
        Self {
            delta_rot: Matrix3::identity(),
            delta_vel: Vector3::zeros(),
            delta_pos: Vector3::zeros(),
            dt: 0.0,
            j_rot_gyro: Matrix3::zeros(),
            j_vel_gyro: Matrix3::zeros(),
            j_vel_accel: Matrix3::zeros(),
            j_pos_gyro: Matrix3::zeros(),
            j_pos_accel: Matrix3::zeros(),
            covariance: Matrix9::zeros(),
            bias,
        }
    }

    /// Rotation delta corrected to first order for `bias`.
    pub fn delta_rotation(&self, bias: &ImuBias) -> Matrix3<f64> {
        let dbg = bias.gyro - self.bias.gyro;
        normalize_rotation(&(self.delta_rot * exp_so3(&(self.j_rot_gyro * dbg))))
    }

    pub fn delta_velocity(&self, bias: &ImuBias) -> Vector3<f64> {
        let dbg = bias.gyro - self.bias.gyro;
        let dba = bias.accel - self.bias.accel;
        self.delta_vel + self.j_vel_gyro * dbg + self.j_vel_accel * dba
    }

    pub fn delta_position(&self, bias: &ImuBias) -> Vector3<f64> {
        let dbg = bias.gyro - self.bias.gyro;
        let dba = bias.accel - self.bias.accel;
        self.delta_pos + self.j_pos_gyro * dbg + self.j_pos_accel * dba
    }
}

/// IMU preintegrator: integrates high-rate IMU into a relative motion prior.
#[derive(Debug, Clone)]
pub struct Preintegrator {
    pub noise: ImuNoise,
    pub state: PreintegratedState,
}

impl Preintegrator {
    pub fn new(bias: ImuBias, noise: ImuNoise) -> Self {
        Self {
            noise,
            state: PreintegratedState::identity(bias),
        }
    }

    /// Restart from identity, linearizing around `bias`.
    pub fn reset(&mut self, bias: ImuBias) {
        self.state = PreintegratedState::identity(bias);
    }

    pub fn bias(&self) -> &ImuBias {
        &self.state.bias
    }

    /// Integrate one measurement held constant over `dt`.
    ///
    /// Position and velocity are updated before the rotation so both use the
    /// rotation at the start of the step.
    pub fn update(&mut self, gyro: &Vector3<f64>, accel: &Vector3<f64>, dt: f64) {
        let s = &mut self.state;
        let acc = accel - s.bias.accel;
        let ang = gyro - s.bias.gyro;

        let dt2 = dt * dt;
        let w_acc = skew(&acc);

        s.delta_pos += s.delta_vel * dt + 0.5 * s.delta_rot * acc * dt2;
        s.delta_vel += s.delta_rot * acc * dt;

        let mut a = Matrix9::identity();
        let mut b = Matrix9x6::zeros();
        a.fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(-s.delta_rot * dt * w_acc));
        a.fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&(-0.5 * s.delta_rot * dt2 * w_acc));
        a.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(Matrix3::identity() * dt));
        b.fixed_view_mut::<3, 3>(3, 3).copy_from(&(s.delta_rot * dt));
        b.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(0.5 * s.delta_rot * dt2));

        s.j_pos_accel += s.j_vel_accel * dt - 0.5 * s.delta_rot * dt2;
        s.j_pos_gyro += s.j_vel_gyro * dt - 0.5 * s.delta_rot * dt2 * w_acc * s.j_rot_gyro;
        s.j_vel_accel -= s.delta_rot * dt;
        s.j_vel_gyro -= s.delta_rot * dt * w_acc * s.j_rot_gyro;

        let phi = ang * dt;
        let inc_rot = exp_so3(&phi);
        let right_j = right_jacobian_so3(&phi);
        s.delta_rot = normalize_rotation(&(s.delta_rot * inc_rot));

        a.fixed_view_mut::<3, 3>(0, 0).copy_from(&inc_rot.transpose());
        b.fixed_view_mut::<3, 3>(0, 0).copy_from(&(right_j * dt));

        if dt > 0.0 {
            let mut noise = Matrix6::zeros();
            let ng = self.noise.sigma_gyro * self.noise.sigma_gyro / dt;
            let na = self.noise.sigma_accel * self.noise.sigma_accel / dt;
            for i in 0..3 {
                noise[(i, i)] = ng;
                noise[(i + 3, i + 3)] = na;
            }
            s.covariance = a * s.covariance * a.transpose() + b * noise * b.transpose();
        }

        s.j_rot_gyro = inc_rot.transpose() * s.j_rot_gyro - right_j * dt;
        s.dt += dt;
    }

    /// Integrate the samples recorded between two frame timestamps.
    ///
    /// The first segment runs from `t_start` to the first sample, each sample
    /// is then integrated with the midpoint of its successor until the last,
    /// which is held until `t_end`. Non-positive intervals are reported but
    /// still integrated so the chain of deltas stays continuous.
    pub fn integrate_between(&mut self, samples: &[ImuSample], t_start: f64, t_end: f64) {
        let Some(first) = samples.first() else {
            warn!("[Preintegration] no IMU samples between {:.6} and {:.6}", t_start, t_end);
            return;
        };

        let head_dt = first.timestamp - t_start;
        if head_dt < 0.0 {
            warn!("[Preintegration] sample at {:.6} precedes interval start {:.6}", first.timestamp, t_start);
        }
        if head_dt != 0.0 {
            self.update(&first.gyro, &first.accel, head_dt);
        }

        for pair in samples.windows(2) {
            let dt = pair[1].timestamp - pair[0].timestamp;
            if dt <= 0.0 {
                warn!(
                    "[Preintegration] non-positive dt {:.6} between samples at {:.6} and {:.6}",
                    dt, pair[0].timestamp, pair[1].timestamp
                );
            }
            let gyro = 0.5 * (pair[0].gyro + pair[1].gyro);
            let accel = 0.5 * (pair[0].accel + pair[1].accel);
            self.update(&gyro, &accel, dt);
        }

        if let Some(last) = samples.last() {
            let tail_dt = t_end - last.timestamp;
            if tail_dt < 0.0 {
                warn!("[Preintegration] sample at {:.6} follows interval end {:.6}", last.timestamp, t_end);
            }
            if tail_dt != 0.0 {
                self.update(&last.gyro, &last.accel, tail_dt);
            }
        }
    }
}
