//! Body navigation state and its inertial prediction.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use crate::geometry::frames::FrameConverter;
use crate::geometry::so3::normalize_rotation;
use crate::geometry::SE3;

use super::preintegration::PreintegratedState;
use super::sample::{ImuBias, GRAVITY};

/// Body orientation, position and velocity in world, plus the bias estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavState {
    /// `R_wb`.
    pub rotation: UnitQuaternion<f64>,
    /// `p_wb`.
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub bias: ImuBias,
}

impl NavState {
    /// Body state of a camera pose `T_cw` with the given velocity and bias.
    pub fn from_camera_pose(
        t_cw: &SE3,
        velocity: Vector3<f64>,
        bias: ImuBias,
        frames: &FrameConverter,
    ) -> Self {
        let (rotation, position) = frames.body_from_t_cw(t_cw);
        Self {
            rotation,
            position,
            velocity,
            bias,
        }
    }

    /// Camera pose `T_cw` of this body state.
    pub fn camera_pose(&self, frames: &FrameConverter) -> SE3 {
        frames.t_cw_from_body(&self.rotation, &self.position)
    }

    /// Propagate through a preintegrated interval using this state's bias.
    ///
    /// ```text
    /// R_j = R_i * ΔR
    /// p_j = p_i + v_i dt + ½ g dt² + R_i ΔP
    /// v_j = v_i + g dt + R_i ΔV
    /// ```
    pub fn predict(&self, preint: &PreintegratedState) -> NavState {
        let dt = preint.dt;
        let r_wb: Matrix3<f64> = self.rotation.to_rotation_matrix().into_inner();

        let r_j = normalize_rotation(&(r_wb * preint.delta_rotation(&self.bias)));
        let p_j = self.position
            + self.velocity * dt
            + 0.5 * GRAVITY * dt * dt
            + r_wb * preint.delta_position(&self.bias);
        let v_j = self.velocity + GRAVITY * dt + r_wb * preint.delta_velocity(&self.bias);

        NavState {
            rotation: UnitQuaternion::from_matrix(&r_j),
            position: p_j,
            velocity: v_j,
            bias: self.bias,
        }
    }
}
