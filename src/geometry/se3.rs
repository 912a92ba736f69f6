//! Rigid body transform in SE(3).
//!
//! Poses in the tracker are stored as `T_cw` (world to camera), matching the
//! convention of the camera projection model: `p_cam = t_cw.transform_point(p_world)`.

use std::ops::Mul;

use nalgebra::{Matrix3, Matrix4, UnitQuaternion, Vector3, Vector6};

/// Rotation + translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a rotation matrix and a translation.
    ///
    /// The matrix is re-orthonormalized, so slightly drifted inputs (e.g. from
    /// a linear solver) are accepted.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_matrix(&rotation),
            translation,
        }
    }

    /// Build from a homogeneous 4x4 matrix.
    pub fn from_matrix(m: Matrix4<f64>) -> Self {
        let r = m.fixed_view::<3, 3>(0, 0).into_owned();
        let t = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
        Self::from_rt(r, t)
    }

    /// Build from a row-major 4x4 slice.
    pub fn from_row_slice(data: &[f64; 16]) -> Self {
        Self::from_matrix(Matrix4::from_row_slice(data))
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        m[(0, 3)] = self.translation.x;
        m[(1, 3)] = self.translation.y;
        m[(2, 3)] = self.translation.z;
        m
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// `self * other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Left-multiplicative increment `exp(delta) * self` with
    /// `delta = [omega, upsilon]` on SO(3) x R3.
    pub fn retract_left(&self, delta: &Vector6<f64>) -> Self {
        let omega = Vector3::new(delta[0], delta[1], delta[2]);
        let upsilon = Vector3::new(delta[3], delta[4], delta[5]);
        let dr = UnitQuaternion::from_scaled_axis(omega);
        Self {
            rotation: dr * self.rotation,
            translation: dr * self.translation + upsilon,
        }
    }

    /// Optical center in world coordinates when `self` is `T_cw`.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        self.compose(&rhs)
    }
}

impl Mul<&SE3> for &SE3 {
    type Output = SE3;

    fn mul(self, rhs: &SE3) -> SE3 {
        self.compose(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, -0.3, 0.7),
            translation: Vector3::new(1.0, -2.0, 0.5),
        }
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let t = sample_pose();
        let id = t.compose(&t.inverse());
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(id.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_matrix_roundtrip_preserves_action() {
        let t = sample_pose();
        let back = SE3::from_matrix(t.to_matrix());
        let p = Vector3::new(0.3, 0.2, 4.0);
        assert_relative_eq!(t.transform_point(&p), back.transform_point(&p), epsilon = 1e-10);
    }

    #[test]
    fn test_camera_center_maps_to_origin() {
        let t_cw = sample_pose();
        let c = t_cw.camera_center();
        assert_relative_eq!(t_cw.transform_point(&c), Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_retract_zero_is_noop() {
        let t = sample_pose();
        let r = t.retract_left(&Vector6::zeros());
        assert_relative_eq!(r.translation, t.translation, epsilon = 1e-15);
    }
}
