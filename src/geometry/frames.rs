//! Body (IMU) and camera frame conventions for visual-inertial tracking.
//!
//! We use the notation `T_target_source`: `t_body_cam` maps a point from the
//! camera frame to the body frame, `p_body = t_body_cam * p_cam`.
//!
//! Tracking stores camera poses as `T_cw`; the inertial navigation state is
//! expressed as the body pose in world, `(R_wb, p_wb)`. The converter below
//! moves between the two using the fixed extrinsic calibration `T_bc`:
//!
//! ```text
//! R_wc = R_wb * R_bc            p_wc = R_wb * p_bc + p_wb
//! R_cw = R_wc^T                 t_cw = -R_cw * p_wc
//! ```

use nalgebra::{UnitQuaternion, Vector3};

use super::SE3;

/// Coordinate frame converter between camera poses and IMU body poses.
#[derive(Debug, Clone, Copy)]
pub struct FrameConverter {
    /// Camera to body (`T_bc`).
    pub t_body_cam: SE3,
    /// Body to camera (`T_cb`).
    pub t_cam_body: SE3,
}

impl FrameConverter {
    pub fn new(t_body_cam: SE3) -> Self {
        Self {
            t_body_cam,
            t_cam_body: t_body_cam.inverse(),
        }
    }

    /// Converter for co-located, co-aligned camera and body frames.
    pub fn identity() -> Self {
        Self::new(SE3::identity())
    }

    /// `T_wc -> T_wb`.
    pub fn camera_pose_to_body(&self, t_wc: &SE3) -> SE3 {
        t_wc.compose(&self.t_cam_body)
    }

    /// `T_wb -> T_wc`.
    pub fn body_pose_to_camera(&self, t_wb: &SE3) -> SE3 {
        t_wb.compose(&self.t_body_cam)
    }

    /// Camera pose `T_cw` from a body orientation and position in world.
    pub fn t_cw_from_body(&self, r_wb: &UnitQuaternion<f64>, p_wb: &Vector3<f64>) -> SE3 {
        let t_wb = SE3 {
            rotation: *r_wb,
            translation: *p_wb,
        };
        self.body_pose_to_camera(&t_wb).inverse()
    }

    /// Body orientation and position in world from a camera pose `T_cw`.
    pub fn body_from_t_cw(&self, t_cw: &SE3) -> (UnitQuaternion<f64>, Vector3<f64>) {
        let t_wb = self.camera_pose_to_body(&t_cw.inverse());
        (t_wb.rotation, t_wb.translation)
    }
}

impl Default for FrameConverter {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_body_camera_roundtrip() {
        let t_bc = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.1, 1.57),
            translation: Vector3::new(-0.02, 0.06, 0.01),
        };
        let conv = FrameConverter::new(t_bc);

        let r_wb = UnitQuaternion::from_euler_angles(0.2, -0.1, 0.3);
        let p_wb = Vector3::new(1.0, 2.0, 3.0);
        let t_cw = conv.t_cw_from_body(&r_wb, &p_wb);
        let (r_back, p_back) = conv.body_from_t_cw(&t_cw);

        assert_relative_eq!(p_back, p_wb, epsilon = 1e-12);
        assert_relative_eq!(r_back.angle_to(&r_wb), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_camera_center_offset_by_lever_arm() {
        // Identity rotation: camera center = body position + p_bc.
        let p_bc = Vector3::new(0.1, 0.0, 0.0);
        let conv = FrameConverter::new(SE3 {
            rotation: UnitQuaternion::identity(),
            translation: p_bc,
        });
        let t_cw = conv.t_cw_from_body(&UnitQuaternion::identity(), &Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(t_cw.camera_center(), Vector3::new(1.1, 0.0, 0.0), epsilon = 1e-12);
    }
}
