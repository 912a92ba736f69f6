//! Calibration context shared by every frame of a calibration epoch.
//!
//! Built once by the tracker from the first processed image and then only
//! read. A calibration change drops the context so the next image rebuilds it.

use nalgebra::{Matrix3, Vector2, Vector3};

use crate::config::CameraConfig;
use crate::tracking::tracking_frame::FeatureGrid;

/// Fixed-point iterations of the inverse distortion model.
const UNDISTORT_ITERATIONS: usize = 10;

/// Valid undistorted image region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl ImageBounds {
    pub fn contains(&self, u: f64, v: f64) -> bool {
        u >= self.min_x && u <= self.max_x && v >= self.min_y && v <= self.max_y
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Pinhole intrinsics with everything derived from them.
#[derive(Debug, Clone)]
pub struct CalibrationContext {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub inv_fx: f64,
    pub inv_fy: f64,
    /// `[k1, k2, p1, p2, k3]`.
    pub distortion: [f64; 5],
    /// Baseline times fx.
    pub bf: f64,
    /// Baseline in meters.
    pub mb: f64,
    /// Close/far depth threshold in meters.
    pub th_depth: f64,
    /// Multiplier from raw depth-map values to meters.
    pub depth_scale: f64,
    pub image_width: u32,
    pub image_height: u32,
    pub bounds: ImageBounds,
    pub grid_element_width_inv: f64,
    pub grid_element_height_inv: f64,
}

impl CalibrationContext {
    /// Freeze the calibration for images of the given size.
    pub fn new(camera: &CameraConfig, image_width: u32, image_height: u32) -> Self {
        let inv_fx = 1.0 / camera.fx;
        let inv_fy = 1.0 / camera.fy;
        let distortion = camera.distortion();

        // Baseline-dependent constants only after bf and fx are final.
        let bf = camera.bf;
        let mb = if camera.fx > 0.0 { bf / camera.fx } else { 0.0 };
        let th_depth = mb * camera.th_depth;
        let depth_scale = if camera.depth_map_factor.abs() < 1e-5 {
            1.0
        } else {
            1.0 / camera.depth_map_factor
        };

        let mut ctx = Self {
            fx: camera.fx,
            fy: camera.fy,
            cx: camera.cx,
            cy: camera.cy,
            inv_fx,
            inv_fy,
            distortion,
            bf,
            mb,
            th_depth,
            depth_scale,
            image_width,
            image_height,
            bounds: ImageBounds {
                min_x: 0.0,
                max_x: image_width as f64,
                min_y: 0.0,
                max_y: image_height as f64,
            },
            grid_element_width_inv: 0.0,
            grid_element_height_inv: 0.0,
        };
        ctx.bounds = ctx.compute_bounds();
        ctx.grid_element_width_inv = FeatureGrid::GRID_COLS as f64 / ctx.bounds.width();
        ctx.grid_element_height_inv = FeatureGrid::GRID_ROWS as f64 / ctx.bounds.height();
        ctx
    }

    /// Intrinsic matrix `K`.
    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx,
            0.0, self.fy, self.cy,
            0.0, 0.0, 1.0,
        )
    }

    pub fn is_distorted(&self) -> bool {
        self.distortion.iter().any(|&c| c != 0.0)
    }

    /// Map a raw pixel to its ideal pinhole position.
    pub fn undistort_point(&self, u: f64, v: f64) -> (f64, f64) {
        if !self.is_distorted() {
            return (u, v);
        }
        let [k1, k2, p1, p2, k3] = self.distortion;
        let x0 = (u - self.cx) * self.inv_fx;
        let y0 = (v - self.cy) * self.inv_fy;
        let (mut x, mut y) = (x0, y0);
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let icdist = 1.0 / (1.0 + ((k3 * r2 + k2) * r2 + k1) * r2);
            let delta_x = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let delta_y = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (x0 - delta_x) * icdist;
            y = (y0 - delta_y) * icdist;
        }
        (x * self.fx + self.cx, y * self.fy + self.cy)
    }

    /// Forward distortion model, raw pixel of an ideal pinhole position.
    pub fn distort_point(&self, u: f64, v: f64) -> (f64, f64) {
        if !self.is_distorted() {
            return (u, v);
        }
        let [k1, k2, p1, p2, k3] = self.distortion;
        let x = (u - self.cx) * self.inv_fx;
        let y = (v - self.cy) * self.inv_fy;
        let r2 = x * x + y * y;
        let radial = 1.0 + ((k3 * r2 + k2) * r2 + k1) * r2;
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        (xd * self.fx + self.cx, yd * self.fy + self.cy)
    }

    fn compute_bounds(&self) -> ImageBounds {
        let w = self.image_width as f64;
        let h = self.image_height as f64;
        if !self.is_distorted() {
            return ImageBounds {
                min_x: 0.0,
                max_x: w,
                min_y: 0.0,
                max_y: h,
            };
        }
        let tl = self.undistort_point(0.0, 0.0);
        let tr = self.undistort_point(w, 0.0);
        let bl = self.undistort_point(0.0, h);
        let br = self.undistort_point(w, h);
        ImageBounds {
            min_x: tl.0.min(bl.0),
            max_x: tr.0.max(br.0),
            min_y: tl.1.min(tr.1),
            max_y: bl.1.max(br.1),
        }
    }

    /// Pinhole projection of a camera-frame point. Caller checks `z > 0`.
    pub fn project(&self, p_c: &Vector3<f64>) -> Vector2<f64> {
        let inv_z = 1.0 / p_c.z;
        Vector2::new(
            self.fx * p_c.x * inv_z + self.cx,
            self.fy * p_c.y * inv_z + self.cy,
        )
    }

    /// Back-project an undistorted pixel at the given depth.
    pub fn unproject(&self, u: f64, v: f64, depth: f64) -> Vector3<f64> {
        Vector3::new(
            (u - self.cx) * depth * self.inv_fx,
            (v - self.cy) * depth * self.inv_fy,
            depth,
        )
    }

    /// Normalized image-plane coordinates of an undistorted pixel.
    pub fn normalized(&self, u: f64, v: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) * self.inv_fx, (v - self.cy) * self.inv_fy, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera(distorted: bool) -> CameraConfig {
        let mut cam = CameraConfig {
            fx: 458.654,
            fy: 457.296,
            cx: 367.215,
            cy: 248.375,
            bf: 50.0,
            ..CameraConfig::default()
        };
        if distorted {
            cam.k1 = -0.28340811;
            cam.k2 = 0.07395907;
            cam.p1 = 0.00019359;
            cam.p2 = 1.76187114e-05;
        }
        cam
    }

    #[test]
    fn test_identity_fast_path() {
        let ctx = CalibrationContext::new(&camera(false), 752, 480);
        assert_eq!(ctx.undistort_point(12.5, 400.25), (12.5, 400.25));
        assert_eq!(ctx.bounds.max_x, 752.0);
        assert_relative_eq!(ctx.grid_element_width_inv, 64.0 / 752.0);
    }

    #[test]
    fn test_undistort_inverts_distortion() {
        let ctx = CalibrationContext::new(&camera(true), 752, 480);
        for &(u, v) in &[(100.0, 80.0), (367.0, 248.0), (650.0, 420.0)] {
            let (ud, vd) = ctx.distort_point(u, v);
            let (uu, vu) = ctx.undistort_point(ud, vd);
            assert_relative_eq!(uu, u, epsilon = 1e-3);
            assert_relative_eq!(vu, v, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_barrel_distortion_expands_bounds() {
        let ctx = CalibrationContext::new(&camera(true), 752, 480);
        assert!(ctx.bounds.min_x < 0.0);
        assert!(ctx.bounds.max_x > 752.0);
    }

    #[test]
    fn test_baseline_constants() {
        let ctx = CalibrationContext::new(&camera(false), 752, 480);
        assert_relative_eq!(ctx.mb, 50.0 / 458.654, epsilon = 1e-12);
        assert_relative_eq!(ctx.th_depth, ctx.mb * 35.0, epsilon = 1e-12);
        assert_relative_eq!(ctx.depth_scale, 1.0);
    }
}
