//! Tracking configuration.
//!
//! All values arrive already parsed; any serde format can populate these
//! structs. `TrackingConfig::validate` rejects invariant violations up front so
//! the tracker never starts with an unusable calibration.

use anyhow::{ensure, Result};
use serde::Deserialize;

use crate::geometry::SE3;
use crate::imu::ImuNoise;

/// Camera arrangement driving the frame construction path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SensorType {
    Monocular,
    Stereo,
    Rgbd,
}

impl Default for SensorType {
    fn default() -> Self {
        Self::Stereo
    }
}

/// Pinhole intrinsics, radial-tangential distortion and stereo constants.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
    /// Stereo baseline times fx. Required for stereo and RGB-D.
    pub bf: f64,
    pub fps: f64,
    /// Close/far threshold in baseline units.
    pub th_depth: f64,
    /// Raw depth-map units per meter (5000 for 16-bit TUM depth). Values close
    /// to zero mean the depth map is already metric.
    pub depth_map_factor: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fx: 0.0,
            fy: 0.0,
            cx: 0.0,
            cy: 0.0,
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            k3: 0.0,
            bf: 0.0,
            fps: 30.0,
            th_depth: 35.0,
            depth_map_factor: 1.0,
        }
    }
}

impl CameraConfig {
    /// Distortion coefficients in OpenCV order `[k1, k2, p1, p2, k3]`.
    pub fn distortion(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }
}

/// Inertial sensor settings. Presence enables inertial fusion.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    pub sigma_gyro: f64,
    pub sigma_accel: f64,
    /// Body-from-camera extrinsic `T_bc`, row-major 4x4.
    pub t_bc: [f64; 16],
    /// Keyframe time gap before the map's inertial initialization (seconds).
    pub keyframe_gap_uninitialized: f64,
    /// Keyframe time gap after inertial initialization (seconds).
    pub keyframe_gap_initialized: f64,
}

impl Default for ImuConfig {
    fn default() -> Self {
        let noise = ImuNoise::default();
        #[rustfmt::skip]
        let t_bc = [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        Self {
            sigma_gyro: noise.sigma_gyro,
            sigma_accel: noise.sigma_accel,
            t_bc,
            keyframe_gap_uninitialized: 0.1,
            keyframe_gap_initialized: 0.5,
        }
    }
}

impl ImuConfig {
    pub fn noise(&self) -> ImuNoise {
        ImuNoise {
            sigma_gyro: self.sigma_gyro,
            sigma_accel: self.sigma_accel,
        }
    }

    pub fn body_from_camera(&self) -> SE3 {
        SE3::from_row_slice(&self.t_bc)
    }
}

/// Top-level tracking settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub sensor: SensorType,
    pub camera: CameraConfig,
    /// Minimum frames between keyframes when local mapping is idle.
    pub min_frames: u64,
    /// Frames after which a keyframe is always considered. `None` means `fps`.
    pub max_frames: Option<u64>,
    /// Keypoints required to bootstrap a stereo/RGB-D map.
    pub stereo_init_min_features: usize,
    /// Keypoints required in both monocular initialization frames.
    pub mono_init_min_features: usize,
    pub imu: Option<ImuConfig>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            sensor: SensorType::default(),
            camera: CameraConfig::default(),
            min_frames: 0,
            max_frames: None,
            stereo_init_min_features: 500,
            mono_init_min_features: 100,
            imu: None,
        }
    }
}

impl TrackingConfig {
    pub fn max_frames(&self) -> u64 {
        self.max_frames
            .unwrap_or_else(|| self.camera.fps.round().max(1.0) as u64)
    }

    pub fn is_inertial(&self) -> bool {
        self.imu.is_some()
    }

    /// Reject configurations no frame could ever be processed with.
    pub fn validate(&self) -> Result<()> {
        let cam = &self.camera;
        ensure!(
            cam.fx > 0.0 && cam.fy > 0.0,
            "focal lengths must be positive (fx={}, fy={})",
            cam.fx,
            cam.fy
        );
        ensure!(
            cam.fx.is_finite() && cam.fy.is_finite() && cam.cx.is_finite() && cam.cy.is_finite(),
            "camera intrinsics must be finite"
        );
        ensure!(cam.fps > 0.0, "fps must be positive, got {}", cam.fps);
        if matches!(self.sensor, SensorType::Stereo | SensorType::Rgbd) {
            ensure!(
                cam.bf > 0.0,
                "{:?} tracking needs a positive bf (baseline * fx), got {}",
                self.sensor,
                cam.bf
            );
            ensure!(cam.th_depth > 0.0, "th_depth must be positive");
        }
        if self.sensor == SensorType::Rgbd {
            ensure!(
                cam.depth_map_factor.is_finite() && cam.depth_map_factor >= 0.0,
                "depth_map_factor must be finite and non-negative, got {}",
                cam.depth_map_factor
            );
        }
        ensure!(
            self.max_frames() >= self.min_frames,
            "max_frames ({}) must not be below min_frames ({})",
            self.max_frames(),
            self.min_frames
        );
        if let Some(imu) = &self.imu {
            ensure!(
                imu.sigma_gyro >= 0.0 && imu.sigma_accel >= 0.0,
                "IMU noise densities must be non-negative"
            );
            let last_row = &imu.t_bc[12..16];
            ensure!(
                last_row == [0.0, 0.0, 0.0, 1.0],
                "t_bc must be a homogeneous transform, last row was {:?}",
                last_row
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_config() -> TrackingConfig {
        TrackingConfig {
            sensor: SensorType::Stereo,
            camera: CameraConfig {
                fx: 435.0,
                fy: 435.0,
                cx: 376.0,
                cy: 240.0,
                bf: 47.9,
                ..CameraConfig::default()
            },
            ..TrackingConfig::default()
        }
    }

    #[test]
    fn test_valid_stereo_config() {
        assert!(stereo_config().validate().is_ok());
        assert_eq!(stereo_config().max_frames(), 30);
    }

    #[test]
    fn test_missing_calibration_rejected() {
        let cfg = TrackingConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_stereo_without_baseline_rejected() {
        let mut cfg = stereo_config();
        cfg.camera.bf = 0.0;
        assert!(cfg.validate().is_err());

        // Monocular does not need a baseline.
        cfg.sensor = SensorType::Monocular;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "sensor": "Rgbd",
            "camera": { "fx": 525.0, "fy": 525.0, "cx": 319.5, "cy": 239.5, "bf": 40.0,
                        "depth_map_factor": 5000.0 },
            "imu": { "sigma_gyro": 0.0002 }
        }"#;
        let cfg: TrackingConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(cfg.sensor, SensorType::Rgbd);
        assert_eq!(cfg.stereo_init_min_features, 500);
        assert_eq!(cfg.camera.th_depth, 35.0);
        let imu = cfg.imu.as_ref().expect("imu section");
        assert_eq!(imu.keyframe_gap_initialized, 0.5);
        assert!(cfg.validate().is_ok());
    }
}
