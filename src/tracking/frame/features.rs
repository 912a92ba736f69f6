//! Feature extractor contract and ORB feature primitives.

use anyhow::{ensure, Result};
use image::GrayImage;

/// 256-bit binary descriptor.
pub type Descriptor = [u8; 32];

/// Hamming distance between two binary descriptors.
#[inline]
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Detected image feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    /// Pyramid level the keypoint was detected at.
    pub octave: i32,
    /// Orientation in degrees, `-1.0` when not computed.
    pub angle: f32,
    pub size: f32,
    pub response: f32,
}

impl KeyPoint {
    pub fn new(x: f32, y: f32, octave: i32) -> Self {
        Self {
            x,
            y,
            octave,
            angle: -1.0,
            size: 31.0,
            response: 0.0,
        }
    }

    /// Same metadata at another position.
    pub fn with_position(&self, x: f32, y: f32) -> Self {
        Self { x, y, ..*self }
    }
}

/// Pyramid scale table of an extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleLevels {
    pub n_levels: usize,
    pub scale_factor: f64,
    pub log_scale_factor: f64,
    pub scale_factors: Vec<f64>,
    pub inv_scale_factors: Vec<f64>,
    pub level_sigma2: Vec<f64>,
    pub inv_level_sigma2: Vec<f64>,
}

impl ScaleLevels {
    pub fn new(n_levels: usize, scale_factor: f64) -> Result<Self> {
        ensure!(n_levels > 0, "pyramid needs at least one level");
        ensure!(
            scale_factor > 1.0,
            "scale factor must be greater than 1, got {}",
            scale_factor
        );
        let mut scale_factors = Vec::with_capacity(n_levels);
        let mut s = 1.0;
        for _ in 0..n_levels {
            scale_factors.push(s);
            s *= scale_factor;
        }
        let inv_scale_factors = scale_factors.iter().map(|s| 1.0 / s).collect();
        let level_sigma2: Vec<f64> = scale_factors.iter().map(|s| s * s).collect();
        let inv_level_sigma2 = level_sigma2.iter().map(|s2| 1.0 / s2).collect();
        Ok(Self {
            n_levels,
            scale_factor,
            log_scale_factor: scale_factor.ln(),
            scale_factors,
            inv_scale_factors,
            level_sigma2,
            inv_level_sigma2,
        })
    }

    /// Reject tables an extractor could not have produced.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.n_levels > 0, "pyramid needs at least one level");
        ensure!(
            self.scale_factor > 1.0,
            "scale factor must be greater than 1, got {}",
            self.scale_factor
        );
        let n = self.n_levels;
        ensure!(
            self.scale_factors.len() == n
                && self.inv_scale_factors.len() == n
                && self.level_sigma2.len() == n
                && self.inv_level_sigma2.len() == n,
            "scale tables must have {} entries",
            n
        );
        Ok(())
    }

    /// Scale factor of a level, clamped to the table.
    pub fn factor(&self, level: i32) -> f64 {
        self.scale_factors[self.clamp_level(level)]
    }

    pub fn sigma2(&self, level: i32) -> f64 {
        self.level_sigma2[self.clamp_level(level)]
    }

    pub fn inv_sigma2(&self, level: i32) -> f64 {
        self.inv_level_sigma2[self.clamp_level(level)]
    }

    fn clamp_level(&self, level: i32) -> usize {
        (level.max(0) as usize).min(self.n_levels - 1)
    }
}

impl Default for ScaleLevels {
    /// ORB defaults: 8 levels, factor 1.2.
    fn default() -> Self {
        let scale_factor: f64 = 1.2;
        let n_levels = 8;
        let scale_factors: Vec<f64> = (0..n_levels).map(|i| scale_factor.powi(i as i32)).collect();
        let level_sigma2: Vec<f64> = scale_factors.iter().map(|s| s * s).collect();
        Self {
            n_levels,
            scale_factor,
            log_scale_factor: scale_factor.ln(),
            inv_scale_factors: scale_factors.iter().map(|s| 1.0 / s).collect(),
            inv_level_sigma2: level_sigma2.iter().map(|s2| 1.0 / s2).collect(),
            scale_factors,
            level_sigma2,
        }
    }
}

/// Output of one extraction call.
#[derive(Debug, Clone, Default)]
pub struct ExtractedFeatures {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    /// Scale pyramid, level 0 first. May be empty when no stereo refinement is needed.
    pub pyramid: Vec<GrayImage>,
}

impl ExtractedFeatures {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Keypoint detector and descriptor.
///
/// Must be deterministic for identical pixels and configuration.
pub trait FeatureExtractor: Send {
    fn extract(&mut self, image: &GrayImage) -> Result<ExtractedFeatures>;

    fn scale_levels(&self) -> &ScaleLevels;
}
