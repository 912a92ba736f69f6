//! Frame-level processing: calibration context, extractor contract, stereo/RGB-D depth.

pub mod camera;
pub mod features;
pub mod stereo;

pub use camera::{CalibrationContext, ImageBounds};
pub use features::{
    descriptor_distance, Descriptor, ExtractedFeatures, FeatureExtractor, KeyPoint, ScaleLevels,
};
pub use stereo::{
    compute_depth_from_rgbd, compute_stereo_matches, DepthImage, StereoDepth, StereoView,
};
