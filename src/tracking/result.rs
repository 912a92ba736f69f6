//! Tracking results and diagnostics structures.
//!
//! These types describe what happened during processing of a single frame:
//! - high level tracking state (OK / LOST / etc.)
//! - pose estimate, absent when the frame was not tracked
//! - correspondence counts and the strategy that produced the pose
//! - timing information for profiling

use crate::atlas::map::KeyFrameId;
use crate::geometry::SE3;
use crate::tracking::strategy::TrackingStrategy;
use crate::tracking::TrackingState;

/// Summary of tracking for a single frame.
#[derive(Debug, Clone)]
pub struct TrackingResult {
    pub frame_id: u64,
    pub timestamp: f64,
    pub state: TrackingState,
    /// World-to-camera pose, `None` unless the frame was tracked.
    pub pose: Option<SE3>,
    pub reference_kf_id: Option<KeyFrameId>,
    pub metrics: TrackingMetrics,
    pub timing: TimingStats,
}

impl TrackingResult {
    pub fn is_tracked(&self) -> bool {
        self.state == TrackingState::Ok && self.pose.is_some()
    }
}

/// Scalar metrics useful for debugging tracking quality.
#[derive(Debug, Clone, Default)]
pub struct TrackingMetrics {
    pub n_features: usize,
    /// Associations after the initial pose estimate.
    pub n_matches: usize,
    /// Map-point inliers after local map tracking.
    pub n_inliers: usize,
    pub strategy: Option<TrackingStrategy>,
    pub relocalization_attempted: bool,
    pub keyframe_created: bool,
    /// Only-tracking mode fell back to visual odometry.
    pub visual_odometry: bool,
}

/// Timing breakdown for a frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingStats {
    pub total_ms: f64,
    pub extract_ms: f64,
    pub track_ms: f64,
}
