//! Tracking thread: turns images (+ IMU) into camera poses and proposes
//! KeyFrames.
//!
//! This module implements the TRACKING component of ORB-SLAM3:
//! - Frame construction (feature extraction, undistortion, grid, stereo/RGB-D depth)
//! - IMU preintegration and navigation-state prediction
//! - Map initialization (stereo/RGB-D from one frame, monocular from two)
//! - Initial pose estimation (IMU prediction, motion model, reference keyframe)
//! - Track local map (projection-based search)
//! - Relocalization
//! - New KeyFrame decision

pub mod frame;
pub mod initializer;
pub mod keyframe_decision;
pub mod local_map;
pub mod matching;
pub mod motion_model;
pub mod relocalization;
pub mod result;
pub mod state;
pub mod strategy;
pub mod tracker;
pub mod tracking_frame;
pub mod trajectory;

pub use result::{TimingStats, TrackingMetrics, TrackingResult};
pub use state::{CycleOutcome, TrackingState};
pub use strategy::TrackingStrategy;
pub use tracker::Tracker;
pub use tracking_frame::Frame;
pub use trajectory::{Trajectory, TrajectoryEntry};
