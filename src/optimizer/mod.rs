//! Optimization used by tracking.
//!
//! Gauss-Newton pose-only refinement of the current frame against fixed
//! map points.

pub mod pose_optim;

pub use pose_optim::{optimize_pose, optimize_pose_with, PoseOptimConfig};
