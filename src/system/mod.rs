//! SLAM system orchestration and thread management.
//!
//! This module contains the top-level `SlamSystem` that runs Tracking and
//! spawns Local Mapping, along with shared state and inter-thread messaging
//! types.

pub mod messages;
pub mod shared_state;
mod slam_system;

pub use messages::{NewKeyFrameMsg, TrackingEvent};
pub use shared_state::SharedState;
pub use slam_system::{keyframe_channel, SlamSystem, KEYFRAME_CHANNEL_CAPACITY};
