//! Local Mapping thread.
//!
//! Inserts the keyframes proposed by Tracking: map point association, close
//! point creation, covisibility and spanning tree, keyframe database, and
//! the inertial initialization of the map.

pub mod imu_init;
mod local_mapper;

pub use local_mapper::LocalMapper;
