//! Atlas module - persistent map and place recognition.
//!
//! - [`map::Map`] - KeyFrames and MapPoints with covisibility and spanning tree
//! - [`keyframe_db::KeyFrameDatabase`] - inverted BoW index for relocalization
//! - [`atlas::Atlas`] - the two together, as shared behind one lock

pub mod atlas;
pub mod keyframe_db;
pub mod map;

pub use atlas::Atlas;
pub use keyframe_db::KeyFrameDatabase;
pub use map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
