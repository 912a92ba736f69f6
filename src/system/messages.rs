//! Inter-thread message types.
//!
//! These types are sent between threads via channels to coordinate
//! SLAM processing.

use crate::atlas::map::{KeyFrame, KeyFrameId, MapPointId};
use crate::geometry::SE3;
use crate::tracking::TrackingState;

/// Message sent from Tracking to Local Mapping when a new keyframe is created.
///
/// Contains all the data needed for Local Mapping to:
/// 1. Insert the keyframe into the map
/// 2. Associate the map points matched during tracking
/// 3. Create new map points from unmatched close stereo/RGB-D features
#[derive(Debug)]
pub struct NewKeyFrameMsg {
    /// Keyframe built from the current frame, with an id reserved through
    /// [`SharedState::reserve_keyframe_id`](crate::system::SharedState::reserve_keyframe_id).
    /// Carries features, depth, BoW, calibration and the inertial payload.
    pub keyframe: KeyFrame,

    /// `matched_map_points[i] = Some(mp_id)` if feature i was tracked as an
    /// inlier of an existing map point.
    pub matched_map_points: Vec<Option<MapPointId>>,

    /// Map epoch the keyframe was built in. Local Mapping drops keyframes
    /// from an epoch that a reset has since ended.
    pub epoch: u64,
}

impl NewKeyFrameMsg {
    pub fn id(&self) -> KeyFrameId {
        self.keyframe.id
    }
}

/// Lifecycle notifications for a viewer or loop closer.
#[derive(Debug, Clone)]
pub enum TrackingEvent {
    FrameTracked {
        frame_id: u64,
        timestamp: f64,
        state: TrackingState,
        pose: Option<SE3>,
        n_inliers: usize,
    },
    KeyFrameProposed {
        id: KeyFrameId,
    },
    Relocalized {
        frame_id: u64,
    },
    ResetRequested,
}
