//! Ordered pose-estimation strategies.
//!
//! Each cycle in the OK state builds a plan from the current conditions and
//! runs the strategies in order until one succeeds. Every strategy reports
//! the same [`AttemptOutcome`], so a failure is just a reason to try the
//! next one.

use std::fmt;

use tracing::debug;

use crate::atlas::map::{KeyFrame, Map};
use crate::optimizer::optimize_pose;
use crate::tracking::matching::OrbMatcher;
use crate::tracking::tracking_frame::Frame;
use crate::vocabulary::Vocabulary;

/// BoW matches needed against the reference keyframe.
const REF_KF_MIN_MATCHES: usize = 15;
/// Map-point inliers needed after optimization.
const REF_KF_MIN_MAP_INLIERS: usize = 10;

/// A way of getting an initial pose for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingStrategy {
    /// Propagate the navigation state with preintegrated inertial data.
    ImuPrediction,
    /// Constant-velocity prediction plus projection of the last frame.
    MotionModel,
    /// BoW matching against the reference keyframe.
    ReferenceKeyFrame,
}

impl fmt::Display for TrackingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ImuPrediction => "imu-prediction",
            Self::MotionModel => "motion-model",
            Self::ReferenceKeyFrame => "reference-keyframe",
        };
        f.write_str(name)
    }
}

/// Result of one strategy attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success {
        /// Associations left after outlier removal.
        n_matches: usize,
        /// Of those, associations to points observed by keyframes.
        n_map_matches: usize,
    },
    Failure(&'static str),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Conditions the plan depends on.
#[derive(Debug, Clone, Copy)]
pub struct PlanConditions {
    pub frame_id: u64,
    pub last_reloc_frame_id: Option<u64>,
    pub has_velocity: bool,
    /// Inertial fusion enabled and the map inertially initialized.
    pub imu_ready: bool,
    /// Frames after a relocalization during which the inertial prediction
    /// is not trusted.
    pub frames_to_reset_imu: u64,
}

impl PlanConditions {
    fn frames_since_reloc(&self) -> Option<u64> {
        self.last_reloc_frame_id
            .map(|reloc| self.frame_id.saturating_sub(reloc))
    }
}

/// Strategies to try, in order.
pub fn plan(cond: &PlanConditions) -> Vec<TrackingStrategy> {
    let since_reloc = cond.frames_since_reloc();
    let just_relocalized = since_reloc.map_or(false, |n| n < 2);

    if just_relocalized || (!cond.has_velocity && !cond.imu_ready) {
        return vec![TrackingStrategy::ReferenceKeyFrame];
    }
    let imu_trusted = since_reloc.map_or(true, |n| n > cond.frames_to_reset_imu);
    if cond.imu_ready && imu_trusted {
        vec![TrackingStrategy::ImuPrediction, TrackingStrategy::ReferenceKeyFrame]
    } else if cond.has_velocity {
        vec![TrackingStrategy::MotionModel, TrackingStrategy::ReferenceKeyFrame]
    } else {
        vec![TrackingStrategy::ReferenceKeyFrame]
    }
}

/// Drop associations flagged as outliers.
///
/// Returns the remaining matches and how many of them are observed by at
/// least one keyframe.
pub fn discard_outliers_counting_map(frame: &mut Frame, map: &Map) -> (usize, usize) {
    frame.discard_outliers();
    let mut n_matches = 0;
    let mut n_map = 0;
    for mp_id in frame.map_points.iter().flatten() {
        n_matches += 1;
        if map
            .get_map_point(*mp_id)
            .map_or(false, |mp| mp.num_observations() > 0)
        {
            n_map += 1;
        }
    }
    (n_matches, n_map)
}

/// Match the frame to the reference keyframe through shared vocabulary
/// nodes and optimize the pose, starting from the last frame's pose.
pub fn track_reference_keyframe(
    frame: &mut Frame,
    reference: &KeyFrame,
    start_pose: Option<&crate::geometry::SE3>,
    map: &Map,
    vocabulary: &dyn Vocabulary,
) -> AttemptOutcome {
    frame.compute_bow(vocabulary);

    let matcher = OrbMatcher::new(0.7, true);
    let (n_matches, matches) = matcher.search_by_bow(reference, frame, map);
    debug!(
        "[RefKF] frame {} vs {}: {} BoW matches",
        frame.id, reference.id, n_matches
    );
    if n_matches < REF_KF_MIN_MATCHES {
        return AttemptOutcome::Failure("not enough BoW matches");
    }

    frame.map_points = matches;
    frame.outliers.iter_mut().for_each(|o| *o = false);
    frame.set_pose(start_pose.copied().unwrap_or(reference.t_cw));
    optimize_pose(frame, map);

    let (n_matches, n_map_matches) = discard_outliers_counting_map(frame, map);
    if n_map_matches >= REF_KF_MIN_MAP_INLIERS {
        AttemptOutcome::Success {
            n_matches,
            n_map_matches,
        }
    } else {
        AttemptOutcome::Failure("too few inliers after optimization")
    }
}
