//! Constant-velocity motion model and tracking with it.

use tracing::debug;

use crate::atlas::map::Map;
use crate::geometry::SE3;
use crate::optimizer::optimize_pose;
use crate::tracking::matching::OrbMatcher;
use crate::tracking::strategy::{discard_outliers_counting_map, AttemptOutcome};
use crate::tracking::tracking_frame::Frame;

/// Projection window for stereo and RGB-D.
const TH_STEREO: f64 = 7.0;
/// Projection window for monocular.
const TH_MONOCULAR: f64 = 15.0;
/// Matches below which the window is doubled, and also the acceptance bar.
const MIN_MATCHES: usize = 20;
/// Map-point inliers needed after optimization.
const MIN_MAP_INLIERS: usize = 10;

/// Constant velocity motion model.
///
/// The velocity is the relative pose `T_cl` from the previous frame to the
/// current one, applied again to predict the next pose.
#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update from the last two frame poses (both `T_cw`).
    pub fn update(&mut self, last_t_cw: &SE3, current_t_cw: &SE3) {
        self.velocity = Some(current_t_cw.compose(&last_t_cw.inverse()));
    }

    pub fn velocity(&self) -> Option<&SE3> {
        self.velocity.as_ref()
    }

    pub fn has_velocity(&self) -> bool {
        self.velocity.is_some()
    }

    /// Predicted `T_cw` of the frame following one at `last_t_cw`.
    pub fn predict(&self, last_t_cw: &SE3) -> Option<SE3> {
        self.velocity.map(|v| v.compose(last_t_cw))
    }

    pub fn reset(&mut self) {
        self.velocity = None;
    }
}

/// Predict the pose with the motion model and match the last frame's points
/// around their reprojections.
///
/// Outside localization mode success needs ten map inliers after pose
/// optimization. In localization mode more than twenty matches suffice,
/// and the caller derives its visual-odometry flag from the map inliers.
pub fn track_with_motion_model(
    frame: &mut Frame,
    last_frame: &Frame,
    model: &MotionModel,
    map: &Map,
    monocular: bool,
    only_tracking: bool,
) -> AttemptOutcome {
    let Some(last_t_cw) = last_frame.pose() else {
        return AttemptOutcome::Failure("last frame has no pose");
    };
    let Some(predicted) = model.predict(last_t_cw) else {
        return AttemptOutcome::Failure("no velocity");
    };
    track_from_prediction(frame, last_frame, predicted, map, monocular, only_tracking)
}

/// Match the last frame's points around their reprojections from a
/// predicted pose and refine it.
///
/// Shared by the motion model and the inertial prediction.
pub fn track_from_prediction(
    frame: &mut Frame,
    last_frame: &Frame,
    predicted: SE3,
    map: &Map,
    monocular: bool,
    only_tracking: bool,
) -> AttemptOutcome {
    frame.set_pose(predicted);
    frame.reset_matches();

    let matcher = OrbMatcher::new(0.9, true);
    let th = if monocular { TH_MONOCULAR } else { TH_STEREO };
    let mut n_matches = matcher.search_by_projection_last_frame(frame, last_frame, map, th, monocular);

    if n_matches < MIN_MATCHES {
        debug!("[MotionModel] {} matches, widening window", n_matches);
        frame.reset_matches();
        n_matches = matcher.search_by_projection_last_frame(frame, last_frame, map, 2.0 * th, monocular);
    }
    if n_matches < MIN_MATCHES {
        return AttemptOutcome::Failure("not enough projection matches");
    }

    optimize_pose(frame, map);
    let (n_matches, n_map_matches) = discard_outliers_counting_map(frame, map);
    debug!(
        "[MotionModel] frame {}: {} matches, {} in map",
        frame.id, n_matches, n_map_matches
    );

    let ok = if only_tracking {
        n_matches > MIN_MATCHES
    } else {
        n_map_matches >= MIN_MAP_INLIERS
    };
    if ok {
        AttemptOutcome::Success {
            n_matches,
            n_map_matches,
        }
    } else {
        AttemptOutcome::Failure("too few inliers after optimization")
    }
}
