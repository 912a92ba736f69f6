//! KeyFrame decision criteria.
//!
//! A new keyframe is proposed when enough frames have passed or local mapping
//! is idle, and tracking is getting weak relative to the reference keyframe
//! (or, with depth, when too few close points are tracked). Inertial
//! configurations also insert keyframes on a time gap.

use crate::config::SensorType;
use crate::tracking::tracking_frame::Frame;

/// Tracked close points below which close-point insertion is considered.
const CLOSE_TRACKED_MAX: usize = 100;
/// Untracked close points above which close-point insertion is needed.
const CLOSE_UNTRACKED_MIN: usize = 70;
/// Inliers the frame must keep before a weakening ratio triggers a keyframe.
const MIN_INLIERS: usize = 15;
/// Queued keyframes above which a non-idle mapper refuses more.
const MAX_QUEUED: usize = 3;

/// Everything the policy looks at for one frame.
#[derive(Debug, Clone, Copy)]
pub struct KeyFrameContext {
    pub sensor: SensorType,
    pub frame_id: u64,
    pub timestamp: f64,
    pub n_inliers: usize,
    /// Points of the reference keyframe observed by enough keyframes.
    pub ref_matches: usize,
    pub close_points: CloseDepthPoints,
    pub last_kf_frame_id: u64,
    pub last_kf_timestamp: f64,
    pub last_reloc_frame_id: Option<u64>,
    pub keyframes_in_map: usize,
    pub only_tracking: bool,
    pub mapping_stopped: bool,
    pub mapping_idle: bool,
    pub queued_keyframes: usize,
    /// Inertial fusion enabled, and whether the map is inertially initialized.
    pub inertial: Option<bool>,
    /// Set after bias re-estimation to force a keyframe.
    pub force: bool,
}

/// Counts of features with depth below the close threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseDepthPoints {
    pub tracked: usize,
    pub untracked: usize,
}

impl CloseDepthPoints {
    pub fn needs_insertion(&self) -> bool {
        self.tracked < CLOSE_TRACKED_MAX && self.untracked > CLOSE_UNTRACKED_MIN
    }
}

/// Count close features that are (not) tracked as inliers.
pub fn count_close_points(frame: &Frame, th_depth: f64) -> CloseDepthPoints {
    let mut counts = CloseDepthPoints::default();
    for (i, &z) in frame.depth.iter().enumerate() {
        if z <= 0.0 || z >= th_depth {
            continue;
        }
        if frame.map_points[i].is_some() && !frame.outliers[i] {
            counts.tracked += 1;
        } else {
            counts.untracked += 1;
        }
    }
    counts
}

/// Keyframe cadence parameters.
#[derive(Debug, Clone, Copy)]
pub struct KeyFrameDecision {
    pub min_frames: u64,
    pub max_frames: u64,
    /// Seconds between inertial keyframes before and after IMU initialization.
    pub inertial_gap_uninitialized: f64,
    pub inertial_gap_initialized: f64,
}

impl KeyFrameDecision {
    pub fn new(min_frames: u64, max_frames: u64) -> Self {
        Self {
            min_frames,
            max_frames,
            inertial_gap_uninitialized: 0.1,
            inertial_gap_initialized: 0.5,
        }
    }

    /// Whether the frame described by `ctx` should become a keyframe.
    pub fn need_new_keyframe(&self, ctx: &KeyFrameContext) -> bool {
        if ctx.only_tracking || ctx.mapping_stopped {
            return false;
        }
        if ctx.force {
            return true;
        }

        let recently_relocalized = ctx
            .last_reloc_frame_id
            .map_or(false, |reloc| ctx.frame_id < reloc + self.max_frames);
        if recently_relocalized && ctx.keyframes_in_map as u64 > self.max_frames {
            return false;
        }

        let monocular = ctx.sensor == SensorType::Monocular;
        let close_needed = !monocular && ctx.close_points.needs_insertion();

        let ratio = if monocular {
            0.9
        } else if ctx.keyframes_in_map < 2 {
            0.4
        } else {
            0.75
        };
        let inliers = ctx.n_inliers as f64;
        let r = ctx.ref_matches as f64;

        let c1a = ctx.frame_id >= ctx.last_kf_frame_id + self.max_frames;
        let c1b = ctx.frame_id >= ctx.last_kf_frame_id + self.min_frames && ctx.mapping_idle;
        let c1c = !monocular && (inliers < 0.25 * r || close_needed);
        let c2 = ctx.n_inliers > MIN_INLIERS && (inliers < ratio * r || close_needed);

        let c3 = match ctx.inertial {
            Some(imu_initialized) => {
                let gap = if imu_initialized {
                    self.inertial_gap_initialized
                } else {
                    self.inertial_gap_uninitialized
                };
                ctx.timestamp - ctx.last_kf_timestamp >= gap
            }
            None => false,
        };

        if !(((c1a || c1b || c1c) && c2) || c3) {
            return false;
        }
        ctx.mapping_idle || (!monocular && ctx.queued_keyframes < MAX_QUEUED)
    }
}
