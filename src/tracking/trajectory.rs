//! Per-frame trajectory history.
//!
//! Poses are stored relative to each frame's reference keyframe, so they
//! follow later corrections of the keyframe poses. Absolute poses are
//! recovered from the map when asked for.

use crate::atlas::map::{KeyFrameId, Map};
use crate::geometry::SE3;

#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryEntry {
    pub frame_id: u64,
    pub timestamp: f64,
    pub reference_kf: Option<KeyFrameId>,
    /// Camera pose relative to the reference keyframe (`T_cr`).
    pub t_cr: Option<SE3>,
    pub lost: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    entries: Vec<TrajectoryEntry>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tracked frame. `t_cw` and the reference keyframe pose
    /// `t_rw` give `T_cr = T_cw * T_rw⁻¹`.
    pub fn push_tracked(&mut self, frame_id: u64, timestamp: f64, reference_kf: KeyFrameId, t_cw: &SE3, t_rw: &SE3) {
        self.entries.push(TrajectoryEntry {
            frame_id,
            timestamp,
            reference_kf: Some(reference_kf),
            t_cr: Some(t_cw.compose(&t_rw.inverse())),
            lost: false,
        });
    }

    /// Record a frame without a pose. The previous relative pose is repeated,
    /// as a lost frame is assumed to sit where tracking last was.
    pub fn push_lost(&mut self, frame_id: u64, timestamp: f64) {
        let (reference_kf, t_cr) = self
            .entries
            .last()
            .map(|e| (e.reference_kf, e.t_cr))
            .unwrap_or((None, None));
        self.entries.push(TrajectoryEntry {
            frame_id,
            timestamp,
            reference_kf,
            t_cr,
            lost: true,
        });
    }

    pub fn entries(&self) -> &[TrajectoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// `(timestamp, T_cw)` per entry, `None` when the reference keyframe is
    /// gone from the map or no pose was ever recorded.
    pub fn absolute_poses(&self, map: &Map) -> Vec<(f64, Option<SE3>)> {
        self.entries
            .iter()
            .map(|e| {
                let pose = e.t_cr.and_then(|t_cr| {
                    let kf = map.get_keyframe(e.reference_kf?)?;
                    Some(t_cr.compose(&kf.t_cw))
                });
                (e.timestamp, pose)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    use crate::atlas::map::keyframe::tests::create_keyframe_with_features;

    #[test]
    fn test_relative_poses_follow_keyframe() {
        let mut map = Map::new();
        let mut kf = create_keyframe_with_features(0, 0);
        kf.t_cw = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.1, 0.0),
            translation: Vector3::new(1.0, 0.0, 0.0),
        };
        let t_rw = kf.t_cw;
        let kf_id = map.add_keyframe(kf);

        let t_cw = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.15, 0.0),
            translation: Vector3::new(1.2, 0.0, 0.1),
        };
        let mut traj = Trajectory::new();
        traj.push_tracked(5, 0.5, kf_id, &t_cw, &t_rw);
        traj.push_lost(6, 0.6);

        let poses = traj.absolute_poses(&map);
        assert_eq!(poses.len(), 2);
        let p = poses[0].1.unwrap();
        assert_relative_eq!(p.translation, t_cw.translation, epsilon = 1e-12);
        assert!(traj.entries()[1].lost);
        assert!(poses[1].1.is_some());

        // Moving the keyframe moves the recovered frame pose with it.
        let shift = SE3::from_rt(nalgebra::Matrix3::identity(), Vector3::new(0.0, 0.0, 1.0));
        if let Some(kf) = map.get_keyframe_mut(kf_id) {
            kf.t_cw = kf.t_cw.compose(&shift);
        }
        let moved = traj.absolute_poses(&map)[0].1.unwrap();
        assert_relative_eq!(moved.translation, t_cw.compose(&shift).translation, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_reference() {
        let mut traj = Trajectory::new();
        traj.push_lost(0, 0.0);
        traj.push_tracked(1, 0.1, KeyFrameId::new(9), &SE3::identity(), &SE3::identity());
        let poses = traj.absolute_poses(&Map::new());
        assert!(poses.iter().all(|(_, p)| p.is_none()));
    }
}
