//! Local Mapper - keyframe insertion thread.
//!
//! Processes keyframes received from Tracking:
//! 1. Drops keyframes built before the last map reset
//! 2. Inserts the keyframe into the map
//! 3. Associates the map points tracked in the frame
//! 4. Creates new map points from close unmatched stereo/RGB-D features
//! 5. Refreshes descriptors, normals and depth ranges of the touched points
//! 6. Attaches the keyframe to the spanning tree and the keyframe database
//! 7. Initializes the inertial state of the map once enough keyframes exist

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::atlas::map::{KeyFrameId, MapPointId};
use crate::system::messages::NewKeyFrameMsg;
use crate::system::shared_state::SharedState;

use super::imu_init::try_initialize_imu;

/// Flow control threshold: if queue has more than this many keyframes,
/// signal Tracking to stop creating new ones.
const MAX_QUEUE_SIZE: usize = 3;

/// Timeout for receiving keyframes. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Far points created after this many have been created or tracked.
const MAX_CLOSE_POINTS: usize = 100;

/// Local Mapping thread state.
#[derive(Debug, Default)]
pub struct LocalMapper {
    keyframes_inserted: usize,
    stale_dropped: usize,
}

impl LocalMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyframes_inserted(&self) -> usize {
        self.keyframes_inserted
    }

    /// Main thread loop: receive keyframes and process them.
    ///
    /// This runs until shutdown is requested or the channel is closed.
    pub fn run(&mut self, kf_receiver: Receiver<NewKeyFrameMsg>, shared: Arc<SharedState>) {
        loop {
            if shared.is_shutdown_requested() {
                break;
            }

            let queue_len = kf_receiver.len();
            shared.set_stop_keyframe_creation(queue_len > MAX_QUEUE_SIZE);
            shared.set_accept_keyframes(queue_len == 0);

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    shared.set_accept_keyframes(false);
                    self.process_keyframe(msg, &shared);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(
            "[LocalMapping] stopped after {} keyframes ({} stale dropped)",
            self.keyframes_inserted, self.stale_dropped
        );
    }

    /// Insert one keyframe. Returns its id, or `None` when it belongs to a
    /// map epoch that has since been reset.
    pub fn process_keyframe(&mut self, msg: NewKeyFrameMsg, shared: &SharedState) -> Option<KeyFrameId> {
        let NewKeyFrameMsg {
            keyframe,
            matched_map_points,
            epoch,
        } = msg;
        let kf_id = keyframe.id;

        let mut atlas = shared.atlas.write();
        if epoch != shared.map_epoch() {
            debug!("[LocalMapping] {} from epoch {} dropped", kf_id, epoch);
            self.stale_dropped += 1;
            return None;
        }
        let (map, db) = atlas.map_and_db_mut();

        // Close features first, so the far cut-off keeps the nearest ones.
        let mut by_depth: Vec<(f64, usize)> = keyframe
            .depth
            .iter()
            .enumerate()
            .filter(|&(_, &z)| z > 0.0)
            .map(|(i, &z)| (z, i))
            .collect();
        by_depth.sort_by(|a, b| a.0.total_cmp(&b.0));
        let th_depth = keyframe.calib.th_depth;
        let candidates: Vec<(usize, _, _)> = by_depth
            .iter()
            .filter_map(|&(z, i)| keyframe.unproject_stereo(i).map(|p| (i, p, z)))
            .collect();
        let descriptors = keyframe.descriptors.clone();
        map.add_keyframe(keyframe);

        let mut touched: Vec<MapPointId> = Vec::new();
        for (i, mp) in matched_map_points.iter().enumerate() {
            let Some(mp_id) = mp.and_then(|id| map.resolve_replaced(id)) else {
                continue;
            };
            if map.associate(kf_id, i, mp_id) {
                touched.push(mp_id);
            }
        }
        let n_tracked = touched.len();

        let mut n_points = 0;
        let mut n_created = 0;
        for (i, position, z) in candidates {
            let tracked = map
                .get_keyframe(kf_id)
                .and_then(|kf| kf.get_map_point(i))
                .and_then(|id| map.get_map_point(id))
                .map_or(false, |mp| mp.num_observations() > 0);
            if !tracked {
                let mp_id = map.create_map_point(position, descriptors[i], kf_id);
                map.associate(kf_id, i, mp_id);
                touched.push(mp_id);
                n_created += 1;
            }
            n_points += 1;
            if z > th_depth && n_points > MAX_CLOSE_POINTS {
                break;
            }
        }

        for mp_id in &touched {
            map.compute_distinctive_descriptor(*mp_id);
            map.update_map_point_normal_and_depth(*mp_id);
        }
        map.update_spanning_parent(kf_id);
        if let Some(kf) = map.get_keyframe(kf_id) {
            db.add(kf_id, &kf.bow);
        }
        try_initialize_imu(map);
        drop(atlas);

        shared.mark_map_updated();
        self.keyframes_inserted += 1;
        debug!(
            "[LocalMapping] {} inserted: {} tracked, {} new points",
            kf_id, n_tracked, n_created
        );
        Some(kf_id)
    }
}
