//! Shared state between Tracking and Local Mapping threads.
//!
//! Tracking is a reader of the atlas for the estimation part of a cycle and
//! only writes while building an initial map. Local Mapping is the writer.
//! The flags carry flow control in both directions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::atlas::map::KeyFrameId;
use crate::atlas::Atlas;

/// Shared state accessible by both Tracking and Local Mapping threads.
pub struct SharedState {
    /// The active map and its keyframe database.
    pub atlas: RwLock<Atlas>,

    /// Set by Local Mapping while it waits for keyframes.
    pub accept_keyframes: AtomicBool,

    /// Flow control: when true, Tracking should not create new keyframes.
    /// Set by Local Mapping when the keyframe queue is too long.
    pub stop_keyframe_creation: AtomicBool,

    /// Raised by Local Mapping after inserting a keyframe, consumed by
    /// Tracking to pick the base of the inertial prediction.
    pub map_updated: AtomicBool,

    /// Keyframe ids are reserved here so Tracking can name a keyframe before
    /// Local Mapping inserts it.
    next_keyframe_id: AtomicU64,

    /// Bumped on every reset. Keyframes sent under an older epoch are stale.
    map_epoch: AtomicU64,

    /// Request Local Mapping to finish processing and exit.
    pub shutdown_requested: AtomicBool,
}

impl SharedState {
    /// Create a new SharedState with an empty Atlas.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reserve_keyframe_id(&self) -> KeyFrameId {
        KeyFrameId::new(self.next_keyframe_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn map_epoch(&self) -> u64 {
        self.map_epoch.load(Ordering::SeqCst)
    }

    /// Clear the atlas and start a new epoch.
    pub fn reset_map(&self) -> u64 {
        self.atlas.write().clear();
        self.map_updated.store(false, Ordering::SeqCst);
        self.map_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Check if keyframe creation should be stopped (flow control).
    pub fn should_stop_keyframe_creation(&self) -> bool {
        self.stop_keyframe_creation.load(Ordering::SeqCst)
    }

    pub fn set_stop_keyframe_creation(&self, value: bool) {
        self.stop_keyframe_creation.store(value, Ordering::SeqCst);
    }

    pub fn is_accepting_keyframes(&self) -> bool {
        self.accept_keyframes.load(Ordering::SeqCst)
    }

    pub fn set_accept_keyframes(&self, value: bool) {
        self.accept_keyframes.store(value, Ordering::SeqCst);
    }

    pub fn mark_map_updated(&self) {
        self.map_updated.store(true, Ordering::SeqCst);
    }

    /// Read and clear the map-updated flag.
    pub fn take_map_updated(&self) -> bool {
        self.map_updated.swap(false, Ordering::SeqCst)
    }

    /// Request shutdown of the Local Mapping thread.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            atlas: RwLock::new(Atlas::new()),
            accept_keyframes: AtomicBool::new(true),
            stop_keyframe_creation: AtomicBool::new(false),
            map_updated: AtomicBool::new(false),
            next_keyframe_id: AtomicU64::new(0),
            map_epoch: AtomicU64::new(0),
            shutdown_requested: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ids_are_unique() {
        let shared = SharedState::new();
        let a = shared.reserve_keyframe_id();
        let b = shared.reserve_keyframe_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_reset_bumps_epoch_and_clears_flags() {
        let shared = SharedState::new();
        shared.mark_map_updated();
        assert_eq!(shared.map_epoch(), 0);
        assert_eq!(shared.reset_map(), 1);
        assert_eq!(shared.map_epoch(), 1);
        assert!(!shared.take_map_updated());
    }
}
