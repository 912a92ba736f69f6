//! Atlas - the active map plus its keyframe database.
//!
//! Tracking, local mapping and any viewer share one `Atlas` behind a
//! `RwLock`, so a reader always sees the map and the database in step.

use crate::atlas::map::Map;

use super::keyframe_db::KeyFrameDatabase;

/// Map container owned by [`SharedState`](crate::system::SharedState).
pub struct Atlas {
    map: Map,
    /// Keyframe database for place recognition.
    pub keyframe_db: KeyFrameDatabase,
}

impl Atlas {
    pub fn new() -> Self {
        Self {
            map: Map::new(),
            keyframe_db: KeyFrameDatabase::new(),
        }
    }

    pub fn active_map(&self) -> &Map {
        &self.map
    }

    pub fn active_map_mut(&mut self) -> &mut Map {
        &mut self.map
    }

    /// Split borrow for callers that update the map and the database together.
    pub fn map_and_db_mut(&mut self) -> (&mut Map, &mut KeyFrameDatabase) {
        (&mut self.map, &mut self.keyframe_db)
    }

    pub fn num_keyframes(&self) -> usize {
        self.map.num_keyframes()
    }

    /// Drop every keyframe, map point and database entry.
    pub fn clear(&mut self) {
        self.map.clear();
        self.keyframe_db.clear();
    }
}

impl Default for Atlas {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::keyframe::tests::create_keyframe_with_features;
    use crate::vocabulary::BowVector;

    #[test]
    fn test_clear_resets_map_and_database() {
        let mut atlas = Atlas::new();
        let kf = create_keyframe_with_features(0, 4);
        let id = kf.id;
        let mut bow = BowVector::new();
        bow.insert(3, 1.0);
        let (map, db) = atlas.map_and_db_mut();
        map.add_keyframe(kf);
        db.add(id, &bow);
        assert_eq!(atlas.num_keyframes(), 1);

        atlas.clear();
        assert_eq!(atlas.num_keyframes(), 0);
        assert!(atlas.keyframe_db.is_empty());
    }
}
