//! KeyFrameDatabase - inverted Bag-of-Words index over keyframes.
//!
//! Each vocabulary word lists the keyframes whose BoW vector contains it.
//! Relocalization queries walk only the lists of the query's words, score the
//! keyframes that share enough words, and then pool scores over covisibility
//! neighborhoods so that a single lucky keyframe does not win on its own.

use std::collections::{HashMap, HashSet};

use crate::atlas::map::{KeyFrameId, Map};
use crate::vocabulary::{BowVector, Vocabulary};

/// Fraction of the best common-word count a candidate must reach.
const MIN_COMMON_WORDS_RATIO: f64 = 0.8;
/// Covisibles pooled into a candidate's group score.
const GROUP_NEIGHBORS: usize = 10;
/// Fraction of the best group score a group must reach.
const MIN_GROUP_SCORE_RATIO: f64 = 0.75;

/// Inverted file from word id to keyframes.
#[derive(Debug, Default)]
pub struct KeyFrameDatabase {
    inverted_file: HashMap<u32, Vec<KeyFrameId>>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a keyframe under every word of its BoW vector.
    pub fn add(&mut self, kf_id: KeyFrameId, bow: &BowVector) {
        for word_id in bow.keys() {
            let entries = self.inverted_file.entry(*word_id).or_default();
            if !entries.contains(&kf_id) {
                entries.push(kf_id);
            }
        }
    }

    pub fn erase(&mut self, kf_id: KeyFrameId, bow: &BowVector) {
        for word_id in bow.keys() {
            if let Some(entries) = self.inverted_file.get_mut(word_id) {
                entries.retain(|&id| id != kf_id);
                if entries.is_empty() {
                    self.inverted_file.remove(word_id);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.inverted_file.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inverted_file.is_empty()
    }

    /// Keyframes that may show the same place as `bow`.
    ///
    /// Returns the best keyframe of every covisibility group whose pooled
    /// score reaches `MIN_GROUP_SCORE_RATIO` of the best group, in
    /// decreasing order of group score.
    pub fn detect_relocalization_candidates(
        &self,
        bow: &BowVector,
        map: &Map,
        vocabulary: &dyn Vocabulary,
    ) -> Vec<KeyFrameId> {
        // Keyframes sharing words with the query.
        let mut common_words: HashMap<KeyFrameId, usize> = HashMap::new();
        for word_id in bow.keys() {
            if let Some(entries) = self.inverted_file.get(word_id) {
                for &kf_id in entries {
                    *common_words.entry(kf_id).or_insert(0) += 1;
                }
            }
        }
        let Some(&max_common) = common_words.values().max() else {
            return Vec::new();
        };
        let min_common = (max_common as f64 * MIN_COMMON_WORDS_RATIO) as usize;

        let mut scores: HashMap<KeyFrameId, f64> = HashMap::new();
        for (&kf_id, &n_words) in &common_words {
            if n_words <= min_common {
                continue;
            }
            if let Some(kf) = map.get_keyframe(kf_id) {
                scores.insert(kf_id, vocabulary.score(bow, &kf.bow));
            }
        }
        if scores.is_empty() {
            return Vec::new();
        }

        // Pool over covisibility neighborhoods.
        let mut groups: Vec<(f64, KeyFrameId)> = Vec::with_capacity(scores.len());
        let mut best_acc_score = 0.0f64;
        for (&kf_id, &score) in &scores {
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            let mut acc_score = score;
            let mut best_score = score;
            let mut best_kf = kf_id;
            for neighbor in kf.best_covisibles(GROUP_NEIGHBORS) {
                if let Some(&neighbor_score) = scores.get(&neighbor) {
                    acc_score += neighbor_score;
                    if neighbor_score > best_score {
                        best_score = neighbor_score;
                        best_kf = neighbor;
                    }
                }
            }
            best_acc_score = best_acc_score.max(acc_score);
            groups.push((acc_score, best_kf));
        }

        let min_score_to_retain = MIN_GROUP_SCORE_RATIO * best_acc_score;
        groups.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut seen = HashSet::new();
        groups
            .into_iter()
            .filter(|(acc, _)| *acc > min_score_to_retain)
            .filter(|(_, kf_id)| seen.insert(*kf_id))
            .map(|(_, kf_id)| kf_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::keyframe::tests::create_keyframe_with_features;
    use crate::vocabulary::OrbVocabulary;

    fn bow(words: &[u32]) -> BowVector {
        let w = 1.0 / words.len() as f64;
        words.iter().map(|&id| (id, w)).collect()
    }

    fn add_kf(map: &mut Map, db: &mut KeyFrameDatabase, id: u64, words: &[u32]) {
        let mut kf = create_keyframe_with_features(id, 0);
        kf.bow = bow(words);
        db.add(kf.id, &kf.bow);
        map.add_keyframe(kf);
    }

    #[test]
    fn test_best_matching_keyframe_wins() {
        let vocab = OrbVocabulary::flat(&[]);
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new();
        add_kf(&mut map, &mut db, 0, &[1, 2, 3, 4, 5]);
        add_kf(&mut map, &mut db, 1, &[1, 2, 9, 10, 11]);
        add_kf(&mut map, &mut db, 2, &[20, 21, 22]);

        let query = bow(&[1, 2, 3, 4, 5]);
        let cands = db.detect_relocalization_candidates(&query, &map, &vocab);
        assert_eq!(cands, vec![KeyFrameId::new(0)]);
    }

    #[test]
    fn test_no_shared_words() {
        let vocab = OrbVocabulary::flat(&[]);
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new();
        add_kf(&mut map, &mut db, 0, &[1, 2, 3]);
        assert!(db
            .detect_relocalization_candidates(&bow(&[7, 8]), &map, &vocab)
            .is_empty());
    }

    #[test]
    fn test_erase_removes_entries() {
        let mut db = KeyFrameDatabase::new();
        let b = bow(&[1, 2]);
        db.add(KeyFrameId::new(3), &b);
        db.add(KeyFrameId::new(3), &b);
        db.erase(KeyFrameId::new(3), &b);
        assert!(db.is_empty());
    }
}
