//! Bag-of-Words vocabulary used for keyframe matching and relocalization.
//!
//! The tracker only depends on the [`Vocabulary`] trait. [`OrbVocabulary`] is
//! a DBoW2-format k-means tree implementing it:
//! - [`BowVector`]: word id -> L1-normalized TF-IDF weight
//! - [`FeatureVector`]: node id at a fixed tree level -> feature indices,
//!   used to restrict descriptor comparisons to features in the same node

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::tracking::frame::{descriptor_distance, Descriptor};

/// Bag-of-Words vector: word_id -> weight.
pub type BowVector = HashMap<u32, f64>;

/// Feature vector: node_id -> feature indices, ordered by node id.
pub type FeatureVector = BTreeMap<u32, Vec<usize>>;

/// Levels above the leaves used to group features in a [`FeatureVector`].
pub const FEATURE_VECTOR_LEVELS_UP: usize = 4;

/// L1 similarity `1 - 0.5 * |a - b|_1`, in `[0, 1]` for normalized inputs.
pub fn l1_score(a: &BowVector, b: &BowVector) -> f64 {
    let mut diff_sum = 0.0;
    for (word_id, wa) in a {
        let wb = b.get(word_id).copied().unwrap_or(0.0);
        diff_sum += (wa - wb).abs();
    }
    for (word_id, wb) in b {
        if !a.contains_key(word_id) {
            diff_sum += wb.abs();
        }
    }
    1.0 - 0.5 * diff_sum
}

/// Descriptor quantizer.
pub trait Vocabulary: Send + Sync {
    fn transform(&self, descriptors: &[Descriptor], levels_up: usize) -> (BowVector, FeatureVector);

    fn score(&self, a: &BowVector, b: &BowVector) -> f64 {
        l1_score(a, b)
    }
}

/// A node in the vocabulary tree.
#[derive(Debug, Clone)]
struct VocabNode {
    parent: u32,
    children: Vec<u32>,
    descriptor: Descriptor,
    /// IDF weight, non-zero for leaves.
    weight: f64,
    word_id: Option<u32>,
}

impl VocabNode {
    fn new(parent: u32) -> Self {
        Self {
            parent,
            children: Vec::new(),
            descriptor: [0u8; 32],
            weight: 0.0,
            word_id: None,
        }
    }
}

/// ORB vocabulary tree (DBoW2 layout, node 0 is the root).
#[derive(Debug)]
pub struct OrbVocabulary {
    nodes: Vec<VocabNode>,
    num_words: usize,
    k: usize,
    l: usize,
}

impl OrbVocabulary {
    /// Load a vocabulary in DBoW2 text format.
    ///
    /// ```text
    /// k L scoring weighting
    /// parent_id is_leaf desc[0] ... desc[31] weight
    /// ```
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open vocabulary {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut lines = reader.lines();
        let header = match lines.next() {
            Some(line) => line?,
            None => bail!("empty vocabulary file"),
        };
        let header_parts: Vec<&str> = header.split_whitespace().collect();
        if header_parts.len() < 2 {
            bail!("invalid vocabulary header '{}', expected: k L [scoring weighting]", header);
        }
        let k: usize = header_parts[0].parse().context("invalid k value")?;
        let l: usize = header_parts[1].parse().context("invalid L value")?;

        let mut nodes = vec![VocabNode::new(u32::MAX)];
        let mut num_words = 0u32;

        for (line_num, line) in lines.enumerate() {
            let line = line?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            // parent_id is_leaf desc[32] weight
            if parts.len() < 35 {
                continue;
            }
            let parent_id: u32 = parts[0]
                .parse()
                .with_context(|| format!("invalid parent_id at line {}", line_num + 2))?;
            let mut node = VocabNode::new(parent_id);
            for (i, byte_str) in parts[2..34].iter().enumerate() {
                node.descriptor[i] = byte_str
                    .parse()
                    .with_context(|| format!("invalid descriptor byte at line {}", line_num + 2))?;
            }
            node.weight = parts[34]
                .parse()
                .with_context(|| format!("invalid weight at line {}", line_num + 2))?;
            if parts[1] == "1" {
                node.word_id = Some(num_words);
                num_words += 1;
            }

            let node_id = nodes.len() as u32;
            if (parent_id as usize) < nodes.len() {
                nodes[parent_id as usize].children.push(node_id);
            }
            nodes.push(node);
        }

        tracing::info!(
            "Loaded vocabulary: k={}, L={}, {} nodes, {} words",
            k,
            l,
            nodes.len(),
            num_words
        );

        Ok(Self {
            nodes,
            num_words: num_words as usize,
            k,
            l,
        })
    }

    /// Single-level vocabulary whose words are the given descriptors, all with
    /// unit weight.
    pub fn flat(words: &[Descriptor]) -> Self {
        let mut nodes = vec![VocabNode::new(u32::MAX)];
        for (i, desc) in words.iter().enumerate() {
            let mut node = VocabNode::new(0);
            node.descriptor = *desc;
            node.weight = 1.0;
            node.word_id = Some(i as u32);
            let child = nodes.len() as u32;
            nodes[0].children.push(child);
            nodes.push(node);
        }
        Self {
            nodes,
            num_words: words.len(),
            k: words.len(),
            l: 1,
        }
    }

    /// Branching factor and depth.
    pub fn params(&self) -> (usize, usize) {
        (self.k, self.l)
    }

    pub fn num_words(&self) -> usize {
        self.num_words
    }

    /// Descend to the closest leaf. Returns `(word_id, leaf_node_id)`.
    fn transform_descriptor(&self, desc: &Descriptor) -> (u32, u32) {
        let mut node_id = 0usize;
        while let Some((&first, rest)) = self.nodes[node_id].children.split_first() {
            let mut best_child = first;
            let mut best_dist = descriptor_distance(desc, &self.nodes[first as usize].descriptor);
            for &child in rest {
                let dist = descriptor_distance(desc, &self.nodes[child as usize].descriptor);
                if dist < best_dist {
                    best_dist = dist;
                    best_child = child;
                }
            }
            node_id = best_child as usize;
        }
        let word_id = self.nodes[node_id].word_id.unwrap_or(0);
        (word_id, node_id as u32)
    }

    /// Ancestor `levels_up` above a leaf, stopping below the root.
    fn parent_at_level(&self, leaf_id: u32, levels_up: usize) -> u32 {
        let mut node_id = leaf_id;
        for _ in 0..levels_up {
            let parent = self.nodes[node_id as usize].parent;
            if parent == u32::MAX || parent == 0 {
                break;
            }
            node_id = parent;
        }
        node_id
    }
}

impl Vocabulary for OrbVocabulary {
    fn transform(&self, descriptors: &[Descriptor], levels_up: usize) -> (BowVector, FeatureVector) {
        let mut bow = BowVector::new();
        let mut feat = FeatureVector::new();
        if self.nodes.len() <= 1 {
            return (bow, feat);
        }

        for (i, desc) in descriptors.iter().enumerate() {
            let (word_id, leaf_id) = self.transform_descriptor(desc);
            let weight = self.nodes[leaf_id as usize].weight;
            if weight > 0.0 {
                *bow.entry(word_id).or_insert(0.0) += weight;
            }
            let node = self.parent_at_level(leaf_id, levels_up);
            feat.entry(node).or_default().push(i);
        }

        let sum: f64 = bow.values().sum();
        if sum > 0.0 {
            for v in bow.values_mut() {
                *v /= sum;
            }
        }
        (bow, feat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn word(b: u8) -> Descriptor {
        [b; 32]
    }

    #[test]
    fn test_l1_score() {
        let mut v1 = BowVector::new();
        v1.insert(0, 0.5);
        v1.insert(1, 0.5);
        assert_relative_eq!(l1_score(&v1, &v1.clone()), 1.0, epsilon = 1e-12);

        let mut v3 = BowVector::new();
        v3.insert(2, 0.5);
        v3.insert(3, 0.5);
        assert_relative_eq!(l1_score(&v1, &v3), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_flat_transform_groups_by_word() {
        let vocab = OrbVocabulary::flat(&[word(0x00), word(0xff), word(0x0f)]);
        let descs = [word(0x01), word(0xfe), word(0x00), word(0x0f)];
        let (bow, feat) = vocab.transform(&descs, FEATURE_VECTOR_LEVELS_UP);

        assert_eq!(bow.len(), 3);
        assert_relative_eq!(bow[&0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(bow.values().sum::<f64>(), 1.0, epsilon = 1e-12);
        // Leaves are direct children of the root, so each leaf is its own group.
        assert_eq!(feat.values().map(|v| v.len()).sum::<usize>(), 4);
        assert!(feat.values().any(|v| v == &vec![0, 2]));
    }

    #[test]
    fn test_parse_text_format() {
        let zeros = vec!["0"; 32].join(" ");
        let ones = vec!["255"; 32].join(" ");
        let text = format!(
            "2 1 0 0\n0 1 {} 0.7\n0 1 {} 0.3\n",
            zeros, ones
        );
        let vocab = OrbVocabulary::from_reader(text.as_bytes()).unwrap();
        assert_eq!(vocab.num_words(), 2);
        assert_eq!(vocab.params(), (2, 1));
        let (bow, _) = vocab.transform(&[word(0xff)], 0);
        assert_relative_eq!(bow[&1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(OrbVocabulary::from_reader("".as_bytes()).is_err());
    }
}
