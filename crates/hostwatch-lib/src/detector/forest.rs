//! Isolation-based outlier forest
//!
//! An ensemble of randomized binary trees; each tree isolates points by
//! recursive random feature/threshold splits, and a sample's isolation
//! score is a function of its average path depth across trees. Tree
//! construction is deterministic for a given seed, so identical training
//! windows always produce identical models.

use crate::models::FEATURE_COUNT;
use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Number of trees in the ensemble
pub const TREE_COUNT: usize = 100;

/// Upper bound on the per-tree training subsample
pub const MAX_SUBSAMPLE: usize = 256;

/// Euler-Mascheroni constant, used in the expected path length of an
/// unsuccessful binary search
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Stretch applied to the normalized score gap so the fixed severity
/// bands cover the usable score range
const SCORE_GAIN: f64 = 2.0;

/// One row of detector input
pub type FeatureRow = [f64; FEATURE_COUNT];

enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn grow(rows: &[FeatureRow], indices: Vec<usize>, rng: &mut StdRng) -> Self {
        let mut nodes = Vec::new();
        Self::grow_node(&mut nodes, rows, indices, rng);
        Tree { nodes }
    }

    fn grow_node(
        nodes: &mut Vec<Node>,
        rows: &[FeatureRow],
        indices: Vec<usize>,
        rng: &mut StdRng,
    ) -> usize {
        if indices.len() <= 1 {
            nodes.push(Node::Leaf {
                size: indices.len(),
            });
            return nodes.len() - 1;
        }

        // Only features with spread inside this partition can split it
        let mut candidates = [0usize; FEATURE_COUNT];
        let mut candidate_count = 0;
        let mut ranges = [(0.0f64, 0.0f64); FEATURE_COUNT];
        for feature in 0..FEATURE_COUNT {
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            for &i in &indices {
                let v = rows[i][feature];
                min = min.min(v);
                max = max.max(v);
            }
            if max > min {
                candidates[candidate_count] = feature;
                ranges[feature] = (min, max);
                candidate_count += 1;
            }
        }

        if candidate_count == 0 {
            nodes.push(Node::Leaf {
                size: indices.len(),
            });
            return nodes.len() - 1;
        }

        let feature = candidates[rng.gen_range(0..candidate_count)];
        let (min, max) = ranges[feature];
        let threshold = rng.gen_range(min..max);

        let size = indices.len();
        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| rows[i][feature] < threshold);

        if left_idx.is_empty() || right_idx.is_empty() {
            nodes.push(Node::Leaf { size });
            return nodes.len() - 1;
        }

        let slot = nodes.len();
        nodes.push(Node::Leaf { size: 0 });
        let left = Self::grow_node(nodes, rows, left_idx, rng);
        let right = Self::grow_node(nodes, rows, right_idx, rng);
        nodes[slot] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        slot
    }

    fn path_length(&self, row: &FeatureRow) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    depth += 1.0;
                    node = if row[*feature] < *threshold {
                        *left
                    } else {
                        *right
                    };
                }
                Node::Leaf { size } => return depth + average_path_length(*size),
            }
        }
    }
}

/// Expected path length of an unsuccessful search in a binary tree of
/// `n` points; normalizes depths across subsample sizes
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Trained isolation forest with a signed decision score
///
/// The decision boundary sits at 0: the fit calibrates an offset at the
/// contamination quantile of the training isolation scores, so roughly a
/// `contamination` fraction of the training window scores negative.
/// Lower scores are more anomalous; the scale is clamped to [-1, 1].
pub struct IsolationForest {
    trees: Vec<Tree>,
    subsample_size: usize,
    score_offset: f64,
    score_scale: f64,
}

impl IsolationForest {
    /// Fit a forest on the training window.
    ///
    /// Fails on degenerate input: fewer than two rows, non-finite
    /// values, or every feature constant (nothing to split on).
    pub fn fit(rows: &[FeatureRow], contamination: f64, seed: u64) -> Result<Self> {
        if rows.len() < 2 {
            bail!("need at least 2 training samples, got {}", rows.len());
        }
        if rows
            .iter()
            .any(|row| row.iter().any(|v| !v.is_finite()))
        {
            bail!("training data contains non-finite feature values");
        }
        if !(0..FEATURE_COUNT).any(|f| {
            let first = rows[0][f];
            rows.iter().any(|row| row[f] != first)
        }) {
            bail!("all features are constant, nothing to isolate");
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let subsample_size = rows.len().min(MAX_SUBSAMPLE);

        let trees = (0..TREE_COUNT)
            .map(|_| {
                let indices = sample_indices(rows.len(), subsample_size, &mut rng);
                Tree::grow(rows, indices, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            subsample_size,
            score_offset: 0.0,
            score_scale: 1.0,
        };

        let mut training_scores: Vec<f64> =
            rows.iter().map(|row| forest.isolation_score(row)).collect();
        training_scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let quantile = ((rows.len() as f64) * (1.0 - contamination)).floor() as usize;
        forest.score_offset = training_scores[quantile.min(rows.len() - 1)];
        forest.score_scale = (1.0 - forest.score_offset).max(f64::EPSILON);

        Ok(forest)
    }

    /// Normalized isolation score in (0, 1]; higher means the point
    /// isolates in fewer splits
    pub fn isolation_score(&self, row: &FeatureRow) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.path_length(row)).sum();
        let avg_depth = total / self.trees.len() as f64;
        let norm = average_path_length(self.subsample_size);
        if norm <= 0.0 {
            return 0.5;
        }
        2.0f64.powf(-avg_depth / norm)
    }

    /// Signed decision score: negative iff the sample is more isolated
    /// than the contamination boundary of the training window
    pub fn decision_score(&self, row: &FeatureRow) -> f64 {
        let s = self.isolation_score(row);
        (SCORE_GAIN * (self.score_offset - s) / self.score_scale).clamp(-1.0, 1.0)
    }

    /// Subsample size each tree was grown on
    pub fn subsample_size(&self) -> usize {
        self.subsample_size
    }
}

/// Draw `k` distinct indices from `0..n` (partial Fisher-Yates)
fn sample_indices(n: usize, k: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..n).collect();
    for i in 0..k {
        let j = rng.gen_range(i..n);
        indices.swap(i, j);
    }
    indices.truncate(k);
    indices
}
