//! Class-weighted random forest of CART trees.
//!
//! Trees are grown in parallel, each from its own seeded ChaCha stream, so a
//! fit is a pure function of (rows, labels, params, seed).

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{Classifier, FittedModel};
use crate::error::TrainingError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForestParams {
    pub trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
}

/// Inverse-frequency weights: each class carries half of the total weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassWeights {
    pub negative: f64,
    pub positive: f64,
}

impl ClassWeights {
    pub fn balanced(labels: &[bool]) -> Self {
        let n = labels.len() as f64;
        let positives = labels.iter().filter(|&&l| l).count() as f64;
        let negatives = n - positives;
        let weight = |count: f64| if count > 0.0 { n / (2.0 * count) } else { 0.0 };
        Self {
            negative: weight(negatives),
            positive: weight(positives),
        }
    }

    fn of(&self, label: bool) -> f64 {
        if label { self.positive } else { self.negative }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Leaf {
        probability: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { probability } => return *probability,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

fn gini(w_neg: f64, w_pos: f64) -> f64 {
    let total = w_neg + w_pos;
    if total <= 0.0 {
        return 0.0;
    }
    let p = w_pos / total;
    1.0 - p * p - (1.0 - p) * (1.0 - p)
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    decrease: f64,
}

struct TreeGrower<'a> {
    rows: &'a [Vec<f64>],
    labels: &'a [bool],
    weights: ClassWeights,
    params: &'a ForestParams,
    max_features: usize,
    nodes: Vec<Node>,
    importance: Vec<f64>,
}

impl TreeGrower<'_> {
    fn class_weights_of(&self, samples: &[usize]) -> (f64, f64) {
        samples.iter().fold((0.0, 0.0), |(neg, pos), &i| {
            if self.labels[i] {
                (neg, pos + self.weights.positive)
            } else {
                (neg + self.weights.negative, pos)
            }
        })
    }

    fn grow(&mut self, samples: Vec<usize>, depth: usize, rng: &mut ChaCha8Rng) -> usize {
        let (w_neg, w_pos) = self.class_weights_of(&samples);
        let total = w_neg + w_pos;
        let probability = if total > 0.0 { w_pos / total } else { 0.0 };
        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf { probability });

        let pure = w_neg == 0.0 || w_pos == 0.0;
        if pure
            || depth >= self.params.max_depth
            || samples.len() < 2 * self.params.min_samples_leaf
        {
            return idx;
        }
        let Some(split) = self.best_split(&samples, w_neg, w_pos, rng) else {
            return idx;
        };
        self.importance[split.feature] += split.decrease;

        let (left, right): (Vec<usize>, Vec<usize>) = samples
            .into_iter()
            .partition(|&i| self.rows[i][split.feature] <= split.threshold);
        let left_idx = self.grow(left, depth + 1, rng);
        let right_idx = self.grow(right, depth + 1, rng);
        self.nodes[idx] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left: left_idx,
            right: right_idx,
        };
        idx
    }

    /// Visits features in random order until `max_features` non-constant ones were tried.
    fn best_split(
        &self,
        samples: &[usize],
        w_neg: f64,
        w_pos: f64,
        rng: &mut ChaCha8Rng,
    ) -> Option<SplitCandidate> {
        let n_features = self.importance.len();
        let mut order: Vec<usize> = (0..n_features).collect();
        order.shuffle(rng);

        let parent = (w_neg + w_pos) * gini(w_neg, w_pos);
        let min_leaf = self.params.min_samples_leaf;
        let mut best: Option<SplitCandidate> = None;
        let mut tried = 0;
        let mut column: Vec<(f64, bool)> = Vec::with_capacity(samples.len());

        for feature in order {
            if tried >= self.max_features {
                break;
            }
            column.clear();
            column.extend(samples.iter().map(|&i| (self.rows[i][feature], self.labels[i])));
            column.sort_by(|a, b| a.0.total_cmp(&b.0));
            if column[0].0 == column[column.len() - 1].0 {
                continue;
            }
            tried += 1;

            let (mut left_neg, mut left_pos) = (0.0, 0.0);
            for split_at in 1..column.len() {
                let (value, label) = column[split_at - 1];
                if label {
                    left_pos += self.weights.positive;
                } else {
                    left_neg += self.weights.negative;
                }
                let next = column[split_at].0;
                if value == next || split_at < min_leaf || column.len() - split_at < min_leaf {
                    continue;
                }
                let right_neg = w_neg - left_neg;
                let right_pos = w_pos - left_pos;
                let children = (left_neg + left_pos) * gini(left_neg, left_pos)
                    + (right_neg + right_pos) * gini(right_neg, right_pos);
                let decrease = parent - children;
                if decrease <= 1e-12 {
                    continue;
                }
                if best.as_ref().is_none_or(|b| decrease > b.decrease) {
                    let mid = value + (next - value) / 2.0;
                    let threshold = if mid < next { mid } else { value };
                    best = Some(SplitCandidate {
                        feature,
                        threshold,
                        decrease,
                    });
                }
            }
        }
        best
    }
}

/// Bootstrap that resamples each class separately, keeping the class ratio.
fn stratified_bootstrap(labels: &[bool], rng: &mut ChaCha8Rng) -> Vec<usize> {
    let positives: Vec<usize> = (0..labels.len()).filter(|&i| labels[i]).collect();
    let negatives: Vec<usize> = (0..labels.len()).filter(|&i| !labels[i]).collect();
    let mut sample = Vec::with_capacity(labels.len());
    for class in [&positives, &negatives] {
        for _ in 0..class.len() {
            sample.push(class[rng.gen_range(0..class.len())]);
        }
    }
    sample
}

fn normalize(mut values: Vec<f64>) -> Vec<f64> {
    let total: f64 = values.iter().sum();
    if total > 0.0 {
        for v in &mut values {
            *v /= total;
        }
    }
    values
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub params: ForestParams,
    pub class_weights: ClassWeights,
    pub n_features: usize,
    trees: Vec<DecisionTree>,
    importance: Vec<f64>,
}

impl RandomForest {
    pub fn trees(&self) -> &[DecisionTree] {
        &self.trees
    }
}

impl FittedModel for RandomForest {
    fn predict_proba(&self, row: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.trees.iter().map(|t| t.predict(row)).sum();
        (sum / self.trees.len() as f64).clamp(0.0, 1.0)
    }

    fn feature_importance(&self) -> &[f64] {
        &self.importance
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomForestClassifier {
    pub params: ForestParams,
}

impl RandomForestClassifier {
    pub fn new(params: ForestParams) -> Self {
        Self { params }
    }
}

impl Classifier for RandomForestClassifier {
    type Model = RandomForest;

    fn name(&self) -> &'static str {
        "random_forest"
    }

    fn describe(&self) -> String {
        format!(
            "random_forest(trees={},max_depth={},min_samples_leaf={},max_features=sqrt,class_weight=balanced)",
            self.params.trees, self.params.max_depth, self.params.min_samples_leaf
        )
    }

    fn fit(
        &self,
        rows: &[Vec<f64>],
        labels: &[bool],
        seed: u64,
    ) -> Result<RandomForest, TrainingError> {
        let n_features = rows.first().map(Vec::len).unwrap_or(0);
        if let Some((row, found)) = rows
            .iter()
            .enumerate()
            .map(|(i, r)| (i, r.len()))
            .find(|(_, len)| *len != n_features)
        {
            return Err(TrainingError::RaggedFeatures {
                row,
                found,
                expected: n_features,
            });
        }

        let weights = ClassWeights::balanced(labels);
        let max_features = ((n_features as f64).sqrt().ceil() as usize).clamp(1, n_features.max(1));

        let grown: Vec<(DecisionTree, Vec<f64>)> = (0..self.params.trees)
            .into_par_iter()
            .map(|tree_idx| {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                rng.set_stream(tree_idx as u64);
                let sample = stratified_bootstrap(labels, &mut rng);
                let mut grower = TreeGrower {
                    rows,
                    labels,
                    weights,
                    params: &self.params,
                    max_features,
                    nodes: Vec::new(),
                    importance: vec![0.0; n_features],
                };
                if !sample.is_empty() && n_features > 0 {
                    grower.grow(sample, 0, &mut rng);
                } else {
                    grower.nodes.push(Node::Leaf { probability: 0.0 });
                }
                (
                    DecisionTree {
                        nodes: grower.nodes,
                    },
                    normalize(grower.importance),
                )
            })
            .collect();

        let mut importance = vec![0.0; n_features];
        let mut trees = Vec::with_capacity(grown.len());
        for (tree, tree_importance) in grown {
            for (acc, v) in importance.iter_mut().zip(tree_importance) {
                *acc += v;
            }
            trees.push(tree);
        }
        let mut importance = normalize(importance);
        if n_features > 0 && importance.iter().all(|v| *v == 0.0) {
            importance = vec![1.0 / n_features as f64; n_features];
        }

        Ok(RandomForest {
            params: self.params.clone(),
            class_weights: weights,
            n_features,
            trees,
            importance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(trees: usize) -> ForestParams {
        ForestParams {
            trees,
            max_depth: 6,
            min_samples_leaf: 1,
        }
    }

    /// Feature 0 separates the classes; feature 1 is noise.
    fn separable(n: usize) -> (Vec<Vec<f64>>, Vec<bool>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..n {
            let positive = i % 10 == 0;
            let signal = if positive { 10.0 + (i % 7) as f64 } else { (i % 5) as f64 };
            rows.push(vec![signal, ((i * 37) % 11) as f64]);
            labels.push(positive);
        }
        (rows, labels)
    }

    #[test]
    fn balanced_weights_split_total_weight_evenly() {
        let labels = [true, false, false, false];
        let w = ClassWeights::balanced(&labels);
        assert_eq!(w.positive, 2.0);
        assert!((w.negative - 4.0 / 6.0).abs() < 1e-12);
        assert!((w.positive * 1.0 - w.negative * 3.0).abs() < 1e-12);
    }

    #[test]
    fn learns_separable_signal() {
        let (rows, labels) = separable(200);
        let forest = RandomForestClassifier::new(params(25)).fit(&rows, &labels, 7).unwrap();
        assert!(forest.predict_proba(&[15.0, 3.0]) > 0.9);
        assert!(forest.predict_proba(&[1.0, 3.0]) < 0.1);
        let importance = forest.feature_importance();
        assert!(importance[0] > importance[1]);
        assert!((importance.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn same_seed_gives_identical_forest() {
        let (rows, labels) = separable(150);
        let clf = RandomForestClassifier::new(params(12));
        let a = clf.fit(&rows, &labels, 99).unwrap();
        let b = clf.fit(&rows, &labels, 99).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn respects_max_depth() {
        let (rows, labels) = separable(300);
        let mut p = params(5);
        p.max_depth = 2;
        let forest = RandomForestClassifier::new(p).fit(&rows, &labels, 3).unwrap();
        assert!(forest.trees().iter().all(|t| t.depth() <= 2));
    }

    #[test]
    fn constant_features_give_uniform_importance() {
        let rows = vec![vec![1.0, 2.0]; 20];
        let labels: Vec<bool> = (0..20).map(|i| i % 4 == 0).collect();
        let forest = RandomForestClassifier::new(params(4)).fit(&rows, &labels, 1).unwrap();
        assert_eq!(forest.feature_importance(), &[0.5, 0.5]);
        // every tree is a single weighted leaf: balanced weights make it 0.5
        assert!((forest.predict_proba(&[1.0, 2.0]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let rows = vec![vec![1.0, 2.0], vec![1.0]];
        let err = RandomForestClassifier::new(params(1))
            .fit(&rows, &[true, false], 1)
            .unwrap_err();
        assert_eq!(
            err,
            TrainingError::RaggedFeatures {
                row: 1,
                found: 1,
                expected: 2
            }
        );
    }
}
