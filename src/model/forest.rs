//! Bagged ensemble of CART regression trees with squared-error splits.

use crate::model::{RANDOM_FOREST_MODEL, RegressionModel};
use crate::series::features::{PREDICTOR_COUNT, Predictors};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub type Sample = [f64; PREDICTOR_COUNT];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    /// `None` grows trees until the sample limits stop them.
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 250,
            max_depth: Some(5),
            min_samples_split: 10,
            min_samples_leaf: 10,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    fn fit(samples: &[Sample], targets: &[f64], indices: Vec<usize>, params: &ForestParams) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(samples, targets, indices, 0, params);
        tree
    }

    /// Appends the subtree for `indices` and returns its root position.
    fn grow(
        &mut self,
        samples: &[Sample],
        targets: &[f64],
        indices: Vec<usize>,
        depth: usize,
        params: &ForestParams,
    ) -> usize {
        let position = self.nodes.len();
        let value = mean(indices.iter().map(|i| targets[*i]));
        self.nodes.push(Node::Leaf { value });

        let depth_reached = params.max_depth.is_some_and(|max| depth >= max);
        let min_leaf = params.min_samples_leaf.max(1);
        if depth_reached
            || indices.len() < params.min_samples_split.max(2)
            || indices.len() < 2 * min_leaf
        {
            return position;
        }

        let Some(split) = best_split(samples, targets, &indices, min_leaf) else {
            return position;
        };

        let (left_indices, right_indices): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|i| samples[*i][split.feature] <= split.threshold);
        let left = self.grow(samples, targets, left_indices, depth + 1, params);
        let right = self.grow(samples, targets, right_indices, depth + 1, params);
        self.nodes[position] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        position
    }

    pub fn predict(&self, sample: &Sample) -> f64 {
        let mut position = 0;
        loop {
            match self.nodes.get(position) {
                Some(Node::Leaf { value }) => return *value,
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let value = sample.get(*feature).copied().unwrap_or(f64::NAN);
                    position = if value <= *threshold { *left } else { *right };
                }
                None => return f64::NAN,
            }
        }
    }

    /// Children must point forward inside the arena, which rules out cycles.
    fn validate(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".to_string());
        }
        for (position, node) in self.nodes.iter().enumerate() {
            if let Node::Split {
                feature,
                left,
                right,
                ..
            } = node
            {
                if *feature >= PREDICTOR_COUNT {
                    return Err(format!("node {position} splits on unknown feature {feature}"));
                }
                for child in [*left, *right] {
                    if child <= position || child >= self.nodes.len() {
                        return Err(format!("node {position} has invalid child {child}"));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], position: usize) -> usize {
            match nodes.get(position) {
                Some(Node::Split { left, right, .. }) => 1 + walk(nodes, *left).max(walk(nodes, *right)),
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }
}

struct Split {
    feature: usize,
    threshold: f64,
}

fn best_split(samples: &[Sample], targets: &[f64], indices: &[usize], min_leaf: usize) -> Option<Split> {
    let n = indices.len();
    let total: f64 = indices.iter().map(|i| targets[*i]).sum();
    // Maximising sum_l^2/n_l + sum_r^2/n_r minimises the children's squared error.
    let baseline = total * total / n as f64;
    let mut best_score = baseline + baseline.abs() * 1e-12 + 1e-9;
    let mut best = None;
    let mut order = indices.to_vec();

    for feature in 0..PREDICTOR_COUNT {
        order.sort_by(|a, b| samples[*a][feature].total_cmp(&samples[*b][feature]));
        let mut left_sum = 0.0;
        for k in 1..n {
            left_sum += targets[order[k - 1]];
            if k < min_leaf || n - k < min_leaf {
                continue;
            }
            let below = samples[order[k - 1]][feature];
            let above = samples[order[k]][feature];
            if below >= above {
                continue;
            }
            let right_sum = total - left_sum;
            let score = left_sum * left_sum / k as f64 + right_sum * right_sum / (n - k) as f64;
            if score > best_score {
                best_score = score;
                best = Some(Split {
                    feature,
                    threshold: below + (above - below) / 2.0,
                });
            }
        }
    }
    best
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<RegressionTree>,
}

impl RandomForest {
    /// Fit one tree per estimator on a bootstrap resample of the rows.
    ///
    /// Each tree draws from its own generator seeded from `params.seed`, so
    /// identical input and parameters give an identical forest.
    pub fn fit(samples: &[Sample], targets: &[f64], params: &ForestParams) -> Self {
        let n = samples.len().min(targets.len());
        let mut seeds = StdRng::seed_from_u64(params.seed);
        let trees = (0..params.n_estimators.max(1))
            .map(|_| {
                let mut rng = StdRng::seed_from_u64(seeds.r#gen());
                let indices: Vec<usize> = if n == 0 {
                    Vec::new()
                } else {
                    (0..n).map(|_| rng.gen_range(0..n)).collect()
                };
                RegressionTree::fit(samples, targets, indices, params)
            })
            .collect();
        Self { trees }
    }

    pub fn predict_sample(&self, sample: &Sample) -> f64 {
        mean(self.trees.iter().map(|tree| tree.predict(sample)))
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.trees.is_empty() {
            return Err("forest has no trees".to_string());
        }
        self.trees.iter().try_for_each(RegressionTree::validate)
    }
}

impl RegressionModel for RandomForest {
    fn predict(&self, predictors: &Predictors) -> f64 {
        self.predict_sample(&predictors.to_array())
    }

    fn kind(&self) -> &'static str {
        RANDOM_FOREST_MODEL
    }
}
