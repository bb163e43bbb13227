//! Approximate nearest neighbour search
//!
//! A forest of random projection trees in the style of Annoy. Every tree
//! recursively splits the items by the hyperplane that separates two
//! centroids found by a short two-means run, until a node holds few enough
//! items to be a leaf. A query walks all trees best-first, collecting leaf
//! items until the search budget is spent, then ranks the candidates by
//! exact Euclidean distance.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::traits::{Neighbor, Search};
use crate::encoding::{FaceEncoding, ENCODING_DIM};
use crate::error::{FaceError, Result};
use crate::utils::math::{dot, euclidean_distance, squared_distance};

const DEFAULT_SEED: u64 = 0x5eed_f00d;
const TWO_MEANS_ITERATIONS: usize = 200;
/// Largest fraction of a node's items one child may take
const MAX_SPLIT_SHARE: f64 = 0.95;
const SPLIT_ATTEMPTS: usize = 3;

#[derive(Debug)]
enum Node {
    Leaf(Vec<usize>),
    Split {
        normal: Vec<f64>,
        offset: f64,
        left: usize,
        right: usize,
    },
}

/// Tree node waiting to be visited, ordered by its margin to the query
struct Pending {
    priority: f64,
    node: usize,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.total_cmp(&other.priority)
    }
}

/// Random projection forest over fixed-dimension vectors.
///
/// Items are appended with [`add_item`](Self::add_item); a label added twice
/// keeps both vectors. [`build`](Self::build) may run only once.
#[derive(Debug)]
pub struct AnnoyIndex {
    dimension: usize,
    labels: Vec<i32>,
    vectors: Vec<Vec<f64>>,
    nodes: Vec<Node>,
    roots: Vec<usize>,
    rng: StdRng,
    built: bool,
}

impl AnnoyIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            labels: Vec::new(),
            vectors: Vec::new(),
            nodes: Vec::new(),
            roots: Vec::new(),
            rng: StdRng::seed_from_u64(DEFAULT_SEED),
            built: false,
        }
    }

    /// Reseed tree construction; only meaningful before `build`
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn item_count(&self) -> usize {
        self.vectors.len()
    }

    pub fn tree_count(&self) -> usize {
        self.roots.len()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn add_item(&mut self, label: i32, vector: &[f64]) -> Result<()> {
        if self.built {
            return Err(FaceError::IndexAlreadyBuilt);
        }
        if vector.len() != self.dimension {
            return Err(FaceError::InvalidArgument(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimension
            )));
        }
        self.labels.push(label);
        self.vectors.push(vector.to_vec());
        Ok(())
    }

    /// Grow `tree_count` trees over every added item
    pub fn build(&mut self, tree_count: usize) -> Result<()> {
        if self.built {
            return Err(FaceError::IndexAlreadyBuilt);
        }
        if tree_count == 0 {
            return Err(FaceError::InvalidArgument("tree_count must be positive".into()));
        }

        let start = Instant::now();
        let all: Vec<usize> = (0..self.vectors.len()).collect();
        if !all.is_empty() {
            for _ in 0..tree_count {
                let root = self.grow(all.clone());
                self.roots.push(root);
            }
        }
        self.built = true;

        info!(
            "Built search forest: {} items, {} trees, {} nodes in {:?}",
            self.vectors.len(),
            self.roots.len(),
            self.nodes.len(),
            start.elapsed()
        );
        Ok(())
    }

    /// Up to `k` approximate neighbours of `query`, nearest first.
    ///
    /// `search_budget` bounds the number of candidate items inspected;
    /// `None` uses `k * tree_count`.
    pub fn get_nns_by_vector(
        &self,
        query: &[f64],
        k: usize,
        search_budget: Option<usize>,
    ) -> Result<(Vec<i32>, Vec<f64>)> {
        if !self.built {
            return Err(FaceError::IndexNotBuilt);
        }
        if query.len() != self.dimension {
            return Err(FaceError::InvalidArgument(format!(
                "query has {} dimensions, index expects {}",
                query.len(),
                self.dimension
            )));
        }
        if k == 0 || self.roots.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let budget = search_budget.unwrap_or(k * self.roots.len()).max(k);
        let mut queue: BinaryHeap<Pending> = self
            .roots
            .iter()
            .map(|&node| Pending {
                priority: f64::INFINITY,
                node,
            })
            .collect();

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        while candidates.len() < budget {
            let Some(Pending { priority, node }) = queue.pop() else {
                break;
            };
            match &self.nodes[node] {
                Node::Leaf(items) => {
                    candidates.extend(items.iter().copied().filter(|&item| seen.insert(item)));
                }
                Node::Split {
                    normal,
                    offset,
                    left,
                    right,
                } => {
                    let margin = dot(normal, query) + offset;
                    queue.push(Pending {
                        priority: priority.min(margin),
                        node: *right,
                    });
                    queue.push(Pending {
                        priority: priority.min(-margin),
                        node: *left,
                    });
                }
            }
        }

        let mut ranked: Vec<(usize, f64)> = candidates
            .into_iter()
            .map(|item| (item, euclidean_distance(&self.vectors[item], query)))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        ranked.truncate(k);

        debug!("Search inspected {} candidates", seen.len());
        Ok(ranked
            .into_iter()
            .map(|(item, distance)| (self.labels[item], distance))
            .unzip())
    }

    fn leaf_capacity(&self) -> usize {
        self.dimension + 2
    }

    fn grow(&mut self, items: Vec<usize>) -> usize {
        if items.len() <= self.leaf_capacity() {
            return self.push(Node::Leaf(items));
        }

        for _ in 0..SPLIT_ATTEMPTS {
            let (normal, offset) = self.hyperplane(&items);
            let (left, right): (Vec<usize>, Vec<usize>) = items
                .iter()
                .copied()
                .partition(|&item| dot(&normal, &self.vectors[item]) + offset <= 0.0);
            if left.len().max(right.len()) as f64 <= MAX_SPLIT_SHARE * items.len() as f64 {
                return self.grow_split(normal, offset, left, right);
            }
        }

        // No hyperplane gave a usable split (e.g. identical vectors or a few
        // far outliers): halve at random under a plane both sides tie on
        let mut shuffled = items;
        shuffled.shuffle(&mut self.rng);
        let right = shuffled.split_off(shuffled.len() / 2);
        let normal = vec![0.0; self.dimension];
        self.grow_split(normal, 0.0, shuffled, right)
    }

    fn grow_split(&mut self, normal: Vec<f64>, offset: f64, left: Vec<usize>, right: Vec<usize>) -> usize {
        let left = self.grow(left);
        let right = self.grow(right);
        self.push(Node::Split {
            normal,
            offset,
            left,
            right,
        })
    }

    fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Hyperplane halfway between two centroids, unit normal
    fn hyperplane(&mut self, items: &[usize]) -> (Vec<f64>, f64) {
        let (p, q) = self.two_means(items);
        let mut normal: Vec<f64> = p.iter().zip(q.iter()).map(|(a, b)| a - b).collect();
        let norm = dot(&normal, &normal).sqrt();
        if norm > 0.0 {
            normal.iter_mut().for_each(|v| *v /= norm);
        }
        let midpoint: Vec<f64> = p.iter().zip(q.iter()).map(|(a, b)| (a + b) / 2.0).collect();
        let offset = -dot(&normal, &midpoint);
        (normal, offset)
    }

    fn two_means(&mut self, items: &[usize]) -> (Vec<f64>, Vec<f64>) {
        let n = items.len();
        let i = self.rng.gen_range(0..n);
        let mut j = self.rng.gen_range(0..n - 1);
        if j >= i {
            j += 1;
        }

        let mut p = self.vectors[items[i]].clone();
        let mut q = self.vectors[items[j]].clone();
        let (mut ic, mut jc) = (1.0f64, 1.0f64);

        for _ in 0..TWO_MEANS_ITERATIONS {
            let x = &self.vectors[items[self.rng.gen_range(0..n)]];
            let di = ic * squared_distance(&p, x);
            let dj = jc * squared_distance(&q, x);
            if di < dj {
                for (m, v) in p.iter_mut().zip(x.iter()) {
                    *m = (*m * ic + v) / (ic + 1.0);
                }
                ic += 1.0;
            } else if dj < di {
                for (m, v) in q.iter_mut().zip(x.iter()) {
                    *m = (*m * jc + v) / (jc + 1.0);
                }
                jc += 1.0;
            }
        }
        (p, q)
    }
}

/// Approximate face search backed by an [`AnnoyIndex`].
///
/// Adding after `build` and building twice are both rejected with
/// `IndexAlreadyBuilt`.
#[derive(Debug)]
pub struct AnnoySearch {
    index: Option<AnnoyIndex>,
    tree_count: usize,
    search_budget: Option<usize>,
}

impl AnnoySearch {
    pub fn new(tree_count: usize, search_budget: Option<usize>) -> Self {
        Self {
            index: Some(AnnoyIndex::new(ENCODING_DIM)),
            tree_count,
            search_budget,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        if let Some(index) = self.index.as_mut() {
            index.set_seed(seed);
        }
        self
    }

    pub fn set_search_budget(&mut self, search_budget: Option<usize>) {
        self.search_budget = search_budget;
    }

    fn index(&self) -> Result<&AnnoyIndex> {
        self.index.as_ref().ok_or(FaceError::Disposed("approximate search index"))
    }

    fn index_mut(&mut self) -> Result<&mut AnnoyIndex> {
        self.index.as_mut().ok_or(FaceError::Disposed("approximate search index"))
    }
}

impl Search for AnnoySearch {
    fn add(&mut self, label: i32, encoding: &FaceEncoding) -> Result<()> {
        if encoding.len() != ENCODING_DIM {
            return Err(FaceError::InvalidEncodingLength(encoding.len()));
        }
        self.index_mut()?.add_item(label, encoding.values())
    }

    fn build(&mut self) -> Result<()> {
        let tree_count = self.tree_count;
        self.index_mut()?.build(tree_count)
    }

    fn query(&self, encoding: &FaceEncoding, k: usize) -> Result<Vec<Neighbor>> {
        let index = self.index()?;
        if encoding.len() != ENCODING_DIM {
            return Err(FaceError::InvalidEncodingLength(encoding.len()));
        }
        let (labels, distances) = index.get_nns_by_vector(encoding.values(), k, self.search_budget)?;
        Ok(labels
            .into_iter()
            .zip(distances)
            .map(|(label, distance)| Neighbor { label, distance })
            .collect())
    }

    fn dispose(&mut self) {
        self.index = None;
    }

    fn is_built(&self) -> bool {
        self.index.as_ref().is_some_and(AnnoyIndex::is_built)
    }

    fn len(&self) -> usize {
        self.index.as_ref().map_or(0, AnnoyIndex::item_count)
    }
}
