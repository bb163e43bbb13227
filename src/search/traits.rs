//! Nearest neighbour search abstraction
//!
//! An index moves through `add* -> build -> query*`. Implementations differ
//! in what they allow after `build` and in how exact their answers are.

use serde::{Deserialize, Serialize};

use crate::encoding::FaceEncoding;
use crate::error::Result;

/// A labelled hit returned by a query
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Caller supplied label passed to `add`
    pub label: i32,
    /// Euclidean distance to the query
    pub distance: f64,
}

/// Face encoding search index
///
/// A built index only needs `&self` to answer queries, so it can be shared
/// across threads for reads. Mutation requires exclusive access.
pub trait Search: Send + Sync {
    /// Store an encoding under `label`
    fn add(&mut self, label: i32, encoding: &FaceEncoding) -> Result<()>;

    /// Finish construction; queries are rejected until this has run
    fn build(&mut self) -> Result<()>;

    /// Up to `k` neighbours sorted by ascending distance
    fn query(&self, encoding: &FaceEncoding, k: usize) -> Result<Vec<Neighbor>>;

    /// Release the index; every later call fails with `Disposed`
    fn dispose(&mut self);

    fn is_built(&self) -> bool;

    /// Number of stored entries
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
