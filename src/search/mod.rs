//! Face encoding search

pub mod annoy;
pub mod knn;
pub mod traits;

use serde::Deserialize;

pub use annoy::{AnnoyIndex, AnnoySearch};
pub use knn::KnnSearch;
pub use traits::{Neighbor, Search};

use crate::config::SearchConfig;
use crate::encoding::ENCODING_DIM;

/// Two trees per encoding dimension
pub const DEFAULT_TREE_COUNT: usize = 2 * ENCODING_DIM;

/// Index strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    /// Linear scan, always correct
    #[default]
    Exact,
    /// Random projection forest, sub-linear queries
    Approximate,
}

/// Create the index selected by `config`
pub fn create_search(config: &SearchConfig) -> Box<dyn Search> {
    match config.kind {
        SearchKind::Exact => Box::new(KnnSearch::new()),
        SearchKind::Approximate => Box::new(AnnoySearch::new(config.tree_count, config.search_budget)),
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::encoding::FaceEncoding;

    #[test]
    fn test_create_search() {
        let mut config = SearchConfig::default();
        let exact = create_search(&config);
        assert!(!exact.is_built());

        config.kind = SearchKind::Approximate;
        let approximate = create_search(&config);
        assert!(approximate.is_empty());
    }

    fn random_encodings(count: usize, seed: u64) -> Vec<FaceEncoding> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let values: Vec<f64> = (0..ENCODING_DIM).map(|_| rng.gen_range(-0.5..0.5)).collect();
                FaceEncoding::from_slice(&values).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_built_index_answers_queries_from_many_threads() {
        let encodings = random_encodings(300, 21);
        for kind in [SearchKind::Exact, SearchKind::Approximate] {
            let config = SearchConfig {
                kind,
                tree_count: 8,
                ..SearchConfig::default()
            };
            let mut search = create_search(&config);
            for (label, encoding) in encodings.iter().enumerate() {
                search.add(label as i32, encoding).unwrap();
            }
            search.build().unwrap();

            let expected: Vec<Vec<Neighbor>> = encodings.iter().map(|e| search.query(e, 3).unwrap()).collect();
            let search = &*search;
            let queries = &encodings;
            std::thread::scope(|scope| {
                let workers: Vec<_> = (0..4)
                    .map(|_| {
                        scope.spawn(move || queries.iter().map(|e| search.query(e, 3).unwrap()).collect::<Vec<_>>())
                    })
                    .collect();
                for worker in workers {
                    assert_eq!(worker.join().unwrap(), expected, "{:?}", kind);
                }
            });
        }
    }
}
