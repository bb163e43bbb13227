//! Exact nearest neighbour search by linear scan

use std::collections::HashMap;

use super::traits::{Neighbor, Search};
use crate::encoding::FaceEncoding;
use crate::error::{FaceError, Result};
use crate::matcher::face_distance;

/// Brute-force index over every stored encoding.
///
/// Re-adding a label replaces its encoding but keeps its original position,
/// so ties are broken by first insertion. Adding after `build` is allowed;
/// the scan always sees every entry.
#[derive(Debug, Default)]
pub struct KnnSearch {
    entries: Vec<(i32, FaceEncoding)>,
    positions: HashMap<i32, usize>,
    built: bool,
    disposed: bool,
}

impl KnnSearch {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed {
            return Err(FaceError::Disposed("exact search index"));
        }
        Ok(())
    }

    fn nearest(&self, encoding: &FaceEncoding) -> Option<Neighbor> {
        let mut best: Option<Neighbor> = None;
        let mut min = f64::MAX;
        for (label, stored) in &self.entries {
            let distance = face_distance(encoding, stored);
            if !(distance < min) {
                continue;
            }
            min = distance;
            best = Some(Neighbor { label: *label, distance });
        }
        best
    }
}

impl Search for KnnSearch {
    fn add(&mut self, label: i32, encoding: &FaceEncoding) -> Result<()> {
        self.check_disposed()?;
        match self.positions.get(&label) {
            Some(&position) => self.entries[position].1 = encoding.clone(),
            None => {
                self.positions.insert(label, self.entries.len());
                self.entries.push((label, encoding.clone()));
            }
        }
        Ok(())
    }

    fn build(&mut self) -> Result<()> {
        self.check_disposed()?;
        self.built = true;
        Ok(())
    }

    fn query(&self, encoding: &FaceEncoding, k: usize) -> Result<Vec<Neighbor>> {
        self.check_disposed()?;
        if !self.built {
            return Err(FaceError::IndexNotBuilt);
        }

        match k {
            0 => Ok(Vec::new()),
            1 => Ok(self.nearest(encoding).into_iter().collect()),
            _ => {
                let mut results: Vec<Neighbor> = self
                    .entries
                    .iter()
                    .map(|(label, stored)| Neighbor {
                        label: *label,
                        distance: face_distance(stored, encoding),
                    })
                    .collect();
                // Stable, so equal distances keep insertion order
                results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
                results.truncate(k);
                Ok(results)
            }
        }
    }

    fn dispose(&mut self) {
        self.entries.clear();
        self.positions.clear();
        self.disposed = true;
    }

    fn is_built(&self) -> bool {
        self.built && !self.disposed
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
