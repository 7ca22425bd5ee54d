//! Running mean.

use std::io::{Read, Write};

use ndarray::{Array1, ArrayView1, Zip};

use crate::checkpoint::{read_array_into, read_u64, write_array, write_u64, Persist};
use crate::moments::{check_len, check_merge};

/// Elementwise running mean of a stream of vectors.
#[derive(Clone, Debug, PartialEq)]
pub struct Mean {
    pub(crate) mean: Array1<f64>,
    pub(crate) increment: u64,
}

impl Mean {
    /// Returns an empty accumulator for vectors of length `vect_size`.
    pub fn new(vect_size: usize) -> Self {
        Self {
            mean: Array1::zeros(vect_size),
            increment: 0,
        }
    }

    pub fn vect_size(&self) -> usize {
        self.mean.len()
    }

    /// Number of vectors folded in.
    pub fn count(&self) -> u64 {
        self.increment
    }

    /// Current mean.
    pub fn values(&self) -> ArrayView1<f64> {
        self.mean.view()
    }

    /// Folds one vector into the mean.
    ///
    /// Panics if `x.len() != self.vect_size()`.
    pub fn increment(&mut self, x: &[f64]) {
        check_len(self.vect_size(), x);
        self.increment += 1;
        let n = self.increment as f64;
        Zip::from(&mut self.mean)
            .and(&ArrayView1::from(x))
            .for_each(|mean, &x| *mean += (x - *mean) / n);
    }

    /// Merges a partial mean accumulated independently over a disjoint set of samples.
    pub fn merge(&mut self, other: &Mean) {
        check_merge(self.vect_size(), other.vect_size());
        if other.increment == 0 {
            return;
        }
        if self.increment == 0 {
            self.clone_from(other);
            return;
        }
        let na = self.increment as f64;
        let nb = other.increment as f64;
        let n = na + nb;
        Zip::from(&mut self.mean)
            .and(&other.mean)
            .for_each(|ma, &mb| *ma += (mb - *ma) * nb / n);
        self.increment += other.increment;
    }
}

impl Persist for Mean {
    fn save(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        write_u64(writer, self.increment)?;
        write_array(writer, &self.mean)
    }

    fn restore(&mut self, reader: &mut dyn Read) -> std::io::Result<()> {
        self.increment = read_u64(reader)?;
        read_array_into(reader, &mut self.mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_three_vectors() {
        let mut mean = Mean::new(3);
        mean.increment(&[1.0, 2.0, 3.0]);
        mean.increment(&[3.0, 2.0, 1.0]);
        mean.increment(&[5.0, 5.0, 5.0]);
        assert_eq!(3, mean.count());
        assert_eq!(ArrayView1::from(&[3.0, 3.0, 3.0]), mean.values());
    }

    #[test]
    #[should_panic(expected = "vect_size")]
    fn mean_length_mismatch_panics() {
        let mut mean = Mean::new(3);
        mean.increment(&[1.0, 2.0]);
    }

    #[test]
    fn merge_matches_sequential() {
        let samples = [[1.0, -4.0], [2.5, 8.0], [7.0, 0.5], [-3.0, 2.0], [0.25, 1.0]];
        let mut sequential = Mean::new(2);
        samples.iter().for_each(|x| sequential.increment(x));

        let mut left = Mean::new(2);
        let mut right = Mean::new(2);
        samples[..2].iter().for_each(|x| left.increment(x));
        samples[2..].iter().for_each(|x| right.increment(x));
        left.merge(&right);

        assert_eq!(sequential.count(), left.count());
        for (a, b) in sequential.values().iter().zip(left.values()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn merge_into_empty_copies() {
        let mut filled = Mean::new(1);
        filled.increment(&[4.0]);
        let mut empty = Mean::new(1);
        empty.merge(&filled);
        assert_eq!(filled, empty);
        // Merging an empty accumulator is a no-op.
        filled.merge(&Mean::new(1));
        assert_eq!(1, filled.count());
    }
}
