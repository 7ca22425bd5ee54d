//! Running variance (Welford).

use std::io::{Read, Write};

use ndarray::{Array1, ArrayView1, Zip};

use crate::checkpoint::{read_array_into, write_array, Persist};
use crate::moments::mean::Mean;
use crate::moments::{check_len, check_merge};

/// Elementwise running variance.
///
/// Stores the sum of squared deviations (M2) and leaves the division to the caller via
/// [Variance::population] or [Variance::sample]. The embedded [Mean] shares the increment
/// counter, so the two can never drift apart.
#[derive(Clone, Debug, PartialEq)]
pub struct Variance {
    pub(crate) mean: Mean,
    pub(crate) m2: Array1<f64>,
}

impl Variance {
    pub fn new(vect_size: usize) -> Self {
        Self {
            mean: Mean::new(vect_size),
            m2: Array1::zeros(vect_size),
        }
    }

    pub fn vect_size(&self) -> usize {
        self.m2.len()
    }

    pub fn count(&self) -> u64 {
        self.mean.count()
    }

    /// The embedded running mean.
    pub fn mean(&self) -> &Mean {
        &self.mean
    }

    /// Sum of squared deviations from the mean.
    pub fn m2(&self) -> ArrayView1<f64> {
        self.m2.view()
    }

    /// M2 / n, or zeros before the first sample.
    pub fn population(&self) -> Array1<f64> {
        self.divided_m2(self.count())
    }

    /// M2 / (n - 1), or zeros before the second sample.
    pub fn sample(&self) -> Array1<f64> {
        self.divided_m2(self.count().saturating_sub(1))
    }

    fn divided_m2(&self, denominator: u64) -> Array1<f64> {
        if denominator == 0 {
            Array1::zeros(self.vect_size())
        } else {
            &self.m2 / denominator as f64
        }
    }

    /// Folds one vector into the mean and M2.
    ///
    /// Panics if `x.len() != self.vect_size()`.
    pub fn increment(&mut self, x: &[f64]) {
        check_len(self.vect_size(), x);
        self.mean.increment += 1;
        let n = self.mean.increment as f64;
        Zip::from(&mut self.mean.mean)
            .and(&mut self.m2)
            .and(&ArrayView1::from(x))
            .for_each(|mean, m2, &x| {
                let delta = x - *mean;
                *mean += delta / n;
                *m2 += delta * (x - *mean);
            });
    }

    /// Merges a partial variance using Chan's pairwise combination.
    pub fn merge(&mut self, other: &Variance) {
        check_merge(self.vect_size(), other.vect_size());
        if other.count() == 0 {
            return;
        }
        if self.count() == 0 {
            self.clone_from(other);
            return;
        }
        let na = self.count() as f64;
        let nb = other.count() as f64;
        let n = na + nb;
        Zip::from(&mut self.mean.mean)
            .and(&mut self.m2)
            .and(&other.mean.mean)
            .and(&other.m2)
            .for_each(|ma, m2a, &mb, &m2b| {
                let delta = mb - *ma;
                *ma += delta * nb / n;
                *m2a += m2b + delta * delta * na * nb / n;
            });
        self.mean.increment += other.count();
    }
}

impl Persist for Variance {
    fn save(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        self.mean.save(writer)?;
        write_array(writer, &self.m2)
    }

    fn restore(&mut self, reader: &mut dyn Read) -> std::io::Result<()> {
        self.mean.restore(reader)?;
        read_array_into(reader, &mut self.m2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Brute-force sum of squared deviations for comparison.
    fn brute_force_m2(samples: &[Vec<f64>]) -> Vec<f64> {
        let n = samples.len() as f64;
        let width = samples[0].len();
        (0..width)
            .map(|i| {
                let mean = samples.iter().map(|s| s[i]).sum::<f64>() / n;
                samples.iter().map(|s| (s[i] - mean).powi(2)).sum()
            })
            .collect()
    }

    fn assert_close(expected: &[f64], actual: ArrayView1<f64>) {
        assert_eq!(expected.len(), actual.len());
        for (e, a) in expected.iter().zip(actual) {
            assert!((e - a).abs() < 1e-9, "expected {e}, got {a}");
        }
    }

    #[test]
    fn three_vectors_match_brute_force() {
        let samples = vec![vec![1.0, 2.0, 3.0], vec![3.0, 2.0, 1.0], vec![5.0, 5.0, 5.0]];
        let mut variance = Variance::new(3);
        samples.iter().for_each(|x| variance.increment(x));
        assert_close(&[3.0, 3.0, 3.0], variance.mean().values());
        assert_close(&brute_force_m2(&samples), variance.m2());
        assert_close(&[8.0, 6.0, 8.0], variance.m2());
        assert_close(&[4.0, 3.0, 4.0], variance.sample().view());
        assert_eq!(variance.count(), variance.mean().count());
    }

    #[test]
    fn order_independent() {
        let samples = vec![
            vec![0.1, 100.0],
            vec![-2.0, 101.5],
            vec![3.3, 99.25],
            vec![7.0, 100.0],
            vec![1.5, 98.0],
        ];
        let mut forward = Variance::new(2);
        samples.iter().for_each(|x| forward.increment(x));
        let mut backward = Variance::new(2);
        samples.iter().rev().for_each(|x| backward.increment(x));
        let mut shuffled = Variance::new(2);
        for i in [3, 0, 4, 2, 1] {
            shuffled.increment(&samples[i]);
        }
        for other in [&backward, &shuffled] {
            assert_close(forward.mean().values().as_slice().unwrap(), other.mean().values());
            assert_close(forward.m2().as_slice().unwrap(), other.m2());
        }
    }

    #[test]
    fn merge_matches_sequential() {
        let samples = vec![
            vec![1.0, -1.0],
            vec![4.0, 2.0],
            vec![9.0, 0.0],
            vec![16.0, 3.5],
            vec![25.0, -7.0],
            vec![36.0, 1.0],
        ];
        let mut sequential = Variance::new(2);
        samples.iter().for_each(|x| sequential.increment(x));

        let mut left = Variance::new(2);
        let mut right = Variance::new(2);
        samples[..4].iter().for_each(|x| left.increment(x));
        samples[4..].iter().for_each(|x| right.increment(x));
        left.merge(&right);

        assert_eq!(sequential.count(), left.count());
        assert_eq!(left.count(), left.mean().count());
        assert_close(sequential.mean().values().as_slice().unwrap(), left.mean().values());
        assert_close(sequential.m2().as_slice().unwrap(), left.m2());
    }

    #[test]
    fn empty_variance_is_zero() {
        let variance = Variance::new(2);
        assert_eq!(Array1::<f64>::zeros(2), variance.population());
        assert_eq!(Array1::<f64>::zeros(2), variance.sample());
    }
}
