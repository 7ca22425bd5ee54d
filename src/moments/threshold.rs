//! Threshold exceedance counters.

use std::io::{Read, Write};

use ndarray::{Array1, ArrayView1, Zip};

use crate::checkpoint::{read_array_into, read_u64, write_array, write_u64, Persist};
use crate::moments::{check_len, check_merge};

/// Per-element count of samples strictly greater than a fixed threshold.
#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdExceedance {
    pub(crate) threshold: f64,
    pub(crate) exceedances: Array1<u64>,
    pub(crate) increment: u64,
}

impl ThresholdExceedance {
    pub fn new(vect_size: usize, threshold: f64) -> Self {
        Self {
            threshold,
            exceedances: Array1::zeros(vect_size),
            increment: 0,
        }
    }

    pub fn vect_size(&self) -> usize {
        self.exceedances.len()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn count(&self) -> u64 {
        self.increment
    }

    pub fn exceedances(&self) -> ArrayView1<u64> {
        self.exceedances.view()
    }

    /// Fraction of samples above the threshold.
    pub fn probability(&self) -> Array1<f64> {
        if self.increment == 0 {
            return Array1::zeros(self.vect_size());
        }
        let n = self.increment as f64;
        self.exceedances.mapv(|count| count as f64 / n)
    }

    pub fn increment(&mut self, x: &[f64]) {
        check_len(self.vect_size(), x);
        let threshold = self.threshold;
        Zip::from(&mut self.exceedances)
            .and(&ArrayView1::from(x))
            .for_each(|count, &x| {
                if x > threshold {
                    *count += 1;
                }
            });
        self.increment += 1;
    }

    /// Adds counts from another accumulator with the same threshold.
    ///
    /// Panics if the thresholds differ.
    pub fn merge(&mut self, other: &ThresholdExceedance) {
        check_merge(self.vect_size(), other.vect_size());
        assert_eq!(
            self.threshold.to_bits(),
            other.threshold.to_bits(),
            "cannot merge exceedance counters for different thresholds"
        );
        self.exceedances += &other.exceedances;
        self.increment += other.increment;
    }
}

impl Persist for ThresholdExceedance {
    fn save(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        write_u64(writer, self.increment)?;
        write_array(writer, &self.exceedances)
    }

    fn restore(&mut self, reader: &mut dyn Read) -> std::io::Result<()> {
        self.increment = read_u64(reader)?;
        read_array_into(reader, &mut self.exceedances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_strict_exceedances() {
        let mut threshold = ThresholdExceedance::new(3, 2.0);
        threshold.increment(&[1.0, 2.0, 3.0]);
        threshold.increment(&[3.0, 2.0, 1.0]);
        threshold.increment(&[5.0, 5.0, 5.0]);
        assert_eq!(ArrayView1::from(&[2_u64, 1, 2]), threshold.exceedances());
        let probability = threshold.probability();
        assert!((probability[1] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn merge_adds_counts() {
        let mut left = ThresholdExceedance::new(1, 0.0);
        left.increment(&[1.0]);
        let mut right = ThresholdExceedance::new(1, 0.0);
        right.increment(&[-1.0]);
        right.increment(&[2.0]);
        left.merge(&right);
        assert_eq!(3, left.count());
        assert_eq!(2, left.exceedances()[0]);
    }

    #[test]
    #[should_panic(expected = "different thresholds")]
    fn merge_different_thresholds_panics() {
        let mut left = ThresholdExceedance::new(1, 0.0);
        left.merge(&ThresholdExceedance::new(1, 1.0));
    }
}
