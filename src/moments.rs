//! Incremental statistics accumulators.
//!
//! Every accumulator folds one vector of length `vect_size` at a time and keeps O(vect_size)
//! state. All except [quantile::Quantile] can merge a partial accumulator built over a disjoint
//! set of samples.

pub mod covariance;
pub mod higher;
pub mod mean;
pub mod min_max;
pub mod quantile;
pub mod threshold;
pub mod variance;

use std::io::{Read, Write};

use ndarray::{Array1, ArrayView1};

use crate::checkpoint::Persist;

pub use covariance::Covariance;
pub use higher::HigherMoments;
pub use mean::Mean;
pub use min_max::MinMax;
pub use quantile::Quantile;
pub use threshold::ThresholdExceedance;
pub use variance::Variance;

/// Panics unless `x` has the accumulator's length.
#[inline]
pub(crate) fn check_len(expected: usize, x: &[f64]) {
    assert_eq!(
        expected,
        x.len(),
        "vector length does not match accumulator vect_size"
    );
}

#[inline]
pub(crate) fn check_merge(expected: usize, actual: usize) {
    assert_eq!(
        expected, actual,
        "cannot merge accumulators with different vect_size"
    );
}

/// The moment accumulator for one timestep.
///
/// Only the richest accumulator needed by the enabled operations is kept, since each one embeds
/// the lower orders.
#[derive(Clone, Debug, PartialEq)]
pub enum Moments {
    Mean(Mean),
    Variance(Variance),
    Higher(HigherMoments),
}

impl Moments {
    /// Chooses the accumulator needed for the requested statistics, or `None` if no moment is
    /// requested.
    pub fn for_order(vect_size: usize, order: u8) -> Option<Self> {
        match order {
            0 => None,
            1 => Some(Moments::Mean(Mean::new(vect_size))),
            2 => Some(Moments::Variance(Variance::new(vect_size))),
            _ => Some(Moments::Higher(HigherMoments::new(vect_size))),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            Moments::Mean(m) => m.count(),
            Moments::Variance(v) => v.count(),
            Moments::Higher(h) => h.count(),
        }
    }

    pub fn increment(&mut self, x: &[f64]) {
        match self {
            Moments::Mean(m) => m.increment(x),
            Moments::Variance(v) => v.increment(x),
            Moments::Higher(h) => h.increment(x),
        }
    }

    /// Merges another set of moments of the same kind.
    ///
    /// Panics if the kinds differ.
    pub fn merge(&mut self, other: &Moments) {
        match (self, other) {
            (Moments::Mean(a), Moments::Mean(b)) => a.merge(b),
            (Moments::Variance(a), Moments::Variance(b)) => a.merge(b),
            (Moments::Higher(a), Moments::Higher(b)) => a.merge(b),
            _ => panic!("cannot merge moments of different orders"),
        }
    }

    pub fn mean(&self) -> ArrayView1<f64> {
        match self {
            Moments::Mean(m) => m.values(),
            Moments::Variance(v) => v.mean().values(),
            Moments::Higher(h) => h.variance().mean().values(),
        }
    }

    /// Sample variance, if tracked.
    pub fn variance(&self) -> Option<Array1<f64>> {
        match self {
            Moments::Mean(_) => None,
            Moments::Variance(v) => Some(v.sample()),
            Moments::Higher(h) => Some(h.variance().sample()),
        }
    }

    pub fn skewness(&self) -> Option<Array1<f64>> {
        match self {
            Moments::Higher(h) => Some(h.skewness()),
            _ => None,
        }
    }

    pub fn kurtosis(&self) -> Option<Array1<f64>> {
        match self {
            Moments::Higher(h) => Some(h.kurtosis()),
            _ => None,
        }
    }
}

impl Persist for Moments {
    fn save(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        match self {
            Moments::Mean(m) => m.save(writer),
            Moments::Variance(v) => v.save(writer),
            Moments::Higher(h) => h.save(writer),
        }
    }

    fn restore(&mut self, reader: &mut dyn Read) -> std::io::Result<()> {
        match self {
            Moments::Mean(m) => m.restore(reader),
            Moments::Variance(v) => v.restore(reader),
            Moments::Higher(h) => h.restore(reader),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_order_picks_richest() {
        assert!(Moments::for_order(2, 0).is_none());
        assert!(matches!(Moments::for_order(2, 1), Some(Moments::Mean(_))));
        assert!(matches!(
            Moments::for_order(2, 2),
            Some(Moments::Variance(_))
        ));
        assert!(matches!(Moments::for_order(2, 4), Some(Moments::Higher(_))));
    }

    #[test]
    fn derived_statistics_follow_order() {
        let mut moments = Moments::for_order(1, 2).unwrap();
        moments.increment(&[1.0]);
        moments.increment(&[3.0]);
        assert_eq!(2.0, moments.mean()[0]);
        assert_eq!(Some(2.0), moments.variance().map(|v| v[0]));
        assert!(moments.skewness().is_none());
    }

    #[test]
    #[should_panic(expected = "different orders")]
    fn merge_different_orders_panics() {
        let mut mean = Moments::for_order(1, 1).unwrap();
        mean.merge(&Moments::for_order(1, 2).unwrap());
    }
}
