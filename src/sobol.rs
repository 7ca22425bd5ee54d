//! Sobol' sensitivity index estimation.
//!
//! Each design point contributes `nb_parameters + 2` correlated vectors: the base run `A`, the
//! resampled run `B`, and one run `C_k` per parameter where parameter `k` is taken from `B` and
//! the others from `A`.

pub mod martinez;

use crate::checkpoint::Persist;
use crate::options::SobolMethod;

use std::io::{Read, Write};

use ndarray::ArrayView1;
use serde::Serialize;

pub use martinez::Martinez;

/// Minimum number of design points before a confidence interval is defined.
pub const MIN_CONFIDENCE_ITERATIONS: u64 = 4;

/// Widths of the 95% confidence intervals of one parameter, taken as the maximum over elements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ConfidenceInterval {
    pub first_order: f64,
    pub total_order: f64,
}

/// An incremental estimator of first and total order Sobol' indices.
pub trait SobolEstimator: Persist {
    fn nb_parameters(&self) -> usize;

    fn vect_size(&self) -> usize;

    /// Number of design points folded in.
    fn iteration(&self) -> u64;

    /// Folds one design point `[A, B, C_1, ..., C_p]`.
    ///
    /// Panics if the number or length of the vectors is wrong.
    fn increment(&mut self, vectors: &[&[f64]]);

    /// Recomputes the confidence intervals. Does nothing before
    /// [MIN_CONFIDENCE_ITERATIONS] design points.
    fn update_confidence(&mut self);

    fn first_order(&self, parameter: usize) -> ArrayView1<f64>;

    fn total_order(&self, parameter: usize) -> ArrayView1<f64>;

    fn confidence(&self, parameter: usize) -> ConfidenceInterval;

    /// Whether every tracked interval is narrower than `tolerance`. Total order intervals are
    /// tracked only when `max_order >= 2`.
    fn is_converged(&self, tolerance: f64, max_order: u8) -> bool {
        if self.iteration() < MIN_CONFIDENCE_ITERATIONS {
            return false;
        }
        (0..self.nb_parameters()).all(|k| {
            let interval = self.confidence(k);
            interval.first_order < tolerance && (max_order < 2 || interval.total_order < tolerance)
        })
    }
}

/// The configured estimator.
#[derive(Clone, Debug, PartialEq)]
pub enum Sobol {
    Martinez(Martinez),
}

impl Sobol {
    pub fn new(method: SobolMethod, vect_size: usize, nb_parameters: usize) -> Self {
        match method {
            SobolMethod::Martinez => Sobol::Martinez(Martinez::new(vect_size, nb_parameters)),
        }
    }

    pub fn estimator(&self) -> &dyn SobolEstimator {
        match self {
            Sobol::Martinez(m) => m,
        }
    }

    pub fn estimator_mut(&mut self) -> &mut dyn SobolEstimator {
        match self {
            Sobol::Martinez(m) => m,
        }
    }
}

impl Persist for Sobol {
    fn save(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        self.estimator().save(writer)
    }

    fn restore(&mut self, reader: &mut dyn Read) -> std::io::Result<()> {
        self.estimator_mut().restore(reader)
    }
}
