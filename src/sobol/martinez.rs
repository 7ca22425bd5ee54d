//! Martinez (2011) correlation estimators for Sobol' indices.
//!
//! * first order: `S_k = corr(B, C_k)`
//! * total order: `ST_k = 1 - corr(A, C_k)`
//!
//! Confidence intervals use the Fisher transform of the correlation coefficient.

use std::io::{Read, Write};

use ndarray::{Array1, ArrayView1, Zip};

use crate::checkpoint::{read_array_into, read_u64, write_array, write_u64, Persist};
use crate::moments::{Covariance, Variance};
use crate::sobol::{ConfidenceInterval, SobolEstimator, MIN_CONFIDENCE_ITERATIONS};

/// Keeps the Fisher transform finite for perfectly correlated samples.
const RHO_EPSILON: f64 = 1e-9;

/// Normal quantile for a two-sided 95% interval.
const Z_95: f64 = 1.96;

/// Running estimators for a single parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct SobolMartinez {
    /// Pairs (B, C_k).
    first_order_covariance: Covariance,
    /// Pairs (A, C_k).
    total_order_covariance: Covariance,
    variance_k: Variance,
    first_order: Array1<f64>,
    total_order: Array1<f64>,
    confidence: ConfidenceInterval,
}

impl SobolMartinez {
    fn new(vect_size: usize) -> Self {
        Self {
            first_order_covariance: Covariance::new(vect_size),
            total_order_covariance: Covariance::new(vect_size),
            variance_k: Variance::new(vect_size),
            first_order: Array1::zeros(vect_size),
            total_order: Array1::zeros(vect_size),
            confidence: ConfidenceInterval::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Martinez {
    variance_a: Variance,
    variance_b: Variance,
    parameters: Vec<SobolMartinez>,
    iteration: u64,
}

impl Martinez {
    pub fn new(vect_size: usize, nb_parameters: usize) -> Self {
        Self {
            variance_a: Variance::new(vect_size),
            variance_b: Variance::new(vect_size),
            parameters: (0..nb_parameters)
                .map(|_| SobolMartinez::new(vect_size))
                .collect(),
            iteration: 0,
        }
    }

    pub fn variance_a(&self) -> &Variance {
        &self.variance_a
    }

    pub fn variance_b(&self) -> &Variance {
        &self.variance_b
    }

    fn update_indices(&mut self) {
        let var_a = self.variance_a.sample();
        let var_b = self.variance_b.sample();
        for parameter in &mut self.parameters {
            let var_k = parameter.variance_k.sample();
            let cov_b = parameter.first_order_covariance.covariance();
            let cov_a = parameter.total_order_covariance.covariance();
            Zip::from(&mut parameter.first_order)
                .and(&cov_b)
                .and(&var_b)
                .and(&var_k)
                .for_each(|s, &cov, &vb, &vk| *s = correlation(cov, vb, vk));
            Zip::from(&mut parameter.total_order)
                .and(&cov_a)
                .and(&var_a)
                .and(&var_k)
                .for_each(|st, &cov, &va, &vk| *st = 1.0 - correlation(cov, va, vk));
        }
    }
}

/// `cov / sqrt(var_x var_y)`, or 0 when either variance vanishes.
fn correlation(covariance: f64, var_x: f64, var_y: f64) -> f64 {
    let denominator = (var_x * var_y).sqrt();
    if denominator > 0.0 {
        covariance / denominator
    } else {
        0.0
    }
}

/// Width of the 95% interval of a correlation coefficient estimated from `n` samples.
fn interval_width(rho: f64, n: u64) -> f64 {
    let rho = rho.clamp(-1.0 + RHO_EPSILON, 1.0 - RHO_EPSILON);
    let z = rho.atanh();
    let h = Z_95 / ((n - 3) as f64).sqrt();
    (z + h).tanh() - (z - h).tanh()
}

fn max_width(rho: ArrayView1<f64>, n: u64) -> f64 {
    rho.iter()
        .map(|&rho| interval_width(rho, n))
        .fold(0.0, f64::max)
}

impl SobolEstimator for Martinez {
    fn nb_parameters(&self) -> usize {
        self.parameters.len()
    }

    fn vect_size(&self) -> usize {
        self.variance_a.vect_size()
    }

    fn iteration(&self) -> u64 {
        self.iteration
    }

    fn increment(&mut self, vectors: &[&[f64]]) {
        assert_eq!(
            self.parameters.len() + 2,
            vectors.len(),
            "a design point needs nb_parameters + 2 vectors"
        );
        let (a, b) = (vectors[0], vectors[1]);
        self.variance_a.increment(a);
        self.variance_b.increment(b);
        for (parameter, c) in self.parameters.iter_mut().zip(&vectors[2..]) {
            parameter.first_order_covariance.increment(b, c);
            parameter.total_order_covariance.increment(a, c);
            parameter.variance_k.increment(c);
        }
        self.iteration += 1;
        self.update_indices();
    }

    fn update_confidence(&mut self) {
        if self.iteration < MIN_CONFIDENCE_ITERATIONS {
            return;
        }
        let n = self.iteration;
        for parameter in &mut self.parameters {
            let total_rho = parameter.total_order.mapv(|st| 1.0 - st);
            parameter.confidence = ConfidenceInterval {
                first_order: max_width(parameter.first_order.view(), n),
                total_order: max_width(total_rho.view(), n),
            };
        }
    }

    fn first_order(&self, parameter: usize) -> ArrayView1<f64> {
        self.parameters[parameter].first_order.view()
    }

    fn total_order(&self, parameter: usize) -> ArrayView1<f64> {
        self.parameters[parameter].total_order.view()
    }

    fn confidence(&self, parameter: usize) -> ConfidenceInterval {
        self.parameters[parameter].confidence
    }
}

impl Persist for Martinez {
    fn save(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        write_u64(writer, self.iteration)?;
        self.variance_a.save(writer)?;
        self.variance_b.save(writer)?;
        for parameter in &self.parameters {
            parameter.first_order_covariance.save(writer)?;
            parameter.total_order_covariance.save(writer)?;
            parameter.variance_k.save(writer)?;
            write_array(writer, &parameter.first_order)?;
            write_array(writer, &parameter.total_order)?;
            write_u64(writer, parameter.confidence.first_order.to_bits())?;
            write_u64(writer, parameter.confidence.total_order.to_bits())?;
        }
        Ok(())
    }

    fn restore(&mut self, reader: &mut dyn Read) -> std::io::Result<()> {
        self.iteration = read_u64(reader)?;
        self.variance_a.restore(reader)?;
        self.variance_b.restore(reader)?;
        for parameter in &mut self.parameters {
            parameter.first_order_covariance.restore(reader)?;
            parameter.total_order_covariance.restore(reader)?;
            parameter.variance_k.restore(reader)?;
            read_array_into(reader, &mut parameter.first_order)?;
            read_array_into(reader, &mut parameter.total_order)?;
            parameter.confidence.first_order = f64::from_bits(read_u64(reader)?);
            parameter.confidence.total_order = f64::from_bits(read_u64(reader)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Lcg;

    /// Feeds `n` design points of a model over two uniform parameters.
    fn run(n: usize, model: impl Fn(f64, f64) -> [f64; 2]) -> Martinez {
        let mut rng = Lcg::new(42);
        let mut estimator = Martinez::new(2, 2);
        for _ in 0..n {
            let a = [rng.next_f64(), rng.next_f64()];
            let b = [rng.next_f64(), rng.next_f64()];
            let c1 = [b[0], a[1]];
            let c2 = [a[0], b[1]];
            let runs = [a, b, c1, c2].map(|p| model(p[0], p[1]));
            let vectors: Vec<&[f64]> = runs.iter().map(|r| &r[..]).collect();
            estimator.increment(&vectors);
        }
        estimator.update_confidence();
        estimator
    }

    #[test]
    fn confidence_defined_after_ten_points() {
        let estimator = run(10, |x1, x2| [x1 + 0.1 * x2, x1 * x2]);
        assert_eq!(10, estimator.iteration());
        for k in 0..2 {
            let interval = estimator.confidence(k);
            assert!(interval.first_order.is_finite() && interval.first_order >= 0.0);
            assert!(interval.total_order.is_finite() && interval.total_order >= 0.0);
        }
    }

    #[test]
    fn no_confidence_before_four_points() {
        let estimator = run(3, |x1, x2| [x1, x2]);
        assert_eq!(ConfidenceInterval::default(), estimator.confidence(0));
        assert!(!estimator.is_converged(1.0, 2));
    }

    #[test]
    fn single_influential_parameter() {
        let estimator = run(2000, |x1, _| [x1, 2.0 * x1 + 3.0]);
        for i in 0..2 {
            assert!((estimator.first_order(0)[i] - 1.0).abs() < 1e-9);
            assert!(estimator.total_order(1)[i].abs() < 1e-9);
            assert!(estimator.first_order(1)[i].abs() < 0.1);
            assert!((estimator.total_order(0)[i] - 1.0).abs() < 0.1);
        }
        assert!(estimator.is_converged(0.1, 2));
        assert!(!estimator.is_converged(0.05, 1));
    }

    #[test]
    fn constant_output_has_zero_indices() {
        let estimator = run(6, |_, _| [1.0, 1.0]);
        assert_eq!(0.0, estimator.first_order(0)[0]);
        assert_eq!(1.0, estimator.total_order(0)[0]);
    }

    #[test]
    fn restore_is_bit_identical() {
        let estimator = run(12, |x1, x2| [x1 - x2, x1 * x1]);
        let mut buffer = Vec::new();
        estimator.save(&mut buffer).unwrap();
        let mut restored = Martinez::new(2, 2);
        restored
            .restore(&mut crate::checkpoint::reader(&buffer))
            .unwrap();
        assert_eq!(estimator, restored);
    }

    #[test]
    #[should_panic(expected = "nb_parameters + 2")]
    fn wrong_vector_count_panics() {
        let mut estimator = Martinez::new(1, 2);
        estimator.increment(&[&[1.0], &[2.0]]);
    }
}
