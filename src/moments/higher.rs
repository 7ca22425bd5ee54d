//! Third and fourth central moments (skewness and kurtosis).
//!
//! Uses Pébay's single-pass update and pairwise combination formulas, which extend Welford's
//! recurrence to M3 and M4.

use std::io::{Read, Write};

use ndarray::{Array1, ArrayView1, Zip};

use crate::checkpoint::{read_array_into, write_array, Persist};
use crate::moments::variance::Variance;
use crate::moments::{check_len, check_merge};

#[derive(Clone, Debug, PartialEq)]
pub struct HigherMoments {
    pub(crate) variance: Variance,
    pub(crate) m3: Array1<f64>,
    pub(crate) m4: Array1<f64>,
}

impl HigherMoments {
    pub fn new(vect_size: usize) -> Self {
        Self {
            variance: Variance::new(vect_size),
            m3: Array1::zeros(vect_size),
            m4: Array1::zeros(vect_size),
        }
    }

    pub fn vect_size(&self) -> usize {
        self.variance.vect_size()
    }

    pub fn count(&self) -> u64 {
        self.variance.count()
    }

    pub fn variance(&self) -> &Variance {
        &self.variance
    }

    /// Sample skewness `sqrt(n) M3 / M2^1.5`. Elements with zero spread report 0.
    pub fn skewness(&self) -> Array1<f64> {
        let n = self.count() as f64;
        Zip::from(&self.variance.m2)
            .and(&self.m3)
            .map_collect(|&m2, &m3| {
                if m2 > 0.0 {
                    n.sqrt() * m3 / m2.powf(1.5)
                } else {
                    0.0
                }
            })
    }

    /// Excess kurtosis `n M4 / M2^2 - 3`. Elements with zero spread report 0.
    pub fn kurtosis(&self) -> Array1<f64> {
        let n = self.count() as f64;
        Zip::from(&self.variance.m2)
            .and(&self.m4)
            .map_collect(|&m2, &m4| {
                if m2 > 0.0 {
                    n * m4 / (m2 * m2) - 3.0
                } else {
                    0.0
                }
            })
    }

    /// Folds one vector into mean, M2, M3 and M4.
    ///
    /// Panics if `x.len() != self.vect_size()`.
    pub fn increment(&mut self, x: &[f64]) {
        check_len(self.vect_size(), x);
        let n1 = self.count() as f64;
        self.variance.mean.increment += 1;
        let n = n1 + 1.0;
        Zip::from(&mut self.variance.mean.mean)
            .and(&mut self.variance.m2)
            .and(&mut self.m3)
            .and(&mut self.m4)
            .and(&ArrayView1::from(x))
            .for_each(|mean, m2, m3, m4, &x| {
                let delta = x - *mean;
                let delta_n = delta / n;
                let delta_n2 = delta_n * delta_n;
                let term1 = delta * delta_n * n1;
                *mean += delta_n;
                // M4 and M3 use the previous M2 and M3, so update from highest order down.
                *m4 += term1 * delta_n2 * (n * n - 3.0 * n + 3.0) + 6.0 * delta_n2 * *m2
                    - 4.0 * delta_n * *m3;
                *m3 += term1 * delta_n * (n - 2.0) - 3.0 * delta_n * *m2;
                *m2 += term1;
            });
    }

    /// Merges partial moments accumulated over a disjoint set of samples.
    pub fn merge(&mut self, other: &HigherMoments) {
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
        for i in 0..self.vect_size() {
            let ma = self.variance.mean.mean[i];
            let m2a = self.variance.m2[i];
            let m3a = self.m3[i];
            let m2b = other.variance.m2[i];
            let m3b = other.m3[i];
            let delta = other.variance.mean.mean[i] - ma;
            let delta2 = delta * delta;

            self.m4[i] += other.m4[i]
                + delta2 * delta2 * na * nb * (na * na - na * nb + nb * nb) / (n * n * n)
                + 6.0 * delta2 * (na * na * m2b + nb * nb * m2a) / (n * n)
                + 4.0 * delta * (na * m3b - nb * m3a) / n;
            self.m3[i] += m3b
                + delta2 * delta * na * nb * (na - nb) / (n * n)
                + 3.0 * delta * (na * m2b - nb * m2a) / n;
            self.variance.m2[i] += m2b + delta2 * na * nb / n;
            self.variance.mean.mean[i] = ma + delta * nb / n;
        }
        self.variance.mean.increment += other.count();
    }
}

impl Persist for HigherMoments {
    fn save(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        self.variance.save(writer)?;
        write_array(writer, &self.m3)?;
        write_array(writer, &self.m4)
    }

    fn restore(&mut self, reader: &mut dyn Read) -> std::io::Result<()> {
        self.variance.restore(reader)?;
        read_array_into(reader, &mut self.m3)?;
        read_array_into(reader, &mut self.m4)
    }
}
