//! Running elementwise covariance between two paired streams.

use std::io::{Read, Write};

use ndarray::{Array1, ArrayView1, Zip};

use crate::checkpoint::{read_array_into, write_array, Persist};
use crate::moments::mean::Mean;
use crate::moments::{check_len, check_merge};

/// Co-moment accumulator for pairs of vectors `(x, y)`.
///
/// Both means share the same increment count.
#[derive(Clone, Debug, PartialEq)]
pub struct Covariance {
    pub(crate) mean_x: Mean,
    pub(crate) mean_y: Mean,
    pub(crate) comoment: Array1<f64>,
}

impl Covariance {
    pub fn new(vect_size: usize) -> Self {
        Self {
            mean_x: Mean::new(vect_size),
            mean_y: Mean::new(vect_size),
            comoment: Array1::zeros(vect_size),
        }
    }

    pub fn vect_size(&self) -> usize {
        self.comoment.len()
    }

    pub fn count(&self) -> u64 {
        self.mean_x.count()
    }

    pub fn mean_x(&self) -> &Mean {
        &self.mean_x
    }

    pub fn mean_y(&self) -> &Mean {
        &self.mean_y
    }

    pub fn comoment(&self) -> ArrayView1<f64> {
        self.comoment.view()
    }

    /// Sample covariance `C / (n - 1)`, zeros before the second pair.
    pub fn covariance(&self) -> Array1<f64> {
        match self.count() {
            0 | 1 => Array1::zeros(self.vect_size()),
            n => &self.comoment / (n - 1) as f64,
        }
    }

    pub fn increment(&mut self, x: &[f64], y: &[f64]) {
        check_len(self.vect_size(), x);
        check_len(self.vect_size(), y);
        self.mean_x.increment += 1;
        self.mean_y.increment += 1;
        let n = self.mean_x.increment as f64;
        Zip::from(&mut self.mean_x.mean)
            .and(&mut self.mean_y.mean)
            .and(&mut self.comoment)
            .and(&ArrayView1::from(x))
            .and(&ArrayView1::from(y))
            .for_each(|mx, my, c, &x, &y| {
                let dx = x - *mx;
                *mx += dx / n;
                *my += (y - *my) / n;
                *c += dx * (y - *my);
            });
    }

    pub fn merge(&mut self, other: &Covariance) {
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
        let factor = na * nb / (na + nb);
        Zip::from(&mut self.comoment)
            .and(&self.mean_x.mean)
            .and(&self.mean_y.mean)
            .and(&other.comoment)
            .and(&other.mean_x.mean)
            .and(&other.mean_y.mean)
            .for_each(|c, &mxa, &mya, &cb, &mxb, &myb| {
                *c += cb + (mxb - mxa) * (myb - mya) * factor;
            });
        self.mean_x.merge(&other.mean_x);
        self.mean_y.merge(&other.mean_y);
    }
}

impl Persist for Covariance {
    fn save(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        self.mean_x.save(writer)?;
        self.mean_y.save(writer)?;
        write_array(writer, &self.comoment)
    }

    fn restore(&mut self, reader: &mut dyn Read) -> std::io::Result<()> {
        self.mean_x.restore(reader)?;
        self.mean_y.restore(reader)?;
        read_array_into(reader, &mut self.comoment)
    }
}
