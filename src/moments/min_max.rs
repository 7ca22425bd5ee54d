//! Running elementwise minimum and maximum.

use std::io::{Read, Write};

use ndarray::{Array1, ArrayView1, Zip};

use crate::checkpoint::{read_array_into, read_i32, read_u64, write_array, write_i32, write_u64, Persist};
use crate::moments::{check_len, check_merge};

#[derive(Clone, Debug, PartialEq)]
pub struct MinMax {
    pub(crate) min: Array1<f64>,
    pub(crate) max: Array1<f64>,
    pub(crate) is_init: bool,
    pub(crate) increment: u64,
}

impl MinMax {
    pub fn new(vect_size: usize) -> Self {
        Self {
            min: Array1::zeros(vect_size),
            max: Array1::zeros(vect_size),
            is_init: false,
            increment: 0,
        }
    }

    pub fn vect_size(&self) -> usize {
        self.min.len()
    }

    pub fn count(&self) -> u64 {
        self.increment
    }

    /// Whether at least one sample has been seen.
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    /// Elementwise minimum, or `None` before the first sample.
    pub fn min(&self) -> Option<ArrayView1<f64>> {
        self.is_init.then(|| self.min.view())
    }

    /// Elementwise maximum, or `None` before the first sample.
    pub fn max(&self) -> Option<ArrayView1<f64>> {
        self.is_init.then(|| self.max.view())
    }

    /// Folds one vector in. The first vector initialises both bounds.
    pub fn increment(&mut self, x: &[f64]) {
        check_len(self.vect_size(), x);
        let x = ArrayView1::from(x);
        if self.is_init {
            Zip::from(&mut self.min)
                .and(&mut self.max)
                .and(&x)
                .for_each(|min, max, &x| {
                    *min = min.min(x);
                    *max = max.max(x);
                });
        } else {
            self.min.assign(&x);
            self.max.assign(&x);
            self.is_init = true;
        }
        self.increment += 1;
    }

    pub fn merge(&mut self, other: &MinMax) {
        check_merge(self.vect_size(), other.vect_size());
        if !other.is_init {
            return;
        }
        if !self.is_init {
            self.clone_from(other);
            return;
        }
        Zip::from(&mut self.min)
            .and(&mut self.max)
            .and(&other.min)
            .and(&other.max)
            .for_each(|min, max, &other_min, &other_max| {
                *min = min.min(other_min);
                *max = max.max(other_max);
            });
        self.increment += other.increment;
    }
}

impl Persist for MinMax {
    fn save(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        write_i32(writer, i32::from(self.is_init))?;
        write_u64(writer, self.increment)?;
        write_array(writer, &self.min)?;
        write_array(writer, &self.max)
    }

    fn restore(&mut self, reader: &mut dyn Read) -> std::io::Result<()> {
        self.is_init = read_i32(reader)? != 0;
        self.increment = read_u64(reader)?;
        read_array_into(reader, &mut self.min)?;
        read_array_into(reader, &mut self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_initialises() {
        let mut min_max = MinMax::new(2);
        assert!(min_max.min().is_none());
        min_max.increment(&[0.0, 0.0]);
        assert!(min_max.is_init());
        assert_eq!(ArrayView1::from(&[0.0, 0.0]), min_max.min().unwrap());
    }

    #[test]
    fn tracks_bounds() {
        let mut min_max = MinMax::new(3);
        min_max.increment(&[1.0, 2.0, 3.0]);
        min_max.increment(&[3.0, 2.0, 1.0]);
        min_max.increment(&[5.0, -5.0, 5.0]);
        assert_eq!(ArrayView1::from(&[1.0, -5.0, 1.0]), min_max.min().unwrap());
        assert_eq!(ArrayView1::from(&[5.0, 2.0, 5.0]), min_max.max().unwrap());
        assert_eq!(3, min_max.count());
    }

    #[test]
    fn merge_combines_bounds() {
        let mut left = MinMax::new(2);
        left.increment(&[1.0, 8.0]);
        let mut right = MinMax::new(2);
        right.increment(&[-1.0, 9.0]);
        right.increment(&[0.0, 2.0]);
        left.merge(&right);
        assert_eq!(ArrayView1::from(&[-1.0, 2.0]), left.min().unwrap());
        assert_eq!(ArrayView1::from(&[1.0, 9.0]), left.max().unwrap());
        assert_eq!(3, left.count());

        let mut empty = MinMax::new(2);
        empty.merge(&left);
        assert_eq!(left, empty);
    }
}
