//! Approximate quantiles using the P² algorithm (Jain & Chlamtac, 1985).
//!
//! Each element keeps five marker heights and positions, so memory stays constant regardless of
//! how many samples are folded in. The first five samples are retained exactly and the estimate
//! is an exact order statistic until then.

use std::io::{Read, Write};

use ndarray::Array1;

use crate::checkpoint::{read_slice_into, read_u64, write_slice, write_u64, Persist};
use crate::moments::check_len;

const MARKERS: usize = 5;

#[derive(Clone, Debug, PartialEq)]
pub struct Quantile {
    order: f64,
    vect_size: usize,
    /// Marker heights, `MARKERS` per element.
    heights: Vec<f64>,
    /// Marker positions (1-based), `MARKERS` per element.
    positions: Vec<f64>,
    increment: u64,
}

impl Quantile {
    /// Returns an estimator for the quantile of `order`, which must lie strictly in (0, 1).
    pub fn new(vect_size: usize, order: f64) -> Self {
        assert!(
            order > 0.0 && order < 1.0,
            "quantile order {order} must lie in (0, 1)"
        );
        Self {
            order,
            vect_size,
            heights: vec![0.0; vect_size * MARKERS],
            positions: initial_positions(vect_size),
            increment: 0,
        }
    }

    pub fn vect_size(&self) -> usize {
        self.vect_size
    }

    pub fn order(&self) -> f64 {
        self.order
    }

    pub fn count(&self) -> u64 {
        self.increment
    }

    /// Increments of the desired marker positions per sample.
    fn desired_increments(&self) -> [f64; MARKERS] {
        let p = self.order;
        [0.0, p / 2.0, p, (1.0 + p) / 2.0, 1.0]
    }

    pub fn increment(&mut self, x: &[f64]) {
        check_len(self.vect_size, x);
        let seen = self.increment as usize;
        self.increment += 1;
        if seen < MARKERS {
            for (markers, &x) in self.heights.chunks_exact_mut(MARKERS).zip(x) {
                markers[seen] = x;
                if seen + 1 == MARKERS {
                    markers.sort_by(f64::total_cmp);
                }
            }
            return;
        }

        let n = self.increment as f64;
        let increments = self.desired_increments();
        let desired = increments.map(|dn| 1.0 + (n - 1.0) * dn);
        for ((q, pos), &x) in self
            .heights
            .chunks_exact_mut(MARKERS)
            .zip(self.positions.chunks_exact_mut(MARKERS))
            .zip(x)
        {
            update_markers(q, pos, &desired, x);
        }
    }

    /// Current quantile estimate per element. Zeros before the first sample.
    pub fn estimate(&self) -> Array1<f64> {
        let seen = self.increment as usize;
        if seen == 0 {
            return Array1::zeros(self.vect_size);
        }
        if seen >= MARKERS {
            return self
                .heights
                .chunks_exact(MARKERS)
                .map(|q| q[2])
                .collect();
        }
        let rank = (self.order * (seen - 1) as f64).round() as usize;
        self.heights
            .chunks_exact(MARKERS)
            .map(|q| {
                let mut retained = q[..seen].to_vec();
                retained.sort_by(f64::total_cmp);
                retained[rank]
            })
            .collect()
    }
}

fn initial_positions(vect_size: usize) -> Vec<f64> {
    (0..vect_size)
        .flat_map(|_| (1..=MARKERS).map(|p| p as f64))
        .collect()
}

/// One P² step for a single element.
fn update_markers(q: &mut [f64], pos: &mut [f64], desired: &[f64; MARKERS], x: f64) {
    let cell = if x < q[0] {
        q[0] = x;
        0
    } else if x >= q[4] {
        q[4] = x;
        3
    } else {
        (0..4).find(|&j| x < q[j + 1]).unwrap_or(3)
    };
    for p in pos.iter_mut().skip(cell + 1) {
        *p += 1.0;
    }

    for j in 1..4 {
        let d = desired[j] - pos[j];
        if (d >= 1.0 && pos[j + 1] - pos[j] > 1.0) || (d <= -1.0 && pos[j - 1] - pos[j] < -1.0) {
            let s = d.signum();
            let candidate = parabolic(q, pos, j, s);
            q[j] = if q[j - 1] < candidate && candidate < q[j + 1] {
                candidate
            } else {
                linear(q, pos, j, s)
            };
            pos[j] += s;
        }
    }
}

fn parabolic(q: &[f64], pos: &[f64], j: usize, s: f64) -> f64 {
    q[j] + s / (pos[j + 1] - pos[j - 1])
        * ((pos[j] - pos[j - 1] + s) * (q[j + 1] - q[j]) / (pos[j + 1] - pos[j])
            + (pos[j + 1] - pos[j] - s) * (q[j] - q[j - 1]) / (pos[j] - pos[j - 1]))
}

fn linear(q: &[f64], pos: &[f64], j: usize, s: f64) -> f64 {
    let neighbour = if s > 0.0 { j + 1 } else { j - 1 };
    q[j] + s * (q[neighbour] - q[j]) / (pos[neighbour] - pos[j])
}

impl Persist for Quantile {
    fn save(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        write_u64(writer, self.increment)?;
        write_slice(writer, &self.heights)?;
        write_slice(writer, &self.positions)
    }

    fn restore(&mut self, reader: &mut dyn Read) -> std::io::Result<()> {
        self.increment = read_u64(reader)?;
        read_slice_into(reader, &mut self.heights)?;
        read_slice_into(reader, &mut self.positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_before_five_samples() {
        let mut median = Quantile::new(2, 0.5);
        median.increment(&[3.0, 30.0]);
        assert_eq!(vec![3.0, 30.0], median.estimate().to_vec());
        median.increment(&[1.0, 10.0]);
        median.increment(&[2.0, 20.0]);
        assert_eq!(vec![2.0, 20.0], median.estimate().to_vec());
    }

    #[test]
    fn converges_on_uniform_sequence() {
        // A deterministic permutation of 0..1000 so the stream is not sorted.
        let n = 1000_u64;
        let mut estimator = Quantile::new(1, 0.9);
        for i in 0..n {
            let value = ((i * 7919) % n) as f64;
            estimator.increment(&[value]);
        }
        let estimate = estimator.estimate()[0];
        assert!((estimate - 900.0).abs() < 30.0, "estimate {estimate}");
    }

    #[test]
    fn markers_stay_ordered() {
        let mut estimator = Quantile::new(1, 0.25);
        for i in 0..200_u64 {
            let value = ((i * 37) % 101) as f64 - 50.0;
            estimator.increment(&[value]);
        }
        let q = &estimator.heights[..MARKERS];
        assert!(q.windows(2).all(|w| w[0] <= w[1]), "{q:?}");
        let pos = &estimator.positions[..MARKERS];
        assert_eq!(200.0, pos[4]);
    }

    #[test]
    #[should_panic(expected = "must lie in (0, 1)")]
    fn invalid_order_panics() {
        Quantile::new(1, 1.0);
    }
}
