/// Benchmarks for the streaming accumulators.
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ensemblist::moments::{HigherMoments, MinMax, Quantile, ThresholdExceedance, Variance};
use ensemblist::sobol::{Martinez, SobolEstimator};

const SAMPLES: usize = 16;

fn get_test_vectors(size: usize) -> Vec<Vec<f64>> {
    (0..SAMPLES)
        .map(|sample| {
            (0..size)
                .map(|i| ((i * 31 + sample * 17) % 101) as f64 / 101.0)
                .collect()
        })
        .collect()
}

type IncrementFn = dyn Fn(usize, &[Vec<f64>]);

fn criterion_benchmark(c: &mut Criterion) {
    for size_k in [1, 16, 256] {
        let size = size_k * 1024;
        let vectors = get_test_vectors(size);
        let accumulators: [(&str, Box<IncrementFn>); 5] = [
            (
                "variance",
                Box::new(|size, vectors| {
                    let mut variance = Variance::new(size);
                    vectors.iter().for_each(|x| variance.increment(x));
                    black_box(variance);
                }),
            ),
            (
                "higher_moments",
                Box::new(|size, vectors| {
                    let mut moments = HigherMoments::new(size);
                    vectors.iter().for_each(|x| moments.increment(x));
                    black_box(moments);
                }),
            ),
            (
                "min_max",
                Box::new(|size, vectors| {
                    let mut min_max = MinMax::new(size);
                    vectors.iter().for_each(|x| min_max.increment(x));
                    black_box(min_max);
                }),
            ),
            (
                "threshold",
                Box::new(|size, vectors| {
                    let mut threshold = ThresholdExceedance::new(size, 0.5);
                    vectors.iter().for_each(|x| threshold.increment(x));
                    black_box(threshold);
                }),
            ),
            (
                "quantile",
                Box::new(|size, vectors| {
                    let mut quantile = Quantile::new(size, 0.9);
                    vectors.iter().for_each(|x| quantile.increment(x));
                    black_box(quantile);
                }),
            ),
        ];
        for (name, increment) in accumulators {
            let name = format!("{}({})", name, size);
            c.bench_function(&name, |b| b.iter(|| increment(size, &vectors)));
        }

        for nb_parameters in [2, 8] {
            let name = format!("martinez({}, {})", size, nb_parameters);
            c.bench_function(&name, |b| {
                b.iter(|| {
                    let mut sobol = Martinez::new(size, nb_parameters);
                    for group in vectors.chunks_exact(nb_parameters + 2) {
                        let group: Vec<&[f64]> = group.iter().map(Vec::as_slice).collect();
                        sobol.increment(&group);
                    }
                    sobol.update_confidence();
                    black_box(sobol);
                })
            });
        }
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
