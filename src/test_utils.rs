use crate::field::FieldTable;
use crate::options::{Operation, Options, SobolMethod};
use crate::protocol::{DataMessage, DataMessageBuilder};
use crate::simulation::SimulationTable;

use std::path::PathBuf;
use std::time::Instant;

/// Create an Options object with the plain statistics enabled.
pub(crate) fn get_test_options() -> Options {
    Options {
        nb_time_steps: 4,
        nb_parameters: 0,
        sampling_size: 2,
        operations: vec![
            Operation::Mean,
            Operation::Variance,
            Operation::MinMax,
            Operation::Threshold,
            Operation::Quantile,
        ],
        thresholds: vec![2.5],
        quantiles: vec![0.5],
        sobol_method: SobolMethod::Martinez,
        sobol_max_order: 1,
        fields: vec!["temperature".into(), "pressure".into()],
        checkpoint_interval: 60,
        timeout_simu: 60,
        launcher_timeout: 60,
        restart_dir: PathBuf::from("/tmp/ensemblist"),
        restart: false,
        learning_mode: false,
        verbosity: 0,
        convergence_tolerance: None,
    }
}

/// Create an Options object with Sobol' indices over two parameters.
pub(crate) fn get_test_sobol_options() -> Options {
    Options {
        nb_parameters: 2,
        sampling_size: 64,
        operations: vec![Operation::Mean, Operation::Variance, Operation::Sobol],
        thresholds: vec![],
        quantiles: vec![],
        sobol_max_order: 2,
        convergence_tolerance: Some(0.1),
        ..get_test_options()
    }
}

/// Deterministic uniform numbers for tests.
pub(crate) struct Lcg(u64);

impl Lcg {
    pub(crate) fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Next value in `[0, 1)`.
    pub(crate) fn next_f64(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1_u64 << 53) as f64
    }
}

/// Build and decode a data message for `options`, repeating `values` with a shift per vector.
pub(crate) fn get_test_message(
    options: &Options,
    field: &str,
    timestep: usize,
    simu_id: usize,
    client_rank: usize,
    values: &[f64],
) -> DataMessage {
    let vectors: Vec<Vec<f64>> = (0..options.vectors_per_message())
        .map(|k| values.iter().map(|v| v + k as f64).collect())
        .collect();
    let bytes = vectors
        .iter()
        .fold(
            DataMessageBuilder::new(field, timestep, simu_id, client_rank),
            |builder, vector| builder.vector(vector),
        )
        .build(options.vectors_per_message())
        .unwrap();
    DataMessage::decode(&bytes, options.vectors_per_message()).unwrap()
}

/// Send every field and timestep of `simu_id` for the given client ranks, leaving the group
/// running.
pub(crate) fn feed_group(
    fields: &mut FieldTable,
    simulations: &mut SimulationTable,
    simu_id: usize,
    client_ranks: &[usize],
    vect_size: usize,
) {
    let options = fields.options().clone();
    for field in &options.fields {
        for &client_rank in client_ranks {
            for timestep in 0..options.nb_time_steps {
                let values: Vec<f64> = (0..vect_size)
                    .map(|i| (simu_id * 7 + client_rank * 3 + timestep + i) as f64)
                    .collect();
                let message =
                    get_test_message(&options, field, timestep, simu_id, client_rank, &values);
                fields.insert(&message, Some(vect_size)).unwrap();
            }
        }
    }
    simulations.touch(simu_id, Instant::now());
}

/// Feed `n` Sobol' design points, starting at group `simu_start`, for client rank 0 with
/// two elements per vector.
pub(crate) fn feed_sobol_points(fields: &mut FieldTable, simu_start: usize, n: usize) {
    let options = fields.options().clone();
    let p = options.nb_parameters;
    let model = |x: &[f64], timestep: usize| -> Vec<f64> {
        let linear: f64 = x.iter().enumerate().map(|(k, v)| (k + 1) as f64 * v).sum();
        vec![linear, x[0] * x[0] + 0.1 * timestep as f64]
    };
    let mut rng = Lcg::new(7);
    for simu_id in simu_start..simu_start + n {
        let a: Vec<f64> = (0..p).map(|_| rng.next_f64()).collect();
        let b: Vec<f64> = (0..p).map(|_| rng.next_f64()).collect();
        let mut points = vec![a.clone(), b.clone()];
        for k in 0..p {
            let mut c = a.clone();
            c[k] = b[k];
            points.push(c);
        }
        for field in &options.fields {
            for timestep in 0..options.nb_time_steps {
                let runs: Vec<Vec<f64>> = points.iter().map(|x| model(x, timestep)).collect();
                let bytes = runs
                    .iter()
                    .fold(
                        DataMessageBuilder::new(field, timestep, simu_id, 0),
                        |builder, run| builder.vector(run),
                    )
                    .build(p + 2)
                    .unwrap();
                let message = DataMessage::decode(&bytes, p + 2).unwrap();
                fields.insert(&message, Some(2)).unwrap();
            }
        }
    }
}
