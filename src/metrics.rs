use axum::{body::Body, http::Request, response::Response};
use lazy_static::lazy_static;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use tracing::Span;

use crate::error::EnsembleError;
use crate::simulation::SimulationTable;
use crate::types::SimulationStatus;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Data messages by outcome
    pub static ref DATA_MESSAGES: IntCounterVec = IntCounterVec::new(
        Opts::new("data_messages", "The number of data messages received"),
        &["server_rank", "outcome"]
    ).unwrap();
    // Launcher messages by direction and command
    pub static ref LAUNCHER_MESSAGES: IntCounterVec = IntCounterVec::new(
        Opts::new("launcher_messages", "The number of launcher messages exchanged"),
        &["direction", "command"]
    ).unwrap();
    // Groups reset after going silent
    pub static ref SIMULATION_TIMEOUTS: IntCounterVec = IntCounterVec::new(
        Opts::new("simulation_timeouts", "The number of simulation groups reset after a timeout"),
        &[]
    ).unwrap();
    // Groups by status, as seen by each rank
    pub static ref SIMULATIONS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("simulations", "The number of simulation groups in each status"),
        &["server_rank", "status"]
    ).unwrap();
    // Checkpoint histogram by write time
    pub static ref CHECKPOINT_TIME: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("checkpoint_time", "The time taken to write each checkpoint"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        },
        &[],
    ).unwrap();
    // Simple request counter
    pub static ref INCOMING_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("incoming_requests", "The number of HTTP requests received"),
        &["http_method"]
    ).unwrap();
    // Request counter by status code
    pub static ref RESPONSE_CODE_COLLECTOR: IntCounterVec = IntCounterVec::new(
        Opts::new("outgoing_response", "The number of responses sent."),
        &["status_code"]
    ).unwrap();
    // Request histogram by response time
    pub static ref RESPONSE_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("response_time", "The time taken to respond to each request"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        },
        &[],
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(DATA_MESSAGES.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(LAUNCHER_MESSAGES.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SIMULATION_TIMEOUTS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SIMULATIONS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CHECKPOINT_TIME.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INCOMING_REQUESTS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_CODE_COLLECTOR.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_TIME_COLLECTOR.clone()))
        .unwrap();
}

pub async fn metrics_handler() -> Result<String, EnsembleError> {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|error| std::io::Error::new(std::io::ErrorKind::Other, error))?;
    String::from_utf8(buffer)
        .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error).into())
}

/// Counts one data message on `server_rank`, labelled by what became of it
pub fn record_data_message(server_rank: usize, outcome: &str) {
    DATA_MESSAGES
        .with_label_values(&[&server_rank.to_string(), outcome])
        .inc();
}

/// Counts one launcher message, labelled by direction and leading command word
pub fn record_launcher_message(direction: &str, line: &str) {
    let command = line.split_ascii_whitespace().next().unwrap_or_default();
    LAUNCHER_MESSAGES
        .with_label_values(&[direction, command])
        .inc();
}

/// Publishes the number of groups in each status on `server_rank`
pub fn record_simulations(server_rank: usize, simulations: &SimulationTable) {
    let rank = server_rank.to_string();
    for status in [
        SimulationStatus::NotStarted,
        SimulationStatus::Running,
        SimulationStatus::Finished,
        SimulationStatus::Dropped,
    ] {
        SIMULATIONS
            .with_label_values(&[&rank, &status.to_string()])
            .set(simulations.count(status) as i64);
    }
}

/// Increments the prometheus counter on all incoming requests, labelled by http method
pub fn request_counter(request: &Request<Body>, _span: &Span) {
    INCOMING_REQUESTS
        .with_label_values(&[&request.method().to_string().to_ascii_uppercase()])
        .inc();
}

/// Increment the prometheus counter on all outgoing responses, labelled by status code
pub fn record_response_metrics<B>(
    response: &Response<B>,
    latency: std::time::Duration,
    _span: &Span,
) {
    RESPONSE_CODE_COLLECTOR
        .with_label_values(&[response.status().as_str()])
        .inc();

    RESPONSE_TIME_COLLECTOR
        .with_label_values(&[])
        .observe(latency.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn simulation_gauges_follow_table() {
        let mut simulations = SimulationTable::new();
        simulations.touch(0, Instant::now());
        simulations.touch(1, Instant::now());
        simulations.finish(1);
        record_simulations(41, &simulations);
        let running = SIMULATIONS.with_label_values(&["41", "running"]).get();
        let finished = SIMULATIONS.with_label_values(&["41", "finished"]).get();
        assert_eq!((1, 1), (running, finished));
    }

    #[test]
    fn launcher_messages_labelled_by_command() {
        record_launcher_message("received", "job 3 17 0.5");
        let counter = LAUNCHER_MESSAGES.with_label_values(&["received", "job"]);
        assert!(counter.get() >= 1);
    }
}
