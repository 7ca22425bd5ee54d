//! This crate provides an online statistics server for large ensembles of simulations. Each
//! simulation streams its fields, timestep by timestep, to a set of server ranks which fold them
//! into running statistics as they arrive. Nothing is written to disk except checkpoints, so the
//! ensemble never has to be stored.
//!
//! Supported statistics are the mean, variance, skewness, kurtosis, minimum and maximum,
//! threshold exceedance, quantiles and first and total order Sobol' indices using the Martinez
//! estimator.
//!
//! Simulations and servers partition the global field differently. A [partition::PartitionPlan]
//! computes which block of which client rank lands on which server rank.
//!
//! The server is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime, drives the event loop of every
//!   server rank and the TCP transports.
//! * [Axum](axum) web framework serves status and [Prometheus](prometheus) metrics endpoints.
//! * [Serde](serde) performs (de)serialisation of options and status reports.
//! * [ndarray] holds the per-element accumulator state.
//! * [zerocopy] maps the native-endian binary wire and checkpoint formats.

pub mod app;
pub mod app_state;
pub mod checkpoint;
pub mod cli;
pub mod client;
pub mod collective;
pub mod error;
pub mod event_loop;
pub mod field;
pub mod metrics;
pub mod moments;
pub mod options;
pub mod partition;
pub mod protocol;
pub mod server;
pub mod simulation;
pub mod sobol;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod transport;
pub mod types;
