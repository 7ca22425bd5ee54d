//! This file defines the ensemblist binary entry point.

use ensemblist::app;
use ensemblist::app_state::StatusBoard;
use ensemblist::cli;
use ensemblist::metrics;
use ensemblist::server;
use ensemblist::tracing;

use axum_server::Handle;
use tokio::sync::watch;
use ::tracing::{event, Level};

/// Application entry point
#[tokio::main]
async fn main() {
    let args = cli::parse();
    tracing::init_tracing(&args);
    metrics::register_metrics();

    let options = match args.options() {
        Ok(options) => options,
        Err(error) => {
            event!(Level::ERROR, %error, "invalid options");
            tracing::shutdown_tracing();
            std::process::exit(2);
        }
    };
    event!(Level::INFO, ?options, "starting");

    let status = StatusBoard::new(options.sampling_size);
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = Handle::new();
    tokio::spawn(server::shutdown_signal(
        stop_tx,
        handle.clone(),
        args.graceful_shutdown_timeout,
    ));

    let http = {
        let args = args.clone();
        let handle = handle.clone();
        let service = app::service(status.clone());
        tokio::spawn(async move {
            if let Err(error) = server::serve(&args, service, handle).await {
                event!(Level::ERROR, %error, "HTTP server failed");
            }
        })
    };

    let code = match server::run(&args, options, status, stop_rx).await {
        Ok(summaries) => {
            for summary in &summaries {
                event!(
                    Level::INFO,
                    rank = summary.rank,
                    reason = ?summary.reason,
                    finished = summary.status.finished,
                    messages = summary.status.messages,
                    "rank stopped"
                );
            }
            0
        }
        Err(error) => {
            event!(Level::ERROR, %error, "server failed");
            1
        }
    };

    handle.graceful_shutdown(Some(std::time::Duration::from_secs(
        args.graceful_shutdown_timeout,
    )));
    if let Err(error) = http.await {
        event!(Level::ERROR, %error, "HTTP server task failed");
    }
    tracing::shutdown_tracing();
    std::process::exit(code);
}
