//! Process wiring: listeners, rank tasks, the HTTP status server and signal handling.

use crate::app;
use crate::app_state::StatusBoard;
use crate::cli::CommandLineArgs;
use crate::collective::RankGroup;
use crate::error::EnsembleError;
use crate::event_loop::{EventSources, RunSummary, ServerSession};
use crate::options::Options;
use crate::transport;

use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use axum_server::Handle;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{event, Level};

/// Serve the HTTP status endpoints until `handle` is shut down
///
/// # Arguments
///
/// * `args`: Command line arguments
/// * `service`: The [crate::app::Service] to serve
/// * `handle`: Shutdown handle shared with the signal handler
pub async fn serve(
    args: &CommandLineArgs,
    service: app::Service,
    handle: Handle,
) -> Result<(), EnsembleError> {
    let addr = socket_addr(&args.host, args.http_port)?;
    axum_server::bind(addr)
        .handle(handle)
        .serve(service.into_make_service())
        .await?;
    Ok(())
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, EnsembleError> {
    SocketAddr::from_str(&format!("{host}:{port}")).map_err(|_| {
        EnsembleError::protocol(format!("invalid host name, IP address or port {host}:{port}"))
    })
}

/// Data port of `rank`, failing if it does not fit in a port number.
fn data_port(args: &CommandLineArgs, rank: usize) -> Result<u16, EnsembleError> {
    Ok(u16::try_from(usize::from(args.data_port) + rank)?)
}

/// Runs every server rank of this process to completion.
///
/// Each rank listens for data on `data_port + rank`. Rank 0 also accepts handshakes and talks
/// to the launcher, when one is configured.
pub async fn run(
    args: &CommandLineArgs,
    options: Options,
    status: StatusBoard,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<RunSummary>, EnsembleError> {
    let options = Arc::new(options);
    let node_names = (0..args.server_ranks)
        .map(|rank| -> Result<String, EnsembleError> {
            Ok(format!("{}:{}", args.advertise_host, data_port(args, rank)?))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let (connections_tx, connections_rx) = mpsc::channel(16);
    let listener = TcpListener::bind(socket_addr(&args.host, args.connection_port)?).await?;
    event!(Level::INFO, port = args.connection_port, "accepting simulations");
    let mut listeners = vec![transport::spawn_connection_listener(listener, connections_tx)];
    let mut connections = Some(connections_rx);

    let mut launcher = match &args.launcher_addr {
        Some(addr) => Some(transport::connect_launcher(addr).await?),
        None => {
            event!(Level::WARN, "no launcher configured");
            None
        }
    };

    let mut ranks = Vec::with_capacity(args.server_ranks);
    for group in RankGroup::local_group(args.server_ranks) {
        let rank = group.rank();
        let (data_tx, data_rx) = mpsc::channel(1024);
        let port = data_port(args, rank)?;
        let listener = TcpListener::bind(socket_addr(&args.host, port)?).await?;
        listeners.push(transport::spawn_data_listener(listener, data_tx));

        let sources = EventSources {
            data: Some(data_rx),
            connections: if group.is_root() { connections.take() } else { None },
            launcher: if group.is_root() { launcher.take() } else { None },
            shutdown: shutdown.clone(),
        };
        let session = ServerSession::new(options.clone(), group, node_names.clone())
            .with_status_board(status.clone());
        ranks.push(tokio::spawn(session.run(sources)));
    }

    let mut summaries = Vec::with_capacity(ranks.len());
    for rank in ranks {
        let summary = rank.await.map_err(|error| {
            std::io::Error::new(std::io::ErrorKind::Other, format!("rank task failed: {error}"))
        })??;
        summaries.push(summary);
    }
    for listener in listeners {
        listener.abort();
    }
    Ok(summaries)
}

/// Graceful shutdown handler
///
/// Installs signal handlers to catch Ctrl-C, SIGTERM or SIGUSR1, then stops the rank loops and
/// shuts the HTTP server down.
pub async fn shutdown_signal(stop: watch::Sender<bool>, handle: Handle, timeout: u64) {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            event!(Level::ERROR, %error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = unix_signal(signal::unix::SignalKind::terminate());
    #[cfg(unix)]
    let user1 = unix_signal(signal::unix::SignalKind::user_defined1());

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    #[cfg(not(unix))]
    let user1 = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = user1 => {},
    }

    event!(Level::INFO, "signal received, starting graceful shutdown");
    // The rank loops may already have finished.
    let _ = stop.send(true);
    handle.graceful_shutdown(Some(Duration::from_secs(timeout)));
}

#[cfg(unix)]
async fn unix_signal(kind: signal::unix::SignalKind) {
    match signal::unix::signal(kind) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(error) => {
            event!(Level::ERROR, %error, "failed to install signal handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn socket_addresses() {
        assert_eq!(
            SocketAddr::from(([127, 0, 0, 1], 5000)),
            socket_addr("127.0.0.1", 5000).unwrap()
        );
        assert!(socket_addr("not a host", 5000).is_err());
    }

    #[test]
    fn data_ports_follow_rank() {
        let args = CommandLineArgs::try_parse_from([
            "ensemblist",
            "--nb-time-steps",
            "1",
            "--sampling-size",
            "1",
            "--fields",
            "u",
            "--data-port",
            "65534",
        ])
        .unwrap();
        assert_eq!(65534, data_port(&args, 0).unwrap());
        assert_eq!(65535, data_port(&args, 1).unwrap());
        assert!(matches!(
            data_port(&args, 2),
            Err(EnsembleError::TryFromInt(_))
        ));
    }
}
