//! Tracing (logging)

use crate::cli::CommandLineArgs;

use opentelemetry::global;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initlialise tracing (logging)
///
/// Applies a filter based on the `RUST_LOG` environment variable, falling back to info logging
/// for this crate and tower_http if not set. A verbosity of 2 or more lowers the fallback to
/// debug. Spans are also exported to a Jaeger agent when enabled.
pub fn init_tracing(args: &CommandLineArgs) {
    let fallback = if args.verbosity >= 2 {
        "ensemblist=debug,tower_http=debug"
    } else {
        "ensemblist=info,tower_http=info"
    };
    let jaeger_layer = if args.enable_jaeger {
        global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());
        match opentelemetry_jaeger::new_agent_pipeline()
            .with_service_name("ensemblist")
            .install_batch(opentelemetry::runtime::Tokio)
        {
            Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            Err(error) => {
                // The subscriber is not installed yet.
                eprintln!("failed to install Jaeger pipeline: {error}");
                None
            }
        }
    } else {
        None
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(tracing_subscriber::fmt::layer())
        .with(jaeger_layer)
        .init();
}

/// Flush and stop any trace exporters.
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}
