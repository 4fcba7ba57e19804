//! Standalone broker daemon.
//!
//! Runs the election in its own process. If elected it serves until a HALT
//! request (exit 0) or a fatal device error (exit 1). If a server is already
//! running it exits 0 without doing anything.
//!
//! Configuration comes from the `MEMMAP_BROKER_*` environment variables and
//! log filtering from `RUST_LOG`.

use memmap_broker::{Broker, BrokerConfig, observability};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("memmap_broker=info")),
        )
        .init();
    observability::init_metrics();

    let config = match BrokerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let broker = match Broker::arbitrate(config) {
        Ok(broker) => broker,
        Err(e) => {
            tracing::error!("election failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if !broker.is_server() {
        tracing::info!(
            dir = %broker.config().runtime_dir.display(),
            "a broker server is already running"
        );
        return ExitCode::SUCCESS;
    }

    match broker.wait() {
        Ok(()) => {
            tracing::info!("server halted");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("server failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
