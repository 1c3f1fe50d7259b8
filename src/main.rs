//! offline-llm - JSON-lines host for the local inference runtime
//!
//! Reads requests from stdin and writes replies and stream events to stdout.
//! Logs go to stderr.

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use offline_llm::bridge;
use offline_llm::runtime::RuntimeFacade;
use offline_llm::storage::init_storage;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("offline_llm=info")))
        .init();

    info!("Starting offline-llm v{}", env!("CARGO_PKG_VERSION"));

    let facade = match RuntimeFacade::global() {
        Ok(facade) => facade,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_storage(&facade.settings().models_directory) {
        error!("Failed to initialize storage: {}", e);
        return ExitCode::FAILURE;
    }

    match bridge::serve(facade, tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Bridge failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
