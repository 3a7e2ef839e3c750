//! ident-responder: answer one ident query, then exit.
//!
//! Configuration via CLI arguments or TOML file.

use ident_responder::config::Config;
use ident_responder::{Responder, State, TracingSink};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        identity = %config.identity,
        timeout_secs = config.timeout.as_secs(),
        "Starting ident-responder"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let state = runtime.block_on(async {
        let responder = Responder::with_config(config.responder_config(), Arc::new(TracingSink));
        responder.closed().await
    });

    match state {
        State::BindFailed => {
            error!(listen = %config.listen, "Ident responder could not start");
            Err(format!("could not bind {}", config.listen).into())
        }
        _ => Ok(()),
    }
}
