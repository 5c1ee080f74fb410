// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;

mod connection_loop;
mod context;
mod initialization;
mod metrics_server;
mod stream;

pub use connection_loop::reload_credentials;
pub use initialization::load_initial_credentials;
pub use stream::ClientStream;

/// The gateway startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    let mut server_context = initialization::setup(config).await?;

    if server_context.state.config.metrics.enabled {
        let state = server_context.state.clone();
        let shutdown_rx = server_context.shutdown_tx.subscribe();
        server_context
            .background_tasks
            .spawn(metrics_server::run_metrics_server(state, shutdown_rx));
    }

    connection_loop::run(server_context).await
}
