mod config;

use std::sync::Arc;

use tracing::info;

use parley_db::Database;
use parley_gateway::{Dispatcher, serve};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_gateway=debug,parley_net=info".into()),
        )
        .init();

    let config = ServerConfig::from_env();

    let db = Database::open(&config.db_path)?;
    let dispatcher = Dispatcher::new(Arc::new(db), config.dispatcher());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        "Parley server listening on {} (ringing timeout {}s)",
        addr,
        config.call_timeout.as_secs()
    );

    serve(listener, dispatcher).await;
    Ok(())
}
