use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use parley_net::StreamConnection;

use crate::dispatcher::Dispatcher;

/// Accept connections until the task is cancelled. Each accepted socket gets
/// its own reader and writer tasks, all sharing `dispatcher`.
pub async fn serve(listener: TcpListener, dispatcher: Dispatcher) {
    match listener.local_addr() {
        Ok(addr) => info!("Accepting connections on {}", addr),
        Err(e) => warn!("Listener has no local address: {}", e),
    }

    let max_record_bytes = dispatcher.config().max_record_bytes;
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                if let Err(e) = StreamConnection::spawn(stream, Arc::new(dispatcher.clone()), max_record_bytes) {
                    warn!("Failed to set up connection from {}: {}", addr, e);
                }
            }
            Err(e) => {
                error!("Accept error: {}", e);
            }
        }
    }
}
