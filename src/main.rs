// Signaling relay for battery-db rooms

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;

use battery_db::config::DEFAULT_RELAY_PORT;
use battery_db::signaling::relay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // positional PORT argument, RELAY_PORT env as the fallback
    let port = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RELAY_PORT").ok())
        .map(|raw| raw.parse::<u16>())
        .transpose()?
        .unwrap_or(DEFAULT_RELAY_PORT);

    let app = relay::router();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("signaling relay listening on ws://{addr}");
    info!("clients join with ws://host:{port}/?token=<room token>");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("signaling relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
