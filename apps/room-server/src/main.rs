//! Collaborative code room server
//! Serves room documents and presence to `coderoom` clients over WebSocket

use clap::Parser;
use room_sync::RoomServer;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "room-server")]
#[command(about = "Realtime room store and presence server")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    bind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("room_server=debug,room_sync=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let listener = TcpListener::bind(&args.bind).await?;
    info!("Room server bound to {}", listener.local_addr()?);

    let server = Arc::new(RoomServer::new());
    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
