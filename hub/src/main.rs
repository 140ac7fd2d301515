//! Real-time multi-publisher damage aggregation hub.

mod handlers;
mod registry;
mod room;
mod types;

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eqloghub", version, about = "Real-time damage aggregation hub")]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8787")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let state = Arc::new(handlers::ServerState::new());

    tokio::spawn(handlers::flush_loop(state.clone()));

    let api = handlers::routes(state);
    match warp::serve(api).try_bind_ephemeral(args.listen) {
        Ok((addr, server)) => {
            info!("eqloghub listening on http://{addr}");
            server.await;
        }
        Err(e) => {
            error!("failed to bind {}: {e}", args.listen);
            std::process::exit(1);
        }
    }
}
