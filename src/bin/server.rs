//! Process bootstrap for the TCP front-end.

use std::sync::Arc;

use clap::Parser;
use flashex::{Engine, TcpServer};

#[derive(Parser, Debug)]
#[command(name = "flashex-server", about = "Matching engine TCP front-end")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Shard worker threads; 0 means one per available core.
    #[arg(long, default_value_t = 0)]
    workers: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let engine = Arc::new(Engine::new(args.workers));
    let server = TcpServer::new(Arc::clone(&engine));

    if let Err(err) = server.run(args.port) {
        tracing::error!(%err, "front-end terminated");
        std::process::exit(1);
    }
}
