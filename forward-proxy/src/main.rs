use std::{sync::Arc, time::Duration};

use clap::Parser;

use forward_proxy::{Proxy, ProxyConfig, serve};

#[derive(Clone, Debug, Parser)]
struct Args {
    /// Address the proxy listens on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    addr: String,
    /// Timeout for establishing upstream connections, in seconds
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,
    /// Log request lifecycle (method, target, duration, tunnel events)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    let proxy = Arc::new(Proxy::new(ProxyConfig {
        connect_timeout: Duration::from_secs(args.connect_timeout),
        verbose: args.verbose,
    }));

    log::info!("Forward proxy starting on {}", args.addr);
    log::info!("  CONNECT host:port  - HTTPS tunneling");
    log::info!("  any other method   - plain HTTP forwarding (SSE unbuffered)");

    if let Err(e) = serve(args.addr, proxy).await {
        log::error!("Error running proxy: {e}");
        panic!();
    }
}
