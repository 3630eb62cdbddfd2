use std::sync::Arc;

use clap::Parser;

use mock_openai_server::{Api, ApiConfig, Synthesizer, serve};

#[derive(Clone, Debug, Parser)]
struct Args {
    /// Address the server listens on
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    addr: String,
    /// Seed for the response policy RNG; random when unset
    #[arg(long)]
    seed: Option<u64>,
    /// Log request details (headers, masked authorization)
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

    let synth = match args.seed {
        Some(seed) => Synthesizer::with_seed(seed),
        None => Synthesizer::new(),
    };
    let api = Arc::new(Api::new(
        synth,
        ApiConfig {
            verbose: args.verbose,
            ..ApiConfig::default()
        },
    ));

    log::info!("Mock OpenAI server starting on {}", args.addr);
    log::info!("  GET  /v1/models              - List models");
    log::info!("  GET  /v1/models/{{id}}         - Get model by ID");
    log::info!("  POST /v1/chat/completions    - Chat (supports streaming)");
    log::info!("  POST /v1/embeddings          - Generate embeddings");

    if let Err(e) = serve(&args.addr, api).await {
        log::error!("Error running server: {e}");
        panic!();
    }
}
