use clap::Parser;
use smcfan::cli::{run_cli, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing only if RUST_LOG is set (for debugging)
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    if let Err(e) = run_cli(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
