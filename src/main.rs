use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use logring::cli::Opts;
use logring::config::Config;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let opts = Opts::parse();
    let config = match Config::load(&opts) {
        Ok(config) => config,
        Err(error) => {
            error!(message = "Invalid configuration.", %error);
            std::process::exit(exitcode::CONFIG);
        }
    };

    if let Err(error) = logring::app::run(config).await {
        error!(message = "Node exited with an error.", %error);
        std::process::exit(exitcode::SOFTWARE);
    }
}
