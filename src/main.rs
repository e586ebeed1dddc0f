use clap::Parser;
use tracing::error;

use thrust::{cli::Cli, logging, settings::Settings};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("thrust: invalid configuration: {err:#}");
            std::process::exit(1);
        }
    };

    if let Err(err) = logging::init_logger(settings.log_filter()) {
        eprintln!("thrust: failed to initialize logging: {err:#}");
        std::process::exit(1);
    }

    match thrust::run(cli, settings).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!(error = %err, "fatal error");
            std::process::exit(1);
        }
    }
}
