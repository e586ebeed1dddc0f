pub mod cache;
pub mod cli;
pub mod compress;
pub mod logging;
pub mod process;
pub mod proxy;
pub mod server;
pub mod service;
pub mod settings;
pub mod tls;
pub mod util;

use anyhow::Result;

use crate::cli::Cli;
use crate::service::Service;
use crate::settings::Settings;

/// Runs the whole assembly and resolves to the process exit code.
pub async fn run(cli: Cli, settings: Settings) -> Result<i32> {
    let service = Service::new(settings);
    service.run(&cli.command, &cli.args).await
}
