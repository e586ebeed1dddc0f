use clap::Parser;

/// Command-line surface: everything after the program name is the upstream
/// command to supervise. All tuning happens through environment variables.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "thrust",
    about = "TLS-terminating caching reverse proxy for a single upstream process",
    trailing_var_arg = true
)]
pub struct Cli {
    /// Program to launch as the supervised upstream.
    pub command: String,

    /// Arguments passed through to the upstream program.
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,
}
