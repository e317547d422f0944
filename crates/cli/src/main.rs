mod mcp_commands;

use std::path::PathBuf;

use {
    clap::Parser,
    tracing::debug,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "switchyard", about = "Switchyard: supervise and use MCP tool servers")]
struct Cli {
    #[command(subcommand)]
    command: mcp_commands::McpAction,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// MCP settings file (defaults to the platform config directory).
    #[arg(long, global = true, env = "SWITCHYARD_SETTINGS")]
    settings: Option<PathBuf>,
}

/// Logs go to stderr so command output on stdout stays parseable.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn default_settings_path() -> anyhow::Result<PathBuf> {
    directories::ProjectDirs::from("", "", "switchyard")
        .map(|dirs| dirs.config_dir().join("mcp_settings.json"))
        .ok_or_else(|| anyhow::anyhow!("could not determine a config directory; pass --settings"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    let settings = match cli.settings {
        Some(path) => path,
        None => default_settings_path()?,
    };
    debug!(
        version = env!("CARGO_PKG_VERSION"),
        settings = %settings.display(),
        "switchyard starting"
    );

    mcp_commands::handle_mcp(cli.command, settings).await
}
