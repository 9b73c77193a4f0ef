use anyhow::{Context, Result};
use clap::Parser;
use toolgate::config::{ConfigurationResolver, ConnectionArgs};
use toolgate::gateway::GatewaySettings;
use toolgate::stdio_wrapper::StdioWrapper;
use tracing_subscriber::EnvFilter;

/// Management API gateway, stdio transport
///
/// Reads one JSON tool request per line on stdin and writes one JSON result per
/// line on stdout. All requests share the connection described by the arguments.
#[derive(Parser)]
#[command(name = "toolgate")]
#[command(about = "Management API gateway - stdio transport")]
struct Args {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Maximum show-task polls per script run
    #[arg(long, default_value_t = toolgate::task::DEFAULT_MAX_RETRIES)]
    max_task_polls: u32,
}

fn main() -> Result<()> {
    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = ConfigurationResolver::from_args(&args.connection)
        .context("invalid connection settings")?;
    let settings = GatewaySettings {
        max_task_polls: args.max_task_polls,
        ..Default::default()
    };

    let wrapper = StdioWrapper::with_configuration(config, settings)?;
    wrapper.run()?;

    Ok(())
}
