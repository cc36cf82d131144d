//! orchard-host — local development orchestrator.
//!
//! Brings up the backing resources declared in `orchard.toml` in dependency
//! order, waits until each one is ready, binds their connection facts into
//! the application's environment, and launches the application.
//!
//! # Usage
//!
//! ```text
//! orchard-host run -c orchard.toml --param admin-password=...
//! orchard-host plan -c orchard.toml --format json
//! orchard-host migrate -c orchard.toml --tenant Default
//! orchard-host status -c orchard.toml
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;
mod exit;

#[derive(Parser)]
#[command(
    name = "orchard-host",
    about = "Orchard host — start backing resources and launch the application",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log output format: text or json.
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start every resource, provision tenants and launch the application.
    Run {
        #[arg(short, long, default_value = "orchard.toml")]
        config: PathBuf,

        /// Override `[bootstrap].state_dir`.
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Parameter value, `name=value`. Repeatable.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Validate the configuration and print the startup order.
    Plan {
        #[arg(short, long, default_value = "orchard.toml")]
        config: PathBuf,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Apply a tenant's recipe once. Run by the application on first start.
    Migrate {
        #[arg(short, long, default_value = "orchard.toml")]
        config: PathBuf,

        #[arg(long)]
        tenant: String,

        /// Recipe name; defaults to the tenant's configured recipe.
        #[arg(long)]
        recipe: Option<String>,

        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
    /// Print persisted resource identities and tenant migration records.
    Status {
        #[arg(short, long, default_value = "orchard.toml")]
        config: PathBuf,

        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected name=value, got '{s}'")),
    }
}

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,orchard=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        "json" => builder.json().init(),
        _ => builder.init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_format);

    let result = match cli.command {
        Command::Run {
            config,
            state_dir,
            params,
        } => commands::run::run(&config, state_dir, params).await,
        Command::Plan { config, format } => commands::plan::plan(&config, &format),
        Command::Migrate {
            config,
            tenant,
            recipe,
            state_dir,
        } => commands::migrate::migrate(&config, &tenant, recipe.as_deref(), state_dir).await,
        Command::Status { config, state_dir } => commands::status::status(&config, state_dir),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit::code_for(&e))
        }
    }
}
