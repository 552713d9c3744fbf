//! mflux - command-line client for Mediaflux servers
//!
//! Runs one action against the server: logon, execute, logoff.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use mflux_client::Connection;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Namespace used when none is configured.
const DEFAULT_NAMESPACE: &str = "/acme";

#[derive(Parser)]
#[command(name = "mflux")]
#[command(about = "Command-line client for Mediaflux servers")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "MF_CONFIG")]
    config: Option<PathBuf>,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Transport: http or https
    #[arg(long)]
    transport: Option<String>,

    /// Forward proxy as [user:password@]host:port
    #[arg(long)]
    proxy: Option<String>,

    /// Asset namespace for created assets
    #[arg(short, long)]
    namespace: Option<String>,

    /// Path to CA certificate for server verification
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
#[command(allow_external_subcommands = true)]
pub(crate) enum Commands {
    /// Print the server version
    MfVersion,

    /// Create an asset, with the content of FILE if given
    Create {
        file: Option<PathBuf>,
    },

    /// Print asset metadata, or save its content to FILE
    Get {
        /// Asset id
        id: String,
        output: Option<PathBuf>,
    },

    /// Replace the note in an asset's metadata
    Update {
        /// Asset id
        id: String,
    },

    /// Compare local files with uploaded assets by CRC32
    CheckUpload {
        directory: PathBuf,
        /// Destination namespace (defaults to the configured one)
        namespace: Option<String>,
    },

    #[command(external_subcommand)]
    Other(Vec<String>),
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        Some(Commands::Other(args)) => {
            println!("{}", commands::unknown_action(&args));
            return Ok(());
        }
        None => {
            println!("{}", commands::usage());
            return Ok(());
        }
        Some(cmd) => cmd,
    };

    let mut config = Config::load(cli.config.as_deref()).map_err(|e| {
        eprintln!("{}: {}", "Configuration error".red(), e);
        e
    })?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(transport) = cli.transport {
        config.server.transport = transport;
    }
    if let Some(proxy) = cli.proxy {
        config.proxy = Some(proxy);
    }
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if let Some(ca_cert) = cli.ca_cert {
        config.tls.ca_cert_path = Some(ca_cert);
    }
    config.tls.insecure |= cli.insecure;
    if config.namespace.is_empty() {
        config.namespace = DEFAULT_NAMESPACE.to_string();
    }

    let conn = Connection::new(config.connection_config()?);
    tracing::info!(
        "Connecting to {}:{} domain {} as user {}",
        config.server.host,
        config.server.port,
        config.auth.domain.as_deref().unwrap_or("-"),
        config.auth.user.as_deref().unwrap_or("-")
    );
    conn.open().map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    let result = commands::execute(&conn, command, &config.namespace);
    conn.close();

    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
