//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Workflow frontend with mutual-TLS authentication and pluggable authorization
#[derive(Parser, Debug)]
#[command(name = "flowgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "FLOWGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// RPC listen address (overrides frontend.rpc.address)
    #[arg(long, env = "FLOWGATE_RPC_ADDRESS")]
    pub rpc_address: Option<String>,

    /// HTTP gateway listen address (overrides frontend.http.address)
    #[arg(long, env = "FLOWGATE_HTTP_ADDRESS")]
    pub http_address: Option<String>,

    /// Disable the HTTP gateway
    #[arg(long)]
    pub no_http: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "FLOWGATE_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "FLOWGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start both frontends (default)
    Serve,

    /// Certificate tooling
    #[command(subcommand)]
    Tls(TlsCommand),
}

/// TLS subcommands
#[derive(Subcommand, Debug)]
pub enum TlsCommand {
    /// Generate a self-signed CA
    InitCa {
        /// Common Name of the CA
        #[arg(long, default_value = "flowgate Root CA")]
        cn: String,

        /// Validity in days
        #[arg(long, default_value_t = 3650)]
        days: u32,

        /// Output directory (writes ca.crt / ca.key)
        #[arg(short, long, default_value = "tls")]
        out: PathBuf,
    },

    /// Issue a server or client certificate signed by the CA
    Issue {
        /// Common Name
        #[arg(long, required = true)]
        cn: String,

        /// Organization
        #[arg(long)]
        org: Option<String>,

        /// Organizational Unit
        #[arg(long)]
        ou: Option<String>,

        /// Subject Alternative Name (DNS name or IP, repeatable)
        #[arg(long = "san")]
        sans: Vec<String>,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: u32,

        /// CA certificate
        #[arg(long, default_value = "tls/ca.crt")]
        ca_cert: PathBuf,

        /// CA private key
        #[arg(long, default_value = "tls/ca.key")]
        ca_key: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "tls")]
        out: PathBuf,

        /// File stem for the output (`<name>.crt` / `<name>.key`)
        #[arg(long, required = true)]
        name: String,
    },
}
