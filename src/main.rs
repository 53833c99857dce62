//! flowgate - workflow frontend with mutual TLS

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use flowgate::{
    cli::{Cli, Command, TlsCommand},
    config::Config,
    frontend::Frontend,
    mtls::{CaParams, CertGenerator, LeafCertParams, TlsConfigProvider},
    pipeline::{AuthPipeline, PluggableHooks},
    service::{WorkflowService, default_registry},
    setup_tracing,
};

/// Time allowed for in-flight calls to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Tls(ref tls_cmd)) => run_tls_command(tls_cmd),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Run certificate tooling
fn run_tls_command(cmd: &TlsCommand) -> ExitCode {
    match cmd {
        TlsCommand::InitCa { cn, days, out } => {
            let generated = CertGenerator::init_ca(&CaParams {
                cn,
                validity_days: *days,
            })
            .and_then(|ca| CertGenerator::write_to_dir(&ca, out, "ca"));
            match generated {
                Ok(()) => {
                    println!("CA written to {}/ca.crt and {}/ca.key", out.display(), out.display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Failed to generate CA: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        TlsCommand::Issue {
            cn,
            org,
            ou,
            sans,
            days,
            ca_cert,
            ca_key,
            out,
            name,
        } => {
            let issued = read_pem(ca_cert)
                .and_then(|ca_cert_pem| Ok((ca_cert_pem, read_pem(ca_key)?)))
                .and_then(|(ca_cert_pem, ca_key_pem)| {
                    let params = LeafCertParams {
                        cn,
                        organization: org.as_deref(),
                        ou: ou.as_deref(),
                        sans: sans.clone(),
                        validity_days: *days,
                    };
                    CertGenerator::issue_leaf(&params, &ca_cert_pem, &ca_key_pem)
                })
                .and_then(|leaf| CertGenerator::write_to_dir(&leaf, out, name));
            match issued {
                Ok(()) => {
                    println!("Certificate written to {}/{name}.crt", out.display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Failed to issue certificate: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn read_pem(path: &Path) -> flowgate::Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        flowgate::Error::Config(format!("Cannot read '{}': {e}", path.display()))
    })
}

/// Run both frontends until a shutdown signal arrives
async fn run_server(cli: Cli) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(address) = cli.rpc_address {
                config.frontend.rpc.address = address;
            }
            if let Some(address) = cli.http_address {
                config.frontend.http.address = address;
            }
            if cli.no_http {
                config.frontend.http.enabled = false;
            }
            if let Err(e) = config.validate() {
                error!("Invalid configuration: {e}");
                return ExitCode::FAILURE;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        rpc = %config.frontend.rpc.address,
        http = config.frontend.http.enabled.then_some(config.frontend.http.address.as_str()),
        require_client_auth = config.tls.require_client_auth,
        "Starting flowgate"
    );

    let tls = match TlsConfigProvider::from_config(&config.tls) {
        Ok(tls) => Arc::new(tls),
        Err(e) => {
            error!("Failed to load TLS material: {e}");
            return ExitCode::FAILURE;
        }
    };
    if !config.tls.require_client_auth {
        warn!("Client certificates are optional - unauthenticated peers reach the claim mapper");
    }

    let service = WorkflowService::with_namespaces(["default"]);
    let registry = Arc::new(default_registry(&service));
    let pipeline = match AuthPipeline::from_config(&config, registry, PluggableHooks::default()) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            error!("Failed to build auth pipeline: {e}");
            return ExitCode::FAILURE;
        }
    };

    let running = match Frontend::new(config.frontend.clone(), tls, pipeline).start().await {
        Ok(running) => running,
        Err(e) => {
            error!("Failed to start frontends: {e}");
            return ExitCode::FAILURE;
        }
    };

    shutdown_signal().await;

    match running.shutdown(SHUTDOWN_GRACE).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Shutdown error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
