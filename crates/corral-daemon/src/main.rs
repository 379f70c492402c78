use clap::Parser;
use corral_core::{ContainerStore, Registry, StateLock};
use corral_daemon::config::SOCKET_ENV;
use corral_daemon::{DaemonConfig, DaemonError, Server, ServerOptions};
use corral_layers::DirectorySource;
use corral_runtime::{check_prereqs, format_missing, select_provider};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "corrald", version, about = "Container supervisor daemon for corral")]
struct Cli {
    /// Path to the daemon config file (default: /etc/corral/daemon.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Socket path; overrides the config file and CORRAL_SOCKET.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Isolation provider: `namespace` or `mock`.
    #[arg(long)]
    provider: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CORRAL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), DaemonError> {
    let mut config = DaemonConfig::resolve(cli.config.as_deref())?
        .with_socket_override(std::env::var_os(SOCKET_ENV).map(PathBuf::from))
        .with_socket_override(cli.socket);
    if let Some(provider) = cli.provider {
        config.provider = provider;
    }

    let _lock = StateLock::try_acquire(&config.lock_path())?
        .ok_or_else(|| DaemonError::Lock(config.state_dir.display().to_string()))?;

    if config.provider == "namespace" {
        let missing = check_prereqs();
        if !missing.is_empty() {
            warn!("{}", format_missing(&missing));
        }
    }

    let provider = select_provider(&config.provider, &config.cgroup_root)
        .map_err(|e| DaemonError::Config(e.to_string()))?;
    info!(
        "corrald starting: provider {}, state {}",
        provider.name(),
        config.state_dir.display()
    );
    let registry = Arc::new(
        Registry::new(
            provider,
            ContainerStore::new(&config.state_dir),
            config.registry_options(),
        )
        .with_layer_source(Arc::new(DirectorySource::new(&config.image_root))),
    );

    let recovering = registry.clone();
    tokio::task::spawn_blocking(move || recovering.recover())
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;

    let server = Server::bind(
        &config.socket_path,
        registry,
        ServerOptions {
            reap_interval: config.reap_interval(),
            detached_stdio: config.detached_stdio(),
        },
    )?;
    server.serve(shutdown_signal()).await?;
    info!("corrald stopped; running containers are picked up on next start");
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}
