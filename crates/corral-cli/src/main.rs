mod commands;

use clap::{Parser, Subcommand};
use commands::{EXIT_DAEMON_UNREACHABLE, EXIT_FAILURE, UNREACHABLE_PREFIX};
use corral_daemon::config::SOCKET_ENV;
use corral_daemon::Client;
use std::path::PathBuf;
use std::process::ExitCode;

const DEFAULT_SOCKET: &str = "/var/run/corral.sock";

#[derive(Debug, Parser)]
#[command(name = "corral", version, about = "Run and manage corral containers")]
struct Cli {
    /// Path to the corrald socket (default: $CORRAL_SOCKET or /var/run/corral.sock).
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a command in a new container and print its id.
    Run {
        /// Assemble the rootfs from this image (`name[:tag]`).
        #[arg(long)]
        image: Option<String>,
        /// Stay connected and relay stdin/stdout to the container.
        #[arg(short, long, default_value_t = false)]
        attach: bool,
        /// Program to run.
        command: String,
        /// Arguments passed to the program.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// List containers known to the daemon.
    #[command(alias = "ls")]
    List {
        /// Print JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Stop a container (SIGTERM, then SIGKILL after the grace period).
    Stop {
        /// Container id.
        id: String,
    },
    /// Show a container's details as JSON.
    Inspect {
        /// Container id.
        id: String,
    },
    /// Remove a stopped container and its root filesystem.
    #[command(name = "rm")]
    Remove {
        /// Container id.
        id: String,
        /// Stop the container first if it is still running.
        #[arg(short, long, default_value_t = false)]
        force: bool,
    },
}

fn socket_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(SOCKET_ENV).map(PathBuf::from))
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CORRAL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let client = Client::new(socket_path(cli.socket));

    let result = match cli.command {
        Commands::Run {
            image,
            attach,
            command,
            args,
        } => commands::run::run(&client, &command, &args, image.as_deref(), attach),
        Commands::List { json } => commands::list::run(&client, json),
        Commands::Stop { id } => commands::stop::run(&client, &id),
        Commands::Inspect { id } => commands::inspect::run(&client, &id),
        Commands::Remove { id, force } => commands::remove::run(&client, &id, force),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with(UNREACHABLE_PREFIX) {
                EXIT_DAEMON_UNREACHABLE
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
