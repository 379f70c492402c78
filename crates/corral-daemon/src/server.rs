use crate::protocol::{decode, encode, read_message, Command, CommandKind, ProtocolError, Response};
use crate::relay;
use crate::DaemonError;
use corral_core::{ContainerInfo, CoreError, Registry, RunRequest};
use corral_runtime::{ProcessIo, StdioMode};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    pub reap_interval: Duration,
    /// Stdio for containers started without `attach`.
    pub detached_stdio: StdioMode,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_millis(500),
            detached_stdio: StdioMode::Null,
        }
    }
}

pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    registry: Arc<Registry>,
    options: ServerOptions,
}

impl Server {
    /// Bind the socket, replacing a stale socket file left by a previous run.
    /// Must be called from within a tokio runtime.
    pub fn bind(
        socket_path: &Path,
        registry: Arc<Registry>,
        options: ServerOptions,
    ) -> Result<Self, DaemonError> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(socket_path) {
            Ok(()) => debug!("removed stale socket {}", socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(socket_path)?;
        info!("listening on {}", socket_path.display());
        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            registry,
            options,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Accept connections until `shutdown` resolves, then remove the socket.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        let reaper = tokio::spawn(reap_loop(
            self.registry.clone(),
            self.options.reap_interval,
        ));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let registry = self.registry.clone();
                        let stdio = self.options.detached_stdio;
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, registry, stdio).await {
                                debug!("connection ended with error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }

        reaper.abort();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!("failed to remove socket {}: {e}", self.socket_path.display());
        }
        Ok(())
    }
}

async fn reap_loop(registry: Arc<Registry>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let registry = registry.clone();
        match tokio::task::spawn_blocking(move || registry.reap_all()).await {
            Ok(0) => {}
            Ok(n) => debug!("reaped {n} exited containers"),
            Err(e) => warn!("reaper task failed: {e}"),
        }
    }
}

/// Serve one connection: one command, one response, then an optional
/// attach relay.
pub async fn handle_connection(
    stream: UnixStream,
    registry: Arc<Registry>,
    detached_stdio: StdioMode,
) -> Result<(), ProtocolError> {
    let mut reader = BufReader::new(stream);
    let command: Command = match read_message(&mut reader).await {
        Ok(line) => match decode(&line) {
            Ok(command) => command,
            Err(e) => {
                warn!("rejecting request: {e}");
                return write_response(reader.get_mut(), &Response::err(e.to_string())).await;
            }
        },
        Err(ProtocolError::ConnectionClosed) => return Ok(()),
        Err(e @ ProtocolError::MessageTooLarge) => {
            warn!("rejecting request: {e}");
            return write_response(reader.get_mut(), &Response::err(e.to_string())).await;
        }
        Err(e) => return Err(e),
    };
    debug!("request: {:?}", command.kind);

    let outcome =
        tokio::task::spawn_blocking(move || dispatch(&registry, command, detached_stdio)).await;
    let (response, io) = match outcome {
        Ok(result) => result,
        Err(e) => (Response::err(format!("internal error: {e}")), None),
    };
    write_response(reader.get_mut(), &response).await?;

    if let Some(io) = io {
        let pending = reader.buffer().to_vec();
        let stream = reader.into_inner().into_std()?;
        stream.set_nonblocking(false)?;
        let stats = tokio::task::spawn_blocking(move || relay::attach(stream, pending, io))
            .await
            .map_err(|e| io::Error::other(e.to_string()))??;
        debug!(
            "attach finished: {} bytes in, {} bytes out",
            stats.to_container, stats.from_container
        );
    }
    Ok(())
}

async fn write_response(stream: &mut UnixStream, response: &Response) -> Result<(), ProtocolError> {
    stream.write_all(&encode(response)?).await?;
    stream.flush().await?;
    Ok(())
}

/// Execute one command against the registry. Blocking; runs on the
/// blocking pool. Returns the container's stdio for an attached `run`.
pub fn dispatch(
    registry: &Registry,
    command: Command,
    detached_stdio: StdioMode,
) -> (Response, Option<ProcessIo>) {
    match command.kind {
        CommandKind::Run => run(registry, command, detached_stdio),
        CommandKind::List => (Response::ok(format_list(&registry.list())), None),
        CommandKind::Stop => (
            respond(require_id(&command).and_then(|id| registry.stop(id).map(|_| String::new()))),
            None,
        ),
        CommandKind::Inspect => (
            respond(require_id(&command).and_then(|id| {
                let info = registry.inspect(id)?;
                Ok(serde_json::to_string_pretty(&info)?)
            })),
            None,
        ),
        CommandKind::Remove => (
            respond(require_id(&command).and_then(|id| registry.remove(id).map(|()| String::new()))),
            None,
        ),
    }
}

fn run(
    registry: &Registry,
    command: Command,
    detached_stdio: StdioMode,
) -> (Response, Option<ProcessIo>) {
    let attach = command.attach;
    let mut request = RunRequest::new(command.command, command.args);
    request.image = command.image;
    request.stdio = if attach {
        StdioMode::Piped
    } else {
        detached_stdio
    };

    match registry.run(request) {
        Ok(container) => {
            let io = if attach { container.take_io() } else { None };
            (Response::ok(container.id()), io)
        }
        Err(e) => (Response::err(e.to_string()), None),
    }
}

fn require_id(command: &Command) -> Result<&str, CoreError> {
    if command.id.trim().is_empty() {
        Err(CoreError::Argument("missing container id".to_owned()))
    } else {
        Ok(command.id.trim())
    }
}

fn respond(result: Result<String, CoreError>) -> Response {
    match result {
        Ok(data) => Response::ok(data),
        Err(e) => {
            debug!("request failed: {e}");
            Response::err(e.to_string())
        }
    }
}

/// `"<id>, <command line>"` per container, newline separated.
pub fn format_list(containers: &[ContainerInfo]) -> String {
    containers
        .iter()
        .map(|c| format!("{}, {}", c.id, c.command_line()))
        .collect::<Vec<_>>()
        .join("\n")
}
