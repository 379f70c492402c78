//! Byte relay between an attached client and a container's stdio.
//!
//! Two pumps on their own threads: client → container stdin and container
//! stdout → client. Whichever side closes first ends the session: the other
//! pump gets a short window to drain, then the socket is shut down in both
//! directions. An output pump still blocked on a silent container is left
//! to finish on its own; it exits on the container's next write or exit.

use corral_runtime::ProcessIo;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

const INPUT_DRAIN: Duration = Duration::from_millis(200);
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub to_container: u64,
    pub from_container: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pump {
    Input,
    Output,
}

/// Blocks until the session is over. `pending` holds bytes the client sent
/// after its command line, already consumed from the socket.
pub fn attach(stream: UnixStream, pending: Vec<u8>, io: ProcessIo) -> io::Result<RelayStats> {
    let ProcessIo { stdin, mut stdout } = io;
    let client_in = stream.try_clone()?;
    let mut client_out = stream.try_clone()?;
    let to_container = Arc::new(AtomicU64::new(0));
    let from_container = Arc::new(AtomicU64::new(0));
    let (done_tx, done) = mpsc::channel();

    let input_done = done_tx.clone();
    let input_count = to_container.clone();
    let input = thread::Builder::new()
        .name("corral-attach-in".to_owned())
        .spawn(move || {
            pump_input(client_in, &pending, stdin, &input_count);
            let _ = input_done.send(Pump::Input);
        })?;

    let output_count = from_container.clone();
    thread::Builder::new()
        .name("corral-attach-out".to_owned())
        .spawn(move || {
            if let Err(e) = copy_until_closed(&mut stdout, &mut client_out, &output_count) {
                debug!("attach output ended: {e}");
            }
            // dropping stdout lets a container writing to it see EPIPE
            drop(stdout);
            let _ = done_tx.send(Pump::Output);
        })?;

    // both senders live in the pump threads, so this only fails if both died
    let first = done
        .recv()
        .map_err(|_| io::Error::other("attach pumps vanished"))?;
    match first {
        Pump::Output => {
            let _ = stream.shutdown(Shutdown::Write);
            wait_for(&done, Pump::Input, INPUT_DRAIN);
        }
        Pump::Input => {
            if !wait_for(&done, Pump::Output, OUTPUT_DRAIN) {
                debug!("client closed its input; detaching from silent container output");
            }
        }
    }
    // unblocks whichever pump is still reading the socket
    let _ = stream.shutdown(Shutdown::Both);

    input
        .join()
        .map_err(|_| io::Error::other("attach input pump panicked"))?;
    Ok(RelayStats {
        to_container: to_container.load(Ordering::Relaxed),
        from_container: from_container.load(Ordering::Relaxed),
    })
}

/// True if `pump` reported completion within `window`.
fn wait_for(done: &mpsc::Receiver<Pump>, pump: Pump, window: Duration) -> bool {
    match done.recv_timeout(window) {
        Ok(finished) => finished == pump,
        Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
    }
}

fn pump_input(
    mut client: UnixStream,
    pending: &[u8],
    mut stdin: Box<dyn Write + Send>,
    count: &AtomicU64,
) {
    if !pending.is_empty() {
        if let Err(e) = stdin.write_all(pending).and_then(|()| stdin.flush()) {
            debug!("attach input ended: {e}");
            return;
        }
        count.fetch_add(pending.len() as u64, Ordering::Relaxed);
    }
    if let Err(e) = copy_until_closed(&mut client, &mut stdin, count) {
        debug!("attach input ended: {e}");
    }
    // dropping stdin delivers EOF to the container
    drop(stdin);
}

/// `io::copy` with flushing, treating a peer that went away as a normal end.
fn copy_until_closed<R, W>(reader: &mut R, writer: &mut W, count: &AtomicU64) -> io::Result<()>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = [0u8; 8192];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_disconnect(&e) => break,
            Err(e) => return Err(e),
        };
        match writer.write_all(&buf[..n]).and_then(|()| writer.flush()) {
            Ok(()) => {
                count.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) if is_disconnect(&e) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected
    )
}
