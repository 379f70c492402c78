use super::{request, unreachable, EXIT_SUCCESS};
use corral_daemon::client::Session;
use corral_daemon::{Client, Command};
use std::io::{self, Write};
use std::net::Shutdown;
use std::thread;
use tracing::debug;

pub fn run(
    client: &Client,
    command: &str,
    args: &[String],
    image: Option<&str>,
    attach: bool,
) -> Result<u8, String> {
    let mut request_cmd = Command::run(command, args.to_vec());
    if let Some(image) = image {
        request_cmd = request_cmd.with_image(image);
    }

    if !attach {
        println!("{}", request(client, &request_cmd)?);
        return Ok(EXIT_SUCCESS);
    }

    let session = client
        .open(&request_cmd.attached())
        .map_err(|e| unreachable(client, &e))?;
    if !session.response.success {
        return Err(session.response.error);
    }
    debug!("attached to container {}", session.response.data);
    relay(session).map_err(|e| format!("attach failed: {e}"))?;
    Ok(EXIT_SUCCESS)
}

/// Our stdin to the container until EOF; container output to our stdout
/// until the daemon closes the connection.
fn relay(session: Session) -> io::Result<()> {
    let Session {
        buffered, stream, ..
    } = session;

    let mut to_daemon = stream.try_clone()?;
    thread::spawn(move || {
        let _ = io::copy(&mut io::stdin().lock(), &mut to_daemon);
        let _ = to_daemon.shutdown(Shutdown::Write);
    });

    let mut stdout = io::stdout().lock();
    stdout.write_all(&buffered)?;
    let mut from_daemon = &stream;
    io::copy(&mut from_daemon, &mut stdout)?;
    stdout.flush()
}
