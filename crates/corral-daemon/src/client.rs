use crate::protocol::{decode, encode, read_message_blocking, Command, ProtocolError, Response};
use std::io::{BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Blocking client: one connection per request.
#[derive(Debug, Clone)]
pub struct Client {
    socket_path: PathBuf,
}

/// An open attached session: the response has been read and the stream now
/// carries the container's stdio. `buffered` holds output that arrived in
/// the same read as the response line.
pub struct Session {
    pub response: Response,
    pub buffered: Vec<u8>,
    pub stream: UnixStream,
}

impl Client {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn send(&self, command: &Command) -> Result<Response, ProtocolError> {
        Ok(self.open(command)?.response)
    }

    /// Send `command` and keep the connection open after the response.
    pub fn open(&self, command: &Command) -> Result<Session, ProtocolError> {
        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.write_all(&encode(command)?)?;
        stream.flush()?;

        let mut reader = BufReader::new(stream);
        let line = read_message_blocking(&mut reader)?;
        let response = decode(&line)?;
        let buffered = reader.buffer().to_vec();
        Ok(Session {
            response,
            buffered,
            stream: reader.into_inner(),
        })
    }
}
