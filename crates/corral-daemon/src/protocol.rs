//! Wire format between `corral` and `corrald`.
//!
//! One JSON object per line in each direction. A connection carries exactly
//! one command and one response; an attached `run` then switches the same
//! connection to a raw byte relay.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Read};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound for a single message, newline included.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("message exceeds {} bytes", MAX_MESSAGE_SIZE)]
    MessageTooLarge,
    #[error("connection closed before a message was received")]
    ConnectionClosed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Run,
    List,
    Stop,
    Inspect,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub attach: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
    !*value
}

impl Command {
    fn bare(kind: CommandKind) -> Self {
        Self {
            kind,
            command: String::new(),
            args: Vec::new(),
            id: String::new(),
            attach: false,
            image: None,
        }
    }

    pub fn run(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::bare(CommandKind::Run)
        }
    }

    pub fn list() -> Self {
        Self::bare(CommandKind::List)
    }

    pub fn stop(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::bare(CommandKind::Stop)
        }
    }

    pub fn inspect(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::bare(CommandKind::Inspect)
        }
    }

    pub fn remove(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::bare(CommandKind::Remove)
        }
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    #[must_use]
    pub fn attached(mut self) -> Self {
        self.attach = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Response {
    pub fn ok(data: impl Into<String>) -> Self {
        Self {
            success: true,
            data: data.into(),
            error: String::new(),
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: String::new(),
            error: error.into(),
        }
    }
}

/// Serialize `message` as one newline-terminated line.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode<T: DeserializeOwned>(line: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(line)?)
}

fn check_line(line: Vec<u8>, read: usize) -> Result<Vec<u8>, ProtocolError> {
    if read == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge);
    }
    Ok(line)
}

/// Read one line. A final line without a trailing newline is accepted so
/// that `printf '{...}' | nc -U` style clients work.
pub async fn read_message<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = AsyncReadExt::take(&mut *reader, MAX_MESSAGE_SIZE as u64 + 1);
    let read = AsyncBufReadExt::read_until(&mut limited, b'\n', &mut line).await?;
    check_line(line, read)
}

/// Blocking counterpart of [`read_message`] for the client side.
pub fn read_message_blocking<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut line = Vec::new();
    let mut limited = Read::take(reader.by_ref(), MAX_MESSAGE_SIZE as u64 + 1);
    let read = BufRead::read_until(&mut limited, b'\n', &mut line)?;
    check_line(line, read)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_shape() {
        let json = String::from_utf8(encode(&Command::run("echo", vec!["hello".into()])).unwrap())
            .unwrap();
        assert_eq!(json, "{\"type\":\"run\",\"command\":\"echo\",\"args\":[\"hello\"]}\n");

        let json = String::from_utf8(encode(&Command::list()).unwrap()).unwrap();
        assert_eq!(json, "{\"type\":\"list\"}\n");
    }

    #[test]
    fn minimal_commands_decode() {
        let cmd: Command = decode(br#"{"type":"stop","id":"abc"}"#).unwrap();
        assert_eq!(cmd, Command::stop("abc"));

        let cmd: Command =
            decode(br#"{"type":"run","command":"sh","attach":true,"image":"alpine"}"#).unwrap();
        assert!(cmd.attach);
        assert!(cmd.args.is_empty());
        assert_eq!(cmd.image.as_deref(), Some("alpine"));
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let err = decode::<Command>(br#"{"type":"explode"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
        assert!(err.to_string().starts_with("malformed message:"));
    }

    #[test]
    fn response_skips_empty_fields() {
        let ok = String::from_utf8(encode(&Response::ok("")).unwrap()).unwrap();
        assert_eq!(ok, "{\"success\":true}\n");

        let err: Response = decode(br#"{"success":false,"error":"container not found"}"#).unwrap();
        assert_eq!(err, Response::err("container not found"));
    }

    #[test]
    fn blocking_reader_splits_lines() {
        let mut input = io::Cursor::new(b"{\"a\":1}\nrest".to_vec());
        assert_eq!(read_message_blocking(&mut input).unwrap(), b"{\"a\":1}\n");
        assert_eq!(read_message_blocking(&mut input).unwrap(), b"rest");
        assert!(matches!(
            read_message_blocking(&mut input),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut input = io::Cursor::new(vec![b'x'; MAX_MESSAGE_SIZE + 10]);
        assert!(matches!(
            read_message_blocking(&mut input),
            Err(ProtocolError::MessageTooLarge)
        ));
    }

    #[tokio::test]
    async fn async_reader_matches_blocking() {
        let data = b"{\"type\":\"list\"}\n".to_vec();
        let mut reader = tokio::io::BufReader::new(&data[..]);
        let line = read_message(&mut reader).await.unwrap();
        let cmd: Command = decode(&line).unwrap();
        assert_eq!(cmd, Command::list());
    }
}
