pub mod inspect;
pub mod list;
pub mod remove;
pub mod run;
pub mod stop;

use corral_daemon::{Client, Command};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_DAEMON_UNREACHABLE: u8 = 3;

/// Prefix of errors that mean the daemon could not be reached at all.
pub const UNREACHABLE_PREFIX: &str = "cannot reach corrald";

/// Send `command` and return the response data, or the daemon's error.
pub fn request(client: &Client, command: &Command) -> Result<String, String> {
    let response = client.send(command).map_err(|e| unreachable(client, &e))?;
    if response.success {
        Ok(response.data)
    } else {
        Err(response.error)
    }
}

pub fn unreachable(client: &Client, e: &dyn std::fmt::Display) -> String {
    format!(
        "{UNREACHABLE_PREFIX} at {}: {e}",
        client.socket_path().display()
    )
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}
