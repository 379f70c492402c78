use super::{request, EXIT_SUCCESS};
use corral_daemon::{Client, Command};

pub fn run(client: &Client, id: &str) -> Result<u8, String> {
    request(client, &Command::stop(id))?;
    println!("stopped container {id}");
    Ok(EXIT_SUCCESS)
}
