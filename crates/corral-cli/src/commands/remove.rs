use super::{request, EXIT_SUCCESS};
use corral_daemon::{Client, Command};

pub fn run(client: &Client, id: &str, force: bool) -> Result<u8, String> {
    if force {
        request(client, &Command::stop(id))?;
    }
    request(client, &Command::remove(id))?;
    println!("removed container {id}");
    Ok(EXIT_SUCCESS)
}
