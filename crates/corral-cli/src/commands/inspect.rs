use super::{request, EXIT_SUCCESS};
use corral_daemon::{Client, Command};

pub fn run(client: &Client, id: &str) -> Result<u8, String> {
    println!("{}", request(client, &Command::inspect(id))?);
    Ok(EXIT_SUCCESS)
}
