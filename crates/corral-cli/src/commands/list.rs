use super::{json_pretty, request, EXIT_SUCCESS};
use corral_core::ContainerInfo;
use corral_daemon::{Client, Command};
use tracing::debug;

pub fn run(client: &Client, json: bool) -> Result<u8, String> {
    let summary = request(client, &Command::list())?;
    let infos = details(client, &summary)?;

    if json {
        println!("{}", json_pretty(&infos)?);
    } else if infos.is_empty() {
        println!("no containers");
    } else {
        println!("{:<18} {:<9} {:<8} COMMAND", "ID", "STATE", "PID");
        for info in &infos {
            println!("{}", format_row(info));
        }
    }
    Ok(EXIT_SUCCESS)
}

/// Split the daemon's `"<id>, <command line>"` lines.
pub fn parse_summary(data: &str) -> Vec<(&str, &str)> {
    data.lines().filter_map(|l| l.split_once(", ")).collect()
}

fn details(client: &Client, summary: &str) -> Result<Vec<ContainerInfo>, String> {
    let mut infos = Vec::new();
    for (id, _) in parse_summary(summary) {
        match request(client, &Command::inspect(id)) {
            Ok(data) => infos.push(
                serde_json::from_str(&data)
                    .map_err(|e| format!("invalid inspect response for {id}: {e}"))?,
            ),
            // removed between list and inspect
            Err(e) if e == "container not found" => debug!("container {id} vanished"),
            Err(e) => return Err(e),
        }
    }
    Ok(infos)
}

fn format_row(info: &ContainerInfo) -> String {
    let pid = info.pid.map_or_else(|| "-".to_owned(), |p| p.to_string());
    // state's Display ignores width, so pad the rendered string
    let state = info.state.to_string();
    format!("{:<18} {state:<9} {pid:<8} {}", info.id, info.command_line())
}
