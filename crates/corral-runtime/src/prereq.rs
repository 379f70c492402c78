use std::fmt;
use std::path::Path;
use std::process::Command;

const CGROUP2_CONTROLLERS: &str = "/sys/fs/cgroup/cgroup.controllers";

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Safe wrapper around libc::geteuid().
#[allow(unsafe_code)]
fn effective_uid() -> u32 {
    // SAFETY: geteuid() takes no arguments, has no side effects and cannot fail.
    unsafe { libc::geteuid() }
}

/// Check everything the namespace provider needs on this host.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    for (tool, purpose) in [
        ("unshare", "creating pid/mount/net/uts namespaces"),
        ("chroot", "entering the assembled root filesystem"),
        ("mount", "mounting /proc inside the container"),
    ] {
        if !command_exists(tool) {
            missing.push(MissingPrereq {
                name: tool,
                purpose,
                install_hint: "part of util-linux / coreutils (usually pre-installed)",
            });
        }
    }

    if !Path::new(CGROUP2_CONTROLLERS).exists() {
        missing.push(MissingPrereq {
            name: "cgroup v2",
            purpose: "enforcing memory, cpu and pid limits",
            install_hint: "boot with systemd.unified_cgroup_hierarchy=1 or mount cgroup2 at /sys/fs/cgroup",
        });
    }

    if effective_uid() != 0 {
        missing.push(MissingPrereq {
            name: "root privileges",
            purpose: "namespace creation and cgroup management",
            install_hint: "run corrald as root",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\ncorrald can start, but containers will fail to launch until these are fixed.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_prereq_display() {
        let m = MissingPrereq {
            name: "unshare",
            purpose: "namespaces",
            install_hint: "apt install util-linux",
        };
        let s = format!("{m}");
        assert!(s.contains("unshare"));
        assert!(s.contains("namespaces"));
        assert!(s.contains("apt install util-linux"));
    }

    #[test]
    fn format_missing_lists_every_item() {
        let items = vec![
            MissingPrereq {
                name: "cgroup v2",
                purpose: "limits",
                install_hint: "mount cgroup2",
            },
            MissingPrereq {
                name: "root privileges",
                purpose: "namespaces",
                install_hint: "run as root",
            },
        ];
        let output = format_missing(&items);
        assert!(output.starts_with("missing prerequisites:"));
        assert!(output.contains("cgroup v2"));
        assert!(output.contains("root privileges"));
    }

    #[test]
    fn check_reports_root_only_when_unprivileged() {
        let missing = check_prereqs();
        let root_missing = missing.iter().any(|m| m.name == "root privileges");
        assert_eq!(root_missing, effective_uid() != 0);
    }
}
