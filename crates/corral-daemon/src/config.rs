use crate::DaemonError;
use corral_core::RegistryOptions;
use corral_runtime::{ResourceLimits, StdioMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/corral/daemon.toml";
pub const SOCKET_ENV: &str = "CORRAL_SOCKET";
pub const LOCK_FILE: &str = "corrald.lock";

/// `corrald` settings, read from TOML. Every field is optional.
///
/// ```toml
/// socket_path = "/run/corral.sock"
/// stop_grace_ms = 5000
///
/// [default_limits]
/// memory_bytes = 268435456
/// pids_max = 64
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub state_dir: PathBuf,
    pub cgroup_root: PathBuf,
    /// Root of the `<name>/<tag>/manifest.json` image tree.
    pub image_root: PathBuf,
    /// `namespace` or `mock`.
    pub provider: String,
    pub stop_grace_ms: u64,
    pub reap_interval_ms: u64,
    /// Let detached containers write to the daemon's stdout/stderr instead
    /// of discarding their output.
    pub inherit_stdio: bool,
    pub default_limits: ResourceLimits,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/corral.sock"),
            state_dir: PathBuf::from("/var/lib/corral"),
            cgroup_root: PathBuf::from(corral_runtime::cgroup::DEFAULT_CGROUP_ROOT),
            image_root: PathBuf::from("/var/lib/corral/images"),
            provider: "namespace".to_owned(),
            stop_grace_ms: 3000,
            reap_interval_ms: 500,
            inherit_stdio: false,
            default_limits: ResourceLimits::default(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&content).map_err(|e| match e {
            DaemonError::Config(msg) => DaemonError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, DaemonError> {
        let config: Self =
            toml::from_str(content).map_err(|e| DaemonError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// `explicit` if given, else the system config file if present, else
    /// built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, DaemonError> {
        match explicit {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load(Path::new(DEFAULT_CONFIG_PATH))
            }
            None => Ok(Self::default()),
        }
    }

    #[must_use]
    pub fn with_socket_override(mut self, socket: Option<PathBuf>) -> Self {
        if let Some(path) = socket.filter(|p| !p.as_os_str().is_empty()) {
            self.socket_path = path;
        }
        self
    }

    pub fn validate(&self) -> Result<(), DaemonError> {
        self.default_limits
            .validate()
            .map_err(|e| DaemonError::Config(format!("default_limits: {e}")))?;
        if self.reap_interval_ms == 0 {
            return Err(DaemonError::Config(
                "reap_interval_ms must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE)
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            default_limits: self.default_limits,
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn detached_stdio(&self) -> StdioMode {
        if self.inherit_stdio {
            StdioMode::Inherit
        } else {
            StdioMode::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(DaemonConfig::parse("").unwrap(), DaemonConfig::default());
    }

    #[test]
    fn partial_file_overrides_fields() {
        let config = DaemonConfig::parse(
            r#"
socket_path = "/run/corral.sock"
stop_grace_ms = 5000

[default_limits]
pids_max = 64
"#,
        )
        .unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/corral.sock"));
        assert_eq!(config.registry_options().stop_grace, Duration::from_secs(5));
        assert_eq!(config.default_limits.pids_max, 64);
        assert_eq!(
            config.default_limits.memory_bytes,
            ResourceLimits::default().memory_bytes
        );
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/corral"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = DaemonConfig::parse("sockt_path = \"/x\"").unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let err = DaemonConfig::parse("[default_limits]\ncpu_shares = 1\n").unwrap_err();
        assert!(err.to_string().contains("default_limits"));
    }

    #[test]
    fn zero_reap_interval_is_rejected() {
        assert!(DaemonConfig::parse("reap_interval_ms = 0").is_err());
    }

    #[test]
    fn load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        std::fs::write(&path, "provider = 3").unwrap();
        let err = DaemonConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("daemon.toml"));

        let missing = DaemonConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(missing.to_string().contains("absent.toml"));
    }

    #[test]
    fn socket_override() {
        let config = DaemonConfig::default()
            .with_socket_override(Some(PathBuf::from("/tmp/c.sock")));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/c.sock"));
        let config = config.with_socket_override(Some(PathBuf::new()));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/c.sock"));
        assert_eq!(config.with_socket_override(None).lock_path().file_name().unwrap(), "corrald.lock");
    }

    #[test]
    fn stdio_mode_follows_flag() {
        let mut config = DaemonConfig::default();
        assert_eq!(config.detached_stdio(), StdioMode::Null);
        config.inherit_stdio = true;
        assert_eq!(config.detached_stdio(), StdioMode::Inherit);
    }
}
