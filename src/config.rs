use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the session root.
pub const ENV_SESSION_ROOT: &str = "CONDUCTOR_SESSION_ROOT";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Directory sessions are created in and listed from
    #[serde(default = "paths::default_session_root")]
    pub session_root: PathBuf,
    /// Directory for the control and client bus sockets
    #[serde(default = "paths::default_runtime_dir")]
    pub runtime_dir: PathBuf,
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Daemon log file; stderr when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Bounded waits, in milliseconds.
///
/// Each can be overridden with `CONDUCTOR_<NAME>_MS`, e.g. `CONDUCTOR_QUIT_MS`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Timeouts {
    /// Launch until announce
    #[serde(default = "default_announce_ms")]
    pub announce_ms: u64,
    /// Open request until reply, and one client's save until ack
    #[serde(default = "default_reply_ms")]
    pub reply_ms: u64,
    /// Whole save fan-out
    #[serde(default = "default_save_all_ms")]
    pub save_all_ms: u64,
    /// Quit request until exit, before SIGKILL
    #[serde(default = "default_quit_ms")]
    pub quit_ms: u64,
    /// SIGKILL until the exit is observed
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_announce_ms() -> u64 {
    10_000
}

fn default_reply_ms() -> u64 {
    10_000
}

fn default_save_all_ms() -> u64 {
    30_000
}

fn default_quit_ms() -> u64 {
    5_000
}

fn default_kill_grace_ms() -> u64 {
    2_000
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            announce_ms: default_announce_ms(),
            reply_ms: default_reply_ms(),
            save_all_ms: default_save_all_ms(),
            quit_ms: default_quit_ms(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

impl Timeouts {
    pub fn announce(&self) -> Duration {
        Duration::from_millis(self.announce_ms)
    }

    pub fn reply(&self) -> Duration {
        Duration::from_millis(self.reply_ms)
    }

    pub fn save_all(&self) -> Duration {
        Duration::from_millis(self.save_all_ms)
    }

    pub fn quit(&self) -> Duration {
        Duration::from_millis(self.quit_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    fn fields_mut(&mut self) -> [(&'static str, &mut u64); 5] {
        [
            ("ANNOUNCE", &mut self.announce_ms),
            ("REPLY", &mut self.reply_ms),
            ("SAVE_ALL", &mut self.save_all_ms),
            ("QUIT", &mut self.quit_ms),
            ("KILL_GRACE", &mut self.kill_grace_ms),
        ]
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            session_root: paths::default_session_root(),
            runtime_dir: paths::default_runtime_dir(),
            timeouts: Timeouts::default(),
            log_file: None,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, else `~/.conductor/config.yaml` if it exists, else
    /// defaults. Environment overrides are applied on top.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => match paths::default_config_path() {
                Ok(default) if default.is_file() => Self::load(&default)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var(ENV_SESSION_ROOT) {
            if !root.is_empty() {
                self.session_root = PathBuf::from(root);
            }
        }
        for (name, value) in self.timeouts.fields_mut() {
            let var = format!("CONDUCTOR_{}_MS", name);
            if let Ok(raw) = std::env::var(&var) {
                *value = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{} must be a number of milliseconds, got {:?}", var, raw))?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.timeouts;
        for (name, value) in [
            ("announce_ms", t.announce_ms),
            ("reply_ms", t.reply_ms),
            ("save_all_ms", t.save_all_ms),
            ("quit_ms", t.quit_ms),
            ("kill_grace_ms", t.kill_grace_ms),
        ] {
            if value == 0 {
                anyhow::bail!("Timeout '{}' must be greater than zero", name);
            }
        }
        if t.save_all_ms < t.reply_ms {
            anyhow::bail!(
                "save_all_ms ({}) must not be shorter than reply_ms ({})",
                t.save_all_ms,
                t.reply_ms
            );
        }
        Ok(())
    }

    pub fn control_socket_path(&self) -> PathBuf {
        paths::control_socket_path(&self.runtime_dir, &self.session_root)
    }

    pub fn bus_socket_path(&self) -> PathBuf {
        paths::bus_socket_path(&self.runtime_dir, &self.session_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "session_root: /srv/sessions\ntimeouts:\n  quit_ms: 1500\n",
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.session_root, PathBuf::from("/srv/sessions"));
        assert_eq!(config.timeouts.quit(), Duration::from_millis(1500));
        assert_eq!(config.timeouts.announce_ms, 10_000);
        assert_eq!(config.timeouts.kill_grace_ms, 2_000);
    }

    #[test]
    fn test_validation_rejects_bad_timeouts() {
        let mut config = DaemonConfig::default();
        config.timeouts.announce_ms = 0;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.timeouts.save_all_ms = 500;
        config.timeouts.reply_ms = 1_000;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("save_all_ms"));
    }

    #[test]
    fn test_invalid_yaml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "timeouts: [not, a, map]").unwrap();
        let err = format!("{:#}", DaemonConfig::load(&path).unwrap_err());
        assert!(err.contains("config.yaml"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("CONDUCTOR_QUIT_MS", "250");
        std::env::set_var(ENV_SESSION_ROOT, "/tmp/conductor-env-root");
        let mut config = DaemonConfig::default();
        let result = config.apply_env_overrides();
        std::env::remove_var("CONDUCTOR_QUIT_MS");
        std::env::remove_var(ENV_SESSION_ROOT);

        result.unwrap();
        assert_eq!(config.timeouts.quit_ms, 250);
        assert_eq!(config.session_root, PathBuf::from("/tmp/conductor-env-root"));
    }

    #[test]
    #[serial]
    fn test_env_override_must_be_numeric() {
        std::env::set_var("CONDUCTOR_REPLY_MS", "soon");
        let mut config = DaemonConfig::default();
        let result = config.apply_env_overrides();
        std::env::remove_var("CONDUCTOR_REPLY_MS");
        assert!(result.is_err());
    }
}
