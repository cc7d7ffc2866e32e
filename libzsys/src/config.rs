use serde::Deserialize;
use std::time::Duration;

/// Daemon configuration sourced from `ZSYSD_*` environment variables via
/// `envy`, the same crate and convention used elsewhere in this workspace
/// for loading typed config from the process environment.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    #[serde(default = "default_idle_exit", with = "humantime_serde")]
    pub idle_exit: Duration,

    #[serde(default = "default_startup_grace", with = "humantime_serde")]
    pub startup_grace: Duration,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    #[serde(default)]
    pub verbose: u8,
}

fn default_socket_path() -> String {
    "/run/zsysd.sock".to_string()
}

fn default_idle_exit() -> Duration {
    Duration::from_secs(60)
}

fn default_startup_grace() -> Duration {
    Duration::from_secs(120)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("ZSYSD_").from_env::<Self>()
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            idle_exit: default_idle_exit(),
            startup_grace: default_startup_grace(),
            request_timeout: default_request_timeout(),
            verbose: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert_eq!(config.socket_path, "/run/zsysd.sock");
        assert_eq!(config.idle_exit, Duration::from_secs(60));
    }
}
