//! Daemon configuration.
//!
//! Loaded from a YAML file (path given as the first CLI argument, with a
//! system-wide default). Missing sections and zero values fall back to the
//! documented defaults.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Default location of the daemon configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sdlab/sdlab.conf";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error reading file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("error parsing configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Control-socket listener settings.
///
/// `user` and `group` are numeric ids; name resolution happens outside the
/// daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocketConf {
    pub enable: bool,
    pub path: String,
    pub user: Option<u32>,
    pub group: Option<u32>,
    pub mode: u32,
}

impl Default for SocketConf {
    fn default() -> Self {
        Self {
            enable: false,
            path: "/run/sdlab.sock".to_string(),
            user: None,
            group: None,
            mode: 0o777,
        }
    }
}

/// TCP listener settings; `listen` is a `host:port` address.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TcpConf {
    pub enable: bool,
    pub listen: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct I2cConf {
    pub buses: Vec<u32>,
}

/// Series engine limits: per-series buffer capacity and the maximum number
/// of concurrently tracked series.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SeriesConf {
    pub buffer: usize,
    pub pool: usize,
}

impl Default for SeriesConf {
    fn default() -> Self {
        Self {
            buffer: 100,
            pool: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConf {
    pub path: String,
}

impl Default for MonitorConf {
    fn default() -> Self {
        Self {
            path: "/var/lib/sdlab/monitor".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConf {
    #[serde(rename = "type")]
    pub backend: String,
    pub dsn: String,
}

impl Default for DatabaseConf {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            dsn: "/data/sdlab.db".to_string(),
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket: SocketConf,
    pub tcp: TcpConf,
    pub sensors_path: String,
    pub i2c: I2cConf,
    pub series: SeriesConf,
    pub monitor: MonitorConf,
    pub database: DatabaseConf,
    /// Log file path; empty means stderr.
    pub log: String,
}

impl Config {
    /// Load configuration from a YAML file and apply defaults for any
    /// empty or zero fields.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut cfg: Config = serde_yaml::from_str(&text)?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Replace empty/zero fields with the documented defaults.
    fn normalize(&mut self) {
        if self.socket.path.is_empty() {
            self.socket.path = SocketConf::default().path;
        }
        if self.socket.mode == 0 {
            self.socket.mode = SocketConf::default().mode;
        }
        if self.sensors_path.is_empty() {
            self.sensors_path = "/etc/sdlab/sensors.d".to_string();
        }
        if self.series.buffer == 0 {
            self.series.buffer = SeriesConf::default().buffer;
        }
        if self.series.pool == 0 {
            self.series.pool = SeriesConf::default().pool;
        }
        if self.monitor.path.is_empty() {
            self.monitor.path = MonitorConf::default().path;
        }
        if self.database.backend.is_empty() {
            self.database.backend = DatabaseConf::default().backend;
        }
        if self.database.dsn.is_empty() {
            self.database.dsn = DatabaseConf::default().dsn;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert!(!cfg.socket.enable);
        assert_eq!(cfg.socket.mode, 0o777);
        assert_eq!(cfg.series.buffer, 100);
        assert_eq!(cfg.series.pool, 50);
        assert_eq!(cfg.database.backend, "sqlite");
        assert_eq!(cfg.database.dsn, "/data/sdlab.db");
    }

    #[test]
    fn test_load_and_normalize() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "socket:\n  enable: true\n  path: \"\"\ntcp:\n  enable: true\n  listen: 127.0.0.1:4242\nseries:\n  buffer: 4\ndatabase:\n  dsn: /tmp/lab.db\n"
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert!(cfg.socket.enable);
        // empty path falls back to the default
        assert_eq!(cfg.socket.path, "/run/sdlab.sock");
        assert_eq!(cfg.tcp.listen, "127.0.0.1:4242");
        assert_eq!(cfg.series.buffer, 4);
        assert_eq!(cfg.series.pool, 50);
        assert_eq!(cfg.database.dsn, "/tmp/lab.db");
        assert_eq!(cfg.sensors_path, "/etc/sdlab/sensors.d");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load("/nonexistent/sdlab.conf").is_err());
    }
}
