use crate::Error;
use std::path::PathBuf;
use tracing::Level;

/// Default TTL in seconds applied to a cluster's status key once its last
/// connection drops.
pub const DEFAULT_CLUSTER_TIMEOUT: u64 = 900;

/// Default interval in seconds between reconciliation sweeps.
pub const DEFAULT_SWEEP_INTERVAL: u64 = 60;

/// Default directory the composition file paths resolve against.
pub const DEFAULT_CHALLENGE_FOLDER: &str = "/challenges";

/// Process configuration, read once from the environment at startup.
/// Malformed values are fatal.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_hostname: String,
    pub redis_port: u16,
    pub redis_db: i64,
    pub redis_password: Option<String>,
    pub log_level: Level,
    pub log_file: Option<PathBuf>,

    /// Seconds a cluster lingers in the expiring state before teardown.
    pub cluster_timeout: u64,

    /// Seconds between reconciliation sweeps; 0 disables the sweep.
    pub sweep_interval: u64,

    /// Directory the per-challenge composition files are mounted under.
    pub challenge_folder: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    /// Separated from [`Config::from_env`] so tests can supply values
    /// without touching the process environment.
    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        Ok(Config {
            redis_hostname: var("REDIS_HOSTNAME").unwrap_or_else(|| "redis".to_owned()),
            redis_port: parse_var(&var, "REDIS_PORT", 6379)?,
            redis_db: parse_var(&var, "REDIS_DB", 0)?,
            redis_password: var("REDIS_PASSWORD"),
            log_level: match var("LOG_LEVEL") {
                Some(level) => parse_level(&level)?,
                None => Level::INFO,
            },
            log_file: var("LOG_FILE").map(PathBuf::from),
            cluster_timeout: parse_var(&var, "CLUSTER_TIMEOUT", DEFAULT_CLUSTER_TIMEOUT)?,
            sweep_interval: parse_var(&var, "SWEEP_INTERVAL", DEFAULT_SWEEP_INTERVAL)?,
            challenge_folder: var("CHALLENGE_FOLDER")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHALLENGE_FOLDER)),
        })
    }

    /// Connection parameters for the shared database.
    pub fn connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.redis_hostname.clone(), self.redis_port),
            redis: redis::RedisConnectionInfo {
                db: self.redis_db,
                password: self.redis_password.clone(),
                ..Default::default()
            },
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    var: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, Error> {
    match var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::ConfigError(format!("invalid value for {}: {}", name, raw))),
        None => Ok(default),
    }
}

fn parse_level(level: &str) -> Result<Level, Error> {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => Ok(Level::DEBUG),
        "INFO" => Ok(Level::INFO),
        "WARNING" => Ok(Level::WARN),
        "ERROR" => Ok(Level::ERROR),
        _ => Err(Error::ConfigError(format!("invalid log level: {}", level))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, Error> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.redis_hostname, "redis");
        assert_eq!(config.redis_port, 6379);
        assert_eq!(config.redis_db, 0);
        assert_eq!(config.redis_password, None);
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.log_file, None);
        assert_eq!(config.cluster_timeout, 900);
        assert_eq!(config.sweep_interval, 60);
        assert_eq!(config.challenge_folder, PathBuf::from("/challenges"));
    }

    #[test]
    fn test_explicit_values() {
        let config = config_from(&[
            ("REDIS_HOSTNAME", "db.internal"),
            ("REDIS_PORT", "6380"),
            ("REDIS_DB", "2"),
            ("REDIS_PASSWORD", "hunter2"),
            ("LOG_LEVEL", "warning"),
            ("LOG_FILE", "/var/log/manager.log"),
            ("CLUSTER_TIMEOUT", "60"),
            ("SWEEP_INTERVAL", "0"),
            ("CHALLENGE_FOLDER", "/srv/challenges"),
        ])
        .unwrap();
        assert_eq!(config.redis_hostname, "db.internal");
        assert_eq!(config.redis_port, 6380);
        assert_eq!(config.redis_db, 2);
        assert_eq!(config.redis_password.as_deref(), Some("hunter2"));
        assert_eq!(config.log_level, Level::WARN);
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/manager.log")));
        assert_eq!(config.cluster_timeout, 60);
        assert_eq!(config.sweep_interval, 0);
        assert_eq!(config.challenge_folder, PathBuf::from("/srv/challenges"));
    }

    #[test]
    fn test_malformed_values_are_fatal() {
        assert!(config_from(&[("REDIS_PORT", "not-a-port")]).is_err());
        assert!(config_from(&[("REDIS_DB", "zero")]).is_err());
        assert!(config_from(&[("CLUSTER_TIMEOUT", "-1")]).is_err());
        assert!(config_from(&[("LOG_LEVEL", "verbose")]).is_err());
    }

    #[test]
    fn test_connection_info() {
        let config = config_from(&[("REDIS_DB", "1"), ("REDIS_PASSWORD", "s3cret")]).unwrap();
        let info = config.connection_info();
        assert_eq!(info.redis.db, 1);
        assert_eq!(info.redis.password.as_deref(), Some("s3cret"));
    }
}
