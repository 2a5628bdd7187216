// Copyright (C) 2026 Capstan Contributors
// SPDX-License-Identifier: Apache-2.0
//! Configuration loading from environment variables.

use std::time::Duration;

/// Store calls are retried this many times on transient failures.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Fixed delay between retry attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Capstan core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Worker pool size for fork fan-out
    pub fork_pool_size: usize,
    /// How often the wait watcher re-evaluates open conditions
    pub wait_poll_interval: Duration,
    /// Delay between status polls in synchronous (blocking) waits
    pub sync_poll_delay: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CAPSTAN_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `CAPSTAN_FORK_POOL_SIZE`: fork worker pool size (default: 8)
    /// - `CAPSTAN_WAIT_POLL_INTERVAL_SECS`: watcher poll interval (default: 5)
    /// - `CAPSTAN_SYNC_POLL_DELAY_SECS`: blocking-wait poll delay (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CAPSTAN_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CAPSTAN_DATABASE_URL"))?;

        let fork_pool_size: usize = std::env::var("CAPSTAN_FORK_POOL_SIZE")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CAPSTAN_FORK_POOL_SIZE", "must be a positive integer")
            })?;
        if fork_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "CAPSTAN_FORK_POOL_SIZE",
                "must be a positive integer",
            ));
        }

        let wait_poll_interval_secs: u64 = std::env::var("CAPSTAN_WAIT_POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "CAPSTAN_WAIT_POLL_INTERVAL_SECS",
                    "must be a positive integer",
                )
            })?;

        let sync_poll_delay_secs: u64 = std::env::var("CAPSTAN_SYNC_POLL_DELAY_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "CAPSTAN_SYNC_POLL_DELAY_SECS",
                    "must be a positive integer",
                )
            })?;

        Ok(Self {
            database_url,
            fork_pool_size,
            wait_poll_interval: Duration::from_secs(wait_poll_interval_secs),
            sync_poll_delay: Duration::from_secs(sync_poll_delay_secs),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CAPSTAN_DATABASE_URL", "sqlite:capstan.db");
        guard.remove("CAPSTAN_FORK_POOL_SIZE");
        guard.remove("CAPSTAN_WAIT_POLL_INTERVAL_SECS");
        guard.remove("CAPSTAN_SYNC_POLL_DELAY_SECS");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite:capstan.db");
        assert_eq!(config.fork_pool_size, 8);
        assert_eq!(config.wait_poll_interval, Duration::from_secs(5));
        assert_eq!(config.sync_poll_delay, Duration::from_secs(5));
    }

    #[test]
    fn custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CAPSTAN_DATABASE_URL", "postgres://localhost/capstan");
        guard.set("CAPSTAN_FORK_POOL_SIZE", "32");
        guard.set("CAPSTAN_WAIT_POLL_INTERVAL_SECS", "1");
        guard.set("CAPSTAN_SYNC_POLL_DELAY_SECS", "2");

        let config = Config::from_env().unwrap();

        assert_eq!(config.fork_pool_size, 32);
        assert_eq!(config.wait_poll_interval, Duration::from_secs(1));
        assert_eq!(config.sync_poll_delay, Duration::from_secs(2));
    }

    #[test]
    fn missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("CAPSTAN_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CAPSTAN_DATABASE_URL")));
    }

    #[test]
    fn zero_pool_size_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CAPSTAN_DATABASE_URL", "sqlite:capstan.db");
        guard.set("CAPSTAN_FORK_POOL_SIZE", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("CAPSTAN_FORK_POOL_SIZE", _)
        ));
    }

    #[test]
    fn invalid_poll_interval_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CAPSTAN_DATABASE_URL", "sqlite:capstan.db");
        guard.set("CAPSTAN_WAIT_POLL_INTERVAL_SECS", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("CAPSTAN_WAIT_POLL_INTERVAL_SECS", _)
        ));
    }
}
