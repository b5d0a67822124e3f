use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::warn;

use crate::cipher::{Cipher, CIPHER_KEY_LEN};
use crate::error::{Result, WorkbenchError};
use crate::models::Connection;

const MAX_SHORT_TTL: u64 = 20 * 60;
const MIN_LONG_TTL: u64 = 23 * 60 * 60;
const MAX_LEASE: u64 = 30 * 60;

/// Process-wide settings, read once at startup.
#[derive(Clone)]
pub struct Config {
    pub cipher_key: Vec<u8>,
    pub mac_key: Vec<u8>,
    pub session_short_ttl: u64,
    pub session_long_ttl: u64,
    pub transaction_lease: u64,
    pub query_row_hard_cap: usize,
    pub sweep_interval: u64,
    pub introspection_dsn: String,
    pub metadata_ttl: u64,
    pub bind_addr: String,
    pub secure_cookies: bool,
    pub query_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cipher_key: Vec::new(),
            mac_key: Vec::new(),
            session_short_ttl: 900,
            session_long_ttl: 86_400,
            transaction_lease: 300,
            query_row_hard_cap: 1_000,
            sweep_interval: 60,
            introspection_dsn: "postgres://postgres@localhost:5432/postgres".to_string(),
            metadata_ttl: 300,
            bind_addr: "127.0.0.1:8080".to_string(),
            secure_cookies: false,
            query_retries: 2,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("session_short_ttl", &self.session_short_ttl)
            .field("session_long_ttl", &self.session_long_ttl)
            .field("transaction_lease", &self.transaction_lease)
            .field("query_row_hard_cap", &self.query_row_hard_cap)
            .field("sweep_interval", &self.sweep_interval)
            .field("metadata_ttl", &self.metadata_ttl)
            .field("bind_addr", &self.bind_addr)
            .field("secure_cookies", &self.secure_cookies)
            .field("query_retries", &self.query_retries)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from any name -> value source. Unset names keep their
    /// defaults; missing keys are replaced by ephemeral ones.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let mut config = Self {
            cipher_key: read("CIPHER_KEY").map(|v| decode_key("CIPHER_KEY", &v)).transpose()?.unwrap_or_default(),
            mac_key: read("MAC_KEY").map(|v| decode_key("MAC_KEY", &v)).transpose()?.unwrap_or_default(),
            session_short_ttl: number(&read, "SESSION_SHORT_TTL", defaults.session_short_ttl)?,
            session_long_ttl: number(&read, "SESSION_LONG_TTL", defaults.session_long_ttl)?,
            transaction_lease: number(&read, "TRANSACTION_LEASE", defaults.transaction_lease)?,
            query_row_hard_cap: number(&read, "QUERY_ROW_HARD_CAP", defaults.query_row_hard_cap)?,
            sweep_interval: number(&read, "SWEEP_INTERVAL", defaults.sweep_interval)?,
            introspection_dsn: read("INTROSPECTION_DSN").unwrap_or(defaults.introspection_dsn),
            metadata_ttl: number(&read, "METADATA_TTL", defaults.metadata_ttl)?,
            bind_addr: read("BIND_ADDR").unwrap_or(defaults.bind_addr),
            secure_cookies: read("SECURE_COOKIES").map_or(Ok(defaults.secure_cookies), |v| flag("SECURE_COOKIES", &v))?,
            query_retries: number(&read, "QUERY_RETRIES", defaults.query_retries)?,
        };

        if config.cipher_key.is_empty() || config.mac_key.is_empty() {
            warn!("CIPHER_KEY or MAC_KEY not set; generated ephemeral keys, sessions will not survive a restart");
            let (cipher_key, mac_key) = Cipher::generate_keys()?;
            if config.cipher_key.is_empty() {
                config.cipher_key = cipher_key;
            }
            if config.mac_key.is_empty() {
                config.mac_key = mac_key;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(WorkbenchError::InputInvalid(msg));
        if self.cipher_key.len() != CIPHER_KEY_LEN {
            return invalid(format!("CIPHER_KEY must be {CIPHER_KEY_LEN} bytes"));
        }
        if self.mac_key.is_empty() {
            return invalid("MAC_KEY must not be empty".to_string());
        }
        if self.session_short_ttl == 0 || self.session_short_ttl > MAX_SHORT_TTL {
            return invalid(format!("SESSION_SHORT_TTL must be within 1..={MAX_SHORT_TTL} seconds"));
        }
        if self.session_long_ttl <= MIN_LONG_TTL {
            return invalid(format!("SESSION_LONG_TTL must exceed {MIN_LONG_TTL} seconds"));
        }
        if self.transaction_lease == 0 || self.transaction_lease > MAX_LEASE {
            return invalid(format!("TRANSACTION_LEASE must be within 1..={MAX_LEASE} seconds"));
        }
        if self.query_row_hard_cap == 0 {
            return invalid("QUERY_ROW_HARD_CAP must be positive".to_string());
        }
        if self.sweep_interval == 0 {
            return invalid("SWEEP_INTERVAL must be positive".to_string());
        }
        self.introspection_connection()?;
        Ok(())
    }

    pub fn introspection_connection(&self) -> Result<Connection> {
        crate::credentials::parse(&self.introspection_dsn)
    }

    /// Often enough to sweep at least once per lease.
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.min(self.transaction_lease).max(1))
    }
}

fn decode_key(name: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| WorkbenchError::InputInvalid(format!("{name} is not valid base64: {e}")))
}

fn number<T: std::str::FromStr>(read: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T> {
    match read(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| WorkbenchError::InputInvalid(format!("{name} must be a non-negative integer, got {raw:?}"))),
        None => Ok(default),
    }
}

fn flag(name: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(WorkbenchError::InputInvalid(format!("{name} must be a boolean, got {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_with_ephemeral_keys() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.cipher_key.len(), CIPHER_KEY_LEN);
        assert!(!config.mac_key.is_empty());
        assert_eq!(config.session_short_ttl, 900);
        assert_eq!(config.session_long_ttl, 86_400);
        assert_eq!(config.transaction_lease, 300);
        assert_eq!(config.query_row_hard_cap, 1_000);
        assert_eq!(config.reaper_interval(), Duration::from_secs(60));
    }

    #[test]
    fn reads_every_variable() {
        let key = STANDARD.encode([9u8; 32]);
        let config = Config::from_lookup(lookup(&[
            ("CIPHER_KEY", key.as_str()),
            ("MAC_KEY", "bWFjLWtleQ=="),
            ("SESSION_SHORT_TTL", "600"),
            ("SESSION_LONG_TTL", "172800"),
            ("TRANSACTION_LEASE", "30"),
            ("QUERY_ROW_HARD_CAP", "250"),
            ("SWEEP_INTERVAL", "90"),
            ("INTROSPECTION_DSN", "postgres://admin:pw@db:6543/main"),
            ("SECURE_COOKIES", "true"),
            ("QUERY_RETRIES", "0"),
        ]))
        .unwrap();
        assert_eq!(config.cipher_key, vec![9u8; 32]);
        assert_eq!(config.mac_key, b"mac-key");
        assert_eq!(config.query_row_hard_cap, 250);
        assert!(config.secure_cookies);
        assert_eq!(config.introspection_connection().unwrap().port, 6543);
        assert_eq!(config.reaper_interval(), Duration::from_secs(30));
        assert!(!format!("{config:?}").contains("admin:pw"));
    }

    #[test]
    fn rejects_out_of_policy_values() {
        for (name, value) in [
            ("SESSION_SHORT_TTL", "1201"),
            ("SESSION_LONG_TTL", "82800"),
            ("TRANSACTION_LEASE", "0"),
            ("TRANSACTION_LEASE", "1801"),
            ("QUERY_ROW_HARD_CAP", "0"),
            ("QUERY_ROW_HARD_CAP", "-5"),
            ("CIPHER_KEY", "c2hvcnQ="),
            ("CIPHER_KEY", "!!"),
            ("INTROSPECTION_DSN", "nonsense"),
            ("SECURE_COOKIES", "maybe"),
        ] {
            assert!(
                matches!(Config::from_lookup(lookup(&[(name, value)])), Err(WorkbenchError::InputInvalid(_))),
                "{name}={value}"
            );
        }
    }
}
