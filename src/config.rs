use std::path::PathBuf;
use std::str::FromStr;

use crate::limits::MAX_CONNECTIONS;

/// Server settings, read once at startup from `SLOTD_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// Login name that gets an admin session.
    pub admin_user: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    /// History older than this many days is purged. 0 keeps everything.
    pub retention_days: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "slotd".into(),
            admin_user: "admin".into(),
            max_connections: MAX_CONNECTIONS,
            compact_threshold: 1000,
            retention_days: 90,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable numeric values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            bind: lookup("SLOTD_BIND").unwrap_or(d.bind),
            port: parse_var(&lookup, "SLOTD_PORT").unwrap_or(d.port),
            data_dir: lookup("SLOTD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("SLOTD_PASSWORD").unwrap_or(d.password),
            admin_user: lookup("SLOTD_ADMIN_USER").unwrap_or(d.admin_user),
            max_connections: parse_var(&lookup, "SLOTD_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(d.max_connections),
            compact_threshold: parse_var(&lookup, "SLOTD_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            retention_days: parse_var(&lookup, "SLOTD_RETENTION_DAYS").unwrap_or(d.retention_days),
            tls_cert: lookup("SLOTD_TLS_CERT"),
            tls_key: lookup("SLOTD_TLS_KEY"),
            metrics_port: parse_var(&lookup, "SLOTD_METRICS_PORT"),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]);
        assert_eq!(c, Config::default());
        assert_eq!(c.addr(), "0.0.0.0:5433");
        assert_eq!(c.wal_path(), PathBuf::from("./data/ledger.wal"));
    }

    #[test]
    fn reads_overrides() {
        let c = config(&[
            ("SLOTD_PORT", "6000"),
            ("SLOTD_DATA_DIR", "/var/lib/slotd"),
            ("SLOTD_ADMIN_USER", "office"),
            ("SLOTD_RETENTION_DAYS", "0"),
            ("SLOTD_METRICS_PORT", "9100"),
            ("SLOTD_TLS_CERT", "cert.pem"),
        ]);
        assert_eq!(c.port, 6000);
        assert_eq!(c.wal_path(), PathBuf::from("/var/lib/slotd/ledger.wal"));
        assert_eq!(c.admin_user, "office");
        assert_eq!(c.retention_days, 0);
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.tls_cert.as_deref(), Some("cert.pem"));
        assert_eq!(c.tls_key, None);
    }

    #[test]
    fn bad_numbers_fall_back() {
        let c = config(&[("SLOTD_PORT", "http"), ("SLOTD_MAX_CONNECTIONS", "0")]);
        assert_eq!(c.port, 5433);
        assert_eq!(c.max_connections, MAX_CONNECTIONS);
    }
}
