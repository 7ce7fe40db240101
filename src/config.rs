use std::path::PathBuf;
use std::str::FromStr;

use crate::auth::Credentials;

/// Process configuration, read from `COURTD_*` environment variables.
/// Unparseable numbers fall back to their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub credentials: Credentials,
    /// Reject bookings that leave the 07:00–22:00 window.
    pub enforce_opening_hours: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Self {
            bind: or("COURTD_BIND", "0.0.0.0"),
            port: parsed(&lookup, "COURTD_PORT").unwrap_or(5433),
            data_dir: PathBuf::from(or("COURTD_DATA_DIR", "./data")),
            max_connections: parsed(&lookup, "COURTD_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&lookup, "COURTD_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parsed(&lookup, "COURTD_METRICS_PORT"),
            tls_cert: lookup("COURTD_TLS_CERT"),
            tls_key: lookup("COURTD_TLS_KEY"),
            credentials: Credentials {
                admin: or("COURTD_ADMIN_PASSWORD", "admin"),
                staff: or("COURTD_STAFF_PASSWORD", "staff"),
                guest: or("COURTD_GUEST_PASSWORD", "guest"),
            },
            enforce_opening_hours: lookup("COURTD_ENFORCE_OPENING_HOURS")
                .is_some_and(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes")),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("courtd.wal")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}
