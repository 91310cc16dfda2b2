use std::path::PathBuf;
use std::time::Duration;

use ulid::Ulid;

/// Server settings, read once from `ALLOCD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub revalidate_on_approve: bool,
    /// Registered as the first ADMIN when the directory is empty.
    pub bootstrap_admin: Option<Ulid>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "allocd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
            revalidate_on_approve: true,
            bootstrap_admin: None,
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to the
    /// default with a warning.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();

        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> T {
            match raw {
                None => default,
                Some(s) => s.trim().parse().unwrap_or_else(|_| {
                    tracing::warn!("ignoring unparseable {key}={s}");
                    default
                }),
            }
        }

        let revalidate_on_approve = match get("ALLOCD_REVALIDATE_ON_APPROVE") {
            None => d.revalidate_on_approve,
            Some(s) => parse_bool(&s).unwrap_or_else(|| {
                tracing::warn!("ignoring unparseable ALLOCD_REVALIDATE_ON_APPROVE={s}");
                d.revalidate_on_approve
            }),
        };
        let bootstrap_admin = get("ALLOCD_BOOTSTRAP_ADMIN").and_then(|s| match Ulid::from_string(s.trim()) {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!("ignoring ALLOCD_BOOTSTRAP_ADMIN={s}: not a ULID");
                None
            }
        });

        Self {
            port: parsed("ALLOCD_PORT", get("ALLOCD_PORT"), d.port),
            bind: get("ALLOCD_BIND").unwrap_or(d.bind),
            data_dir: get("ALLOCD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: get("ALLOCD_PASSWORD").unwrap_or(d.password),
            max_connections: parsed("ALLOCD_MAX_CONNECTIONS", get("ALLOCD_MAX_CONNECTIONS"), d.max_connections),
            compact_threshold: parsed(
                "ALLOCD_COMPACT_THRESHOLD",
                get("ALLOCD_COMPACT_THRESHOLD"),
                d.compact_threshold,
            ),
            compact_interval: Duration::from_secs(parsed(
                "ALLOCD_COMPACT_INTERVAL_SECS",
                get("ALLOCD_COMPACT_INTERVAL_SECS"),
                d.compact_interval.as_secs(),
            )),
            tls_cert: get("ALLOCD_TLS_CERT"),
            tls_key: get("ALLOCD_TLS_KEY"),
            metrics_port: get("ALLOCD_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            revalidate_on_approve,
            bootstrap_admin,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("allocd.wal")
    }
}
