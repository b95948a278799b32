use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once at start-up from `ROOST_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "roost".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            port: parse(lookup("ROOST_PORT")).unwrap_or(d.port),
            bind: lookup("ROOST_BIND").unwrap_or(d.bind),
            data_dir: lookup("ROOST_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("ROOST_PASSWORD").unwrap_or(d.password),
            max_connections: parse(lookup("ROOST_MAX_CONNECTIONS")).unwrap_or(d.max_connections),
            compact_threshold: parse(lookup("ROOST_COMPACT_THRESHOLD")).unwrap_or(d.compact_threshold),
            metrics_port: parse(lookup("ROOST_METRICS_PORT")),
            tls_cert: lookup("ROOST_TLS_CERT"),
            tls_key: lookup("ROOST_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}
