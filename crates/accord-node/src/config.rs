//! Node configuration, read from `ACCORD_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use accord_identity::Id;
use accord_subjectivity::SubjectivityConfig;

use crate::error::{Error, Result};

/// Configuration for an Accord node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// P2P listen address
    pub p2p_addr: SocketAddr,

    /// Address announced to peers; defaults to the bound p2p address
    pub advertise_addr: Option<SocketAddr>,

    /// HTTP status API listen address
    pub api_addr: SocketAddr,

    /// Peers to introduce ourselves to at startup (host:port)
    pub bootstrap_peers: Vec<String>,

    pub node_number: u64,

    /// User administering this node
    pub administrator: Id,

    /// Write a genesis core if none is stored
    pub genesis: bool,

    /// How often catch-up machines tick
    pub catch_up_interval: Duration,

    /// How often the majority is re-sampled
    pub majority_interval: Duration,

    /// Neighbors asked for state hashes per sample
    pub majority_sample: usize,

    /// Per-request deadline on the wire
    pub request_timeout: Duration,

    pub subjectivity: SubjectivityConfig,
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`NodeConfig::from_env`], reading variables through `var`.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir =
            PathBuf::from(var("ACCORD_DATA_DIR").unwrap_or_else(|| "./accord-data".to_string()));

        let advertise_addr = match var("ACCORD_ADVERTISE_ADDR") {
            Some(raw) => Some(parse("ACCORD_ADVERTISE_ADDR", &raw)?),
            None => None,
        };

        let bootstrap_peers = var("ACCORD_BOOTSTRAP_PEERS")
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let genesis = match var("ACCORD_GENESIS").as_deref() {
            None | Some("") | Some("0") | Some("false") => false,
            Some("1") | Some("true") => true,
            Some(other) => {
                return Err(Error::Config(format!("ACCORD_GENESIS: expected true/false, got {other}")))
            }
        };

        let catch_up_interval = millis(&var, "ACCORD_CATCH_UP_INTERVAL_MS", 5_000)?;
        let majority_interval = millis(&var, "ACCORD_MAJORITY_INTERVAL_MS", 30_000)?;
        let request_timeout = millis(&var, "ACCORD_REQUEST_TIMEOUT_MS", 10_000)?;
        if catch_up_interval.is_zero() || majority_interval.is_zero() || request_timeout.is_zero() {
            return Err(Error::Config("intervals and timeouts must be positive".into()));
        }

        Ok(Self {
            data_dir,
            p2p_addr: or_default(&var, "ACCORD_P2P_ADDR", "0.0.0.0:9000")?,
            advertise_addr,
            api_addr: or_default(&var, "ACCORD_API_ADDR", "0.0.0.0:8080")?,
            bootstrap_peers,
            node_number: or_default(&var, "ACCORD_NODE_NUMBER", "0")?,
            administrator: Id(or_default(&var, "ACCORD_ADMINISTRATOR", "-1")?),
            genesis,
            catch_up_interval,
            majority_interval,
            majority_sample: or_default(&var, "ACCORD_MAJORITY_SAMPLE", "8")?,
            request_timeout,
            subjectivity: SubjectivityConfig::default(),
        })
    }
}

fn parse<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name}: {e} (got {raw:?})")))
}

fn or_default<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => parse(name, &raw),
        None => parse(name, default),
    }
}

fn millis(var: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<Duration> {
    let ms = match var(name) {
        Some(raw) => parse::<u64>(name, &raw)?,
        None => default,
    };
    Ok(Duration::from_millis(ms))
}
