use anyhow::{anyhow, Result};
use chrono::NaiveTime;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::plate::{PlatePolicy, DEFAULT_PLATE_PATTERN};
use crate::sink::{is_plain_identifier, DEFAULT_DELIVERY_QUEUE, DEFAULT_SINK_TABLE};

const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1";
const DEFAULT_SERVER_PORT: u16 = 3065;
const DEFAULT_BUFFER_PATH: &str = "npr_buffer.db";
const DEFAULT_SINK_DB_PATH: &str = "npr_sink.db";
const DEFAULT_PROBE_ADDR: &str = crate::connectivity::DEFAULT_PROBE_ADDR;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1500;
const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 5000;
const DEFAULT_RECONCILE_SECS: u64 = 600;
const DEFAULT_RECONCILE_MAX_RUN_SECS: u64 = 300;
const DEFAULT_RETENTION_AT: &str = "03:00";

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    listen_addr: Option<String>,
    buffer_path: Option<String>,
    delivery_timeout_ms: Option<u64>,
    delivery_queue: Option<usize>,
    sink: Option<SinkConfigFile>,
    probe: Option<ProbeConfigFile>,
    reconcile: Option<ReconcileConfigFile>,
    retention: Option<RetentionConfigFile>,
    plate: Option<PlateConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SinkConfigFile {
    db_path: Option<String>,
    table: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ProbeConfigFile {
    enabled: Option<bool>,
    addr: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconcileConfigFile {
    interval_secs: Option<u64>,
    max_run_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    at: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PlateConfigFile {
    pattern: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub buffer_path: String,
    pub delivery_timeout: Duration,
    /// Deliveries allowed to wait behind the one in progress.
    pub delivery_queue: usize,
    pub sink: SinkSettings,
    pub probe: ProbeSettings,
    pub reconcile: ReconcileSettings,
    pub retention_at: NaiveTime,
    pub plate_pattern: String,
}

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub db_path: String,
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub enabled: bool,
    pub addr: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub interval: Duration,
    pub max_run: Duration,
}

impl RelayConfig {
    /// Load from `NPR_CONFIG` (if set), then apply environment overrides.
    ///
    /// Variables from the env file (see [`load_env_file`]) count as
    /// environment, but never replace variables already set.
    pub fn load() -> Result<Self> {
        load_env_file()?;
        let config_path = std::env::var("NPR_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        load_env_file()?;
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Result<Self> {
        let listen_addr = file
            .listen_addr
            .unwrap_or_else(|| format!("{}:{}", DEFAULT_SERVER_ADDRESS, DEFAULT_SERVER_PORT));
        let buffer_path = file
            .buffer_path
            .unwrap_or_else(|| DEFAULT_BUFFER_PATH.to_string());
        let delivery_timeout = Duration::from_millis(
            file.delivery_timeout_ms
                .unwrap_or(DEFAULT_DELIVERY_TIMEOUT_MS),
        );
        let delivery_queue = file.delivery_queue.unwrap_or(DEFAULT_DELIVERY_QUEUE);
        let sink = SinkSettings {
            db_path: file
                .sink
                .as_ref()
                .and_then(|sink| sink.db_path.clone())
                .unwrap_or_else(|| DEFAULT_SINK_DB_PATH.to_string()),
            table: file
                .sink
                .and_then(|sink| sink.table)
                .unwrap_or_else(|| DEFAULT_SINK_TABLE.to_string()),
        };
        let probe = ProbeSettings {
            enabled: file
                .probe
                .as_ref()
                .and_then(|probe| probe.enabled)
                .unwrap_or(true),
            addr: file
                .probe
                .as_ref()
                .and_then(|probe| probe.addr.clone())
                .unwrap_or_else(|| DEFAULT_PROBE_ADDR.to_string()),
            timeout: Duration::from_millis(
                file.probe
                    .and_then(|probe| probe.timeout_ms)
                    .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
            ),
        };
        let reconcile = ReconcileSettings {
            interval: Duration::from_secs(
                file.reconcile
                    .as_ref()
                    .and_then(|r| r.interval_secs)
                    .unwrap_or(DEFAULT_RECONCILE_SECS),
            ),
            max_run: Duration::from_secs(
                file.reconcile
                    .and_then(|r| r.max_run_secs)
                    .unwrap_or(DEFAULT_RECONCILE_MAX_RUN_SECS),
            ),
        };
        let retention_at = parse_wall_clock(
            file.retention
                .and_then(|retention| retention.at)
                .as_deref()
                .unwrap_or(DEFAULT_RETENTION_AT),
        )?;
        let plate_pattern = file
            .plate
            .and_then(|plate| plate.pattern)
            .unwrap_or_else(|| DEFAULT_PLATE_PATTERN.to_string());
        Ok(Self {
            listen_addr,
            buffer_path,
            delivery_timeout,
            delivery_queue,
            sink,
            probe,
            reconcile,
            retention_at,
            plate_pattern,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        let address = non_empty_env("SERVER_ADDRESS");
        let port = match non_empty_env("NPR_SERVER_PORT") {
            Some(port) => Some(
                port.parse::<u16>()
                    .map_err(|_| anyhow!("NPR_SERVER_PORT must be a port number"))?,
            ),
            None => None,
        };
        if address.is_some() || port.is_some() {
            let (current_host, current_port) = split_host_port(&self.listen_addr);
            let host = address.unwrap_or(current_host);
            let port = port.or(current_port).unwrap_or(DEFAULT_SERVER_PORT);
            self.listen_addr = format!("{}:{}", host, port);
        }
        if let Some(path) = non_empty_env("NPR_BUFFER_PATH") {
            self.buffer_path = path;
        }
        if let Some(path) = non_empty_env("NPR_SINK_DB") {
            self.sink.db_path = path;
        }
        if let Some(addr) = non_empty_env("NPR_PROBE_ADDR") {
            self.probe.addr = addr;
        }
        if let Some(secs) = non_empty_env("NPR_RECONCILE_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("NPR_RECONCILE_SECS must be an integer number of seconds")
            })?;
            self.reconcile.interval = Duration::from_secs(secs);
        }
        if let Some(at) = non_empty_env("NPR_RETENTION_AT") {
            self.retention_at = parse_wall_clock(&at)?;
        }
        if let Some(pattern) = non_empty_env("NPR_PLATE_PATTERN") {
            self.plate_pattern = pattern;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.reconcile.interval.is_zero() {
            return Err(anyhow!("reconcile interval must be greater than zero"));
        }
        if self.reconcile.max_run.is_zero() {
            return Err(anyhow!("reconcile max run must be greater than zero"));
        }
        if self.delivery_timeout.is_zero() {
            return Err(anyhow!("delivery timeout must be greater than zero"));
        }
        if self.delivery_queue == 0 {
            return Err(anyhow!("delivery queue must hold at least one delivery"));
        }
        if self.probe.enabled && self.probe.timeout.is_zero() {
            return Err(anyhow!("probe timeout must be greater than zero"));
        }
        if !is_plain_identifier(&self.sink.table) {
            return Err(anyhow!(
                "sink table {:?} must be a plain identifier",
                self.sink.table
            ));
        }
        PlatePolicy::new(&self.plate_pattern)?;
        Ok(())
    }

    pub fn plate_policy(&self) -> Result<PlatePolicy> {
        PlatePolicy::new(&self.plate_pattern)
    }
}

/// Export variables from `NPR_ENV_FILE`, or from `.env` in the working
/// directory or its parents. A missing default `.env` is not an error; a
/// missing `NPR_ENV_FILE` is.
pub fn load_env_file() -> Result<Option<PathBuf>> {
    match non_empty_env("NPR_ENV_FILE") {
        Some(path) => {
            dotenv::from_path(&path)
                .map_err(|e| anyhow!("failed to load env file {}: {}", path, e))?;
            Ok(Some(PathBuf::from(path)))
        }
        None => match dotenv::dotenv() {
            Ok(path) => Ok(Some(path)),
            Err(e) if e.not_found() => Ok(None),
            Err(e) => Err(anyhow!("failed to load .env: {}", e)),
        },
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn split_host_port(addr: &str) -> (String, Option<u16>) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().ok()),
        None => (addr.to_string(), None),
    }
}

fn parse_wall_clock(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| anyhow!("retention time {:?} must be HH:MM", value))
}
