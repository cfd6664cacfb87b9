//! Collector configuration. Everything is passed explicitly at
//! construction, either as a JSON document or through the command line,
//! there is no process-wide configuration state.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SCRAPE_INTERVAL: u64 = 30;
pub const DEFAULT_AFTERGLOW_PERIOD: u64 = 300;

/// Default syscall set the collector asks the capture engine for.
pub const DEFAULT_SYSCALLS: &[&str] = &[
    "accept", "chdir", "clone", "close", "connect", "execve", "fchdir", "fork", "procexit",
    "procinfo", "setresgid", "setresuid", "setgid", "setuid", "shutdown", "socket", "vfork",
];

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid collection method {0}")]
    InvalidCollectionMethod(String),
    #[error("invalid export endpoint {0}: {1}")]
    InvalidEndpoint(String, &'static str),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// How kernel events get captured.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMethod {
    KernelModule,
    #[default]
    Ebpf,
    CoreBpf,
}

impl CollectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionMethod::KernelModule => "kernel_module",
            CollectionMethod::Ebpf => "ebpf",
            CollectionMethod::CoreBpf => "core_bpf",
        }
    }

    /// Probe artifact name for this method and kernel release. CO-RE
    /// probes are kernel independent.
    pub fn probe_artifact(&self, kernel_release: &str) -> String {
        match self {
            CollectionMethod::KernelModule => format!("collector-{kernel_release}.ko.gz"),
            CollectionMethod::Ebpf => format!("collector-ebpf-{kernel_release}.o.gz"),
            CollectionMethod::CoreBpf => "collector-core-bpf.o.gz".to_string(),
        }
    }
}

impl fmt::Display for CollectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CollectionMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // canonicalize to lowercase with '-' replaced by '_'
        let canon = s.to_lowercase().replace('-', "_");
        match canon.as_str() {
            "kernel_module" => Ok(CollectionMethod::KernelModule),
            "ebpf" => Ok(CollectionMethod::Ebpf),
            "core_bpf" => Ok(CollectionMethod::CoreBpf),
            _ => Err(Error::InvalidCollectionMethod(s.to_string())),
        }
    }
}

/// Settings of the probe artifact download performed before the capture
/// engine is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Base URL probe artifacts are fetched from, no download when unset.
    pub base_url: Option<String>,
    pub retries: u32,
    /// Seconds slept between two download attempts.
    pub retry_delay: u64,
    /// Upper bound in seconds on the whole retry loop.
    pub max_retry_time: u64,
    pub connection_timeout: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            retries: 10,
            retry_delay: 1,
            max_retry_time: 120,
            connection_timeout: 5,
        }
    }
}

/// Collector configuration to be used in userland.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    host_uuid: Option<uuid::Uuid>,
    hostname: Option<String>,
    pub host_proc: PathBuf,
    pub collection_method: CollectionMethod,
    /// A missing key in the document means the complete default set.
    pub syscalls: Vec<String>,
    pub scrape_interval: u64,
    pub turn_off_scrape: bool,
    pub scrape_listen_endpoints: bool,
    pub disable_network_flows: bool,
    pub enable_afterglow: bool,
    /// Seconds a closed connection keeps being reported as active.
    pub afterglow_period: u64,
    pub grpc_server: Option<String>,
    pub log_level: Option<String>,
    /// Opaque TLS material handed through to the export layer.
    pub tls: Option<serde_json::Value>,
    pub probe: ProbeSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_uuid: None,
            hostname: None,
            host_proc: PathBuf::from("/proc"),
            collection_method: CollectionMethod::default(),
            syscalls: DEFAULT_SYSCALLS.iter().map(|s| s.to_string()).collect(),
            scrape_interval: DEFAULT_SCRAPE_INTERVAL,
            turn_off_scrape: false,
            scrape_listen_endpoints: false,
            disable_network_flows: false,
            enable_afterglow: true,
            afterglow_period: DEFAULT_AFTERGLOW_PERIOD,
            grpc_server: None,
            log_level: None,
            tls: None,
            probe: ProbeSettings::default(),
        }
    }
}

fn machine_uuid() -> Option<uuid::Uuid> {
    let machine_id = fs::read_to_string("/etc/machine-id").ok()?;
    let machine_id = machine_id.trim_end();
    // we do not derive a uuid from an empty machine-id
    if machine_id.is_empty() {
        return None;
    }
    Some(uuid::Uuid::new_v5(
        &uuid::Uuid::NAMESPACE_OID,
        machine_id.as_bytes(),
    ))
}

fn validate_endpoint(addr: &str) -> Result<(), Error> {
    if addr.len() > 255 {
        return Err(Error::InvalidEndpoint(addr.into(), "address too long"));
    }
    let (host, port) = addr
        .split_once(':')
        .ok_or_else(|| Error::InvalidEndpoint(addr.into(), "missing port separator"))?;
    if host.is_empty() {
        return Err(Error::InvalidEndpoint(addr.into(), "missing host"));
    }
    if port.parse::<u16>().is_err() {
        return Err(Error::InvalidEndpoint(addr.into(), "invalid port"));
    }
    Ok(())
}

impl Config {
    pub fn from_json_str(s: &str) -> Result<Self, Error> {
        let value: serde_json::Value = serde_json::from_str(s)?;
        if value.get("syscalls").is_none() {
            warn!("no syscalls key in configuration, extracting on the complete default set");
        }
        let config: Config = serde_json::from_value(value)?;
        if let Some(addr) = &config.grpc_server {
            validate_endpoint(addr)?;
        }
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    /// Environment supersedes the document for afterglow tuning.
    pub fn handle_env_vars(&mut self) {
        if let Ok(v) = env::var("TANTO_ENABLE_AFTERGLOW") {
            match v.parse::<bool>() {
                Ok(b) => self.enable_afterglow = b,
                Err(_) => warn!("ignoring invalid TANTO_ENABLE_AFTERGLOW={v}"),
            }
        }
        if let Ok(v) = env::var("TANTO_AFTERGLOW_PERIOD") {
            match v.parse::<u64>() {
                Ok(secs) => self.afterglow_period = secs,
                Err(_) => warn!("ignoring invalid TANTO_AFTERGLOW_PERIOD={v}"),
            }
        }
    }

    pub fn set_grpc_server(&mut self, addr: &str) -> Result<(), Error> {
        validate_endpoint(addr)?;
        self.grpc_server = Some(addr.to_string());
        Ok(())
    }

    /// Host uuid from the document, falling back to one derived from the
    /// machine-id.
    pub fn host_uuid(&self) -> Option<uuid::Uuid> {
        self.host_uuid.or_else(machine_uuid)
    }

    pub fn hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| {
            fs::read_to_string("/etc/hostname")
                .map(|s| s.trim_end().to_string())
                .unwrap_or_default()
        })
    }

    pub fn is_syscall_enabled(&self, name: &str) -> bool {
        self.syscalls.iter().any(|s| s == name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.collection_method, CollectionMethod::Ebpf);
        assert_eq!(config.syscalls.len(), DEFAULT_SYSCALLS.len());
        assert!(config.is_syscall_enabled("execve"));
        assert!(!config.is_syscall_enabled("ptrace"));
        assert!(config.enable_afterglow);
    }

    #[test]
    fn test_json_round_trip() {
        let config = Config::default();
        let ser = serde_json::to_string(&config).unwrap();
        let de = Config::from_json_str(&ser).unwrap();
        assert_eq!(de.syscalls, config.syscalls);
        assert_eq!(de.collection_method, config.collection_method);
    }

    #[test]
    fn test_missing_syscalls_key_defaults_to_full_set() {
        let config = Config::from_json_str(r#"{"collection_method":"core_bpf"}"#).unwrap();
        assert_eq!(config.collection_method, CollectionMethod::CoreBpf);
        assert_eq!(config.syscalls.len(), DEFAULT_SYSCALLS.len());
    }

    #[test]
    fn test_collection_method_canonicalization() {
        assert_eq!(
            "CORE-BPF".parse::<CollectionMethod>().unwrap(),
            CollectionMethod::CoreBpf
        );
        assert_eq!(
            "Kernel-Module".parse::<CollectionMethod>().unwrap(),
            CollectionMethod::KernelModule
        );
        assert_eq!(
            "ebpf".parse::<CollectionMethod>().unwrap(),
            CollectionMethod::Ebpf
        );
        assert!("dtrace".parse::<CollectionMethod>().is_err());
    }

    #[test]
    fn test_endpoint_validation() {
        let mut config = Config::default();
        config.set_grpc_server("172.16.0.5:443").unwrap();
        assert_eq!(config.grpc_server.as_deref(), Some("172.16.0.5:443"));

        assert!(config.set_grpc_server("172.16.0.5").is_err());
        assert!(config.set_grpc_server(":443").is_err());
        assert!(config.set_grpc_server("host:").is_err());
        assert!(config.set_grpc_server("host:notaport").is_err());
    }

    #[test]
    fn test_env_var_overrides() {
        let mut config = Config::default();
        env::set_var("TANTO_ENABLE_AFTERGLOW", "false");
        env::set_var("TANTO_AFTERGLOW_PERIOD", "60");
        config.handle_env_vars();
        env::remove_var("TANTO_ENABLE_AFTERGLOW");
        env::remove_var("TANTO_AFTERGLOW_PERIOD");

        assert!(!config.enable_afterglow);
        assert_eq!(config.afterglow_period, 60);
    }

    #[test]
    fn test_host_uuid_from_document_wins() {
        let id = uuid::Uuid::new_v4();
        let config = Config {
            host_uuid: Some(id),
            ..Default::default()
        };
        assert_eq!(config.host_uuid(), Some(id));
    }

    #[test]
    fn test_probe_artifact_names() {
        assert_eq!(
            CollectionMethod::Ebpf.probe_artifact("6.1.0-18-amd64"),
            "collector-ebpf-6.1.0-18-amd64.o.gz"
        );
        assert_eq!(
            CollectionMethod::CoreBpf.probe_artifact("6.1.0-18-amd64"),
            "collector-core-bpf.o.gz"
        );
    }
}
