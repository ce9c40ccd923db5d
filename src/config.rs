//! Failover and daemon configuration
//!
//! Two layers:
//! - [`FailoverConfig`]: the per-event snapshot produced by the configuration
//!   store. Re-read for every event, never mutated by the engine.
//! - [`EngineConfig`]: static daemon settings (paths, binaries, peer and
//!   timeouts), loaded once from YAML.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error reading {path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },

    /// Malformed JSON snapshot
    #[error("Invalid failover snapshot: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed YAML daemon configuration
    #[error("Invalid daemon configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Semantically invalid configuration
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Lagg bundles halt all traffic for this long while reconverging.
pub const LAGG_RECONVERGE_SECS: u64 = 2;

/// Static per-boot failover configuration snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Refuse to promote unless overridden
    pub disabled: bool,
    /// Preferred master; only consulted while `disabled`
    pub master: bool,
    /// Debounce window in seconds
    pub timeout: u64,
    /// Group id -> critical interfaces. A group is up iff any member is MASTER.
    pub groups: IndexMap<String, Vec<String>>,
    /// Pools imported on promotion, in order
    pub volumes: Vec<String>,
    /// Pools that need a passphrase side-channel before import
    pub phrasedvolumes: Vec<String>,
    /// Interfaces carrying VIPs that never trigger events
    pub non_crit_interfaces: Vec<String>,
    /// Heartbeat interconnect; events on these are ignored
    pub internal_interfaces: Vec<String>,
    /// Comma separated disk list handed to the fencing daemon
    pub boot_disks: String,
}

impl FailoverConfig {
    /// Parse a JSON snapshot
    pub fn from_json(data: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn is_internal(&self, ifname: &str) -> bool {
        self.internal_interfaces.iter().any(|i| i == ifname)
    }

    /// Is the interface a member of any failover group?
    pub fn is_critical(&self, ifname: &str) -> bool {
        self.groups
            .values()
            .any(|members| members.iter().any(|m| m == ifname))
    }

    /// Every critical interface, in group order
    pub fn critical_interfaces(&self) -> impl Iterator<Item = &str> {
        self.groups
            .values()
            .flat_map(|members| members.iter().map(String::as_str))
    }

    /// `volumes` followed by `phrasedvolumes`
    pub fn all_volumes(&self) -> impl Iterator<Item = &str> {
        self.volumes
            .iter()
            .chain(self.phrasedvolumes.iter())
            .map(String::as_str)
    }

    /// Split `boot_disks` into individual disk names
    pub fn boot_disk_list(&self) -> Vec<String> {
        self.boot_disks
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Link aggregates need extra time to reconverge.
    pub fn is_lagg(ifname: &str) -> bool {
        ifname.starts_with("lagg")
    }

    /// Validate invariants the engine relies on
    pub fn validate(&self) -> ConfigResult<()> {
        for (group, members) in &self.groups {
            if let Some(ifname) = members.iter().find(|m| self.is_internal(m)) {
                return Err(ConfigError::Invalid(format!(
                    "internal interface {} listed in failover group {}",
                    ifname, group
                )));
            }
        }
        Ok(())
    }
}

/// Source of [`FailoverConfig`] snapshots, queried once per event
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> ConfigResult<FailoverConfig>;
}

/// Reads the externally generated JSON snapshot from disk
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for JsonFileSource {
    async fn load(&self) -> ConfigResult<FailoverConfig> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| ConfigError::Io {
                path: self.path.clone(),
                err,
            })?;
        let config = FailoverConfig::from_json(&data)?;
        config.validate()?;
        Ok(config)
    }
}

/// Well-known filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// tmpfs directory holding the lifecycle sentinels
    pub sentinel_dir: PathBuf,
    /// Stamped at the start of every event
    pub heartbeat_barrier: PathBuf,
    /// Touched by the external peer probe
    pub heartbeat_state: PathBuf,
    /// Survives reboots; written before the watchdog is armed
    pub watchdog_alert: PathBuf,
    /// Holds zpool.cache, its saved copy and the killcache marker
    pub zfs_dir: PathBuf,
    pub failover_json: PathBuf,
    pub mount_root: PathBuf,
    /// FIFO fed with `<vhid>@<ifname> <TYPE>` lines
    pub event_fifo: Option<PathBuf>,
    pub pf_block_rules: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sentinel_dir: PathBuf::from("/tmp"),
            heartbeat_barrier: PathBuf::from("/tmp/heartbeat_barrier"),
            heartbeat_state: PathBuf::from("/tmp/heartbeat_state"),
            watchdog_alert: PathBuf::from("/data/sentinels/.watchdog-alert"),
            zfs_dir: PathBuf::from("/data/zfs"),
            failover_json: PathBuf::from("/tmp/failover.json"),
            mount_root: PathBuf::from("/mnt"),
            event_fifo: Some(PathBuf::from("/var/run/carp-events")),
            pf_block_rules: PathBuf::from("/etc/pf.conf.block"),
        }
    }
}

/// Absolute paths of the OS tools the engine drives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinariesConfig {
    pub ifconfig: PathBuf,
    pub zpool: PathBuf,
    pub fenced: PathBuf,
    pub pfctl: PathBuf,
    pub watchdog: PathBuf,
    pub sysctl: PathBuf,
    pub service: PathBuf,
    pub mail: PathBuf,
    pub enc_helper: PathBuf,
    pub pkill: PathBuf,
}

impl Default for BinariesConfig {
    fn default() -> Self {
        Self {
            ifconfig: PathBuf::from("/sbin/ifconfig"),
            zpool: PathBuf::from("/sbin/zpool"),
            fenced: PathBuf::from("/usr/local/bin/fenced"),
            pfctl: PathBuf::from("/sbin/pfctl"),
            watchdog: PathBuf::from("/usr/sbin/watchdog"),
            sysctl: PathBuf::from("/sbin/sysctl"),
            service: PathBuf::from("/usr/sbin/service"),
            mail: PathBuf::from("/usr/bin/mail"),
            enc_helper: PathBuf::from("/usr/local/sbin/enc_helper"),
            pkill: PathBuf::from("/bin/pkill"),
        }
    }
}

/// Remote controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Base URL of the peer daemon's HTTP surface
    pub url: String,
    /// Per-call RPC timeout in seconds
    pub timeout_secs: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            url: "http://169.254.10.2:6080".to_string(),
            timeout_secs: 5,
        }
    }
}

/// Local management plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:6000".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Daemon HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub address: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 6080,
        }
    }
}

/// Deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Per-service deadline for the critical restart batch
    pub critical_service_secs: u64,
    /// Per-service deadline for the remaining services
    pub non_critical_service_secs: u64,
    /// Watchdog deadline armed around pool export
    pub watchdog_secs: u32,
    /// Fencing attempts while the peer's fenced is still running
    pub fenced_max_retries: u32,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            critical_service_secs: 15,
            non_critical_service_secs: 60,
            watchdog_secs: 4,
            fenced_max_retries: 4,
        }
    }
}

impl TimeoutsConfig {
    pub fn critical_service(&self) -> Duration {
        Duration::from_secs(self.critical_service_secs)
    }

    pub fn non_critical_service(&self) -> Duration {
        Duration::from_secs(self.non_critical_service_secs)
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub paths: PathsConfig,
    pub binaries: BinariesConfig,
    pub peer: PeerConfig,
    pub middleware: MiddlewareConfig,
    pub http: HttpConfig,
    pub timeouts: TimeoutsConfig,
    /// VHIDs carried by the internal heartbeat link. The "both peer VHIDs
    /// already MASTER" checks are skipped unless this is set.
    pub internal_vhids: Vec<u32>,
    /// Re-sync key escrow material after promotion
    pub key_escrow_sync: bool,
}

impl EngineConfig {
    /// Load from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.to_path_buf(),
            err,
        })?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> ConfigResult<Self> {
        let config: EngineConfig = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.timeouts.watchdog_secs == 0 {
            return Err(ConfigError::Invalid(
                "watchdog_secs must be non-zero".to_string(),
            ));
        }
        if self.timeouts.fenced_max_retries == 0 {
            return Err(ConfigError::Invalid(
                "fenced_max_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"{
        "disabled": false,
        "master": true,
        "timeout": 2,
        "groups": {"1": ["em0", "em1"], "2": ["lagg0"]},
        "volumes": ["tank"],
        "phrasedvolumes": ["vault"],
        "non_crit_interfaces": ["em2"],
        "internal_interfaces": ["ix0"],
        "boot_disks": "ada0, ada1"
    }"#;

    #[test]
    fn test_parse_snapshot() {
        let config = FailoverConfig::from_json(SNAPSHOT).unwrap();
        assert_eq!(config.timeout, 2);
        assert!(config.is_critical("em1"));
        assert!(config.is_critical("lagg0"));
        assert!(!config.is_critical("em2"));
        assert!(config.is_internal("ix0"));
        assert_eq!(config.boot_disk_list(), vec!["ada0", "ada1"]);
        assert_eq!(
            config.all_volumes().collect::<Vec<_>>(),
            vec!["tank", "vault"]
        );
        assert_eq!(
            config.critical_interfaces().collect::<Vec<_>>(),
            vec!["em0", "em1", "lagg0"]
        );
    }

    #[test]
    fn test_missing_fields_default() {
        let config = FailoverConfig::from_json("{}").unwrap();
        assert!(!config.disabled);
        assert!(config.groups.is_empty());
        assert!(config.boot_disk_list().is_empty());
    }

    #[test]
    fn test_internal_interface_in_group_rejected() {
        let mut config = FailoverConfig::from_json(SNAPSHOT).unwrap();
        config.groups.insert("3".to_string(), vec!["ix0".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::from_yaml("internal_vhids: [10, 20]\n").unwrap();
        assert_eq!(config.internal_vhids, vec![10, 20]);
        assert_eq!(config.timeouts.watchdog_secs, 4);
        assert_eq!(config.timeouts.critical_service(), Duration::from_secs(15));
        assert_eq!(config.paths.mount_root, PathBuf::from("/mnt"));
    }

    #[test]
    fn test_engine_config_rejects_zero_watchdog() {
        let err = EngineConfig::from_yaml("timeouts:\n  watchdog_secs: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_json_file_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("failover.json");
        std::fs::write(&path, SNAPSHOT).unwrap();

        let source = JsonFileSource::new(&path);
        let config = source.load().await.unwrap();
        assert_eq!(config.volumes, vec!["tank"]);

        let missing = JsonFileSource::new(dir.path().join("nope.json"));
        assert!(matches!(missing.load().await, Err(ConfigError::Io { .. })));
    }
}
