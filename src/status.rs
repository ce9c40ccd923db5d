//! Externally visible failover status
//!
//! Computed from live CARP state, pool ownership and the lifecycle sentinels,
//! falling back to asking the peer. The last value is cached for a while and
//! every change is published on a watch channel.

use crate::carp::{CarpState, InterfaceIntrospector};
use crate::config::FailoverConfig;
use crate::peer::PeerClient;
use crate::pool::PoolManager;
use crate::sentinel::{Sentinel, SentinelStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

/// How long a computed status stays valid without a refresh
pub const STATUS_TTL: Duration = Duration::from_secs(300);

/// Node status as reported to the UI and to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailoverStatus {
    Master,
    Backup,
    Electing,
    Importing,
    Error,
    Single,
    Unknown,
}

impl fmt::Display for FailoverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailoverStatus::Master => "MASTER",
            FailoverStatus::Backup => "BACKUP",
            FailoverStatus::Electing => "ELECTING",
            FailoverStatus::Importing => "IMPORTING",
            FailoverStatus::Error => "ERROR",
            FailoverStatus::Single => "SINGLE",
            FailoverStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Everything status computation reads
pub struct StatusInputs<'a> {
    pub config: &'a FailoverConfig,
    pub introspector: &'a dyn InterfaceIntrospector,
    pub pools: &'a dyn PoolManager,
    pub sentinels: &'a SentinelStore,
    pub peer: &'a dyn PeerClient,
}

/// Any configured pool imported locally?
pub async fn any_pool_imported(config: &FailoverConfig, pools: &dyn PoolManager) -> bool {
    for name in config.all_volumes() {
        match pools.is_imported(name).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => warn!("Failed to query pool {}: {}", name, e),
        }
    }
    false
}

/// Status derivable without the peer. `None` means "ask the peer".
pub async fn local_status(inputs: &StatusInputs<'_>) -> Option<FailoverStatus> {
    let config = inputs.config;
    if config.groups.is_empty() || config.all_volumes().next().is_none() {
        return Some(FailoverStatus::Single);
    }

    let mut master = false;
    for ifname in config.critical_interfaces() {
        match inputs.introspector.snapshot(ifname).await {
            Ok(snap) if snap.has_state(CarpState::Master) => {
                master = true;
                break;
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to read CARP state of {}: {}", ifname, e),
        }
    }
    if !master {
        return None;
    }

    if any_pool_imported(config, inputs.pools).await {
        Some(FailoverStatus::Master)
    } else if inputs.sentinels.exists(&Sentinel::Electing) {
        Some(FailoverStatus::Electing)
    } else if inputs.sentinels.exists(&Sentinel::Importing) {
        Some(FailoverStatus::Importing)
    } else if inputs.sentinels.exists(&Sentinel::Failed) {
        Some(FailoverStatus::Error)
    } else {
        None
    }
}

/// Status derived from whether the peer holds the pools
pub async fn peer_status(peer: &dyn PeerClient) -> FailoverStatus {
    match peer.pools_imported().await {
        Ok(true) => FailoverStatus::Backup,
        Ok(false) => FailoverStatus::Error,
        Err(e) => {
            warn!("Failed checking failover status: {}", e);
            FailoverStatus::Unknown
        }
    }
}

/// Cached status plus its change channel
pub struct StatusTracker {
    tx: watch::Sender<FailoverStatus>,
    computed_at: Mutex<Option<Instant>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(FailoverStatus::Unknown);
        Self {
            tx,
            computed_at: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<FailoverStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> FailoverStatus {
        *self.tx.borrow()
    }

    /// Is the cached value still valid?
    pub fn is_fresh(&self) -> bool {
        self.computed_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|at| at.elapsed() < STATUS_TTL)
    }

    pub fn invalidate(&self) {
        *self.computed_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Store a locally computed status, valid for [`STATUS_TTL`]. Returns
    /// true when it changed.
    pub fn publish(&self, status: FailoverStatus) -> bool {
        self.store(status, Some(Instant::now()))
    }

    /// Store a status that must be recomputed on the next query (it came
    /// from the peer).
    pub fn publish_transient(&self, status: FailoverStatus) -> bool {
        self.store(status, None)
    }

    fn store(&self, status: FailoverStatus, computed_at: Option<Instant>) -> bool {
        *self.computed_at.lock().unwrap_or_else(|e| e.into_inner()) = computed_at;
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!("Failover status changed to {}", status);
        }
        changed
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}
