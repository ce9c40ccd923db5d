//! Failover event engine
//!
//! Accepts one CARP transition at a time per interface, decides whether it
//! matters and drives promotion ([`master`]) or demotion ([`backup`]) to
//! completion or to a deterministic failure state.
//!
//! `handle_event` never fails: collaborator errors are logged where they are
//! recoverable and otherwise surface as [`EventOutcome::Failed`] with the
//! `failed` sentinel created.

mod backup;
mod master;
pub mod role;

pub use role::{NodeRole, RoleMachine};

use crate::carp::{
    advskew, set_advskew_all, CarpState, Ifconfig, IntrospectError, InterfaceIntrospector,
    LinkStatus,
};
use crate::config::{ConfigError, ConfigSource, EngineConfig, FailoverConfig, JsonFileSource};
use crate::control::{Alert, ControlError, ControlPlane, MiddlewareClient};
use crate::fencing::{Fenced, Fencing, FencingError, FencingResult, FENCED_ALREADY_RUNNING};
use crate::heartbeat::HeartbeatTracker;
use crate::host::{
    EncHelper, HostError, KeyProviders, Kernel, Mail, Notifier, PacketFilter, Pfctl, Sysctl,
    Watchdog, WatchdogAlert, WatchdogCmd,
};
use crate::locks::CriticalSection;
use crate::peer::{HttpPeer, PeerClient, PeerError};
use crate::pool::{PoolError, PoolManager, ZfsCache, Zpool};
use crate::sentinel::{Sentinel, SentinelError, SentinelStore};
use crate::services::{RcService, ServiceControl};
use crate::status::{self, FailoverStatus, StatusInputs, StatusTracker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Engine errors. Converted into [`EventOutcome::Failed`] at the
/// `handle_event` boundary; only those raised inside the promotion critical
/// section leave the node FAILED.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sentinel error: {0}")]
    Sentinel(#[from] SentinelError),

    #[error("Interface error: {0}")]
    Introspect(#[from] IntrospectError),

    #[error("Fencing error: {0}")]
    Fencing(#[from] FencingError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Control plane error: {0}")]
    Control(#[from] ControlError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Kind of a CARP event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "MASTER")]
    Master,
    #[serde(rename = "BACKUP")]
    Backup,
    #[serde(rename = "INIT")]
    Init,
    /// Operator-initiated takeover, produced by force-master
    #[serde(rename = "forcetakeover")]
    ForceTakeover,
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MASTER" => Ok(EventKind::Master),
            "BACKUP" => Ok(EventKind::Backup),
            "INIT" => Ok(EventKind::Init),
            "forcetakeover" => Ok(EventKind::ForceTakeover),
            other => Err(format!("Unknown CARP event type: {}", other)),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Master => "MASTER",
            EventKind::Backup => "BACKUP",
            EventKind::Init => "INIT",
            EventKind::ForceTakeover => "forcetakeover",
        };
        f.write_str(s)
    }
}

/// Per-event record
#[derive(Debug, Clone)]
pub struct EventContext {
    pub ifname: String,
    pub vhid: u32,
    pub kind: EventKind,
    pub user_override: bool,
    pub forcetakeover: bool,
}

/// Why an event was dropped without acting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    InternalInterface,
    AlreadyProcessing,
    NotCritical,
    DisabledNotMaster,
    PeerIsMaster,
    AllPoolsImported,
    /// CARP state changed back during the debounce sleep
    Transient,
    /// The interface could not be read back after the debounce sleep
    InterfaceUnavailable,
    BackupInEveryGroup,
    MasterInEveryGroup,
    PromotedThenDemoted,
}

/// Result of one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum EventOutcome {
    Ignored(IgnoreReason),
    /// Already master; advskew re-asserted
    Reasserted,
    Promoted,
    /// Lost the fencing election
    FencingLost,
    /// Another event holds the critical section
    LockContended,
    Demoted { exported: bool },
    Failed(String),
}

impl EventOutcome {
    pub fn is_ignored(&self) -> bool {
        matches!(self, EventOutcome::Ignored(_))
    }
}

/// Result of a force-master request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ForceMaster {
    AlreadyMaster,
    /// Fencing refused to force the reservation
    Refused { fencing: FencingResult },
    NoCriticalVhid,
    /// A forcetakeover event should be injected on this interface
    Dispatch { ifname: String, vhid: u32 },
}

/// Every external collaborator of the engine
#[derive(Clone)]
pub struct Collaborators {
    pub config: Arc<dyn ConfigSource>,
    pub introspector: Arc<dyn InterfaceIntrospector>,
    pub peer: Arc<dyn PeerClient>,
    pub fencing: Arc<dyn Fencing>,
    pub pools: Arc<dyn PoolManager>,
    pub services: Arc<dyn ServiceControl>,
    pub watchdog: Arc<dyn Watchdog>,
    pub packet_filter: Arc<dyn PacketFilter>,
    pub kernel: Arc<dyn Kernel>,
    pub keys: Arc<dyn KeyProviders>,
    pub notifier: Arc<dyn Notifier>,
    pub control: Arc<dyn ControlPlane>,
}

impl Collaborators {
    /// The real host: OS tools, peer daemon and local management plane
    pub fn production(settings: &EngineConfig) -> EngineResult<Self> {
        let bins = &settings.binaries;
        Ok(Self {
            config: Arc::new(JsonFileSource::new(&settings.paths.failover_json)),
            introspector: Arc::new(Ifconfig::new(&bins.ifconfig)),
            peer: Arc::new(HttpPeer::new(
                &settings.peer.url,
                Duration::from_secs(settings.peer.timeout_secs),
            )?),
            fencing: Arc::new(Fenced::new(&bins.fenced, &bins.pkill)),
            pools: Arc::new(Zpool::new(&bins.zpool)),
            services: Arc::new(RcService::new(&bins.service)),
            watchdog: Arc::new(WatchdogCmd::new(&bins.watchdog, &bins.service)),
            packet_filter: Arc::new(Pfctl::new(&bins.pfctl, &settings.paths.pf_block_rules)),
            kernel: Arc::new(Sysctl::new(&bins.sysctl)),
            keys: Arc::new(EncHelper::new(&bins.enc_helper)),
            notifier: Arc::new(Mail::new(&bins.mail, "root")),
            control: Arc::new(MiddlewareClient::new(
                &settings.middleware.url,
                Duration::from_secs(settings.middleware.timeout_secs),
            )?),
        })
    }
}

/// The failover event engine
pub struct Engine {
    settings: EngineConfig,
    deps: Collaborators,
    sentinels: Arc<SentinelStore>,
    heartbeat: HeartbeatTracker,
    zfs_cache: ZfsCache,
    watchdog_alert: WatchdogAlert,
    critical: CriticalSection,
    role: RoleMachine,
    /// Self-encrypting drives were already unlocked during an earlier
    /// demotion, so promotion does not repeat it.
    sed_unlocked: AtomicBool,
    status: StatusTracker,
}

impl Engine {
    pub fn new(settings: EngineConfig, deps: Collaborators) -> EngineResult<Self> {
        settings.validate()?;
        let paths = &settings.paths;
        let sentinels = Arc::new(SentinelStore::new(&paths.sentinel_dir)?);
        let role = RoleMachine::new(NodeRole::recover(&sentinels));
        info!("Failover engine starting in role {}", role.current());
        Ok(Self {
            heartbeat: HeartbeatTracker::new(&paths.heartbeat_barrier, &paths.heartbeat_state),
            zfs_cache: ZfsCache::new(&paths.zfs_dir),
            watchdog_alert: WatchdogAlert::new(&paths.watchdog_alert),
            critical: CriticalSection::new(),
            sed_unlocked: AtomicBool::new(false),
            status: StatusTracker::new(),
            sentinels,
            role,
            deps,
            settings,
        })
    }

    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    pub fn sentinels(&self) -> &Arc<SentinelStore> {
        &self.sentinels
    }

    pub fn heartbeat(&self) -> &HeartbeatTracker {
        &self.heartbeat
    }

    pub fn role(&self) -> NodeRole {
        self.role.current()
    }

    /// Is a promotion or demotion body running right now?
    pub fn in_progress(&self) -> bool {
        self.critical.is_held()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<FailoverStatus> {
        self.status.subscribe()
    }

    /// Cached status, recomputed once stale
    pub async fn status(&self) -> FailoverStatus {
        if self.status.is_fresh() {
            return self.status.current();
        }
        self.refresh_status().await
    }

    /// Recompute and publish the failover status
    pub async fn refresh_status(&self) -> FailoverStatus {
        let config = match self.deps.config.load().await {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load failover configuration for status: {}", e);
                return self.status.current();
            }
        };
        let inputs = StatusInputs {
            config: &config,
            introspector: &*self.deps.introspector,
            pools: &*self.deps.pools,
            sentinels: &self.sentinels,
            peer: &*self.deps.peer,
        };
        match status::local_status(&inputs).await {
            Some(status) => {
                self.status.publish(status);
                status
            }
            None => {
                let status = status::peer_status(&*self.deps.peer).await;
                self.status.publish_transient(status);
                status
            }
        }
    }

    /// Does this node hold any configured pool?
    pub async fn pools_imported(&self) -> EngineResult<bool> {
        let config = self.deps.config.load().await?;
        Ok(status::any_pool_imported(&config, &*self.deps.pools).await)
    }

    /// Process one CARP event to completion
    pub async fn handle_event(&self, ifname: &str, vhid: u32, kind: EventKind) -> EventOutcome {
        let id = Uuid::new_v4();
        let span = info_span!("failover_event", ifname, vhid, event = %kind, %id);
        self.process(ifname, vhid, kind).instrument(span).await
    }

    async fn process(&self, ifname: &str, vhid: u32, kind: EventKind) -> EventOutcome {
        let config = match self.deps.config.load().await {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load failover configuration: {}", e);
                return EventOutcome::Failed(e.to_string());
            }
        };

        if config.is_internal(ifname) {
            debug!("Ignoring CARP event on internal interface {}", ifname);
            return EventOutcome::Ignored(IgnoreReason::InternalInterface);
        }

        let key = Sentinel::EventState(format!("{}@{}", kind, ifname));
        match self.sentinels.create_new(&key) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Failover event already being processed, ignoring.");
                return EventOutcome::Ignored(IgnoreReason::AlreadyProcessing);
            }
            Err(e) => {
                error!("{}", e);
                return EventOutcome::Failed(e.to_string());
            }
        }
        let state_guard = self.sentinels.scoped(key);

        let outcome = match self.dispatch(ifname, vhid, kind, &config).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Failover event failed: {}", e);
                EventOutcome::Failed(e.to_string())
            }
        };
        drop(state_guard);

        if !outcome.is_ignored() {
            self.refresh_status().await;
            if matches!(kind, EventKind::Backup | EventKind::Init) {
                // The active node's dashboard reads our state
                if let Err(e) = self.deps.peer.refresh_status().await {
                    warn!("Failed to refresh failover status on active node: {}", e);
                }
            }
        }
        info!("Failover event finished: {:?}", outcome);
        outcome
    }

    async fn dispatch(
        &self,
        ifname: &str,
        vhid: u32,
        kind: EventKind,
        config: &FailoverConfig,
    ) -> EngineResult<EventOutcome> {
        let forcetakeover = kind == EventKind::ForceTakeover;
        let mut ctx = EventContext {
            ifname: ifname.to_string(),
            vhid,
            kind,
            user_override: false,
            forcetakeover,
        };

        if !forcetakeover {
            if !config.is_critical(ifname) {
                warn!("Ignoring state change on non-critical interface {}.", ifname);
                return Ok(EventOutcome::Ignored(IgnoreReason::NotCritical));
            }
            if config.disabled {
                if let Some(reason) = self.disabled_takeover(config).await? {
                    return Ok(EventOutcome::Ignored(reason));
                }
                ctx.kind = EventKind::Master;
            }
        }

        if let Err(e) = self.heartbeat.stamp_barrier() {
            warn!("Failed to stamp heartbeat barrier: {}", e);
        }
        ctx.user_override = self.sentinels.exists(&Sentinel::UserOverride);

        match ctx.kind {
            EventKind::Master | EventKind::ForceTakeover => self.become_master(&ctx, config).await,
            EventKind::Backup | EventKind::Init => {
                match self.deps.kernel.carp_allowed().await {
                    Ok(false) => ctx.user_override = true,
                    Ok(true) => {}
                    Err(e) => warn!("Failed to read net.inet.carp.allow: {}", e),
                }
                self.become_backup(&ctx, config).await
            }
        }
    }

    /// Failover is administratively disabled. Returns a reason to stay
    /// backup, or `None` after arranging to take over.
    async fn disabled_takeover(&self, config: &FailoverConfig) -> EngineResult<Option<IgnoreReason>> {
        if !config.master {
            warn!("Failover disabled. Assuming backup.");
            return Ok(Some(IgnoreReason::DisabledNotMaster));
        }

        match self.deps.peer.failover_status().await {
            Ok(FailoverStatus::Master) => {
                warn!("Other node is already active, assuming backup.");
                return Ok(Some(IgnoreReason::PeerIsMaster));
            }
            Ok(_) => {}
            Err(e) => info!("Failed to contact the other node: {}", e),
        }

        let mut missing = None;
        for name in config.all_volumes() {
            match self.deps.pools.is_imported(name).await {
                Ok(true) => {}
                Ok(false) => {
                    missing = Some(name);
                    break;
                }
                Err(e) => {
                    warn!("Failed to query pool {}: {}", name, e);
                    missing = Some(name);
                    break;
                }
            }
        }
        let Some(pool) = missing else {
            warn!("All pools already imported, ignoring.");
            return Ok(Some(IgnoreReason::AllPoolsImported));
        };

        info!("Pool {} is not imported", pool);
        let interfaces = self.non_internal_interfaces(config).await;
        set_advskew_all(
            &*self.deps.introspector,
            interfaces.iter().map(String::as_str),
            advskew::FORCED,
        )
        .await;
        warn!("Failover disabled.  Assuming active.");
        self.sentinels.create(&Sentinel::UserOverride)?;
        Ok(None)
    }

    /// Operator takeover. Forces the disk reservation first, then names the
    /// interface a `forcetakeover` event must be injected on.
    pub async fn force_master(&self) -> EngineResult<ForceMaster> {
        if self.status().await == FailoverStatus::Master {
            return Ok(ForceMaster::AlreadyMaster);
        }
        let config = self.deps.config.load().await?;
        let fencing = self
            .deps
            .fencing
            .fence(&config.boot_disk_list(), true)
            .await?;
        if !fencing.is_ok() && fencing != FencingResult::Unknown(FENCED_ALREADY_RUNNING) {
            warn!("Forced fencing refused: {}", fencing);
            return Ok(ForceMaster::Refused { fencing });
        }

        for ifname in config.critical_interfaces() {
            match self.deps.introspector.vhids(ifname).await {
                Ok(vhids) => {
                    if let Some(vhid) = vhids.first() {
                        warn!("Forcing takeover via {} vhid {}", ifname, vhid);
                        return Ok(ForceMaster::Dispatch {
                            ifname: ifname.to_string(),
                            vhid: *vhid,
                        });
                    }
                }
                Err(e) => warn!("Failed to read VHIDs of {}: {}", ifname, e),
            }
        }
        Ok(ForceMaster::NoCriticalVhid)
    }

    /// Start-up check: did the watchdog reboot us in the middle of a
    /// demotion? Raises the unauthorized-reboot alert and clears the marker.
    pub async fn check_watchdog_alert(&self) -> Option<DateTime<Utc>> {
        if !self.watchdog_alert.exists() {
            return None;
        }
        let at = self.watchdog_alert.read();
        if let Err(e) = self.watchdog_alert.remove() {
            warn!("Failed to remove watchdog alert marker: {}", e);
        }
        let at = at?;
        error!("System was rebooted by the watchdog during failover at {}", at);
        self.alert(Alert::UnauthorizedReboot { at }).await;
        Some(at)
    }

    fn mark_failed(&self) {
        self.sentinels.discard(&Sentinel::Importing);
        if let Err(e) = self.sentinels.create(&Sentinel::Failed) {
            error!("{}", e);
        }
        self.role.transition(NodeRole::Failed);
    }

    /// Seconds to wait before trusting a transition on `ctx.ifname`
    async fn debounce_secs(&self, ctx: &EventContext, config: &FailoverConfig) -> u64 {
        let floor = crate::config::LAGG_RECONVERGE_SECS;
        let timeout = config.timeout;
        if FailoverConfig::is_lagg(&ctx.ifname) {
            return timeout.max(floor);
        }
        // Interlink down: the peer is gone, no point waiting longer
        if !self.internal_links_active(config).await {
            return timeout;
        }
        match ctx.kind {
            EventKind::Master | EventKind::ForceTakeover => {
                // Link may be up while the peer reboots
                if self.internal_vhids_master(config).await {
                    timeout
                } else {
                    timeout.max(floor)
                }
            }
            EventKind::Backup | EventKind::Init => timeout.max(floor),
        }
    }

    async fn internal_links_active(&self, config: &FailoverConfig) -> bool {
        for ifname in &config.internal_interfaces {
            match self.deps.introspector.link_status(ifname).await {
                Ok(LinkStatus::Active) => {}
                Ok(_) => return false,
                Err(e) => {
                    warn!("Failed to read link status of {}: {}", ifname, e);
                    return false;
                }
            }
        }
        true
    }

    /// Does some internal interface report every configured internal VHID
    /// as MASTER? Always false without `internal_vhids`.
    async fn internal_vhids_master(&self, config: &FailoverConfig) -> bool {
        let vhids = &self.settings.internal_vhids;
        if vhids.is_empty() {
            return false;
        }
        for ifname in &config.internal_interfaces {
            if let Ok(snap) = self.deps.introspector.snapshot(ifname).await {
                let all_master = vhids
                    .iter()
                    .all(|v| snap.vhid(*v).is_some_and(|c| c.state == CarpState::Master));
                if all_master {
                    return true;
                }
            }
        }
        false
    }

    /// (MASTER or INIT, BACKUP) counts of the internal VHIDs on the first
    /// internal interface
    async fn internal_vhid_counts(&self, config: &FailoverConfig) -> Option<(usize, usize)> {
        let vhids = &self.settings.internal_vhids;
        if vhids.is_empty() {
            return None;
        }
        let ifname = config.internal_interfaces.first()?;
        let snap = match self.deps.introspector.snapshot(ifname).await {
            Ok(snap) => snap,
            Err(e) => {
                warn!("Failed to read CARP state of {}: {}", ifname, e);
                return None;
            }
        };
        let states = vhids.iter().filter_map(|v| snap.vhid(*v).map(|c| c.state));
        let (mut up, mut backup) = (0, 0);
        for state in states {
            match state {
                CarpState::Master | CarpState::Init => up += 1,
                CarpState::Backup => backup += 1,
            }
        }
        Some((up, backup))
    }

    /// Every interface on the host except the heartbeat link
    async fn non_internal_interfaces(&self, config: &FailoverConfig) -> Vec<String> {
        match self.deps.introspector.list_interfaces().await {
            Ok(all) => all.into_iter().filter(|i| !config.is_internal(i)).collect(),
            Err(e) => {
                warn!("Failed to list interfaces, using configured ones: {}", e);
                config
                    .critical_interfaces()
                    .chain(config.non_crit_interfaces.iter().map(String::as_str))
                    .map(str::to_string)
                    .collect()
            }
        }
    }

    /// Groups with at least one member in `state`
    async fn groups_with(&self, config: &FailoverConfig, state: CarpState) -> Vec<String> {
        let mut matching = Vec::new();
        for (group, members) in &config.groups {
            for ifname in members {
                match self.deps.introspector.snapshot(ifname).await {
                    Ok(snap) if snap.has_state(state) => {
                        matching.push(group.clone());
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Failed to read CARP state of {}: {}", ifname, e),
                }
            }
        }
        matching
    }

    /// advskew 1 on every VHID of every non-internal interface
    async fn assert_mastery(&self, config: &FailoverConfig) {
        let interfaces = self.non_internal_interfaces(config).await;
        set_advskew_all(
            &*self.deps.introspector,
            interfaces.iter().map(String::as_str),
            advskew::MASTER,
        )
        .await;
    }

    /// Raise a typed alert and mail it. Both best effort.
    async fn alert(&self, alert: Alert) {
        let subject = alert.subject();
        let body = match serde_json::to_string(&alert) {
            Ok(body) => body,
            Err(_) => subject.to_string(),
        };
        if let Err(e) = self.deps.control.raise_alert(alert).await {
            warn!("Failed to raise alert: {}", e);
        }
        self.mail(subject, &body).await;
    }

    async fn mail(&self, subject: &str, body: &str) {
        let body = format!("{}, {}", Utc::now().to_rfc2822(), body);
        if let Err(e) = self.deps.notifier.notify(subject, &body).await {
            warn!("Failed to send failover mail: {}", e);
        }
    }

    fn sed_unlocked(&self) -> bool {
        self.sed_unlocked.load(Ordering::SeqCst)
    }
}
