//! In-process fake host
//!
//! [`FakeHost`] implements every collaborator trait of the engine against
//! in-memory state and records what the engine asked for in an ordered
//! [`Action`] journal. Pool exports honour an armed watchdog: an export that
//! would outlive the deadline "reboots" the node and never returns.

use crate::carp::{
    CarpState, CarpVhid, InterfaceIntrospector, InterfaceSnapshot, IntrospectError,
    IntrospectResult, LinkStatus,
};
use crate::config::{ConfigResult, ConfigSource, EngineConfig, FailoverConfig};
use crate::control::{Alert, ControlPlane, ControlResult};
use crate::engine::Collaborators;
use crate::fencing::{Fencing, FencingError, FencingOutcome, FencingResult};
use crate::host::exec::ExecutionError;
use crate::host::{
    HaRole, HostResult, Kernel, KeyProviders, Notifier, PacketFilter, Watchdog,
};
use crate::peer::{PeerClient, PeerError, PeerResult};
use crate::pool::{ImportOptions, PoolError, PoolManager, PoolResult};
use crate::services::{ServiceControl, ServiceResult};
use crate::status::FailoverStatus;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// One side effect the engine requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SetAdvskew { ifname: String, vhid: u32, skew: u32 },
    Fence { force: bool, result: FencingResult },
    KillFenced,
    Import(String),
    Export(String),
    SetCachefile(String),
    ServiceStart(String),
    ServiceStop(String),
    ServiceRestart(String),
    WatchdogArm(u32),
    WatchdogDisarm,
    WatchdogFired,
    SupervisorStop,
    SupervisorStart,
    PfBlock,
    PfAllow,
    HaRole(HaRole),
    AttachKeys,
    DetachKeys,
    SyncKeys,
    Mail(String),
    /// Management plane call, `method` or `method:arg`
    Control(String),
    Alert(Alert),
    PeerRefresh,
}

#[derive(Default)]
struct State {
    config: FailoverConfig,
    interfaces: IndexMap<String, InterfaceSnapshot>,
    imported: BTreeSet<String>,
    failing_imports: BTreeSet<String>,
    export_delays: HashMap<String, Duration>,
    watchdog_deadline: Option<Instant>,
    rebooted: bool,
    fencing_codes: VecDeque<i32>,
    fence_delay: Duration,
    fenced_missing: bool,
    peer_status: Option<FailoverStatus>,
    peer_pools: Option<bool>,
    enabled: Vec<String>,
    running: BTreeSet<String>,
    carp_allowed: bool,
    alua: bool,
    journal: Vec<Action>,
}

/// Fake OS, peer and management plane
pub struct FakeHost {
    state: Mutex<State>,
}

impl FakeHost {
    /// A host with the given failover snapshot, CARP allowed and an
    /// unreachable peer
    pub fn new(config: FailoverConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                config,
                carp_allowed: true,
                ..State::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, action: Action) {
        self.lock().journal.push(action);
    }

    /// Every collaborator backed by this host
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            config: self.clone(),
            introspector: self.clone(),
            peer: self.clone(),
            fencing: self.clone(),
            pools: self.clone(),
            services: self.clone(),
            watchdog: self.clone(),
            packet_filter: self.clone(),
            kernel: self.clone(),
            keys: self.clone(),
            notifier: self.clone(),
            control: self.clone(),
        }
    }

    pub fn set_config(&self, config: FailoverConfig) {
        self.lock().config = config;
    }

    /// Add an interface with an active link and the given VHIDs, all at
    /// advskew 100
    pub fn add_interface(&self, ifname: &str, vhids: &[(u32, CarpState)]) {
        let carp = vhids
            .iter()
            .map(|(vhid, state)| CarpVhid {
                vhid: *vhid,
                state: *state,
                advskew: 100,
            })
            .collect();
        self.lock().interfaces.insert(
            ifname.to_string(),
            InterfaceSnapshot {
                name: ifname.to_string(),
                link: LinkStatus::Active,
                carp,
            },
        );
    }

    /// Change what CARP reports for one VHID
    pub fn set_carp(&self, ifname: &str, vhid: u32, state: CarpState) {
        let mut st = self.lock();
        if let Some(c) = st
            .interfaces
            .get_mut(ifname)
            .and_then(|snap| snap.carp.iter_mut().find(|c| c.vhid == vhid))
        {
            c.state = state;
        }
    }

    /// The NIC disappears, e.g. a lagg being torn down
    pub fn remove_interface(&self, ifname: &str) {
        self.lock().interfaces.shift_remove(ifname);
    }

    pub fn set_link(&self, ifname: &str, link: LinkStatus) {
        if let Some(snap) = self.lock().interfaces.get_mut(ifname) {
            snap.link = link;
        }
    }

    pub fn advskew(&self, ifname: &str, vhid: u32) -> Option<u32> {
        self.lock()
            .interfaces
            .get(ifname)
            .and_then(|snap| snap.vhid(vhid))
            .map(|c| c.advskew)
    }

    pub fn set_imported(&self, pool: &str) {
        self.lock().imported.insert(pool.to_string());
    }

    pub fn imported(&self) -> Vec<String> {
        self.lock().imported.iter().cloned().collect()
    }

    /// Make every import of `pool` fail
    pub fn fail_import(&self, pool: &str) {
        self.lock().failing_imports.insert(pool.to_string());
    }

    pub fn set_export_delay(&self, pool: &str, delay: Duration) {
        self.lock().export_delays.insert(pool.to_string(), delay);
    }

    /// Exit codes handed out by successive fencing runs; 0 once drained
    pub fn push_fencing_codes(&self, codes: &[i32]) {
        self.lock().fencing_codes.extend(codes.iter().copied());
    }

    /// How long each fencing run takes before reporting
    pub fn set_fence_delay(&self, delay: Duration) {
        self.lock().fence_delay = delay;
    }

    /// Pretend the fencing binary is not installed
    pub fn set_fenced_missing(&self) {
        self.lock().fenced_missing = true;
    }

    /// `None` makes the peer unreachable
    pub fn set_peer(&self, status: Option<FailoverStatus>, pools_imported: Option<bool>) {
        let mut st = self.lock();
        st.peer_status = status;
        st.peer_pools = pools_imported;
    }

    pub fn enable_service(&self, name: &str, running: bool) {
        let mut st = self.lock();
        st.enabled.push(name.to_string());
        if running {
            st.running.insert(name.to_string());
        }
    }

    pub fn set_carp_allowed(&self, allowed: bool) {
        self.lock().carp_allowed = allowed;
    }

    pub fn set_alua(&self, alua: bool) {
        self.lock().alua = alua;
    }

    /// Did an export outlive the armed watchdog?
    pub fn rebooted(&self) -> bool {
        self.lock().rebooted
    }

    pub fn journal(&self) -> Vec<Action> {
        self.lock().journal.clone()
    }

    /// Index of the first journal entry matching `pred`
    pub fn position(&self, pred: impl Fn(&Action) -> bool) -> Option<usize> {
        self.lock().journal.iter().position(pred)
    }

    pub fn count(&self, pred: impl Fn(&Action) -> bool) -> usize {
        self.lock().journal.iter().filter(|a| pred(a)).count()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.lock()
            .journal
            .iter()
            .filter_map(|a| match a {
                Action::Alert(alert) => Some(alert.clone()),
                _ => None,
            })
            .collect()
    }

    /// Is the packet filter open? It starts open.
    pub fn pf_open(&self) -> bool {
        !matches!(
            self.lock()
                .journal
                .iter()
                .rev()
                .find(|a| matches!(a, Action::PfBlock | Action::PfAllow)),
            Some(Action::PfBlock)
        )
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }
}

/// Daemon settings with every path inside `dir` and production timeouts
pub fn settings_in(dir: &Path) -> EngineConfig {
    let mut settings = EngineConfig::default();
    let paths = &mut settings.paths;
    paths.sentinel_dir = dir.join("sentinels");
    paths.heartbeat_barrier = dir.join("heartbeat_barrier");
    paths.heartbeat_state = dir.join("heartbeat_state");
    paths.watchdog_alert = dir.join("persist").join(".watchdog-alert");
    paths.zfs_dir = dir.join("zfs");
    paths.failover_json = dir.join("failover.json");
    paths.mount_root = dir.join("mnt");
    paths.event_fifo = None;
    settings
}

#[async_trait]
impl ConfigSource for FakeHost {
    async fn load(&self) -> ConfigResult<FailoverConfig> {
        Ok(self.lock().config.clone())
    }
}

#[async_trait]
impl InterfaceIntrospector for FakeHost {
    async fn list_interfaces(&self) -> IntrospectResult<Vec<String>> {
        Ok(self.lock().interfaces.keys().cloned().collect())
    }

    async fn snapshot(&self, ifname: &str) -> IntrospectResult<InterfaceSnapshot> {
        self.lock()
            .interfaces
            .get(ifname)
            .cloned()
            .ok_or_else(|| IntrospectError::UnknownInterface(ifname.to_string()))
    }

    async fn set_advskew(&self, ifname: &str, vhid: u32, skew: u32) -> IntrospectResult<()> {
        let mut st = self.lock();
        let c = st
            .interfaces
            .get_mut(ifname)
            .and_then(|snap| snap.carp.iter_mut().find(|c| c.vhid == vhid))
            .ok_or_else(|| IntrospectError::UnknownInterface(ifname.to_string()))?;
        c.advskew = skew;
        st.journal.push(Action::SetAdvskew {
            ifname: ifname.to_string(),
            vhid,
            skew,
        });
        Ok(())
    }
}

#[async_trait]
impl PeerClient for FakeHost {
    async fn failover_status(&self) -> PeerResult<FailoverStatus> {
        self.lock()
            .peer_status
            .ok_or_else(|| PeerError::Unreachable("fake peer is down".to_string()))
    }

    async fn pools_imported(&self) -> PeerResult<bool> {
        self.lock()
            .peer_pools
            .ok_or_else(|| PeerError::Unreachable("fake peer is down".to_string()))
    }

    async fn refresh_status(&self) -> PeerResult<()> {
        let mut st = self.lock();
        st.journal.push(Action::PeerRefresh);
        match st.peer_status {
            Some(_) => Ok(()),
            None => Err(PeerError::Unreachable("fake peer is down".to_string())),
        }
    }
}

#[async_trait]
impl Fencing for FakeHost {
    async fn fence(&self, _boot_disks: &[String], force: bool) -> FencingOutcome {
        let (result, delay) = {
            let mut st = self.lock();
            if st.fenced_missing {
                return Err(FencingError::Execution(ExecutionError::ExecutionStart {
                    command: "fenced".to_string(),
                    err: io::Error::new(io::ErrorKind::NotFound, "no such file or directory"),
                }));
            }
            let code = st.fencing_codes.pop_front().unwrap_or(0);
            (FencingResult::from_code(code), st.fence_delay)
        };
        tokio::time::sleep(delay).await;
        self.record(Action::Fence { force, result });
        Ok(result)
    }

    async fn kill(&self) {
        self.record(Action::KillFenced);
    }
}

#[async_trait]
impl PoolManager for FakeHost {
    async fn import(&self, name: &str, _options: &ImportOptions) -> PoolResult<()> {
        let mut st = self.lock();
        st.journal.push(Action::Import(name.to_string()));
        if st.failing_imports.contains(name) {
            return Err(PoolError::Import {
                name: name.to_string(),
                reason: "no such pool".to_string(),
            });
        }
        st.imported.insert(name.to_string());
        Ok(())
    }

    async fn export(&self, name: &str, _force: bool) -> PoolResult<()> {
        let (delay, deadline) = {
            let mut st = self.lock();
            st.journal.push(Action::Export(name.to_string()));
            (
                st.export_delays.get(name).copied().unwrap_or_default(),
                st.watchdog_deadline,
            )
        };

        if let Some(deadline) = deadline {
            if Instant::now() + delay >= deadline {
                tokio::time::sleep_until(deadline).await;
                {
                    let mut st = self.lock();
                    st.rebooted = true;
                    st.journal.push(Action::WatchdogFired);
                }
                // The node is gone
                std::future::pending::<()>().await;
            }
        }
        tokio::time::sleep(delay).await;
        self.lock().imported.remove(name);
        Ok(())
    }

    async fn is_imported(&self, name: &str) -> PoolResult<bool> {
        Ok(self.lock().imported.contains(name))
    }

    async fn set_cachefile(&self, name: &str, _path: &Path) -> PoolResult<()> {
        self.record(Action::SetCachefile(name.to_string()));
        Ok(())
    }

    async fn status(&self, name: &str) -> PoolResult<String> {
        Ok(format!("  pool: {}\n state: ONLINE", name))
    }
}

#[async_trait]
impl ServiceControl for FakeHost {
    async fn enabled_services(&self) -> ServiceResult<Vec<String>> {
        Ok(self.lock().enabled.clone())
    }

    async fn is_running(&self, name: &str) -> ServiceResult<bool> {
        Ok(self.lock().running.contains(name))
    }

    async fn start(&self, name: &str) -> ServiceResult<()> {
        let mut st = self.lock();
        st.running.insert(name.to_string());
        st.journal.push(Action::ServiceStart(name.to_string()));
        Ok(())
    }

    async fn stop(&self, name: &str) -> ServiceResult<()> {
        let mut st = self.lock();
        st.running.remove(name);
        st.journal.push(Action::ServiceStop(name.to_string()));
        Ok(())
    }

    async fn restart(&self, name: &str) -> ServiceResult<()> {
        let mut st = self.lock();
        st.running.insert(name.to_string());
        st.journal.push(Action::ServiceRestart(name.to_string()));
        Ok(())
    }
}

#[async_trait]
impl Watchdog for FakeHost {
    async fn arm(&self, secs: u32) -> HostResult<()> {
        let mut st = self.lock();
        st.watchdog_deadline = Some(Instant::now() + Duration::from_secs(u64::from(secs)));
        st.journal.push(Action::WatchdogArm(secs));
        Ok(())
    }

    async fn disarm(&self) -> HostResult<()> {
        let mut st = self.lock();
        st.watchdog_deadline = None;
        st.journal.push(Action::WatchdogDisarm);
        Ok(())
    }

    async fn stop_supervisor(&self) -> HostResult<()> {
        self.record(Action::SupervisorStop);
        Ok(())
    }

    async fn start_supervisor(&self) -> HostResult<()> {
        self.record(Action::SupervisorStart);
        Ok(())
    }
}

#[async_trait]
impl PacketFilter for FakeHost {
    async fn block(&self) -> HostResult<()> {
        self.record(Action::PfBlock);
        Ok(())
    }

    async fn allow(&self) -> HostResult<()> {
        self.record(Action::PfAllow);
        Ok(())
    }
}

#[async_trait]
impl Kernel for FakeHost {
    async fn set_ha_role(&self, role: HaRole) -> HostResult<()> {
        self.record(Action::HaRole(role));
        Ok(())
    }

    async fn carp_allowed(&self) -> HostResult<bool> {
        Ok(self.lock().carp_allowed)
    }
}

#[async_trait]
impl KeyProviders for FakeHost {
    async fn attach_all(&self) -> HostResult<()> {
        self.record(Action::AttachKeys);
        Ok(())
    }

    async fn detach_all(&self) -> HostResult<()> {
        self.record(Action::DetachKeys);
        Ok(())
    }

    async fn sync_from_peer(&self) -> HostResult<()> {
        self.record(Action::SyncKeys);
        Ok(())
    }
}

#[async_trait]
impl Notifier for FakeHost {
    async fn notify(&self, subject: &str, _body: &str) -> HostResult<()> {
        self.record(Action::Mail(subject.to_string()));
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for FakeHost {
    async fn generate_etc(&self, group: &str) -> ControlResult<()> {
        self.record(Action::Control(format!("etc.generate:{}", group)));
        Ok(())
    }

    async fn update_replication_tasks(&self) -> ControlResult<()> {
        self.record(Action::Control("replication.update_tasks".to_string()));
        Ok(())
    }

    async fn start_on_boot_workloads(&self) -> ControlResult<()> {
        self.record(Action::Control("workloads.start_on_boot".to_string()));
        Ok(())
    }

    async fn stop_workloads(&self) -> ControlResult<()> {
        self.record(Action::Control("workloads.stop".to_string()));
        Ok(())
    }

    async fn sync_disks(&self) -> ControlResult<()> {
        self.record(Action::Control("disk.sync_all".to_string()));
        Ok(())
    }

    async fn block_failover_alerts(&self, duration: Duration) -> ControlResult<()> {
        self.record(Action::Control(format!(
            "alert.block_failover:{}",
            duration.as_secs()
        )));
        Ok(())
    }

    async fn initialize_alerts(&self) -> ControlResult<()> {
        self.record(Action::Control("alert.initialize".to_string()));
        Ok(())
    }

    async fn sync_key_escrow(&self) -> ControlResult<()> {
        self.record(Action::Control("kmip.sync_keys".to_string()));
        Ok(())
    }

    async fn unlock_datasets(&self, pool: &str) -> ControlResult<()> {
        self.record(Action::Control(format!("pool.dataset.unlock:{}", pool)));
        Ok(())
    }

    async fn sed_unlock_all(&self) -> ControlResult<()> {
        self.record(Action::Control("disk.sed_unlock_all".to_string()));
        Ok(())
    }

    async fn iscsi_alua_enabled(&self) -> ControlResult<bool> {
        Ok(self.lock().alua)
    }

    async fn raise_alert(&self, alert: Alert) -> ControlResult<()> {
        self.record(Action::Alert(alert));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_export_past_watchdog_deadline_reboots() {
        let host = FakeHost::new(FailoverConfig::default());
        host.set_imported("tank");
        host.set_export_delay("tank", Duration::from_secs(6));
        host.arm(4).await.unwrap();

        let exporter = Arc::clone(&host);
        let task = tokio::spawn(async move { exporter.export("tank", true).await });
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(host.rebooted());
        assert!(!task.is_finished());
        assert_eq!(host.imported(), vec!["tank"]);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_within_deadline() {
        let host = FakeHost::new(FailoverConfig::default());
        host.set_imported("tank");
        host.set_export_delay("tank", Duration::from_secs(1));
        host.arm(4).await.unwrap();
        host.export("tank", true).await.unwrap();
        assert!(!host.rebooted());
        assert!(host.imported().is_empty());
    }

    #[tokio::test]
    async fn test_advskew_is_tracked() {
        let host = FakeHost::new(FailoverConfig::default());
        host.add_interface("em0", &[(10, CarpState::Master)]);
        host.set_advskew("em0", 10, 1).await.unwrap();
        assert_eq!(host.advskew("em0", 10), Some(1));
        assert!(host.set_advskew("em1", 10, 1).await.is_err());
        assert_eq!(host.count(|a| matches!(a, Action::SetAdvskew { .. })), 1);
    }
}
