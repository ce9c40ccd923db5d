//! Demotion
//!
//! The packet filter is closed before any export starts and the watchdog is
//! armed around the exports. An export that hangs past the deadline reboots
//! the node, which is the intended recovery: a rebooted standby is safe.

use super::{Engine, EngineResult, EventContext, EventOutcome, IgnoreReason, NodeRole};
use crate::carp::{advskew, set_advskew_all, CarpState};
use crate::config::FailoverConfig;
use crate::host::HaRole;
use crate::sentinel::Sentinel;
use crate::services::{ServiceOrchestrator, ISCSI_TARGET};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, warn};

/// Stopped once pools were actually exported
const STOP_AFTER_EXPORT: &[&str] = &["smartd", "collectd"];

impl Engine {
    pub(super) async fn become_backup(
        &self,
        ctx: &EventContext,
        config: &FailoverConfig,
    ) -> EngineResult<EventOutcome> {
        let deps = &self.deps;
        warn!("Entering BACKUP on {}", ctx.ifname);

        if !ctx.user_override {
            let sleeper = self.debounce_secs(ctx, config).await;
            if sleeper != 0 {
                warn!("Sleeping {} seconds and rechecking {}", sleeper, ctx.ifname);
                tokio::time::sleep(Duration::from_secs(sleeper)).await;
                let state = match deps.introspector.carp_state(&ctx.ifname, ctx.vhid).await {
                    Ok(state) => state,
                    Err(e) => {
                        warn!("Failed to re-read {} after debounce, ignoring: {}", ctx.ifname, e);
                        return Ok(EventOutcome::Ignored(IgnoreReason::InterfaceUnavailable));
                    }
                };
                if state == Some(CarpState::Master) {
                    warn!(
                        "Ignoring state on {} because it changed back to MASTER after {} seconds.",
                        ctx.ifname, sleeper
                    );
                    return Ok(EventOutcome::Ignored(IgnoreReason::Transient));
                }
            }
        }

        let master_groups = self.groups_with(config, CarpState::Master).await;
        if master_groups.len() == config.groups.len() {
            warn!(
                "Ignoring DOWN state on {} because we still have interfaces that are UP.",
                ctx.ifname
            );
            return Ok(EventOutcome::Ignored(IgnoreReason::MasterInEveryGroup));
        }

        let Some(_critical) = self.critical.try_enter() else {
            warn!("Failover event handler failed to acquire backup lock");
            return Ok(EventOutcome::LockContended);
        };
        warn!("Acquired failover backup lock");
        self.role.transition(NodeRole::Demoting);

        deps.fencing.kill().await;
        let interfaces = config
            .non_crit_interfaces
            .iter()
            .map(String::as_str)
            .chain(config.critical_interfaces())
            .collect::<Vec<&str>>();
        set_advskew_all(&*deps.introspector, interfaces, advskew::BACKUP).await;

        if let Err(e) = deps.packet_filter.block().await {
            error!("Failed to close packet filter: {}", e);
        }
        if let Err(e) = deps.watchdog.stop_supervisor().await {
            warn!("Failed to stop watchdogd: {}", e);
        }
        // Must exist before arming: if the watchdog fires, the next boot
        // finds it and raises the unauthorized reboot alert.
        if let Err(e) = self.watchdog_alert.write_now() {
            warn!("Failed to write watchdog alert marker: {}", e);
        }
        let watchdog_secs = self.settings.timeouts.watchdog_secs;
        if let Err(e) = deps.watchdog.arm(watchdog_secs).await {
            error!("Failed to arm watchdog: {}", e);
        }
        // Make CTL close its backing storage so the pools can export
        if let Err(e) = deps.kernel.set_ha_role(HaRole::Standby).await {
            error!("Failed to set HA role: {}", e);
        }

        let exported = self.export_pools(config, watchdog_secs).await;

        if let Err(e) = deps.watchdog.disarm().await {
            error!("Failed to disarm watchdog: {}", e);
        }
        self.sentinels.discard(&Sentinel::AssumedMaster);
        if let Err(e) = self.watchdog_alert.remove() {
            warn!("Failed to remove watchdog alert marker: {}", e);
        }

        self.refresh_status().await;
        self.settle_services(config, exported).await;

        self.sed_unlocked.store(true, Ordering::SeqCst);
        self.role.transition(NodeRole::Standby);
        Ok(EventOutcome::Demoted { exported })
    }

    /// Export every imported pool. Returns whether anything was exported.
    async fn export_pools(&self, config: &FailoverConfig, watchdog_secs: u32) -> bool {
        let pools = &*self.deps.pools;
        let mut exported = false;
        for name in config.all_volumes() {
            match pools.is_imported(name).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("Failed to query pool {}: {}", name, e);
                    continue;
                }
            }
            exported = true;
            warn!("Exporting {}", name);
            if let Err(e) = pools.export(name, true).await {
                error!("Failed to export {}: {}", name, e);
                if let Ok(status) = pools.status(name).await {
                    error!("{}", status);
                }
                // Outlive the armed watchdog
                tokio::time::sleep(Duration::from_secs(u64::from(watchdog_secs) + 1)).await;
            }
            warn!("Exported {}", name);
        }
        exported
    }

    async fn settle_services(&self, config: &FailoverConfig, exported: bool) {
        let deps = &self.deps;
        let timeout = self.settings.timeouts.non_critical_service();
        let services = ServiceOrchestrator::new(&*deps.services);

        // Remote logging must now point at the active node
        services.restart("syslogd", timeout).await;
        services.stop("mdns", timeout).await;
        if let Err(e) = deps.control.generate_etc("cron").await {
            error!("Failed to generate cron: {}", e);
        }

        if exported {
            if let Err(e) = deps.watchdog.start_supervisor().await {
                warn!("Failed to start watchdogd: {}", e);
            }
            for name in STOP_AFTER_EXPORT {
                services.stop(name, timeout).await;
            }
            if let Err(e) = deps.control.stop_workloads().await {
                warn!("Failed to stop workloads: {}", e);
            }
            self.mail("Failover", "assume backup").await;
        }

        services.restart_if_enabled("ssh", timeout).await;
        let alua = match deps.control.iscsi_alua_enabled().await {
            Ok(alua) => alua,
            Err(e) => {
                warn!("Failed to read ALUA setting: {}", e);
                false
            }
        };
        if alua {
            services.restart_if_enabled(ISCSI_TARGET, timeout).await;
        } else if deps.services.is_enabled(ISCSI_TARGET).await.unwrap_or(false) {
            services.stop(ISCSI_TARGET, timeout).await;
        }

        if let Err(e) = deps.keys.detach_all().await {
            warn!("Failed to detach key providers: {}", e);
        }
        if !config.phrasedvolumes.is_empty() {
            warn!("Setting passphrase from master");
            if let Err(e) = deps.keys.sync_from_peer().await {
                warn!("Failed to sync keys from peer: {}", e);
            }
        }
    }
}
