//! Promotion
//!
//! Order inside the critical section: fence, advertise, import, services,
//! and only then open the packet filter. Pool imports never start unless
//! fencing returned OK in this same event.

use super::{Engine, EngineResult, EventContext, EventOutcome, IgnoreReason, NodeRole};
use crate::carp::{advskew, CarpState};
use crate::config::FailoverConfig;
use crate::control::Alert;
use crate::fencing::{FencingOutcome, FencingResult};
use crate::host::HaRole;
use crate::pool::ImportOptions;
use crate::sentinel::Sentinel;
use crate::services::ServiceOrchestrator;
use std::time::Duration;
use tracing::{error, info, warn};

/// Services restarted one by one after the packet filter opens
const INDIVIDUAL_RESTARTS: &[&str] = &["collectd", "syslogd", "mdns"];

/// How long failover alerts stay suppressed after a promotion
const ALERT_BLOCK: Duration = Duration::from_secs(120);

/// Pause before admitting NFS clients, avoids ESTALE right after import
const NFS_GRACE: Duration = Duration::from_secs(1);

/// Settle time before re-reading our own CARP state on the fast track
const FAST_TRACK_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct ImportReport {
    imported: Vec<String>,
    failed: Vec<String>,
}

impl Engine {
    pub(super) async fn become_master(
        &self,
        ctx: &EventContext,
        config: &FailoverConfig,
    ) -> EngineResult<EventOutcome> {
        let intro = &*self.deps.introspector;
        if ctx.forcetakeover {
            warn!("Starting force takeover.");
        } else {
            warn!("Entering MASTER on {}", ctx.ifname);
        }

        if !ctx.user_override && !ctx.forcetakeover {
            let sleeper = self.debounce_secs(ctx, config).await;
            if sleeper != 0 {
                warn!("Sleeping {} seconds and rechecking {}", sleeper, ctx.ifname);
                tokio::time::sleep(Duration::from_secs(sleeper)).await;
                let state = match intro.carp_state(&ctx.ifname, ctx.vhid).await {
                    Ok(state) => state,
                    Err(e) => {
                        warn!("Failed to re-read {} after debounce, ignoring: {}", ctx.ifname, e);
                        return Ok(EventOutcome::Ignored(IgnoreReason::InterfaceUnavailable));
                    }
                };
                if state != Some(CarpState::Master) {
                    warn!(
                        "{} became {}. Previous event ignored.",
                        ctx.ifname,
                        state.map(|s| s.to_string()).unwrap_or_default()
                    );
                    return Ok(EventOutcome::Ignored(IgnoreReason::Transient));
                }
            }
        }

        if self.sentinels.exists(&Sentinel::AssumedMaster) || ctx.forcetakeover {
            self.assert_mastery(config).await;
            if !ctx.forcetakeover {
                return Ok(EventOutcome::Reasserted);
            }
        }

        if !ctx.forcetakeover {
            let backup_groups = self.groups_with(config, CarpState::Backup).await;
            if backup_groups.len() == config.groups.len() {
                warn!(
                    "Ignoring UP state on {} because we still have interfaces that are BACKUP.",
                    ctx.ifname
                );
                self.alert(Alert::AssumedMasterWithBackupInterfaces {
                    groups: backup_groups,
                })
                .await;
                return Ok(EventOutcome::Ignored(IgnoreReason::BackupInEveryGroup));
            }
        }

        // Losers of the race must not touch the sentinels or the role
        let Some(_critical) = self.critical.try_enter() else {
            warn!("Failover event handler failed to acquire master lock");
            return Ok(EventOutcome::LockContended);
        };
        warn!("Acquired failover master lock");

        match self.promote(ctx, config).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!("Promotion failed: {}", e);
                self.mark_failed();
                Err(e)
            }
        }
    }

    /// Critical section body. Errors past this point leave the node FAILED.
    async fn promote(&self, ctx: &EventContext, config: &FailoverConfig) -> EngineResult<EventOutcome> {
        let intro = &*self.deps.introspector;
        self.deps.fencing.kill().await;
        self.sentinels.discard(&Sentinel::Failed);
        self.sentinels.discard(&Sentinel::Importing);
        self.sentinels.create(&Sentinel::Electing)?;
        let electing = self.sentinels.scoped(Sentinel::Electing);
        self.role.transition(NodeRole::Electing);

        let mut fasttrack = false;
        if !ctx.forcetakeover && self.heartbeat.peer_recently_connected() {
            tokio::time::sleep(FAST_TRACK_SETTLE).await;
            let (ours, counts) = match intro.carp_state(&ctx.ifname, ctx.vhid).await {
                Ok(state) => (state, self.internal_vhid_counts(config).await),
                Err(e) => {
                    // No fast track; plain fencing still arbitrates
                    warn!("Failed to re-read {}: {}", ctx.ifname, e);
                    (Some(CarpState::Master), None)
                }
            };
            warn!("Status: {:?}:{:?}", ours, counts);

            if ours != Some(CarpState::Master) {
                warn!("Promoted then demoted, quitting.");
                if let Err(e) = intro.set_advskew(&ctx.ifname, ctx.vhid, advskew::DEMOTED).await {
                    warn!("Failed to demote {} vhid {}: {}", ctx.ifname, ctx.vhid, e);
                }
                self.role.transition(NodeRole::Standby);
                return Ok(EventOutcome::Ignored(IgnoreReason::PromotedThenDemoted));
            }
            fasttrack = counts
                .is_some_and(|(up, backup)| up == self.settings.internal_vhids.len() && backup == 0);
        }

        let force = ctx.user_override || fasttrack || ctx.forcetakeover;
        warn!("Starting fenced");
        let result = match self.fence_with_retries(config, force).await {
            Ok(result) => result,
            Err(e) => {
                error!("Fencing could not run: {}", e);
                self.penalize(ctx, FencingResult::Unknown(-1)).await;
                self.alert(Alert::FencingFailed {
                    reason: e.to_string(),
                })
                .await;
                return Err(e.into());
            }
        };
        if !result.is_ok() {
            warn!("Fencing failed: {}", result);
            self.penalize(ctx, result).await;
            if result.is_programming_error() {
                self.alert(Alert::FencingFailed {
                    reason: result.to_string(),
                })
                .await;
                self.mark_failed();
                return Ok(EventOutcome::Failed(result.to_string()));
            }
            self.role.transition(NodeRole::Standby);
            return Ok(EventOutcome::FencingLost);
        }

        // fenced is daemonized and holds every shared disk
        self.assert_mastery(config).await;

        self.sentinels.create(&Sentinel::Importing)?;
        let importing = self.sentinels.scoped(Sentinel::Importing);
        drop(electing);
        self.role.transition(NodeRole::Importing);

        let report = self.import_pools(config).await;
        drop(importing);

        if !report.imported.is_empty() && !self.sentinels.exists(&Sentinel::NeedOp) {
            self.sentinels.create(&Sentinel::AssumedMaster)?;
        }
        if report.failed.is_empty() {
            self.role.transition(NodeRole::Active);
        } else {
            self.role.transition(NodeRole::Failed);
            self.alert(Alert::PoolImportFailed {
                pools: report.failed.clone(),
            })
            .await;
        }
        warn!("Volume imports complete.");

        self.bring_up_services().await;
        warn!("Failover event complete.");
        Ok(EventOutcome::Promoted)
    }

    /// Run fencing, retrying while the peer's daemon is still shutting down
    async fn fence_with_retries(&self, config: &FailoverConfig, force: bool) -> FencingOutcome {
        let disks = config.boot_disk_list();
        let max = self.settings.timeouts.fenced_max_retries;
        let started = tokio::time::Instant::now();
        let mut attempt = 1;
        loop {
            let result = self.deps.fencing.fence(&disks, force).await?;
            if result != FencingResult::RemoteRunning || attempt >= max {
                return Ok(result);
            }
            warn!(
                "Fenced is running on remote node after waiting {} seconds, retrying.",
                started.elapsed().as_secs()
            );
            attempt += 1;
        }
    }

    /// Write the loser's advskew on the interface that raised the event
    async fn penalize(&self, ctx: &EventContext, result: FencingResult) {
        if let Some(skew) = result.penalty() {
            warn!("Setting advskew to {} on {} vhid {}", skew, ctx.ifname, ctx.vhid);
            if let Err(e) = self
                .deps
                .introspector
                .set_advskew(&ctx.ifname, ctx.vhid, skew)
                .await
            {
                error!("Failed to set advskew on {}: {}", ctx.ifname, e);
            }
        }
    }

    async fn import_pools(&self, config: &FailoverConfig) -> ImportReport {
        let mut report = ImportReport::default();
        if let Err(e) = self.zfs_cache.prepare_import() {
            warn!("Failed to prepare zpool cache: {}", e);
        }

        warn!("Beginning volume imports.");
        if let Err(e) = self.deps.keys.attach_all().await {
            error!("Failed to attach key providers: {}", e);
        }
        if !self.sed_unlocked() {
            if let Err(e) = self.deps.control.sed_unlock_all().await {
                warn!("Failed to unlock SED disks: {}", e);
            }
        }

        let cache_path = self.zfs_cache.cache_path();
        for name in &config.volumes {
            warn!("Importing {}", name);
            let options = ImportOptions::failover(
                &self.settings.paths.mount_root,
                self.zfs_cache.import_source(),
            );
            if let Err(e) = self.deps.pools.import(name, &options).await {
                error!("Failed to import {}: {}", name, e);
                if let Err(e) = self.sentinels.create(&Sentinel::Failed) {
                    error!("{}", e);
                }
                report.failed.push(name.clone());
                continue;
            }
            if let Err(e) = self.deps.control.unlock_datasets(name).await {
                error!("Failed to unlock datasets of {}: {}", name, e);
            }
            if let Err(e) = self.deps.pools.set_cachefile(name, &cache_path).await {
                warn!("Failed to set cachefile on {}: {}", name, e);
            }
            report.imported.push(name.clone());
        }

        if let Err(e) = self.zfs_cache.finish_import(!report.failed.is_empty()) {
            warn!("Failed to save zpool cache: {}", e);
        }
        report
    }

    /// Everything after the pools are in place. Traffic is admitted only
    /// once the critical services are back.
    async fn bring_up_services(&self) {
        let control = &*self.deps.control;
        let timeouts = &self.settings.timeouts;
        let services = ServiceOrchestrator::new(&*self.deps.services);

        self.refresh_status().await;
        warn!("Restarting services.");
        for group in ["rc", "system_dataset", "ssl"] {
            if let Err(e) = control.generate_etc(group).await {
                error!("Failed to generate {}: {}", group, e);
            }
        }
        if let Err(e) = self.deps.kernel.set_ha_role(HaRole::Active).await {
            error!("Failed to set HA role: {}", e);
        }

        let report = services
            .restart_services(true, timeouts.critical_service())
            .await;
        info!("Critical services: {:?}", report);
        if let Err(e) = control.update_replication_tasks().await {
            warn!("Failed to update replication tasks: {}", e);
        }

        tokio::time::sleep(NFS_GRACE).await;
        if let Err(e) = self.deps.packet_filter.allow().await {
            error!("Failed to open packet filter: {}", e);
        }
        warn!("Allowing network traffic.");
        self.mail("Failover", "assume master").await;
        self.sentinels.discard(&Sentinel::UserOverride);

        if let Err(e) = control.generate_etc("cron").await {
            error!("Failed to generate cron: {}", e);
        }
        for name in INDIVIDUAL_RESTARTS {
            services.restart(name, timeouts.non_critical_service()).await;
        }
        let report = services
            .restart_services_except(false, timeouts.non_critical_service(), INDIVIDUAL_RESTARTS)
            .await;
        info!("Non-critical services: {:?}", report);

        if let Err(e) = control.start_on_boot_workloads().await {
            warn!("Failed to start on-boot workloads: {}", e);
        }
        warn!("Syncing disks and enclosure");
        if let Err(e) = control.sync_disks().await {
            warn!("Failed to sync disks: {}", e);
        }
        if let Err(e) = control.block_failover_alerts(ALERT_BLOCK).await {
            warn!("Failed to block failover alerts: {}", e);
        }
        if let Err(e) = control.initialize_alerts().await {
            warn!("Failed to initialize alerts: {}", e);
        }
        if self.settings.key_escrow_sync {
            if let Err(e) = control.sync_key_escrow().await {
                warn!("Failed to sync key escrow: {}", e);
            }
        }
    }
}
