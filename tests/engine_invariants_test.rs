mod common;

use carp_failover::control::Alert;
use carp_failover::fakes::{settings_in, Action, FakeHost};
use carp_failover::host::HaRole;
use carp_failover::{
    CarpState, Engine, EventKind, EventOutcome, FailoverStatus, FencingResult, ForceMaster,
    IgnoreReason, LinkStatus, NodeRole, Sentinel,
};
use common::{active_harness, harness, single_group_config};
use indexmap::IndexMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_demotion_closes_filter_before_export() {
    let h = active_harness(CarpState::Backup);

    let outcome = h.engine.handle_event("em0", 10, EventKind::Backup).await;

    assert_eq!(outcome, EventOutcome::Demoted { exported: true });
    let pos = |action: Action| h.host.position(|a| *a == action).unwrap();
    let block = pos(Action::PfBlock);
    let arm = pos(Action::WatchdogArm(4));
    let standby = pos(Action::HaRole(HaRole::Standby));
    let export = pos(Action::Export("tank".to_string()));
    let disarm = pos(Action::WatchdogDisarm);
    assert!(block < arm && arm < standby && standby < export && export < disarm);

    assert!(!h.host.pf_open());
    assert!(h.host.imported().is_empty());
    assert_eq!(h.host.advskew("em0", 10), Some(100));
    assert!(!h.engine.sentinels().exists(&Sentinel::AssumedMaster));
    assert!(!h.settings().paths.watchdog_alert.exists());
    assert_eq!(h.engine.role(), NodeRole::Standby);
    // The surviving node is told to recompute its status
    assert!(h.host.journal().contains(&Action::PeerRefresh));
    assert!(h.host.journal().contains(&Action::SupervisorStart));
}

#[tokio::test(start_paused = true)]
async fn test_demotion_without_pools_skips_post_export_steps() {
    let h = harness(single_group_config(), CarpState::Backup);

    let outcome = h.engine.handle_event("em0", 10, EventKind::Backup).await;

    assert_eq!(outcome, EventOutcome::Demoted { exported: false });
    assert_eq!(h.host.count(|a| matches!(a, Action::Export(_))), 0);
    assert!(!h.host.journal().contains(&Action::SupervisorStart));
    assert!(!h.host.journal().contains(&Action::Mail("Failover".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_backup_ignored_while_every_group_has_master() {
    let h = active_harness(CarpState::Master);

    let outcome = h.engine.handle_event("em0", 10, EventKind::Backup).await;

    assert_eq!(outcome, EventOutcome::Ignored(IgnoreReason::Transient));
    assert_eq!(h.host.imported(), vec!["tank"]);

    // Without the debounce the group check is what stops it
    h.host.set_carp_allowed(false);
    let outcome = h.engine.handle_event("em0", 10, EventKind::Backup).await;
    assert_eq!(outcome, EventOutcome::Ignored(IgnoreReason::MasterInEveryGroup));
    assert!(h.host.pf_open());
}

#[tokio::test(start_paused = true)]
async fn test_promote_then_demote_round_trip() {
    let h = harness(single_group_config(), CarpState::Master);
    assert_eq!(
        h.engine.handle_event("em0", 10, EventKind::Master).await,
        EventOutcome::Promoted
    );

    h.host.set_carp("em0", 10, CarpState::Backup);
    assert_eq!(
        h.engine.handle_event("em0", 10, EventKind::Backup).await,
        EventOutcome::Demoted { exported: true }
    );

    let sentinels = h.engine.sentinels();
    for sentinel in [
        Sentinel::Electing,
        Sentinel::Importing,
        Sentinel::Failed,
        Sentinel::AssumedMaster,
        Sentinel::UserOverride,
    ] {
        assert!(!sentinels.exists(&sentinel), "{:?} left behind", sentinel);
    }
    assert!(h.host.imported().is_empty());
    assert_eq!(h.host.advskew("em0", 10), Some(100));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_master_only_reasserts() {
    let h = active_harness(CarpState::Master);
    h.host.set_carp("em0", 10, CarpState::Master);

    let outcome = h.engine.handle_event("em0", 10, EventKind::Master).await;

    assert_eq!(outcome, EventOutcome::Reasserted);
    assert_eq!(h.host.advskew("em0", 10), Some(1));
    assert_eq!(h.host.count(|a| matches!(a, Action::Fence { .. })), 0);
    assert_eq!(h.host.count(|a| matches!(a, Action::Import(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_master_ignored_while_every_group_has_backup() {
    let mut config = single_group_config();
    config.groups["1"].push("em1".to_string());
    let h = harness(config, CarpState::Master);
    h.host.add_interface("em1", &[(11, CarpState::Backup)]);

    let outcome = h.engine.handle_event("em0", 10, EventKind::Master).await;

    assert_eq!(outcome, EventOutcome::Ignored(IgnoreReason::BackupInEveryGroup));
    assert!(h
        .host
        .alerts()
        .contains(&Alert::AssumedMasterWithBackupInterfaces {
            groups: vec!["1".to_string()],
        }));
    assert_eq!(h.host.count(|a| matches!(a, Action::Fence { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn test_forcetakeover_bypasses_group_check() {
    let h = harness(single_group_config(), CarpState::Backup);

    let outcome = h
        .engine
        .handle_event("em0", 10, EventKind::ForceTakeover)
        .await;

    assert_eq!(outcome, EventOutcome::Promoted);
    assert!(h.host.journal().contains(&Action::Fence {
        force: true,
        result: FencingResult::Ok,
    }));
    assert_eq!(h.host.imported(), vec!["tank"]);
    assert!(h.host.alerts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fencing_daemon_missing_marks_failed() {
    let h = harness(single_group_config(), CarpState::Master);
    h.host.set_fenced_missing();

    let outcome = h.engine.handle_event("em0", 10, EventKind::Master).await;

    assert!(matches!(outcome, EventOutcome::Failed(_)));
    let sentinels = h.engine.sentinels();
    assert!(!sentinels.exists(&Sentinel::Electing));
    assert!(sentinels.exists(&Sentinel::Failed));
    assert_eq!(h.host.advskew("em0", 10), Some(204));
    assert_eq!(h.engine.role(), NodeRole::Failed);
    assert!(h
        .host
        .alerts()
        .iter()
        .any(|a| matches!(a, Alert::FencingFailed { .. })));
    assert_eq!(h.host.count(|a| matches!(a, Action::Import(_))), 0);
    assert_eq!(h.engine.status().await, FailoverStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_fencing_code_marks_failed() {
    let h = harness(single_group_config(), CarpState::Master);
    h.host.push_fencing_codes(&[42]);

    let outcome = h.engine.handle_event("em0", 10, EventKind::Master).await;

    assert!(matches!(outcome, EventOutcome::Failed(_)));
    assert!(h.engine.sentinels().exists(&Sentinel::Failed));
    assert!(!h.engine.sentinels().exists(&Sentinel::Electing));
    assert_eq!(h.host.count(|a| matches!(a, Action::Import(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fencing_retries_while_peer_daemon_runs() {
    let h = harness(single_group_config(), CarpState::Master);
    h.host.push_fencing_codes(&[2, 2, 0]);
    assert_eq!(
        h.engine.handle_event("em0", 10, EventKind::Master).await,
        EventOutcome::Promoted
    );
    assert_eq!(h.host.count(|a| matches!(a, Action::Fence { .. })), 3);

    let h = harness(single_group_config(), CarpState::Master);
    h.host.push_fencing_codes(&[2, 2, 2, 2, 0]);
    assert_eq!(
        h.engine.handle_event("em0", 10, EventKind::Master).await,
        EventOutcome::FencingLost
    );
    assert_eq!(h.host.count(|a| matches!(a, Action::Fence { .. })), 4);
    assert_eq!(h.host.advskew("em0", 10), Some(202));
}

#[tokio::test(start_paused = true)]
async fn test_pool_import_failure() {
    let h = harness(single_group_config(), CarpState::Master);
    h.host.fail_import("tank");

    h.engine.handle_event("em0", 10, EventKind::Master).await;

    let sentinels = h.engine.sentinels();
    assert!(sentinels.exists(&Sentinel::Failed));
    assert!(!sentinels.exists(&Sentinel::AssumedMaster));
    assert!(!sentinels.exists(&Sentinel::Importing));
    assert_eq!(h.engine.role(), NodeRole::Failed);
    assert!(h.host.alerts().contains(&Alert::PoolImportFailed {
        pools: vec!["tank".to_string()],
    }));
    assert_eq!(h.engine.status().await, FailoverStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn test_lagg_debounces_even_with_zero_timeout() {
    let mut groups = IndexMap::new();
    groups.insert("1".to_string(), vec!["lagg0".to_string()]);
    let mut config = single_group_config();
    config.groups = groups;
    config.timeout = 0;
    let h = harness(config, CarpState::Backup);
    h.host.add_interface("lagg0", &[(10, CarpState::Backup)]);

    let start = Instant::now();
    let outcome = h.engine.handle_event("lagg0", 10, EventKind::Master).await;

    assert_eq!(outcome, EventOutcome::Ignored(IgnoreReason::Transient));
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_no_debounce_when_interlink_is_down() {
    let mut config = single_group_config();
    config.timeout = 0;
    let h = harness(config, CarpState::Backup);
    h.host.set_link("ix0", LinkStatus::Inactive);

    let start = Instant::now();
    let outcome = h.engine.handle_event("em0", 10, EventKind::Master).await;

    // No re-poll, so the group check is what rejects it
    assert_eq!(outcome, EventOutcome::Ignored(IgnoreReason::BackupInEveryGroup));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_internal_vhids_master_skips_debounce_floor() {
    let dir = TempDir::new().unwrap();
    let mut config = single_group_config();
    config.timeout = 0;
    let host = FakeHost::new(config);
    host.add_interface("em0", &[(10, CarpState::Master)]);
    host.add_interface("ix0", &[(1, CarpState::Master), (2, CarpState::Master)]);
    let mut settings = settings_in(dir.path());
    settings.internal_vhids = vec![1, 2];
    let engine = Engine::new(settings, host.collaborators()).unwrap();

    let start = Instant::now();
    let outcome = engine.handle_event("em0", 10, EventKind::Master).await;

    assert_eq!(outcome, EventOutcome::Promoted);
    // Only the NFS grace pause, no debounce
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_event_filters() {
    let h = harness(single_group_config(), CarpState::Master);
    h.host.add_interface("em2", &[(30, CarpState::Master)]);

    assert_eq!(
        h.engine.handle_event("ix0", 1, EventKind::Master).await,
        EventOutcome::Ignored(IgnoreReason::InternalInterface)
    );
    assert_eq!(
        h.engine.handle_event("em2", 30, EventKind::Master).await,
        EventOutcome::Ignored(IgnoreReason::NotCritical)
    );

    let key = Sentinel::EventState("MASTER@em0".to_string());
    h.engine.sentinels().create(&key).unwrap();
    assert_eq!(
        h.engine.handle_event("em0", 10, EventKind::Master).await,
        EventOutcome::Ignored(IgnoreReason::AlreadyProcessing)
    );
    // Someone else's marker is left alone
    assert!(h.engine.sentinels().exists(&key));
    assert!(h.host.journal().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_passphrase_pools_use_key_providers() {
    let mut config = single_group_config();
    config.phrasedvolumes = vec!["vault".to_string()];
    let h = harness(config, CarpState::Master);

    h.engine.handle_event("em0", 10, EventKind::Master).await;
    let attach = h.host.position(|a| *a == Action::AttachKeys).unwrap();
    let import = h
        .host
        .position(|a| *a == Action::Import("tank".to_string()))
        .unwrap();
    assert!(attach < import);
    assert_eq!(h.host.imported(), vec!["tank"]);

    h.host.set_imported("vault");
    h.host.set_carp("em0", 10, CarpState::Backup);
    h.host.clear_journal();
    h.engine.handle_event("em0", 10, EventKind::Backup).await;

    assert!(h.host.journal().contains(&Action::Export("vault".to_string())));
    let detach = h.host.position(|a| *a == Action::DetachKeys).unwrap();
    let sync = h.host.position(|a| *a == Action::SyncKeys).unwrap();
    assert!(detach < sync);
}

#[tokio::test(start_paused = true)]
async fn test_block_target_handling() {
    let h = harness(single_group_config(), CarpState::Master);
    h.host.enable_service("iscsitarget", true);
    h.host.enable_service("nfs", false);

    h.engine.handle_event("em0", 10, EventKind::Master).await;
    let restarted = |name: &str| {
        h.host
            .count(|a| *a == Action::ServiceRestart(name.to_string()))
    };
    assert_eq!(restarted("iscsitarget"), 0);
    assert_eq!(restarted("nfs"), 1);

    h.host.set_carp("em0", 10, CarpState::Backup);
    h.host.clear_journal();
    h.engine.handle_event("em0", 10, EventKind::Backup).await;
    assert!(h
        .host
        .journal()
        .contains(&Action::ServiceStop("iscsitarget".to_string())));

    h.host.set_alua(true);
    h.host.set_carp("em0", 10, CarpState::Master);
    h.engine.handle_event("em0", 10, EventKind::Master).await;
    h.host.set_carp("em0", 10, CarpState::Backup);
    h.host.clear_journal();
    h.engine.handle_event("em0", 10, EventKind::Backup).await;
    assert_eq!(restarted("iscsitarget"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_force_master() {
    let h = harness(single_group_config(), CarpState::Backup);

    let result = h.engine.force_master().await.unwrap();
    assert_eq!(
        result,
        ForceMaster::Dispatch {
            ifname: "em0".to_string(),
            vhid: 10,
        }
    );

    h.host.push_fencing_codes(&[6]);
    assert!(matches!(
        h.engine.force_master().await.unwrap(),
        ForceMaster::Dispatch { .. }
    ));

    h.host.push_fencing_codes(&[3]);
    assert_eq!(
        h.engine.force_master().await.unwrap(),
        ForceMaster::Refused {
            fencing: FencingResult::CannotReserve,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_force_master_refused_when_already_master() {
    let h = active_harness(CarpState::Master);
    assert_eq!(
        h.engine.force_master().await.unwrap(),
        ForceMaster::AlreadyMaster
    );
    assert_eq!(h.host.count(|a| matches!(a, Action::Fence { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn test_status_sources() {
    let mut config = single_group_config();
    config.groups.clear();
    let h = harness(config, CarpState::Backup);
    assert_eq!(h.engine.refresh_status().await, FailoverStatus::Single);

    h.host.set_config(single_group_config());
    assert_eq!(h.engine.refresh_status().await, FailoverStatus::Unknown);
    h.host.set_peer(Some(FailoverStatus::Master), Some(true));
    assert_eq!(h.engine.refresh_status().await, FailoverStatus::Backup);
    h.host.set_peer(Some(FailoverStatus::Error), Some(false));
    assert_eq!(h.engine.refresh_status().await, FailoverStatus::Error);

    h.host.set_carp("em0", 10, CarpState::Master);
    h.engine.sentinels().create(&Sentinel::Electing).unwrap();
    assert_eq!(h.engine.refresh_status().await, FailoverStatus::Electing);
    h.engine.sentinels().remove(&Sentinel::Electing).unwrap();
    h.engine.sentinels().create(&Sentinel::Importing).unwrap();
    assert_eq!(h.engine.refresh_status().await, FailoverStatus::Importing);
}

#[tokio::test(start_paused = true)]
async fn test_status_change_is_published() {
    let h = harness(single_group_config(), CarpState::Master);
    let mut rx = h.engine.subscribe_status();

    h.engine.handle_event("em0", 10, EventKind::Master).await;

    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), FailoverStatus::Master);
}

/// What the heartbeat probe leaves behind once the peer answered; dated
/// ahead so it reads as newer than the barrier the event stamps.
fn peer_seen(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_interface_vanishing_during_debounce_is_ignored() {
    let h = active_harness(CarpState::Backup);

    let engine = Arc::clone(&h.engine);
    let task = tokio::spawn(async move { engine.handle_event("em0", 10, EventKind::Backup).await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.host.remove_interface("em0");

    assert_eq!(
        task.await.unwrap(),
        EventOutcome::Ignored(IgnoreReason::InterfaceUnavailable)
    );
    assert!(!h.engine.sentinels().exists(&Sentinel::Failed));
    assert_ne!(h.engine.role(), NodeRole::Failed);
    assert!(h.engine.sentinels().exists(&Sentinel::AssumedMaster));
    assert_eq!(h.host.imported(), vec!["tank"]);
    assert_eq!(h.host.count(|a| matches!(a, Action::PfBlock)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fast_track_promoted_then_demoted() {
    let h = harness(single_group_config(), CarpState::Master);
    peer_seen(&h.settings().paths.heartbeat_state);

    let engine = Arc::clone(&h.engine);
    let task = tokio::spawn(async move { engine.handle_event("em0", 10, EventKind::Master).await });
    // Past the 2s debounce, inside the 1s fast-track settle
    tokio::time::sleep(Duration::from_millis(2500)).await;
    h.host.set_carp("em0", 10, CarpState::Backup);

    assert_eq!(
        task.await.unwrap(),
        EventOutcome::Ignored(IgnoreReason::PromotedThenDemoted)
    );
    assert_eq!(h.host.advskew("em0", 10), Some(206));
    assert!(!h.engine.sentinels().exists(&Sentinel::Electing));
    assert!(!h.engine.sentinels().exists(&Sentinel::AssumedMaster));
    assert_eq!(h.host.count(|a| matches!(a, Action::Fence { .. })), 0);
    assert_eq!(h.host.count(|a| matches!(a, Action::Import(_))), 0);
    assert!(!h.engine.in_progress());
}

#[tokio::test(start_paused = true)]
async fn test_fast_track_forces_fencing() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new(single_group_config());
    host.add_interface("em0", &[(10, CarpState::Master)]);
    host.add_interface("ix0", &[(1, CarpState::Master), (2, CarpState::Master)]);
    let mut settings = settings_in(dir.path());
    settings.internal_vhids = vec![1, 2];
    peer_seen(&settings.paths.heartbeat_state);
    let engine = Engine::new(settings, host.collaborators()).unwrap();

    let outcome = engine.handle_event("em0", 10, EventKind::Master).await;

    assert_eq!(outcome, EventOutcome::Promoted);
    assert!(host.journal().contains(&Action::Fence {
        force: true,
        result: FencingResult::Ok,
    }));
    assert_eq!(host.imported(), vec!["tank"]);
}

#[tokio::test(start_paused = true)]
async fn test_without_fast_track_fencing_is_not_forced() {
    let h = harness(single_group_config(), CarpState::Master);

    h.engine.handle_event("em0", 10, EventKind::Master).await;

    assert!(h.host.journal().contains(&Action::Fence {
        force: false,
        result: FencingResult::Ok,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_promotion_restarts_monitoring_services_once() {
    let h = harness(single_group_config(), CarpState::Master);
    h.host.enable_service("collectd", true);
    h.host.enable_service("syslogd", true);
    h.host.enable_service("snmp", false);

    h.engine.handle_event("em0", 10, EventKind::Master).await;

    let restarted = |name: &str| {
        h.host
            .count(|a| *a == Action::ServiceRestart(name.to_string()))
    };
    assert_eq!(restarted("collectd"), 1);
    assert_eq!(restarted("syslogd"), 1);
    assert_eq!(restarted("snmp"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_key_providers_without_passphrase_pools() {
    let h = harness(single_group_config(), CarpState::Master);

    h.engine.handle_event("em0", 10, EventKind::Master).await;
    assert!(h.host.journal().contains(&Action::AttachKeys));

    h.host.set_carp("em0", 10, CarpState::Backup);
    h.host.clear_journal();
    h.engine.handle_event("em0", 10, EventKind::Backup).await;

    assert!(h.host.journal().contains(&Action::DetachKeys));
    // Only pools with a passphrase need the peer's keys
    assert!(!h.host.journal().contains(&Action::SyncKeys));
}
