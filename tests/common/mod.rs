#![allow(dead_code)]

use carp_failover::fakes::{settings_in, FakeHost};
use carp_failover::{CarpState, Engine, EngineConfig, FailoverConfig};
use indexmap::IndexMap;
use std::sync::Arc;
use tempfile::TempDir;

/// Two-node appliance with one critical NIC (em0, vhid 10) and the
/// heartbeat link on ix0
pub fn single_group_config() -> FailoverConfig {
    let mut groups = IndexMap::new();
    groups.insert("1".to_string(), vec!["em0".to_string()]);
    FailoverConfig {
        disabled: false,
        master: false,
        timeout: 2,
        groups,
        volumes: vec!["tank".to_string()],
        phrasedvolumes: vec![],
        non_crit_interfaces: vec![],
        internal_interfaces: vec!["ix0".to_string()],
        boot_disks: "sda,sdb".to_string(),
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub host: Arc<FakeHost>,
    pub engine: Arc<Engine>,
}

impl Harness {
    pub fn settings(&self) -> EngineConfig {
        settings_in(self.dir.path())
    }

    /// A fresh engine over the same host and paths, as after a reboot
    pub fn restart(&self) -> Engine {
        Engine::new(self.settings(), self.host.collaborators()).unwrap()
    }
}

/// em0 carries vhid 10 in `em0_state`; ix0 is the internal link
pub fn harness(config: FailoverConfig, em0_state: CarpState) -> Harness {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new(config);
    host.add_interface("em0", &[(10, em0_state)]);
    host.add_interface("ix0", &[]);
    let engine = Engine::new(settings_in(dir.path()), host.collaborators()).unwrap();
    Harness {
        dir,
        host,
        engine: Arc::new(engine),
    }
}

/// Node that already owns `tank` and advertises as master
pub fn active_harness(em0_state: CarpState) -> Harness {
    let h = harness(single_group_config(), em0_state);
    h.host.set_imported("tank");
    h.engine
        .sentinels()
        .create(&carp_failover::Sentinel::AssumedMaster)
        .unwrap();
    h
}
