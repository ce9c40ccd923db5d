//! In-memory node role machine
//!
//! The sentinels are its persistent projection; this copy exists so the
//! engine can validate and log transitions.

use crate::sentinel::{Sentinel, SentinelStore};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    Undecided,
    Electing,
    Importing,
    Active,
    Demoting,
    Standby,
    Failed,
}

impl NodeRole {
    /// Is `self -> next` an expected transition?
    pub fn can_transition_to(self, next: NodeRole) -> bool {
        use NodeRole::*;
        match (self, next) {
            (_, Failed) => true,
            (Undecided | Standby | Failed | Active, Electing) => true,
            (Electing, Importing | Standby) => true,
            (Importing, Active) => true,
            (Undecided | Active | Standby | Failed, Demoting) => true,
            (Demoting, Standby) => true,
            _ => false,
        }
    }

    /// Role implied by sentinels left from earlier events
    pub fn recover(sentinels: &SentinelStore) -> NodeRole {
        if sentinels.exists(&Sentinel::Failed) {
            NodeRole::Failed
        } else if sentinels.exists(&Sentinel::AssumedMaster) {
            NodeRole::Active
        } else {
            NodeRole::Undecided
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeRole::Undecided => "UNDECIDED",
            NodeRole::Electing => "ELECTING",
            NodeRole::Importing => "IMPORTING",
            NodeRole::Active => "ACTIVE",
            NodeRole::Demoting => "DEMOTING",
            NodeRole::Standby => "STANDBY",
            NodeRole::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct RoleMachine {
    role: Mutex<NodeRole>,
}

impl RoleMachine {
    pub fn new(initial: NodeRole) -> Self {
        Self {
            role: Mutex::new(initial),
        }
    }

    pub fn current(&self) -> NodeRole {
        *self.role.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next`. Unexpected transitions are applied anyway (the OS
    /// drives CARP, not us) but logged.
    pub fn transition(&self, next: NodeRole) -> bool {
        let mut role = self.role.lock().unwrap_or_else(|e| e.into_inner());
        let prev = *role;
        if prev == next {
            return true;
        }
        let valid = prev.can_transition_to(next);
        if valid {
            debug!("Node role {} -> {}", prev, next);
        } else {
            warn!("Unexpected node role transition {} -> {}", prev, next);
        }
        *role = next;
        valid
    }
}
