//! Peer liveness barrier
//!
//! An external probe touches the peer-state file whenever the peer answers.
//! The engine stamps the barrier at the start of every event. The peer was
//! reachable "recently" iff the probe ran after the last barrier stamp.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Snapshot of both mtimes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatState {
    pub barrier_mtime: Option<SystemTime>,
    pub peer_mtime: Option<SystemTime>,
}

impl HeartbeatState {
    pub fn peer_recently_connected(&self) -> bool {
        match (self.peer_mtime, self.barrier_mtime) {
            (Some(peer), Some(barrier)) => peer > barrier,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Heartbeat file pair
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    barrier: PathBuf,
    peer: PathBuf,
}

impl HeartbeatTracker {
    pub fn new(barrier: impl Into<PathBuf>, peer: impl Into<PathBuf>) -> Self {
        Self {
            barrier: barrier.into(),
            peer: peer.into(),
        }
    }

    /// Stamp the barrier to now
    pub fn stamp_barrier(&self) -> io::Result<()> {
        touch(&self.barrier, SystemTime::now())
    }

    /// What the external probe does when the peer answers
    pub fn record_peer_seen(&self) -> io::Result<()> {
        touch(&self.peer, SystemTime::now())
    }

    pub fn state(&self) -> HeartbeatState {
        HeartbeatState {
            barrier_mtime: mtime(&self.barrier),
            peer_mtime: mtime(&self.peer),
        }
    }

    pub fn peer_recently_connected(&self) -> bool {
        self.state().peer_recently_connected()
    }
}

fn touch(path: &Path, when: SystemTime) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.set_modified(when)
}

fn mtime(path: &Path) -> Option<SystemTime> {
    File::open(path)
        .and_then(|f| f.metadata())
        .and_then(|m| m.modified())
        .ok()
}
