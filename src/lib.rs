//! CARP failover engine
//!
//! Event engine for a dual-controller storage appliance. Each controller runs
//! CARP on its client-facing NICs; this crate reacts to CARP transitions by
//! promoting the node (fence the shared disks, import the pools, restart the
//! services, open the packet filter) or demoting it (close the filter, export
//! the pools under an armed watchdog).
//!
//! # Architecture
//!
//! - [`subscriber`]: raw `vhid@ifname` notifications in, one worker per
//!   interface, outcomes broadcast
//! - [`engine`]: filters, debounce, promotion and demotion
//! - [`carp`], [`fencing`], [`pool`], [`services`], [`host`]: typed wrappers
//!   over the OS tools the engine drives
//! - [`peer`], [`control`]: the other controller and the local management
//!   plane
//! - [`sentinel`], [`heartbeat`], [`status`]: observable state
//! - [`http`]: the daemon's status surface
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use carp_failover::{Collaborators, Engine, EngineConfig, EventKind};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = EngineConfig::from_file("/etc/carp-failover.yaml")?;
//! let deps = Collaborators::production(&settings)?;
//! let engine = Engine::new(settings, deps)?;
//!
//! let outcome = engine.handle_event("em0", 10, EventKind::Master).await;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod carp;
pub mod config;
pub mod control;
pub mod engine;
pub mod fakes;
pub mod fencing;
pub mod heartbeat;
pub mod host;
pub mod http;
pub mod locks;
pub mod peer;
pub mod pool;
pub mod sentinel;
pub mod services;
pub mod status;
pub mod subscriber;

// Re-export main types for convenience
pub use carp::{CarpState, InterfaceIntrospector, InterfaceSnapshot, LinkStatus};

pub use config::{ConfigError, ConfigResult, ConfigSource, EngineConfig, FailoverConfig};

pub use engine::{
    Collaborators, Engine, EngineError, EngineResult, EventKind, EventOutcome, ForceMaster,
    IgnoreReason, NodeRole,
};

pub use fencing::{Fencing, FencingResult};

pub use sentinel::{Sentinel, SentinelStore};

pub use status::FailoverStatus;

pub use subscriber::{CarpEvent, EventRecord, Subscriber, SubscriberError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get version string
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
        assert_eq!(ver, "1.0.0");
    }
}
