//! CARP event subscriber
//!
//! Turns raw `vhid@ifname` notifications into engine events, publishes a
//! `failover.carp_event` CHANGED record for listeners and hands the event to
//! the per-interface queue. Outcomes are broadcast once the engine finishes.

use crate::engine::{Engine, EngineError, EventKind, EventOutcome, ForceMaster};
use crate::locks::InterfaceQueues;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Name of the change notification published for every accepted event
pub const CARP_EVENT: &str = "failover.carp_event";

const CHANNEL_CAPACITY: usize = 64;

/// Subscriber errors
#[derive(Error, Debug)]
pub enum SubscriberError {
    #[error("Malformed CARP notification: {0}")]
    Parse(String),

    #[error("Event feed I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

pub type SubscriberResult<T> = Result<T, SubscriberError>;

/// One CARP transition, as published on [`CARP_EVENT`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarpEvent {
    pub vhid: u32,
    pub interface: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
}

/// An event together with what the engine made of it
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    #[serde(flatten)]
    pub event: CarpEvent,
    #[serde(flatten)]
    pub outcome: EventOutcome,
}

/// Split `"<vhid>@<ifname>"`
pub fn parse_subsystem(subsystem: &str) -> SubscriberResult<(u32, String)> {
    let (vhid, ifname) = subsystem
        .split_once('@')
        .ok_or_else(|| SubscriberError::Parse(format!("missing '@' in {:?}", subsystem)))?;
    let vhid = vhid
        .parse::<u32>()
        .map_err(|e| SubscriberError::Parse(format!("vhid {:?}: {}", vhid, e)))?;
    if ifname.is_empty() {
        return Err(SubscriberError::Parse(format!("no interface in {:?}", subsystem)));
    }
    Ok((vhid, ifname.to_string()))
}

/// Parse one feed line, `"<vhid>@<ifname> <TYPE>"`
pub fn parse_line(line: &str) -> SubscriberResult<CarpEvent> {
    let mut parts = line.split_whitespace();
    let (Some(subsystem), Some(kind), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(SubscriberError::Parse(format!("expected two fields in {:?}", line)));
    };
    parse_event(subsystem, kind)
}

fn parse_event(subsystem: &str, kind: &str) -> SubscriberResult<CarpEvent> {
    let (vhid, interface) = parse_subsystem(subsystem)?;
    let kind = kind.parse::<EventKind>().map_err(SubscriberError::Parse)?;
    if kind == EventKind::ForceTakeover {
        return Err(SubscriberError::Parse(
            "forcetakeover cannot come from the event feed".to_string(),
        ));
    }
    Ok(CarpEvent {
        vhid,
        interface,
        kind,
    })
}

/// Feeds the engine from the OS event bus
pub struct Subscriber {
    engine: Arc<Engine>,
    queues: InterfaceQueues<CarpEvent>,
    changed: broadcast::Sender<CarpEvent>,
    outcomes: broadcast::Sender<EventRecord>,
}

impl Subscriber {
    pub fn new(engine: Arc<Engine>) -> Self {
        let (changed, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (outcomes, _) = broadcast::channel(CHANNEL_CAPACITY);

        let handler_engine = Arc::clone(&engine);
        let handler_outcomes = outcomes.clone();
        let queues = InterfaceQueues::new(move |event: CarpEvent| {
            let engine = Arc::clone(&handler_engine);
            let outcomes = handler_outcomes.clone();
            async move {
                let outcome = engine
                    .handle_event(&event.interface, event.vhid, event.kind)
                    .await;
                // No observers is fine
                let _ = outcomes.send(EventRecord { event, outcome });
            }
            .boxed()
        });

        Self {
            engine,
            queues,
            changed,
            outcomes,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// CHANGED records for [`CARP_EVENT`]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CarpEvent> {
        self.changed.subscribe()
    }

    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<EventRecord> {
        self.outcomes.subscribe()
    }

    /// Accept one raw notification
    pub fn publish(&self, subsystem: &str, kind: &str) -> SubscriberResult<CarpEvent> {
        let event = parse_event(subsystem, kind)?;
        self.accept(event.clone());
        Ok(event)
    }

    fn accept(&self, event: CarpEvent) {
        info!(
            "{} CHANGED vhid {} on {}: {}",
            CARP_EVENT, event.vhid, event.interface, event.kind
        );
        let _ = self.changed.send(event.clone());
        self.submit(event);
    }

    fn submit(&self, event: CarpEvent) {
        let ifname = event.interface.clone();
        if self.queues.submit(&ifname, event) {
            debug!("Superseded a pending event on {}", ifname);
        }
    }

    /// Operator takeover. On success the `forcetakeover` event is queued on
    /// the interface the engine picked.
    pub async fn force_master(&self) -> SubscriberResult<ForceMaster> {
        let result = self.engine.force_master().await?;
        if let ForceMaster::Dispatch { ifname, vhid } = &result {
            self.submit(CarpEvent {
                vhid: *vhid,
                interface: ifname.clone(),
                kind: EventKind::ForceTakeover,
            });
        }
        Ok(result)
    }

    /// Read notifications until EOF. Malformed lines are logged and skipped.
    pub async fn run_lines<R>(&self, reader: R) -> SubscriberResult<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok(event) => self.accept(event),
                Err(e) => warn!("{}", e),
            }
        }
        Ok(())
    }

    /// Follow a FIFO forever, reopening it whenever the writer goes away
    pub async fn run_fifo(&self, path: &Path) -> SubscriberResult<()> {
        info!("Reading CARP events from {}", path.display());
        loop {
            let file = tokio::fs::File::open(path).await?;
            self.run_lines(BufReader::new(file)).await?;
            debug!("Event feed writer closed, reopening {}", path.display());
        }
    }
}
