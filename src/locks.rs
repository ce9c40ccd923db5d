//! Event serialization primitives
//!
//! - [`InterfaceQueues`]: one worker per interface with a single coalescing
//!   slot. Events on the same NIC run strictly one after another; an event
//!   that arrives while another is pending replaces it, so the worker always
//!   acts on the latest CARP transition.
//! - [`CriticalSection`]: node-wide non-blocking lock around the promotion and
//!   demotion bodies. Losing the race means another event is already driving
//!   the transition.
//!
//! Ordering rule: an event is dispatched by its interface worker before it
//! ever touches the critical section, never the other way round.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, Notify};
use tracing::{debug, info};

/// Node-wide critical section
#[derive(Debug, Default)]
pub struct CriticalSection {
    inner: AsyncMutex<()>,
    held: AtomicBool,
}

impl CriticalSection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking acquire
    pub fn try_enter(&self) -> Option<CriticalGuard<'_>> {
        let lock = self.inner.try_lock().ok()?;
        self.held.store(true, Ordering::SeqCst);
        Some(CriticalGuard {
            _lock: lock,
            held: &self.held,
        })
    }

    /// Is some event inside the critical section right now? Observers only
    /// read the flag; they never contend for the lock itself.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

/// Occupancy of the [`CriticalSection`]; leaving it clears the flag
#[derive(Debug)]
pub struct CriticalGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    held: &'a AtomicBool,
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct Slot<T> {
    pending: Mutex<Option<T>>,
    notify: Notify,
}

/// Per-interface FIFO with capacity one and latest-wins coalescing
pub struct InterfaceQueues<T> {
    slots: Mutex<HashMap<String, Arc<Slot<T>>>>,
    handler: Handler<T>,
}

impl<T: Send + 'static> InterfaceQueues<T> {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(T) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            slots: Mutex::new(HashMap::new()),
            handler: Arc::new(handler),
        }
    }

    /// Queue `item` for `ifname`. Returns true when it superseded an event
    /// that had not started yet.
    pub fn submit(&self, ifname: &str, item: T) -> bool {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.get(ifname) {
                Some(slot) => Arc::clone(slot),
                None => {
                    let slot = Arc::new(Slot {
                        pending: Mutex::new(None),
                        notify: Notify::new(),
                    });
                    slots.insert(ifname.to_string(), Arc::clone(&slot));
                    info!("Starting event worker for {}", ifname);
                    tokio::spawn(worker(
                        ifname.to_string(),
                        Arc::clone(&slot),
                        Arc::clone(&self.handler),
                    ));
                    slot
                }
            }
        };

        let superseded = slot
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(item)
            .is_some();
        if superseded {
            debug!("Pending event on {} superseded", ifname);
        }
        slot.notify.notify_one();
        superseded
    }

    /// Number of interfaces with a worker
    pub fn workers(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

async fn worker<T: Send + 'static>(ifname: String, slot: Arc<Slot<T>>, handler: Handler<T>) {
    loop {
        slot.notify.notified().await;
        loop {
            let next = slot.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
            match next {
                Some(item) => {
                    debug!("Dispatching queued event on {}", ifname);
                    handler(item).await;
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_critical_section_is_exclusive() {
        let cs = CriticalSection::new();
        let guard = cs.try_enter();
        assert!(guard.is_some());
        assert!(cs.is_held());
        assert!(cs.try_enter().is_none());
        drop(guard);
        assert!(!cs.is_held());
        assert!(cs.try_enter().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_observers_never_take_the_lock() {
        let cs = Arc::new(CriticalSection::new());
        let stop = Arc::new(AtomicBool::new(false));
        let poller = {
            let cs = Arc::clone(&cs);
            let stop = Arc::clone(&stop);
            tokio::task::spawn_blocking(move || {
                let mut polls = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let _ = cs.is_held();
                    polls += 1;
                }
                polls
            })
        };

        let mut misses = 0;
        for _ in 0..50_000 {
            match cs.try_enter() {
                Some(guard) => drop(guard),
                None => misses += 1,
            }
        }
        stop.store(true, Ordering::Relaxed);
        assert!(poller.await.unwrap() > 0);
        assert_eq!(misses, 0);
        assert!(!cs.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_interface_runs_in_order_and_coalesces() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queues = InterfaceQueues::new(move |item: &'static str| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                let _ = tx.send(item);
            }
            .boxed()
        });

        queues.submit("em0", "first");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!queues.submit("em0", "second"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        // "second" has not started yet, so "third" replaces it
        assert!(queues.submit("em0", "third"));

        assert_eq!(rx.recv().await, Some("first"));
        assert_eq!(rx.recv().await, Some("third"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(queues.workers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interfaces_run_independently() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queues = InterfaceQueues::new(move |item: String| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((item, tokio::time::Instant::now()));
            }
            .boxed()
        });

        queues.submit("em0", "a".to_string());
        queues.submit("em1", "b".to_string());

        let (_, t1) = rx.recv().await.unwrap();
        let (_, t2) = rx.recv().await.unwrap();
        assert_eq!(t1, t2);
        assert_eq!(queues.workers(), 2);
    }
}
