// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Pier state-change events and the bus that fans them out.
//!
//! Every subscriber owns an unbounded FIFO queue and `publish` pushes into
//! each queue in call order, so events about one pier reach every subscriber
//! in the order they were published. A subscriber only sees events published
//! after it subscribed; there is no replay. Consumers resynchronize with
//! `PierRegistry::list` after (re)subscribing.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::{unix_millis, PierId, PortPair};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// What happened to a pier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PierEventKind {
    /// Registry row inserted, directory provisioned.
    Created { directory: PathBuf },

    /// Ports reserved for the pier; repeated on every start.
    PortsAssigned { web_port: u16, loopback_port: u16 },

    /// First-run initialization finished; emitted once per boot cycle.
    Booted,

    /// Process is running and accepting connections.
    Started { pid: u32 },

    /// Process exited after a requested stop.
    Stopped { forced: bool },

    /// Process exited without being asked to.
    Crashed {
        exit_code: Option<i32>,
        signal: Option<i32>,
        reason: String,
    },

    /// App data wiped; the pier is unbooted again.
    DataCleared,

    /// Registry row, ports and directory are gone.
    Deleted,
}

impl PierEventKind {
    pub fn ports_assigned(ports: PortPair) -> Self {
        Self::PortsAssigned {
            web_port: ports.web.value(),
            loopback_port: ports.loopback.value(),
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::PortsAssigned { .. } => "ports_assigned",
            Self::Booted => "booted",
            Self::Started { .. } => "started",
            Self::Stopped { .. } => "stopped",
            Self::Crashed { .. } => "crashed",
            Self::DataCleared => "data_cleared",
            Self::Deleted => "deleted",
        }
    }
}

/// One published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PierEvent {
    /// Globally unique, monotonically increasing.
    pub seq: u64,
    /// Wall-clock publish time, unix milliseconds.
    pub at: u64,
    pub pier_id: PierId,
    #[serde(flatten)]
    pub kind: PierEventKind,
}

impl PierEvent {
    pub fn new(pier_id: PierId, kind: PierEventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, Ordering::Relaxed),
            at: unix_millis(),
            pier_id,
            kind,
        }
    }
}

/// Fan-out bus for [`PierEvent`]s.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PierEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<PierEvent>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `kind` for `pier_id` to every active subscriber.
    ///
    /// Never blocks. Subscribers whose stream was dropped are pruned.
    pub fn publish(&self, pier_id: &PierId, kind: PierEventKind) -> PierEvent {
        // Sequence is assigned under the lock so queue order matches seq order.
        let mut subs = self.lock();
        let event = PierEvent::new(pier_id.clone(), kind);

        tracing::debug!(
            pier_id = %event.pier_id,
            seq = event.seq,
            event = event.kind.name(),
            subscribers = subs.len(),
            "Publishing pier event"
        );

        subs.retain(|tx| tx.send(event.clone()).is_ok());
        event
    }

    /// Start receiving events published from now on.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        EventStream { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.lock();
        subs.retain(|tx| !tx.is_closed());
        subs.len()
    }
}

/// A subscriber's view of the bus. Dropping it unsubscribes.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<PierEvent>,
}

impl EventStream {
    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<PierEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<PierEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PierId {
        PierId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_per_pier_order_preserved() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(&id("zod"), PierEventKind::Booted);
        bus.publish(&id("zod"), PierEventKind::Started { pid: 42 });
        bus.publish(&id("zod"), PierEventKind::Stopped { forced: false });

        for stream in [&mut a, &mut b] {
            let kinds: Vec<&'static str> = vec![
                stream.recv().await.unwrap().kind.name(),
                stream.recv().await.unwrap().kind.name(),
                stream.recv().await.unwrap().kind.name(),
            ];
            assert_eq!(kinds, vec!["booted", "started", "stopped"]);
        }
    }

    #[tokio::test]
    async fn test_seq_increases() {
        let bus = EventBus::new();
        let mut s = bus.subscribe();
        bus.publish(&id("zod"), PierEventKind::Deleted);
        bus.publish(&id("bus"), PierEventKind::Deleted);

        let first = s.recv().await.unwrap();
        let second = s.recv().await.unwrap();
        assert!(second.seq > first.seq);
    }

    #[test]
    fn test_no_replay_for_late_subscriber() {
        let bus = EventBus::new();
        bus.publish(&id("zod"), PierEventKind::Booted);

        let mut late = bus.subscribe();
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        let gone = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(gone);
        bus.publish(&id("zod"), PierEventKind::DataCleared);
        assert_eq!(bus.subscriber_count(), 1);
        drop(keep);
    }

    #[test]
    fn test_serializes_flat() {
        let ev = PierEvent::new(
            id("zod"),
            PierEventKind::PortsAssigned {
                web_port: 8080,
                loopback_port: 12321,
            },
        );
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "ports_assigned");
        assert_eq!(json["pier_id"], "zod");
        assert_eq!(json["web_port"], 8080);
    }
}
