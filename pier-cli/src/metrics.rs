// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Prometheus metrics and event logging, both fed from the pier event bus.

use std::collections::HashSet;

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge};

use pier_core::{EventStream, PierEvent, PierEventKind, PierId};

lazy_static! {
    pub static ref PIER_STARTS: IntCounterVec = register_int_counter_vec!(
        "pier_starts_total",
        "Total number of successful pier starts",
        &["pier_id"]
    )
    .expect("pier_starts_total registers once");
    pub static ref PIER_CRASHES: IntCounterVec = register_int_counter_vec!(
        "pier_crashes_total",
        "Total number of unexpected pier process exits",
        &["pier_id"]
    )
    .expect("pier_crashes_total registers once");
    pub static ref PIER_STOPS: IntCounterVec = register_int_counter_vec!(
        "pier_stops_total",
        "Total number of requested pier stops",
        &["pier_id"]
    )
    .expect("pier_stops_total registers once");
    pub static ref PIERS_RUNNING: IntGauge =
        register_int_gauge!("piers_running", "Number of piers currently running")
            .expect("piers_running registers once");
}

/// Force registration so `/metrics` lists every metric from the start.
pub fn init() {
    lazy_static::initialize(&PIER_STARTS);
    lazy_static::initialize(&PIER_CRASHES);
    lazy_static::initialize(&PIER_STOPS);
    lazy_static::initialize(&PIERS_RUNNING);
}

/// Update the metrics for one event. `running` tracks which piers are up;
/// a failed restart is reported as a crash of a pier that never came up.
pub fn record(event: &PierEvent, running: &mut HashSet<PierId>) {
    let id = event.pier_id.as_str();
    match &event.kind {
        PierEventKind::Started { .. } => {
            PIER_STARTS.with_label_values(&[id]).inc();
            running.insert(event.pier_id.clone());
        }
        PierEventKind::Stopped { .. } => {
            PIER_STOPS.with_label_values(&[id]).inc();
            running.remove(&event.pier_id);
        }
        PierEventKind::Crashed { .. } => {
            PIER_CRASHES.with_label_values(&[id]).inc();
            running.remove(&event.pier_id);
        }
        PierEventKind::Deleted => {
            running.remove(&event.pier_id);
        }
        _ => {}
    }
    PIERS_RUNNING.set(running.len() as i64);
}

fn log(event: &PierEvent) {
    match &event.kind {
        PierEventKind::Crashed { reason, .. } => {
            tracing::warn!(pier_id = %event.pier_id, seq = event.seq, reason = %reason, "Pier crashed");
        }
        PierEventKind::PortsAssigned {
            web_port,
            loopback_port,
        } => {
            tracing::info!(pier_id = %event.pier_id, seq = event.seq, web_port, loopback_port, "Pier ports assigned");
        }
        PierEventKind::Started { pid } => {
            tracing::info!(pier_id = %event.pier_id, seq = event.seq, pid, "Pier started");
        }
        other => {
            tracing::info!(pier_id = %event.pier_id, seq = event.seq, event = other.name(), "Pier event");
        }
    }
}

/// Consume `events` until the bus goes away, logging and counting each.
pub fn spawn_observer(mut events: EventStream) -> tokio::task::JoinHandle<()> {
    init();
    tokio::spawn(async move {
        let mut running = HashSet::new();
        while let Some(event) = events.recv().await {
            log(&event);
            record(&event, &mut running);
        }
    })
}

/// Text exposition of every registered metric.
pub fn render() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("Encoding error"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts_lifecycle() {
        init();
        let id = PierId::new("metrics-test").unwrap();
        let mut running = HashSet::new();
        let crash = |reason: &str| PierEventKind::Crashed {
            exit_code: None,
            signal: None,
            reason: reason.to_string(),
        };

        record(&PierEvent::new(id.clone(), PierEventKind::Started { pid: 7 }), &mut running);
        assert_eq!(running.len(), 1);
        record(&PierEvent::new(id.clone(), crash("exit code 1")), &mut running);
        // A restart that never came up counts as a crash but leaves the gauge alone.
        record(&PierEvent::new(id.clone(), crash("restart failed")), &mut running);
        assert!(running.is_empty());
        record(&PierEvent::new(id.clone(), PierEventKind::Started { pid: 8 }), &mut running);
        record(&PierEvent::new(id, PierEventKind::Stopped { forced: false }), &mut running);
        assert!(running.is_empty());

        assert_eq!(PIER_STARTS.with_label_values(&["metrics-test"]).get(), 2);
        assert_eq!(PIER_CRASHES.with_label_values(&["metrics-test"]).get(), 2);
        assert_eq!(PIER_STOPS.with_label_values(&["metrics-test"]).get(), 1);

        let text = render();
        assert!(text.contains("pier_starts_total"));
        assert!(text.contains("piers_running"));
    }
}
