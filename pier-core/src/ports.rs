// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Port pair allocation.
//!
//! Every pier owns a web port and a loopback port for its whole lifetime,
//! running or not. The allocator is the bookkeeping behind that promise: a
//! reservation survives stops and restarts and is only returned by `release`.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::{PortRange, PortsConfig};
use crate::error::{PierError, PierResult};
use crate::types::{PierId, Port, PortPair};

#[derive(Debug, Default)]
struct AllocatorState {
    reservations: HashMap<PierId, PortPair>,
    taken: HashSet<Port>,
}

impl AllocatorState {
    fn insert(&mut self, id: PierId, pair: PortPair) {
        self.taken.insert(pair.web);
        self.taken.insert(pair.loopback);
        self.reservations.insert(id, pair);
    }
}

/// Assigns and reclaims unique port pairs per pier.
///
/// All mutations go through one mutex and none of them block on I/O beyond a
/// bind probe, so the lock is only ever held for bookkeeping.
#[derive(Debug)]
pub struct PortAllocator {
    config: PortsConfig,
    state: Mutex<AllocatorState>,
}

impl PortAllocator {
    /// Create an empty allocator over the configured ranges.
    pub fn new(config: PortsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        // The state is a pair of plain collections, a panic elsewhere cannot
        // leave it half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a reservation restored from the durable store.
    ///
    /// Fails when the pair overlaps a port already held by another pier,
    /// which only happens if the store was edited by hand.
    pub fn seed(&self, id: &PierId, pair: PortPair) -> PierResult<()> {
        let mut state = self.lock();

        if let Some(existing) = state.reservations.get(id) {
            if *existing == pair {
                return Ok(());
            }
        }

        let clashes: Vec<Port> = [pair.web, pair.loopback]
            .into_iter()
            .filter(|p| state.taken.contains(p))
            .collect();
        if !clashes.is_empty() {
            return Err(PierError::PortConflict {
                pier_id: id.clone(),
                ports: clashes,
            });
        }

        state.insert(id.clone(), pair);
        Ok(())
    }

    /// Reserve a port pair for `id`.
    ///
    /// An id that already holds a reservation gets the same pair back, so a
    /// restarted pier keeps its ports. Otherwise the first free port of each
    /// range is taken. Nothing is reserved when either range is exhausted.
    pub fn allocate(&self, id: &PierId) -> PierResult<PortPair> {
        let mut state = self.lock();

        if let Some(pair) = state.reservations.get(id) {
            return Ok(*pair);
        }

        let web = self.first_free(&state, self.config.web, None);
        let loopback = web.and_then(|w| self.first_free(&state, self.config.loopback, Some(w)));

        let (Some(web), Some(loopback)) = (web, loopback) else {
            tracing::warn!(pier_id = %id, reserved = state.reservations.len(), "Port ranges exhausted");
            return Err(self.exhausted());
        };

        let pair = PortPair::new(web, loopback)?;
        state.insert(id.clone(), pair);

        tracing::debug!(pier_id = %id, web_port = %web, loopback_port = %loopback, "Reserved port pair");
        Ok(pair)
    }

    /// Return the ports of `id` to the pool. Unknown ids are a no-op.
    pub fn release(&self, id: &PierId) {
        let mut state = self.lock();
        if let Some(pair) = state.reservations.remove(id) {
            state.taken.remove(&pair.web);
            state.taken.remove(&pair.loopback);
            tracing::debug!(pier_id = %id, ports = %pair, "Released port pair");
        }
    }

    /// The pair currently reserved for `id`, if any.
    pub fn reserved(&self, id: &PierId) -> Option<PortPair> {
        self.lock().reservations.get(id).copied()
    }

    /// Number of piers holding a reservation.
    pub fn in_use(&self) -> usize {
        self.lock().reservations.len()
    }

    fn first_free(
        &self,
        state: &AllocatorState,
        range: PortRange,
        exclude: Option<Port>,
    ) -> Option<Port> {
        range
            .iter()
            .filter_map(|p| Port::new(p).ok())
            .filter(|p| Some(*p) != exclude && !state.taken.contains(p))
            .find(|p| !self.config.verify_bind || bindable(*p))
    }

    fn exhausted(&self) -> PierError {
        PierError::PortExhausted {
            web_start: self.config.web.start,
            web_end: self.config.web.end,
            loopback_start: self.config.loopback.start,
            loopback_end: self.config.loopback.end,
        }
    }
}

/// Whether the OS would let us listen on `port` on the loopback interface.
fn bindable(port: Port) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port.value())).is_ok()
}
