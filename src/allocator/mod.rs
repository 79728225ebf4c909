//! Allocation management for a TURN relay as specified in RFC 5766
//!
//! This module is the authoritative registry of live allocations. It
//! guarantees at most one non-terminated allocation per client 5-tuple,
//! clamps granted lifetimes to the configured bounds, runs the periodic
//! expiry sweep, and owns the teardown ordering: an allocation's relay
//! loop is always stopped before its table entry is removed, so a stale
//! entry can never shadow a concurrent re-create of the same 5-tuple.

use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::relay::RelayAllocator;
use crate::types::FiveTuple;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

mod allocation;
mod channel;
mod permission;

pub use allocation::{Allocation, RelayState};
pub use channel::{Binding, ChannelBindings};
pub use permission::{Permission, Permissions};

/// Receives one call per authorized inbound peer datagram
///
/// The protocol layer implements this to frame relayed data as a Data
/// Indication or channel-data message back to the client. Invocations run
/// to completion for the datagram that triggered them.
pub trait PeerHandler: Send + Sync {
    /// Accepts a peer datagram relayed for the given 5-tuple
    fn handle_peer_data(&self, data: Bytes, tuple: &FiveTuple, peer: SocketAddr);
}

/// Registry mapping client 5-tuples to their allocations
///
/// All operations are safe under concurrent callers; per-tuple lifecycle
/// transitions are linearized, distinct tuples do not wait on each other
/// beyond bounded map-lock critical sections.
pub struct AllocationTable {
    allocations: RwLock<HashMap<FiveTuple, Arc<Allocation>>>,
    config: Arc<AllocatorConfig>,
    relay: Arc<dyn RelayAllocator>,
    handler: Arc<dyn PeerHandler>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AllocationTable {
    /// Creates a new table and spawns its expiry sweeper
    ///
    /// Must be called from within a Tokio runtime. The sweeper holds a
    /// weak reference and exits once the table is dropped.
    pub fn new(
        config: Arc<AllocatorConfig>,
        relay: Arc<dyn RelayAllocator>,
        handler: Arc<dyn PeerHandler>,
    ) -> Arc<Self> {
        let table = Arc::new(Self {
            allocations: RwLock::new(HashMap::new()),
            config,
            relay,
            handler,
            sweeper: Mutex::new(None),
        });

        let task = tokio::spawn(run_sweeper(
            Arc::downgrade(&table),
            table.config.get_sweep_interval(),
        ));
        *table.sweeper.lock().unwrap() = Some(task);

        table
    }

    /// Creates an allocation for a 5-tuple and starts its relay loop
    ///
    /// Fails with [`Error::AllocationExists`] while a live allocation
    /// holds the tuple; an expired or draining entry is torn down and
    /// replaced. The granted lifetime is the requested one clamped to the
    /// configured bounds (zero selects the default).
    pub async fn create(
        &self,
        tuple: FiveTuple,
        requested_lifetime: Duration,
    ) -> Result<Arc<Allocation>> {
        if let Some(existing) = self.lookup(&tuple).await {
            if existing.is_live() {
                return Err(Error::AllocationExists(tuple));
            }
            existing.close().await;
            self.remove_if_current(&tuple, &existing).await;
        }

        let lifetime = self.config.clamp_lifetime(requested_lifetime);
        let (socket, relay_addr) = self.relay.allocate()?;
        let allocation = Arc::new(Allocation::new(
            tuple,
            relay_addr,
            socket,
            Arc::clone(&self.handler),
            Arc::clone(&self.config),
            lifetime,
        ));

        {
            let mut allocations = self.allocations.write().await;
            if allocations.contains_key(&tuple) {
                return Err(Error::AllocationExists(tuple));
            }
            if allocations.len() >= self.config.get_max_allocations() {
                return Err(Error::QuotaExceeded);
            }
            allocations.insert(tuple, Arc::clone(&allocation));
        }

        allocation.start();
        log::info!(
            "allocation created: {} relaying on {}",
            tuple,
            allocation.relay_addr()
        );
        Ok(allocation)
    }

    /// Refreshes an allocation's lifetime
    ///
    /// A zero requested lifetime deallocates: the relay loop is stopped,
    /// the entry removed, and `Duration::ZERO` returned. Otherwise the
    /// deadline is reset from the current time to the clamped lifetime,
    /// which is returned.
    pub async fn refresh(
        &self,
        tuple: &FiveTuple,
        requested_lifetime: Duration,
    ) -> Result<Duration> {
        let allocation = self
            .lookup(tuple)
            .await
            .ok_or(Error::AllocationNotFound(*tuple))?;

        if requested_lifetime.is_zero() {
            allocation.close().await;
            self.remove_if_current(tuple, &allocation).await;
            log::info!("allocation released: {}", tuple);
            return Ok(Duration::ZERO);
        }

        if !allocation.is_live() {
            return Err(Error::AllocationNotFound(*tuple));
        }

        let granted = self.config.clamp_lifetime(requested_lifetime);
        allocation.refresh(granted);
        Ok(granted)
    }

    /// Read-only access to a live allocation
    pub async fn lookup(&self, tuple: &FiveTuple) -> Option<Arc<Allocation>> {
        self.allocations.read().await.get(tuple).cloned()
    }

    /// Removes allocations past their deadline and prunes expired
    /// permission and channel entries of the remaining ones
    ///
    /// Runs periodically from the spawned sweeper; callable directly.
    pub async fn sweep(&self) {
        let expired: Vec<(FiveTuple, Arc<Allocation>)> = {
            let allocations = self.allocations.read().await;
            allocations
                .iter()
                .filter(|(_, allocation)| allocation.is_expired())
                .map(|(tuple, allocation)| (*tuple, Arc::clone(allocation)))
                .collect()
        };

        for (tuple, allocation) in expired {
            allocation.close().await;
            self.remove_if_current(&tuple, &allocation).await;
            log::debug!("allocation expired: {}", tuple);
        }

        let live: Vec<Arc<Allocation>> = {
            let allocations = self.allocations.read().await;
            allocations.values().cloned().collect()
        };
        for allocation in live {
            allocation.permissions().remove_expired();
            allocation.channels().remove_expired();
        }
    }

    /// Tears down every allocation and stops the sweeper
    pub async fn close(&self) {
        let sweeper = self.sweeper.lock().unwrap().take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        let drained: Vec<(FiveTuple, Arc<Allocation>)> = {
            let mut allocations = self.allocations.write().await;
            allocations.drain().collect()
        };
        for (tuple, allocation) in drained {
            allocation.close().await;
            log::debug!("allocation closed: {}", tuple);
        }
    }

    /// Number of table entries
    pub async fn len(&self) -> usize {
        self.allocations.read().await.len()
    }

    /// True when no allocations are registered
    pub async fn is_empty(&self) -> bool {
        self.allocations.read().await.is_empty()
    }

    // Removes the entry only if it still refers to the given allocation,
    // so a teardown finishing late cannot evict a replacement.
    async fn remove_if_current(&self, tuple: &FiveTuple, allocation: &Arc<Allocation>) {
        let mut allocations = self.allocations.write().await;
        if let Some(current) = allocations.get(tuple) {
            if Arc::ptr_eq(current, allocation) {
                allocations.remove(tuple);
            }
        }
    }
}

impl Drop for AllocationTable {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().unwrap().take() {
            sweeper.abort();
        }
    }
}

async fn run_sweeper(table: Weak<AllocationTable>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        match table.upgrade() {
            Some(table) => table.sweep().await,
            None => break,
        }
    }
}
