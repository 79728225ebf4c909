//! The allocation subsystem of a TURN relay server (RFC 5766)
//!
//! This crate implements the server-side resource at the heart of a TURN
//! relay: per client 5-tuple, one allocation owning a relayed transport
//! address, the permissions and channel bindings authorizing its peers,
//! and a relay loop forwarding authorized peer datagrams to a handler.
//! STUN/TURN wire parsing, authentication and listener setup live above
//! this crate and talk to it through [`AllocationTable`], [`Allocation`]
//! and [`PeerHandler`].

mod allocator;
mod config;
mod error;
mod relay;
mod types;

// Re-export primary types
pub use allocator::{Allocation, AllocationTable, PeerHandler, RelayState};
pub use error::{Error, Result};

// Re-export the per-allocation authorization state
pub use allocator::{Binding, ChannelBindings, Permission, Permissions};

// Re-export configuration types
pub use config::{AllocatorConfig, ChannelConfig, RelayConfig, TimeoutConfig};

// Re-export relay socket provisioning
pub use relay::{RelayAllocator, UdpRelayAllocator};

// Re-export the addressing primitives
pub use types::*;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the logger for the allocation subsystem
pub fn init_logger() {
    env_logger::init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    struct DiscardHandler;

    impl PeerHandler for DiscardHandler {
        fn handle_peer_data(&self, _data: Bytes, _tuple: &FiveTuple, _peer: SocketAddr) {}
    }

    #[tokio::test]
    async fn test_table_creation() {
        let mut config = AllocatorConfig::default();
        config.relay.relay_address_range = "127.0.0.1/32".into();
        config.relay.min_port = 0;
        config.relay.max_port = 0;
        let config = Arc::new(config);

        let relay = Arc::new(UdpRelayAllocator::new(&config).unwrap());
        let table = AllocationTable::new(config, relay, Arc::new(DiscardHandler));

        assert!(table.is_empty().await);

        let tuple = FiveTuple {
            client: "10.0.0.1:40000".parse().unwrap(),
            server: "192.0.2.1:3478".parse().unwrap(),
            protocol: Protocol::Udp,
        };
        table.create(tuple, Duration::from_secs(600)).await.unwrap();
        assert_eq!(table.len().await, 1);

        table.close().await;
        assert!(table.is_empty().await);
    }
}
