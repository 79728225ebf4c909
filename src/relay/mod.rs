//! Relay socket provisioning
//!
//! Each allocation owns one relay transport socket. The [`RelayAllocator`]
//! trait is the seam through which those sockets are provisioned, so
//! embedders can plug in their own address/port policy. The default
//! [`UdpRelayAllocator`] draws a host from a configured CIDR range and a
//! port from a configured range, binding with bounded retry.

use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::types::RelayAddress;
use ipnetwork::IpNetwork;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

/// How many bind attempts before giving up on a relay address
const MAX_BIND_ATTEMPTS: usize = 100;

/// Supplies a bound, ready-to-use relay socket per allocation
///
/// Implementations must be callable from within a Tokio runtime; the
/// returned socket is registered with the current reactor.
pub trait RelayAllocator: Send + Sync {
    /// Allocates and binds one relay socket
    fn allocate(&self) -> Result<(UdpSocket, RelayAddress)>;
}

/// Default relay provisioner drawing addresses from a configured range
pub struct UdpRelayAllocator {
    network: IpNetwork,
    min_port: u16,
    max_port: u16,
}

impl UdpRelayAllocator {
    /// Creates a provisioner from the relay section of the configuration
    pub fn new(config: &AllocatorConfig) -> Result<Self> {
        let network = config
            .get_relay_address_range()
            .parse::<IpNetwork>()
            .map_err(|e| Error::Config(format!("invalid relay address range: {}", e)))?;

        Ok(Self {
            network,
            min_port: config.relay.min_port,
            max_port: config.relay.max_port,
        })
    }
}

impl RelayAllocator for UdpRelayAllocator {
    fn allocate(&self) -> Result<(UdpSocket, RelayAddress)> {
        let mut rng = rand::thread_rng();

        for _ in 0..MAX_BIND_ATTEMPTS {
            let ip = random_host(&self.network, &mut rng);
            let port = rng.gen_range(self.min_port..=self.max_port);

            // The host may not own every address in the range; treat a
            // failed bind as one spent attempt and move on.
            let socket = match std::net::UdpSocket::bind(SocketAddr::new(ip, port)) {
                Ok(socket) => socket,
                Err(_) => continue,
            };
            socket.set_nonblocking(true)?;
            let socket = UdpSocket::from_std(socket)?;
            let local_addr = socket.local_addr()?;

            return Ok((socket, RelayAddress::new(local_addr)));
        }

        Err(Error::Relay(format!(
            "no relay address available after {} attempts",
            MAX_BIND_ATTEMPTS
        )))
    }
}

/// Picks a uniformly random host inside the network
fn random_host<R: Rng>(network: &IpNetwork, rng: &mut R) -> IpAddr {
    match network {
        IpNetwork::V4(net) => {
            let host_bits = 32 - u32::from(net.prefix());
            if host_bits == 0 {
                return IpAddr::V4(net.network());
            }
            let mask = if host_bits >= 32 {
                u32::MAX
            } else {
                (1u32 << host_bits) - 1
            };
            let base = u32::from(net.network());
            IpAddr::V4(Ipv4Addr::from(base | (rng.gen::<u32>() & mask)))
        }
        IpNetwork::V6(net) => {
            let host_bits = 128 - u32::from(net.prefix());
            if host_bits == 0 {
                return IpAddr::V6(net.network());
            }
            let mask = if host_bits >= 128 {
                u128::MAX
            } else {
                (1u128 << host_bits) - 1
            };
            let base = u128::from(net.network());
            IpAddr::V6(Ipv6Addr::from(base | (rng.gen::<u128>() & mask)))
        }
    }
}
