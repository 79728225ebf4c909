//! Core type definitions for the allocation subsystem
//!
//! This module provides the addressing primitives used throughout the crate:
//! - Transport protocols and the client 5-tuple
//! - Channel numbers and relay addresses
//! - Timing and expiration handling

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Lowest channel number reserved for channel data (RFC 5766 Section 11)
pub const MIN_CHANNEL_NUMBER: u16 = 0x4000;
/// Highest channel number reserved for channel data (RFC 5766 Section 11)
pub const MAX_CHANNEL_NUMBER: u16 = 0x7FFF;

/// Transport protocol of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plain UDP
    Udp,
    /// Plain TCP
    Tcp,
    /// TLS over TCP
    Tls,
    /// DTLS over UDP
    Dtls,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
            Protocol::Tls => "TLS",
            Protocol::Dtls => "DTLS",
        };
        f.write_str(name)
    }
}

/// The 5-TUPLE identifying one client session's allocation
///
/// See RFC 5766 Section 2.2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    /// Client's transport address
    pub client: SocketAddr,
    /// Server's transport address the client reached
    pub server: SocketAddr,
    /// Transport protocol between client and server
    pub protocol: Protocol,
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{} ({})", self.client, self.server, self.protocol)
    }
}

/// Channel number for TURN channel bindings (0x4000 through 0x7FFF)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelNumber(pub u16);

impl ChannelNumber {
    /// Creates a new channel number if within the reserved range
    pub fn new(value: u16) -> Option<Self> {
        if (MIN_CHANNEL_NUMBER..=MAX_CHANNEL_NUMBER).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Gets the raw channel number value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Relay address assigned to an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayAddress(pub SocketAddr);

impl RelayAddress {
    /// Creates a new relay address
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Point in time when a resource expires
#[derive(Debug, Clone, Copy)]
pub struct Expiration(pub Instant);

impl Expiration {
    /// Creates a new expiration time from a duration
    pub fn new(ttl: Duration) -> Self {
        Self(Instant::now() + ttl)
    }

    /// Checks if the expiration time has been reached
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    /// Re-arms the expiration, counting from the current time
    pub fn refresh(&mut self, ttl: Duration) {
        self.0 = Instant::now() + ttl;
    }

    /// Time left until expiry, zero if already expired
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }
}
