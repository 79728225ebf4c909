//! Channel binding functionality as specified in RFC 5766 Section 11
//!
//! Channels map an authorized peer to a 16-bit number so data can be
//! relayed with a 4-byte prefix instead of a full STUN header. Per
//! allocation, a channel number is bound to exactly one peer and a peer to
//! exactly one channel number; a live binding is never re-pointed at a
//! different peer.

use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::types::{ChannelNumber, Expiration};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::Duration;

/// A time-limited channel-number-to-peer binding
#[derive(Debug, Clone)]
pub struct Binding {
    number: ChannelNumber,
    peer: SocketAddr,
    expiration: Expiration,
}

impl Binding {
    fn new(number: ChannelNumber, peer: SocketAddr, ttl: Duration) -> Self {
        Self {
            number,
            peer,
            expiration: Expiration::new(ttl),
        }
    }

    /// The bound channel number
    pub fn number(&self) -> ChannelNumber {
        self.number
    }

    /// The peer address this channel is bound to
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Checks if this binding has expired
    pub fn is_expired(&self) -> bool {
        self.expiration.is_expired()
    }
}

#[derive(Debug, Default)]
struct Index {
    by_number: HashMap<u16, Binding>,
    by_peer: HashMap<SocketAddr, u16>,
}

/// The per-allocation set of channel bindings
///
/// Both directions are indexed: number-to-peer for outbound channel data,
/// peer-to-number for framing inbound peer data. Binding expiry is a clock
/// of its own; it never revokes the permission a bind created.
#[derive(Debug)]
pub struct ChannelBindings {
    index: RwLock<Index>,
    min_number: u16,
    max_number: u16,
    lifetime: Duration,
}

impl ChannelBindings {
    /// Creates an empty binding set using the configured range and lifetime
    pub fn new(config: &AllocatorConfig) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            min_number: config.channels.min_number,
            max_number: config.channels.max_number,
            lifetime: config.get_channel_lifetime(),
        }
    }

    /// Binds a channel number to a peer address, or refreshes the pair
    ///
    /// Rejects numbers outside the reserved range, a live number bound to a
    /// different peer, and a peer live on a different number. Expired
    /// conflicting entries are replaced.
    pub fn bind(&self, number: u16, peer: SocketAddr) -> Result<()> {
        if !(self.min_number..=self.max_number).contains(&number) {
            return Err(Error::InvalidChannelNumber(number));
        }

        let mut index = self.index.write().unwrap();

        if let Some((expired, bound_peer)) = index
            .by_number
            .get(&number)
            .map(|b| (b.is_expired(), b.peer()))
        {
            if !expired && bound_peer != peer {
                return Err(Error::ChannelInUse(number));
            }
            if expired {
                index.by_number.remove(&number);
                index.by_peer.remove(&bound_peer);
            }
        }

        if let Some(bound_number) = index.by_peer.get(&peer).copied() {
            if bound_number != number {
                let live = index
                    .by_number
                    .get(&bound_number)
                    .map_or(false, |b| !b.is_expired());
                if live {
                    return Err(Error::PeerAlreadyBound(peer));
                }
                index.by_number.remove(&bound_number);
                index.by_peer.remove(&peer);
            }
        }

        match index.by_number.get_mut(&number) {
            Some(binding) => binding.expiration.refresh(self.lifetime),
            None => {
                let binding = Binding::new(ChannelNumber(number), peer, self.lifetime);
                index.by_number.insert(number, binding);
                index.by_peer.insert(peer, number);
            }
        }

        Ok(())
    }

    /// Re-arms an existing binding without touching the peer mapping
    pub fn refresh(&self, number: u16) -> Result<()> {
        let mut index = self.index.write().unwrap();
        match index.by_number.get_mut(&number) {
            Some(binding) if !binding.is_expired() => {
                binding.expiration.refresh(self.lifetime);
                Ok(())
            }
            _ => Err(Error::ChannelNotFound(number)),
        }
    }

    /// Snapshot of the stored binding for a channel number, if any
    pub fn get(&self, number: u16) -> Option<Binding> {
        self.index.read().unwrap().by_number.get(&number).cloned()
    }

    /// Resolves a channel number to its peer address, live bindings only
    pub fn resolve(&self, number: u16) -> Option<SocketAddr> {
        let index = self.index.read().unwrap();
        index
            .by_number
            .get(&number)
            .filter(|b| !b.is_expired())
            .map(|b| b.peer())
    }

    /// Resolves a peer address to its channel number, live bindings only
    pub fn number_for_peer(&self, peer: &SocketAddr) -> Option<u16> {
        let index = self.index.read().unwrap();
        let number = index.by_peer.get(peer).copied()?;
        index
            .by_number
            .get(&number)
            .filter(|b| !b.is_expired())
            .map(|_| number)
    }

    /// Drops bindings past expiry from both indexes
    pub fn remove_expired(&self) {
        let mut index = self.index.write().unwrap();
        let expired: Vec<(u16, SocketAddr)> = index
            .by_number
            .iter()
            .filter(|(_, b)| b.is_expired())
            .map(|(number, b)| (*number, b.peer()))
            .collect();

        for (number, peer) in expired {
            index.by_number.remove(&number);
            index.by_peer.remove(&peer);
        }
    }

    /// Number of stored bindings, expired ones included until swept
    pub fn len(&self) -> usize {
        self.index.read().unwrap().by_number.len()
    }

    /// True when no bindings are stored
    pub fn is_empty(&self) -> bool {
        self.index.read().unwrap().by_number.is_empty()
    }
}
