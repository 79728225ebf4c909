//! Permission handling as specified in RFC 5766 Section 9
//!
//! Permissions authorize peers to send data through the relay to a client.
//! Without a live permission (or channel binding), inbound peer traffic is
//! dropped. Permissions are scoped to the peer's IP address; the port is
//! irrelevant.

use crate::types::Expiration;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::Duration;

/// A time-limited authorization for one peer IP
///
/// See RFC 5766 Section 2.3
#[derive(Debug, Clone)]
pub struct Permission {
    ip: IpAddr,
    expiration: Expiration,
}

impl Permission {
    fn new(ip: IpAddr, ttl: Duration) -> Self {
        Self {
            ip,
            expiration: Expiration::new(ttl),
        }
    }

    /// The peer IP this permission covers
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Checks if this permission has expired
    pub fn is_expired(&self) -> bool {
        self.expiration.is_expired()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:?} left]", self.ip, self.expiration.remaining())
    }
}

/// The per-allocation set of live permissions
///
/// Written by client-driven requests, read by the relay loop on every
/// inbound datagram. Critical sections are a single map operation.
#[derive(Debug, Default)]
pub struct Permissions {
    entries: RwLock<HashMap<IpAddr, Permission>>,
}

impl Permissions {
    /// Creates an empty permission set
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or re-arms the permission for a peer IP
    ///
    /// Authorizing an already-authorized IP extends the existing entry;
    /// there is never more than one entry per IP.
    pub fn authorize(&self, ip: IpAddr, ttl: Duration) {
        let mut entries = self.entries.write().unwrap();
        entries
            .entry(ip)
            .and_modify(|permission| permission.expiration.refresh(ttl))
            .or_insert_with(|| Permission::new(ip, ttl));
    }

    /// True iff a live permission exists for the IP
    pub fn is_authorized(&self, ip: IpAddr) -> bool {
        let entries = self.entries.read().unwrap();
        entries.get(&ip).map_or(false, |p| !p.is_expired())
    }

    /// Snapshot of the stored permission for an IP, if any
    pub fn get(&self, ip: IpAddr) -> Option<Permission> {
        self.entries.read().unwrap().get(&ip).cloned()
    }

    /// Drops entries past their expiry
    pub fn remove_expired(&self) {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, permission| !permission.is_expired());
    }

    /// Number of stored entries, expired ones included until swept
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// True when no entries are stored
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}
