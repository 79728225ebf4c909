//! Error types and handling for the allocation subsystem
//!
//! This module provides the failure taxonomy for:
//! - Allocation table operations (create/refresh collisions, quota)
//! - Channel binding operations
//! - Relay socket provisioning
//! - Configuration errors
//!
//! The error types map to appropriate STUN error codes as defined in RFC 5766.

use crate::types::FiveTuple;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// The main error type for the allocation subsystem
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from std::io
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An unexpired allocation already holds the 5-tuple
    #[error("allocation already exists for {0}")]
    AllocationExists(FiveTuple),

    /// No allocation known for the 5-tuple
    #[error("no allocation found for {0}")]
    AllocationNotFound(FiveTuple),

    /// Allocation quota reached
    #[error("allocation quota reached")]
    QuotaExceeded,

    /// The channel number is bound to a different peer
    #[error("channel {0:#06x} is already bound to another peer")]
    ChannelInUse(u16),

    /// The peer is bound to a different channel number
    #[error("peer {0} is already bound to another channel")]
    PeerAlreadyBound(SocketAddr),

    /// Channel number outside the reserved range
    #[error("invalid channel number {0:#06x}")]
    InvalidChannelNumber(u16),

    /// No binding exists for the channel number
    #[error("channel {0:#06x} is not bound")]
    ChannelNotFound(u16),

    /// Relay address provisioning failure
    #[error("relay allocation failed: {0}")]
    Relay(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for allocation subsystem operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Convert the error to a STUN error code
    ///
    /// Maps internal errors to the response codes defined in RFC 5766:
    /// - 400: Bad Request
    /// - 437: Allocation Mismatch
    /// - 486: Allocation Quota Reached
    /// - 508: Insufficient Capacity
    /// - 500: Server Error
    pub fn to_stun_error_code(&self) -> u16 {
        match self {
            Error::AllocationExists(_) => 437,
            Error::AllocationNotFound(_) => 437,
            Error::QuotaExceeded => 486,
            Error::ChannelInUse(_) => 400,
            Error::PeerAlreadyBound(_) => 400,
            Error::InvalidChannelNumber(_) => 400,
            Error::ChannelNotFound(_) => 400,
            Error::Relay(_) => 508,
            Error::Io(_) => 500,
            Error::Config(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    fn tuple() -> FiveTuple {
        FiveTuple {
            client: "10.0.0.1:40000".parse().unwrap(),
            server: "192.0.2.1:3478".parse().unwrap(),
            protocol: Protocol::Udp,
        }
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::AllocationExists(tuple()).to_stun_error_code(), 437);
        assert_eq!(Error::AllocationNotFound(tuple()).to_stun_error_code(), 437);
        assert_eq!(Error::QuotaExceeded.to_stun_error_code(), 486);
        assert_eq!(Error::ChannelInUse(0x4000).to_stun_error_code(), 400);
        assert_eq!(
            Error::PeerAlreadyBound("10.0.0.2:9000".parse().unwrap()).to_stun_error_code(),
            400
        );
        assert_eq!(Error::InvalidChannelNumber(0x3FFF).to_stun_error_code(), 400);
        assert_eq!(Error::ChannelNotFound(0x4001).to_stun_error_code(), 400);
        assert_eq!(Error::Relay("no ports".into()).to_stun_error_code(), 508);
        assert_eq!(Error::Config("bad range".into()).to_stun_error_code(), 500);
    }

    #[test]
    fn test_error_messages() {
        let err = Error::ChannelInUse(0x4001);
        assert_eq!(
            err.to_string(),
            "channel 0x4001 is already bound to another peer"
        );

        let err = Error::InvalidChannelNumber(0x8000);
        assert_eq!(err.to_string(), "invalid channel number 0x8000");

        let err = Error::AllocationNotFound(tuple());
        assert_eq!(
            err.to_string(),
            "no allocation found for 10.0.0.1:40000->192.0.2.1:3478 (UDP)"
        );

        let io_err = io::Error::new(io::ErrorKind::Other, "boom");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "I/O error: boom");
    }
}
