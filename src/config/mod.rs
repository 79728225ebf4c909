//! Configuration module for the allocation subsystem
//!
//! This module provides configuration structures and functionality for:
//! - Relay address provisioning (CIDR range, port range, quota)
//! - Allocation, permission and channel-binding lifetimes
//! - Relay loop and sweeper timing

use crate::error::{Error, Result};
use crate::types::{MAX_CHANNEL_NUMBER, MIN_CHANNEL_NUMBER};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use serde_with::DurationSeconds;
use std::time::Duration;

/// Configuration for relay transport address provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// IP range relay addresses are drawn from (CIDR notation)
    pub relay_address_range: String,

    /// Lowest relay port to try
    pub min_port: u16,

    /// Highest relay port to try
    pub max_port: u16,

    /// Maximum concurrent allocations
    pub max_allocations: usize,
}

/// Configuration for the subsystem's expiry clocks
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Lifetime granted when the client requests none
    #[serde_as(as = "DurationSeconds<u64>")]
    pub default_lifetime: Duration,

    /// Lower bound on granted allocation lifetimes
    #[serde_as(as = "DurationSeconds<u64>")]
    pub min_lifetime: Duration,

    /// Upper bound on granted allocation lifetimes
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_lifetime: Duration,

    /// How long permissions remain valid
    #[serde_as(as = "DurationSeconds<u64>")]
    pub permission_lifetime: Duration,

    /// How long channel bindings remain valid
    #[serde_as(as = "DurationSeconds<u64>")]
    pub channel_lifetime: Duration,

    /// Per-receive liveness deadline of the relay loop
    #[serde_as(as = "DurationSeconds<u64>")]
    pub read_timeout: Duration,

    /// How often the expiry sweeper runs
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sweep_interval: Duration,
}

/// Configuration for the reserved channel-number range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Lowest channel number handed to clients
    pub min_number: u16,

    /// Highest channel number handed to clients
    pub max_number: u16,
}

/// Main configuration struct for the allocation subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Relay provisioning configuration
    pub relay: RelayConfig,

    /// Lifetime and timing configuration
    pub timeouts: TimeoutConfig,

    /// Channel number range configuration
    pub channels: ChannelConfig,
}

impl AllocatorConfig {
    /// Get the relay address range in CIDR notation
    pub fn get_relay_address_range(&self) -> &str {
        &self.relay.relay_address_range
    }

    /// Get maximum allowed allocations
    pub fn get_max_allocations(&self) -> usize {
        self.relay.max_allocations
    }

    /// Get permission lifetime duration
    pub fn get_permission_lifetime(&self) -> Duration {
        self.timeouts.permission_lifetime
    }

    /// Get channel binding lifetime duration
    pub fn get_channel_lifetime(&self) -> Duration {
        self.timeouts.channel_lifetime
    }

    /// Get the relay loop per-receive deadline
    pub fn get_read_timeout(&self) -> Duration {
        self.timeouts.read_timeout
    }

    /// Get the expiry sweeper interval
    pub fn get_sweep_interval(&self) -> Duration {
        self.timeouts.sweep_interval
    }

    /// Clamp a requested allocation lifetime to the configured bounds
    ///
    /// A zero request selects the default lifetime; refresh-to-zero
    /// deallocation is decided by the caller before clamping.
    pub fn clamp_lifetime(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.timeouts.default_lifetime
        } else {
            requested.clamp(self.timeouts.min_lifetime, self.timeouts.max_lifetime)
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.relay
            .relay_address_range
            .parse::<IpNetwork>()
            .map_err(|e| Error::Config(format!("invalid relay address range: {}", e)))?;

        if self.relay.min_port > self.relay.max_port {
            return Err(Error::Config("min_port must not exceed max_port".into()));
        }
        if self.relay.max_allocations == 0 {
            return Err(Error::Config("max_allocations must be greater than 0".into()));
        }
        if self.timeouts.min_lifetime > self.timeouts.max_lifetime {
            return Err(Error::Config(
                "min_lifetime must not exceed max_lifetime".into(),
            ));
        }
        if self.timeouts.sweep_interval.is_zero() {
            return Err(Error::Config("sweep_interval must be greater than 0".into()));
        }
        if self.channels.min_number > self.channels.max_number {
            return Err(Error::Config(
                "channel min_number must not exceed max_number".into(),
            ));
        }
        if self.channels.min_number < MIN_CHANNEL_NUMBER
            || self.channels.max_number > MAX_CHANNEL_NUMBER
        {
            return Err(Error::Config(format!(
                "channel numbers must stay within {:#06x}..={:#06x}",
                MIN_CHANNEL_NUMBER, MAX_CHANNEL_NUMBER
            )));
        }

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;

        let config: AllocatorConfig = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse config file: {}", e)))?;

        config.validate()?;

        Ok(config)
    }
}

// Defaults follow RFC 5766: 10-minute allocations, 5-minute permissions,
// 10-minute channel bindings.
impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig {
                relay_address_range: "0.0.0.0/32".to_string(),
                min_port: 49152,
                max_port: 65535,
                max_allocations: 10000,
            },
            timeouts: TimeoutConfig {
                default_lifetime: Duration::from_secs(600),
                min_lifetime: Duration::from_secs(30),
                max_lifetime: Duration::from_secs(3600),
                permission_lifetime: Duration::from_secs(300),
                channel_lifetime: Duration::from_secs(600),
                read_timeout: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(5),
            },
            channels: ChannelConfig {
                min_number: MIN_CHANNEL_NUMBER,
                max_number: MAX_CHANNEL_NUMBER,
            },
        }
    }
}
