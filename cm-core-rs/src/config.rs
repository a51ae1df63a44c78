//! Configuration for the manager and client engines

use crate::protocol::{CHARGE_MANAGEMENT_PORT, CHARGE_MANAGER_PORT};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Manager engine configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Local address for the manager socket
    pub bind_addr: IpAddr,

    /// Port state packets arrive on
    pub port: u16,

    /// Port chargers listen on for commands
    pub client_port: u16,

    /// Receive queue poll period
    pub poll_interval: Duration,

    /// Maximum packets handled per poll
    pub poll_burst: usize,

    /// Period of the hostname resolution task
    pub resolve_interval: Duration,

    /// Minimum time between resolution attempts for one device
    pub resolve_retry: Duration,

    /// Upper bound for a single resolution
    pub resolve_timeout: Duration,

    /// Packets from unknown addresses are only logged at debug level this
    /// long after startup, while hostnames are still being resolved
    pub unknown_source_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: CHARGE_MANAGER_PORT,
            client_port: CHARGE_MANAGEMENT_PORT,
            poll_interval: Duration::from_millis(50),
            poll_burst: 10,
            resolve_interval: Duration::from_secs(1),
            resolve_retry: Duration::from_secs(10),
            resolve_timeout: Duration::from_secs(5),
            unknown_source_grace: Duration::from_secs(20),
        }
    }
}

impl ManagerConfig {
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_client_port(mut self, port: u16) -> Self {
        self.client_port = port;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_resolve_retry(mut self, retry: Duration) -> Self {
        self.resolve_retry = retry;
        self
    }

    pub fn with_unknown_source_grace(mut self, grace: Duration) -> Self {
        self.unknown_source_grace = grace;
        self
    }
}

/// Client engine configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local address for the client socket
    pub bind_addr: IpAddr,

    /// Port command packets arrive on
    pub port: u16,

    /// Receive poll period
    pub poll_interval: Duration,

    /// Period of state packets sent to the manager
    pub send_interval: Duration,

    /// Minimum time between accepted manager address changes
    pub address_debounce: Duration,

    /// The manager is considered gone after this long without a valid packet
    pub manager_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: CHARGE_MANAGEMENT_PORT,
            poll_interval: Duration::from_millis(100),
            send_interval: Duration::from_secs(1),
            address_debounce: Duration::from_secs(60),
            manager_timeout: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }

    pub fn with_address_debounce(mut self, debounce: Duration) -> Self {
        self.address_debounce = debounce;
        self
    }

    pub fn with_manager_timeout(mut self, timeout: Duration) -> Self {
        self.manager_timeout = timeout;
        self
    }
}
