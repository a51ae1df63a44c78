//! Error types

use std::io;
use thiserror::Error;

/// Setup failures of the manager and client engines
#[derive(Debug, Error)]
pub enum CmError {
    #[error("unable to bind UDP socket to port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("no managed devices configured")]
    NoDevices,

    #[error("too many managed devices: {count} (at most {max})")]
    TooManyDevices { count: usize, max: usize },

    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    #[error("invalid state file: {0}")]
    StateFile(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Problems with a managed device, reported through the manager's error callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkingError {
    /// The device sent a packet that failed header validation
    InvalidHeader,
    /// The device reports that managed mode is disabled
    NotManaged,
}

impl std::fmt::Display for NetworkingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkingError::InvalidHeader => write!(f, "invalid header"),
            NetworkingError::NotManaged => write!(f, "not managed"),
        }
    }
}
