//! Hostname resolution for managed chargers
//!
//! `.local` names go through an mDNS daemon, everything else through the
//! system resolver. Only IPv4 addresses are used.

use crate::directory::HostAddressType;
use crate::error::CmError;
use async_trait::async_trait;
use mdns_sd::{HostnameResolutionEvent, ServiceDaemon};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Default time to wait for an mDNS answer
pub const MDNS_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    #[error("mDNS is not available")]
    MdnsUnavailable,

    #[error("DNS lookup failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("no IPv4 address for {0}")]
    NoAddress(String),

    #[error("resolving {0} timed out")]
    Timeout(String),
}

/// Resolves configured hostnames to addresses
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, hostname: &str, kind: HostAddressType) -> Result<Ipv4Addr, ResolveError>;
}

/// Resolver backed by an mDNS daemon and the system DNS resolver
pub struct NetworkResolver {
    daemon: Option<ServiceDaemon>,
    mdns_timeout: Duration,
}

impl NetworkResolver {
    /// Create a resolver with its own mDNS daemon
    pub fn new() -> Result<Self, CmError> {
        let daemon = ServiceDaemon::new()?;
        info!("mDNS: Resolver daemon started");

        Ok(Self {
            daemon: Some(daemon),
            mdns_timeout: MDNS_TIMEOUT,
        })
    }

    /// Create a resolver that only uses DNS
    pub fn dns_only() -> Self {
        Self {
            daemon: None,
            mdns_timeout: MDNS_TIMEOUT,
        }
    }

    pub fn with_mdns_timeout(mut self, timeout: Duration) -> Self {
        self.mdns_timeout = timeout;
        self
    }

    async fn resolve_mdns(&self, hostname: &str) -> Result<Ipv4Addr, ResolveError> {
        let daemon = self.daemon.as_ref().ok_or(ResolveError::MdnsUnavailable)?;

        // mdns-sd wants fully qualified names
        let fqdn = if hostname.ends_with('.') {
            hostname.to_string()
        } else {
            format!("{}.", hostname)
        };

        let receiver =
            daemon.resolve_hostname(&fqdn, Some(self.mdns_timeout.as_millis() as u64))?;

        let result = loop {
            match receiver.recv_async().await {
                Ok(HostnameResolutionEvent::AddressesFound(_, addrs)) => {
                    if let Some(ip) = first_ipv4(addrs.iter().copied()) {
                        break Ok(ip);
                    }
                }
                Ok(HostnameResolutionEvent::SearchTimeout(_)) | Err(_) => {
                    break Err(ResolveError::Timeout(hostname.to_string()));
                }
                Ok(event) => debug!("mDNS: {:?}", event),
            }
        };

        let _ = daemon.stop_resolve_hostname(&fqdn);
        result
    }

    async fn resolve_dns(&self, hostname: &str) -> Result<Ipv4Addr, ResolveError> {
        let addrs = tokio::net::lookup_host((hostname, 0)).await?;
        first_ipv4(addrs.map(|a: SocketAddr| a.ip()))
            .ok_or_else(|| ResolveError::NoAddress(hostname.to_string()))
    }

    /// Shutdown the mDNS daemon
    pub fn shutdown(&self) -> Result<(), CmError> {
        if let Some(daemon) = &self.daemon {
            daemon.shutdown()?;
        }
        Ok(())
    }
}

#[async_trait]
impl HostResolver for NetworkResolver {
    async fn resolve(&self, hostname: &str, kind: HostAddressType) -> Result<Ipv4Addr, ResolveError> {
        match kind {
            HostAddressType::StaticIp => hostname
                .parse()
                .map_err(|_| ResolveError::NoAddress(hostname.to_string())),
            HostAddressType::Mdns => self.resolve_mdns(hostname).await,
            HostAddressType::Dns => self.resolve_dns(hostname).await,
        }
    }
}

/// Resolver answering from a fixed table
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Ipv4Addr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, hostname: impl Into<String>, ip: Ipv4Addr) -> Self {
        self.hosts.insert(hostname.into(), ip);
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, hostname: &str, _kind: HostAddressType) -> Result<Ipv4Addr, ResolveError> {
        self.hosts
            .get(hostname)
            .copied()
            .ok_or_else(|| ResolveError::NoAddress(hostname.to_string()))
    }
}

fn first_ipv4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<Ipv4Addr> {
    addrs.into_iter().find_map(|a| match a {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    })
}
