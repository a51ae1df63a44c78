//! Directory of chargers controlled by a manager
//!
//! Each configured host is classified once at startup: literal IPv4
//! addresses are usable immediately, `.local` names are resolved through
//! mDNS and everything else through DNS. Resolution attempts are started by
//! the manager's periodic resolve tick and their results are applied back
//! into the directory from the same context.

use crate::resolver::ResolveError;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Device indices are carried as `u8` client ids.
pub const MAX_MANAGED_DEVICES: usize = 64;

const MDNS_SUFFIX: &str = ".local";

/// How a configured host gets its address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAddressType {
    StaticIp,
    Mdns,
    Dns,
}

impl std::fmt::Display for HostAddressType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostAddressType::StaticIp => write!(f, "static IP"),
            HostAddressType::Mdns => write!(f, "mDNS"),
            HostAddressType::Dns => write!(f, "DNS"),
        }
    }
}

/// Resolution progress of a managed device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    Unknown,
    NotResolved,
    Resolving,
    Resolved,
    Failed,
}

/// One charger controlled by the manager
#[derive(Debug, Clone)]
pub struct ManagedDevice {
    pub hostname: String,
    pub addr: SocketAddrV4,
    pub host_address_type: HostAddressType,
    pub resolve_state: ResolveState,
    pub last_resolve_attempt: Option<Instant>,
    pub device_index: u8,
}

impl ManagedDevice {
    /// Classify a configured host
    pub fn new(device_index: u8, hostname: &str, port: u16) -> Self {
        let (ip, host_address_type, resolve_state) = match hostname.parse::<Ipv4Addr>() {
            Ok(ip) => (ip, HostAddressType::StaticIp, ResolveState::Resolved),
            Err(_) if hostname.ends_with(MDNS_SUFFIX) => (
                Ipv4Addr::UNSPECIFIED,
                HostAddressType::Mdns,
                ResolveState::NotResolved,
            ),
            Err(_) => (
                Ipv4Addr::UNSPECIFIED,
                HostAddressType::Dns,
                ResolveState::Unknown,
            ),
        };

        Self {
            hostname: hostname.to_string(),
            addr: SocketAddrV4::new(ip, port),
            host_address_type,
            resolve_state,
            last_resolve_attempt: None,
            device_index,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolve_state == ResolveState::Resolved
    }

    fn due(&self, now: Instant, retry_interval: Duration) -> bool {
        match self.resolve_state {
            ResolveState::Resolved | ResolveState::Resolving => false,
            ResolveState::Unknown | ResolveState::NotResolved | ResolveState::Failed => self
                .last_resolve_attempt
                .map_or(true, |last| now.duration_since(last) >= retry_interval),
        }
    }
}

/// A resolution the manager should start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    pub device_index: u8,
    pub hostname: String,
    pub kind: HostAddressType,
}

/// Result of a finished resolution
#[derive(Debug)]
pub struct ResolveOutcome {
    pub device_index: u8,
    pub result: Result<Ipv4Addr, ResolveError>,
}

/// All devices controlled by a manager, in configuration order
#[derive(Debug)]
pub struct ManagerDirectory {
    devices: Vec<ManagedDevice>,
    connected: bool,
    resolving: usize,
}

impl ManagerDirectory {
    /// Build the directory. Fails on more than [`MAX_MANAGED_DEVICES`] hosts.
    pub fn new<S: AsRef<str>>(hosts: &[S], port: u16) -> Result<Self, crate::CmError> {
        if hosts.len() > MAX_MANAGED_DEVICES {
            return Err(crate::CmError::TooManyDevices {
                count: hosts.len(),
                max: MAX_MANAGED_DEVICES,
            });
        }

        let devices = hosts
            .iter()
            .enumerate()
            .map(|(i, host)| ManagedDevice::new(i as u8, host.as_ref(), port))
            .collect();

        Ok(Self {
            devices,
            connected: true,
            resolving: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, device_index: u8) -> Option<&ManagedDevice> {
        self.devices.get(device_index as usize)
    }

    pub fn devices(&self) -> &[ManagedDevice] {
        &self.devices
    }

    pub fn is_resolved(&self, device_index: u8) -> bool {
        self.get(device_index).is_some_and(ManagedDevice::is_resolved)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// True while at least one resolution is in flight
    pub fn resolver_active(&self) -> bool {
        self.resolving > 0
    }

    /// Find the resolved device a packet came from
    pub fn find_by_addr(&self, source: &SocketAddr) -> Option<u8> {
        self.devices
            .iter()
            .find(|d| d.is_resolved() && SocketAddr::V4(d.addr) == *source)
            .map(|d| d.device_index)
    }

    /// Mark every device whose retry interval has passed as resolving and
    /// return the resolutions to start.
    pub fn begin_due_resolutions(&mut self, now: Instant, retry_interval: Duration) -> Vec<ResolveRequest> {
        self.begin_resolutions(now, |d| d.due(now, retry_interval))
    }

    /// Start resolving every unresolved device, ignoring the retry interval.
    pub fn begin_all_resolutions(&mut self, now: Instant) -> Vec<ResolveRequest> {
        self.begin_resolutions(now, |d| {
            !matches!(d.resolve_state, ResolveState::Resolved | ResolveState::Resolving)
        })
    }

    fn begin_resolutions<F>(&mut self, now: Instant, mut pick: F) -> Vec<ResolveRequest>
    where
        F: FnMut(&ManagedDevice) -> bool,
    {
        let mut requests = Vec::new();

        for device in self.devices.iter_mut().filter(|d| pick(d)) {
            if device.resolve_state == ResolveState::Failed {
                debug!("Directory: Retrying {} after failed resolution", device.hostname);
                device.resolve_state = ResolveState::NotResolved;
            }

            device.resolve_state = ResolveState::Resolving;
            device.last_resolve_attempt = Some(now);
            self.resolving += 1;

            requests.push(ResolveRequest {
                device_index: device.device_index,
                hostname: device.hostname.clone(),
                kind: device.host_address_type,
            });
        }

        requests
    }

    /// Apply the result of a resolution started by this directory.
    pub fn complete_resolution(&mut self, outcome: ResolveOutcome) {
        let Some(device) = self.devices.get_mut(outcome.device_index as usize) else {
            return;
        };
        if device.resolve_state != ResolveState::Resolving {
            return;
        }
        self.resolving = self.resolving.saturating_sub(1);

        match outcome.result {
            Ok(ip) => {
                device.addr.set_ip(ip);
                device.resolve_state = ResolveState::Resolved;
                info!(
                    "Directory: Resolved {} ({}) to {}",
                    device.hostname, device.host_address_type, ip
                );
            }
            Err(e) => {
                device.resolve_state = ResolveState::Failed;
                warn!("Directory: Failed to resolve {}: {}", device.hostname, e);
            }
        }
    }
}
