//! Charger side of the charge-management protocol
//!
//! The client accepts command packets from a single manager and reports its
//! state back to it. Because the manager is identified only by the source
//! address of its packets, a change of that address is trusted at most once
//! per debounce interval. Two managers fighting over one charger therefore
//! block charging instead of taking turns.

use crate::config::ClientConfig;
use crate::error::CmError;
use crate::protocol::{CommandPacket, COMMAND_PACKET_LEN};
use crate::sequence::SequenceTracker;
use crate::state::{build_state_packet, ChargerStatus, SystemState};
use crate::transport;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Allocation received from the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandUpdate {
    /// Allocated current in mA
    pub allocated_current: u16,
    pub cp_disconnect_requested: bool,
    /// 0 if the manager does not allocate phases
    pub allocated_phases: i8,
}

impl CommandUpdate {
    /// Reported while the manager address is not trusted
    pub const BLOCKED: CommandUpdate = CommandUpdate {
        allocated_current: 0,
        cp_disconnect_requested: false,
        allocated_phases: 0,
    };

    fn from_packet(packet: &CommandPacket) -> Self {
        Self {
            allocated_current: packet.v1.allocated_current,
            cp_disconnect_requested: packet.cp_disconnect_requested(),
            allocated_phases: packet.allocated_phases(),
        }
    }
}

pub type CommandCallback = Box<dyn FnMut(CommandUpdate) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDecision {
    Accepted,
    Blocked,
}

/// Which manager address the client currently trusts
#[derive(Debug, Clone)]
pub struct AddressLock {
    manager_addr: Option<SocketAddr>,
    valid: bool,
    last_change: Option<Instant>,
    debounce: Duration,
}

impl AddressLock {
    pub fn new(debounce: Duration) -> Self {
        Self {
            manager_addr: None,
            valid: false,
            last_change: None,
            debounce,
        }
    }

    /// Last seen manager address, trusted or not
    pub fn manager_addr(&self) -> Option<SocketAddr> {
        self.manager_addr
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Address state packets may be sent to
    pub fn valid_addr(&self) -> Option<SocketAddr> {
        self.manager_addr.filter(|_| self.valid)
    }

    pub fn invalidate(&mut self) {
        if self.valid {
            if let Some(addr) = self.manager_addr {
                info!("Client: No valid packet from manager {} in time, invalidating", addr);
            }
        }
        self.valid = false;
    }

    fn debounced(&self, now: Instant) -> bool {
        self.last_change
            .map_or(true, |last| now.saturating_duration_since(last) > self.debounce)
    }

    /// Decide whether a valid packet from `from` is trusted.
    ///
    /// Only accepted changes restart the debounce interval. A rejected address
    /// is remembered and accepted once more than the interval has passed.
    pub fn observe(&mut self, from: SocketAddr, now: Instant) -> LockDecision {
        if self.manager_addr != Some(from) {
            let previous = self.manager_addr.replace(from);

            if self.debounced(now) {
                match previous {
                    Some(previous) => {
                        info!("Client: Manager address changed from {} to {}", previous, from)
                    }
                    None => info!("Client: Using manager address {}", from),
                }
                self.valid = true;
                self.last_change = Some(now);
                return LockDecision::Accepted;
            }

            match previous {
                Some(previous) => warn!(
                    "Client: Rejecting conflicting manager address change from {} to {}",
                    previous, from
                ),
                None => warn!("Client: Rejecting manager address {}", from),
            }
            self.valid = false;
            return LockDecision::Blocked;
        }

        if self.valid {
            return LockDecision::Accepted;
        }

        if self.debounced(now) {
            info!("Client: Accepting manager address {}", from);
            self.valid = true;
            self.last_change = Some(now);
            LockDecision::Accepted
        } else {
            LockDecision::Blocked
        }
    }
}

/// Client engine
pub struct Client {
    config: ClientConfig,
    socket: UdpSocket,
    lock: AddressLock,
    sequence: SequenceTracker,
    last_successful_recv: Instant,
    next_seq_num: u16,
    callback: Option<CommandCallback>,
    system: Box<dyn SystemState>,
}

impl Client {
    /// Bind the client socket. The socket is non-blocking and only touched
    /// from [`Client::poll`] and [`Client::send_state`].
    pub fn register(config: ClientConfig, system: impl SystemState + 'static) -> Result<Self, CmError> {
        let socket = transport::create_socket(config.bind_addr, config.port, false)?;
        info!("Client: Listening on {}", socket.local_addr()?);

        Ok(Self {
            lock: AddressLock::new(config.address_debounce),
            config,
            socket,
            sequence: SequenceTracker::new(),
            last_successful_recv: Instant::now(),
            next_seq_num: 0,
            callback: None,
            system: Box::new(system),
        })
    }

    /// Set the command callback. Without one, received commands are sent back
    /// to the manager unchanged.
    pub fn set_command_callback<F>(&mut self, callback: F)
    where
        F: FnMut(CommandUpdate) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// Manager address state packets are currently sent to
    pub fn manager_addr(&self) -> Option<SocketAddr> {
        self.lock.valid_addr()
    }

    /// Periodic receive tick: handle at most one command packet.
    pub fn poll(&mut self) {
        self.poll_at(Instant::now());
    }

    pub fn poll_at(&mut self, now: Instant) {
        let mut buf = [0u8; COMMAND_PACKET_LEN];

        let (len, from) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    error!("Client: recvfrom failed: {}", e);
                }
                // Stop sending state to a manager that went away.
                if now.saturating_duration_since(self.last_successful_recv) >= self.config.manager_timeout {
                    self.lock.invalidate();
                }
                return;
            }
        };

        let packet = match CommandPacket::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(
                    "Client: Command packet from {} ({} bytes) failed validation: {}",
                    from, len, e
                );
                return;
            }
        };

        let last_seen = self.sequence.last_seen();
        if !self.sequence.accept(packet.header.seq_num) {
            debug!(
                "Client: Stale (out of order?) command packet. Last seen seq_num is {:?}, received seq_num is {}",
                last_seen, packet.header.seq_num
            );
            return;
        }

        if self.lock.observe(from, now) == LockDecision::Blocked {
            if let Some(callback) = self.callback.as_mut() {
                callback(CommandUpdate::BLOCKED);
            }
            return;
        }

        self.last_successful_recv = now;

        match self.callback.as_mut() {
            Some(callback) => callback(CommandUpdate::from_packet(&packet)),
            None => {
                if let Err(e) = self.socket.send_to(&packet.encode(), from) {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        warn!("Client: Failed to echo command to {}: {}", from, e);
                    }
                }
            }
        }
    }

    /// Send the charger state to the trusted manager.
    ///
    /// Returns `false` if no manager address is trusted or the send failed.
    pub fn send_state(&mut self, status: &ChargerStatus) -> bool {
        let Some(target) = self.lock.valid_addr() else {
            return false;
        };

        let packet = build_state_packet(self.next_seq_num, status, self.system.as_ref());
        self.next_seq_num = self.next_seq_num.wrapping_add(1);

        let bytes = packet.encode();
        match self.socket.send_to(&bytes, target) {
            Ok(sent) if sent == bytes.len() => true,
            Ok(sent) => {
                error!(
                    "Client: Failed to send state: sendto truncated packet (of {} bytes) to {} bytes",
                    bytes.len(),
                    sent
                );
                false
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    warn!("Client: Failed to send state to {}: {}", target, e);
                }
                false
            }
        }
    }
}
