//! Manager side of the charge-management protocol
//!
//! The manager receives state packets from every managed charger and sends
//! current allocations back. A background task moves datagrams from the
//! socket into a bounded queue; everything else (validation, sequence
//! tracking, the directory, callbacks) runs in [`Manager::poll`] and
//! [`Manager::resolve_due`], which the owner calls periodically from one
//! task.

use crate::config::ManagerConfig;
use crate::directory::{ManagedDevice, ManagerDirectory, ResolveOutcome, ResolveRequest};
use crate::error::{CmError, NetworkingError};
use crate::protocol::{CommandPacket, StatePacket, StateV1, StateV2, StateV3, STATE_PACKET_LEN};
use crate::resolver::{HostResolver, ResolveError};
use crate::sequence::SequenceTracker;
use crate::transport::{self, bounded_queue, Datagram, QueueReceiver};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Called with decoded state packets: device index, v1 and the optional newer blocks
pub type StateCallback = Box<dyn FnMut(u8, &StateV1, Option<&StateV2>, Option<&StateV3>) + Send>;

/// Called when a device sends unusable packets
pub type ErrorCallback = Box<dyn FnMut(u8, NetworkingError) + Send>;

/// Hook for phase switching logic to adjust packets in flight
pub trait PhaseSwitchFilter: Send {
    fn filter_state_packet(&mut self, _device_index: u8, _packet: &mut StatePacket) {}

    fn filter_command_packet(&mut self, _device_index: u8, _packet: &mut CommandPacket) {}
}

/// Manager engine
pub struct Manager {
    config: ManagerConfig,
    directory: ManagerDirectory,
    socket: Arc<UdpSocket>,
    sender: std::net::UdpSocket,
    queue: QueueReceiver<io::Result<Datagram>>,
    receiver_task: JoinHandle<()>,
    sequences: Vec<SequenceTracker>,
    resolver: Arc<dyn HostResolver>,
    resolved_tx: mpsc::UnboundedSender<ResolveOutcome>,
    resolved_rx: mpsc::UnboundedReceiver<ResolveOutcome>,
    state_callback: Option<StateCallback>,
    error_callback: Option<ErrorCallback>,
    phase_filter: Option<Box<dyn PhaseSwitchFilter>>,
    next_seq_num: u16,
    started: Instant,
    #[cfg(test)]
    send_fault: Option<io::ErrorKind>,
}

impl Manager {
    /// Build the device directory, bind the manager socket and start the
    /// background receive task. Must be called from within a tokio runtime.
    pub fn register<S: AsRef<str>>(
        config: ManagerConfig,
        hosts: &[S],
        resolver: Arc<dyn HostResolver>,
    ) -> Result<Self, CmError> {
        if hosts.is_empty() {
            return Err(CmError::NoDevices);
        }
        let directory = ManagerDirectory::new(hosts, config.client_port)?;

        let (socket, sender) = transport::bind_with_sender(config.bind_addr, config.port)?;
        let socket = Arc::new(socket);
        info!(
            "Manager: Listening on {} for {} devices",
            socket.local_addr()?,
            directory.len()
        );

        // Sized to the device count: only the latest state per device matters.
        let (queue_tx, queue) = bounded_queue(directory.len());
        let receiver_task = transport::spawn_receiver(socket.clone(), queue_tx, STATE_PACKET_LEN);

        let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();

        Ok(Self {
            sequences: vec![SequenceTracker::new(); directory.len()],
            config,
            directory,
            socket,
            sender,
            queue,
            receiver_task,
            resolver,
            resolved_tx,
            resolved_rx,
            state_callback: None,
            error_callback: None,
            phase_filter: None,
            next_seq_num: 1,
            started: Instant::now(),
            #[cfg(test)]
            send_fault: None,
        })
    }

    /// Set the state packet callback. Without one, every valid state packet
    /// is answered with a command echoing the charger's allowed current.
    pub fn set_state_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u8, &StateV1, Option<&StateV2>, Option<&StateV3>) + Send + 'static,
    {
        self.state_callback = Some(Box::new(callback));
    }

    pub fn set_error_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u8, NetworkingError) + Send + 'static,
    {
        self.error_callback = Some(Box::new(callback));
    }

    pub fn set_phase_filter(&mut self, filter: impl PhaseSwitchFilter + 'static) {
        self.phase_filter = Some(Box::new(filter));
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    pub fn device_count(&self) -> usize {
        self.directory.len()
    }

    pub fn device(&self, device_index: u8) -> Option<&ManagedDevice> {
        self.directory.get(device_index)
    }

    pub fn is_resolved(&self, device_index: u8) -> bool {
        self.directory.is_resolved(device_index)
    }

    pub fn is_connected(&self) -> bool {
        self.directory.is_connected()
    }

    /// Network connectivity changed. On connect every unresolved device is
    /// resolved again right away.
    pub fn set_connected(&mut self, connected: bool) {
        self.directory.set_connected(connected);
        if connected {
            self.resolve_all();
        }
    }

    /// Start resolving all unresolved devices, ignoring the retry interval
    pub fn resolve_all(&mut self) {
        self.apply_resolutions();
        let requests = self.directory.begin_all_resolutions(Instant::now());
        self.spawn_resolutions(requests);
    }

    /// Periodic resolve tick: apply finished resolutions and start new ones
    /// for devices whose retry interval has passed.
    pub fn resolve_due(&mut self) {
        self.apply_resolutions();
        if !self.directory.is_connected() {
            return;
        }
        let requests = self
            .directory
            .begin_due_resolutions(Instant::now(), self.config.resolve_retry);
        self.spawn_resolutions(requests);
    }

    fn spawn_resolutions(&self, requests: Vec<ResolveRequest>) {
        for request in requests {
            debug!(
                "Manager: Resolving {} via {}",
                request.hostname, request.kind
            );

            let resolver = self.resolver.clone();
            let tx = self.resolved_tx.clone();
            let timeout = self.config.resolve_timeout;

            tokio::spawn(async move {
                let result =
                    match tokio::time::timeout(timeout, resolver.resolve(&request.hostname, request.kind)).await {
                        Ok(result) => result,
                        Err(_) => Err(ResolveError::Timeout(request.hostname.clone())),
                    };

                let _ = tx.send(ResolveOutcome {
                    device_index: request.device_index,
                    result,
                });
            });
        }
    }

    fn apply_resolutions(&mut self) {
        while let Ok(outcome) = self.resolved_rx.try_recv() {
            self.directory.complete_resolution(outcome);
        }
    }

    /// Periodic receive tick: handle up to `poll_burst` queued packets.
    pub fn poll(&mut self) {
        self.apply_resolutions();

        for _ in 0..self.config.poll_burst {
            let Some(item) = self.queue.pop() else {
                return;
            };

            match item {
                Ok(datagram) => self.handle_datagram(datagram),
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!("Manager: recvfrom failed: {}", e);
                    }
                    return;
                }
            }
        }
    }

    fn handle_datagram(&mut self, datagram: Datagram) {
        let source = datagram.source;

        let Some(device_index) = self.directory.find_by_addr(&source) else {
            if self.expects_unknown_sources() {
                debug!("Manager: Received packet from unknown {} while resolving", source);
            } else {
                warn!(
                    "Manager: Received packet from unknown {}. Is the config complete?",
                    source
                );
            }
            return;
        };
        let name = self.device_name(device_index);

        let mut packet = match StatePacket::decode(&datagram.data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(
                    "Manager: State packet from {} ({}) ({} bytes) failed validation: {}",
                    name,
                    source,
                    datagram.data.len(),
                    e
                );
                self.report_error(device_index, NetworkingError::InvalidHeader);
                return;
            }
        };

        let tracker = &mut self.sequences[device_index as usize];
        let last_seen = tracker.last_seen();
        if !tracker.accept(packet.header.seq_num) {
            debug!(
                "Manager: Stale (out of order?) state packet from {} ({}). Last seen seq_num is {:?}, received seq_num is {}",
                name, source, last_seen, packet.header.seq_num
            );
            return;
        }

        if !packet.v1.is_managed() {
            warn!("Manager: {} ({}) reports managed is not activated!", name, source);
            self.report_error(device_index, NetworkingError::NotManaged);
            return;
        }

        if let Some(filter) = self.phase_filter.as_mut() {
            filter.filter_state_packet(device_index, &mut packet);
        }

        match self.state_callback.as_mut() {
            Some(callback) => callback(
                device_index,
                &packet.v1,
                packet.v2.as_ref(),
                packet.v3.as_ref(),
            ),
            None => {
                let mut echo = CommandPacket::new(
                    packet.header.seq_num,
                    packet.v1.allowed_charging_current,
                    false,
                    packet.v3.map_or(0, |v3| v3.phase_count()),
                );
                self.send_command(device_index, &mut echo);
            }
        }
    }

    /// Packets from unknown sources are expected during the startup grace
    /// window while hostnames are still being resolved.
    fn expects_unknown_sources(&self) -> bool {
        self.started.elapsed() < self.config.unknown_source_grace && self.directory.resolver_active()
    }

    fn device_name(&self, device_index: u8) -> String {
        self.directory
            .get(device_index)
            .map(|d| d.hostname.clone())
            .unwrap_or_else(|| format!("#{}", device_index))
    }

    fn report_error(&mut self, device_index: u8, error: NetworkingError) {
        if let Some(callback) = self.error_callback.as_mut() {
            callback(device_index, error);
        }
    }

    /// Send an allocation to a charger using the manager's sequence counter.
    ///
    /// The counter only advances if the packet was sent or deliberately
    /// skipped; on backpressure the retry reuses the same number.
    pub fn send_manager_update(
        &mut self,
        client_id: u8,
        allocated_current: u16,
        cp_disconnect_requested: bool,
        allocated_phases: i8,
    ) -> bool {
        let mut packet = CommandPacket::new(
            self.next_seq_num,
            allocated_current,
            cp_disconnect_requested,
            allocated_phases,
        );

        let done = self.send_command(client_id, &mut packet);
        if done {
            self.next_seq_num = self.next_seq_num.wrapping_add(1);
        }
        done
    }

    /// Send a command packet to a charger.
    ///
    /// Returns `false` only if the socket's send buffer is full and the
    /// caller should retry later. Unresolved devices are skipped and other
    /// send failures are logged; both count as done.
    pub fn send_command(&mut self, client_id: u8, packet: &mut CommandPacket) -> bool {
        let Some(device) = self.directory.get(client_id) else {
            return true;
        };
        if !device.is_resolved() {
            return true;
        }
        let target = SocketAddr::V4(device.addr);

        if let Some(filter) = self.phase_filter.as_mut() {
            filter.filter_command_packet(client_id, packet);
        }

        let bytes = packet.encode();
        match self.send_to(&bytes, target) {
            Ok(sent) if sent == bytes.len() => true,
            Ok(sent) => {
                error!(
                    "Manager: Failed to send command: sendto truncated packet (of {} bytes) to {} bytes",
                    bytes.len(),
                    sent
                );
                true
            }
            Err(e) => match e.kind() {
                io::ErrorKind::WouldBlock => false,
                // Usually means there is no network connection yet.
                io::ErrorKind::OutOfMemory => true,
                io::ErrorKind::HostUnreachable => {
                    if self.directory.is_connected() {
                        warn!("Manager: Failed to send command to {}: {}", target, e);
                    }
                    true
                }
                _ => {
                    warn!("Manager: Failed to send command to {}: {}", target, e);
                    true
                }
            },
        }
    }
}

impl Manager {
    #[cfg(not(test))]
    fn send_to(&mut self, bytes: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.sender.send_to(bytes, target)
    }

    #[cfg(test)]
    fn send_to(&mut self, bytes: &[u8], target: SocketAddr) -> io::Result<usize> {
        match self.send_fault.take() {
            Some(kind) => Err(kind.into()),
            None => self.sender.send_to(bytes, target),
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.receiver_task.abort();
    }
}
