//! UDP transport for charge-management packets

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::CmError;

/// Create a UDP socket bound to `bind_ip:port`.
///
/// Blocking sockets are meant for a dedicated receive loop, non-blocking
/// ones for polling from a periodic task.
pub fn create_socket(bind_ip: IpAddr, port: u16, blocking: bool) -> Result<std::net::UdpSocket, CmError> {
    let bind_err = |source| CmError::Bind { port, source };

    let socket = Socket::new(Domain::for_address(SocketAddr::new(bind_ip, port)), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    socket
        .bind(&SocketAddr::new(bind_ip, port).into())
        .map_err(bind_err)?;
    socket.set_nonblocking(!blocking).map_err(bind_err)?;

    Ok(socket.into())
}

/// Bind a socket for a background receive task plus a non-blocking send
/// handle to the same socket.
///
/// Sends through the std handle report `WouldBlock` only if the kernel send
/// buffer is full, independent of the runtime's readiness tracking. Must be
/// called from within a runtime.
pub fn bind_with_sender(bind_ip: IpAddr, port: u16) -> Result<(UdpSocket, std::net::UdpSocket), CmError> {
    let bind_err = |source| CmError::Bind { port, source };

    // tokio drives the socket itself and requires non-blocking mode.
    let socket = create_socket(bind_ip, port, false)?;
    let sender = socket.try_clone().map_err(bind_err)?;
    let socket = UdpSocket::from_std(socket).map_err(bind_err)?;

    Ok((socket, sender))
}

/// One received datagram
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Bytes,
    pub source: SocketAddr,
}

/// Producer side of a bounded receive queue
#[derive(Debug, Clone)]
pub struct QueueSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> QueueSender<T> {
    /// Append an item without waiting. Returns `false` if the queue is full
    /// or closed, in which case the item is dropped.
    pub fn push(&self, item: T) -> bool {
        self.tx.try_send(item).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of a bounded receive queue
#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> QueueReceiver<T> {
    /// Take the oldest item without waiting
    pub fn pop(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Bounded FIFO that drops new items while full
pub fn bounded_queue<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (QueueSender { tx }, QueueReceiver { rx })
}

/// Delay after failed receives, doubling while errors repeat
#[derive(Debug, Clone, Default)]
pub struct ErrorBackoff {
    consecutive: u32,
}

impl ErrorBackoff {
    pub const INITIAL: Duration = Duration::from_millis(10);
    pub const MAX: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return how long to wait before the next attempt
    pub fn on_error(&mut self) -> Duration {
        self.consecutive = self.consecutive.saturating_add(1);
        let shift = (self.consecutive - 1).min(16);
        Self::INITIAL.saturating_mul(1 << shift).min(Self::MAX)
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Failures in the current run. Only the first and then every
    /// power of two are logged at error level.
    pub fn should_log(&self) -> bool {
        self.consecutive.is_power_of_two()
    }
}

/// Receive datagrams in the background and hand them to `queue`.
///
/// The socket is drained as fast as packets arrive so the OS receive buffer
/// never fills up; the consumer polls the queue at its own pace. Datagrams
/// longer than `max_len` are truncated. Receive errors are queued as well and
/// delay the next receive by an [`ErrorBackoff`].
pub fn spawn_receiver(
    socket: Arc<UdpSocket>,
    queue: QueueSender<io::Result<Datagram>>,
    max_len: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; max_len];
        let mut backoff = ErrorBackoff::new();

        loop {
            let (item, delay) = match socket.recv_from(&mut buf).await {
                Ok((len, source)) => {
                    debug!("Received {} bytes from {}", len, source);
                    backoff.reset();
                    let datagram = Datagram {
                        data: Bytes::copy_from_slice(&buf[..len]),
                        source,
                    };
                    (Ok(datagram), None)
                }
                Err(e) => {
                    let delay = backoff.on_error();
                    if backoff.should_log() {
                        error!("UDP receive error: {}", e);
                    } else {
                        debug!("UDP receive error (repeated): {}", e);
                    }
                    (Err(e), Some(delay))
                }
            };

            if !queue.push(item) && queue.is_closed() {
                break;
            }

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_queue_drops_newest_when_full() {
        let device_count = 3;
        let (tx, mut rx) = bounded_queue(device_count);

        for i in 0..device_count {
            assert!(tx.push(i));
        }
        assert!(!tx.push(device_count));

        let drained: Vec<_> = std::iter::from_fn(|| rx.pop()).collect();
        assert_eq!(drained, vec![0, 1, 2]);
        assert_eq!(rx.pop(), None);

        // Space is available again after draining
        assert!(tx.push(7));
        assert_eq!(rx.pop(), Some(7));
    }

    #[test]
    fn test_queue_closed() {
        let (tx, rx) = bounded_queue::<u8>(1);
        drop(rx);
        assert!(!tx.push(1));
        assert!(tx.is_closed());
    }

    #[test]
    fn test_create_socket() {
        let socket = create_socket(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, false).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_receiver_forwards_datagrams() {
        let (socket, _) = bind_with_sender(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        let socket = Arc::new(socket);
        let target = socket.local_addr().unwrap();
        let (tx, mut rx) = bounded_queue(4);
        let task = spawn_receiver(socket, tx, 8);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"0123456789", target).await.unwrap();

        let datagram = loop {
            if let Some(item) = rx.pop() {
                break item.unwrap();
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };

        // Truncated to the receive buffer
        assert_eq!(&datagram.data[..], b"01234567");
        assert_eq!(datagram.source, sender.local_addr().unwrap());
        task.abort();
    }

    #[test]
    fn test_error_backoff_grows_and_resets() {
        let mut backoff = ErrorBackoff::new();

        assert_eq!(backoff.on_error(), Duration::from_millis(10));
        assert!(backoff.should_log());
        assert_eq!(backoff.on_error(), Duration::from_millis(20));
        assert!(backoff.should_log());
        assert_eq!(backoff.on_error(), Duration::from_millis(40));
        assert!(!backoff.should_log());

        for _ in 0..20 {
            backoff.on_error();
        }
        assert_eq!(backoff.on_error(), ErrorBackoff::MAX);

        backoff.reset();
        assert_eq!(backoff.on_error(), ErrorBackoff::INITIAL);
    }

    #[tokio::test]
    async fn test_sender_shares_bound_socket() {
        let (socket, sender) = bind_with_sender(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        assert_eq!(socket.local_addr().unwrap(), sender.local_addr().unwrap());

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Writable right away, without waiting for the runtime to poll the socket
        assert_eq!(sender.send_to(b"ping", peer.local_addr().unwrap()).unwrap(), 4);

        let mut buf = [0u8; 8];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, socket.local_addr().unwrap());
    }
}
