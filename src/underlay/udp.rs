//! UDP/IP underlay towards a first-hop router.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::core::{DEFAULT_INBOX_CAPACITY, Underlay};

/// Default receive buffer size.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65535;

/// Sends encapsulated packets to a fixed next hop and pumps received
/// datagrams into a channel.
#[derive(Debug)]
pub struct UdpUnderlay {
    socket: Arc<UdpSocket>,
    next_hop: SocketAddr,
    pump: JoinHandle<()>,
}

impl UdpUnderlay {
    /// Bind with default options.
    pub async fn bind(
        addr: SocketAddr,
        next_hop: SocketAddr,
    ) -> io::Result<(Arc<Self>, mpsc::Receiver<Vec<u8>>)> {
        UdpUnderlayBuilder::new(next_hop).bind(addr).await
    }

    /// Local UDP address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Where packets are sent.
    pub fn next_hop(&self) -> SocketAddr {
        self.next_hop
    }
}

impl Underlay for UdpUnderlay {
    fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.socket.try_send_to(packet, self.next_hop).map(|_| ())
    }
}

impl Drop for UdpUnderlay {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Builder for [`UdpUnderlay`].
#[derive(Debug, Clone)]
pub struct UdpUnderlayBuilder {
    next_hop: SocketAddr,
    recv_buffer_size: usize,
    inbound_capacity: usize,
}

impl UdpUnderlayBuilder {
    /// Builder sending to `next_hop`.
    pub fn new(next_hop: SocketAddr) -> Self {
        Self {
            next_hop,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            inbound_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }

    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size.max(1);
        self
    }

    /// Set how many received packets may wait for the dispatcher.
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }

    /// Bind to `addr` and start the receive pump.
    pub async fn bind(
        self,
        addr: SocketAddr,
    ) -> io::Result<(Arc<UdpUnderlay>, mpsc::Receiver<Vec<u8>>)> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(self.from_socket(socket))
    }

    /// Use an already bound socket. Must be called inside a tokio runtime.
    pub fn from_socket(self, socket: UdpSocket) -> (Arc<UdpUnderlay>, mpsc::Receiver<Vec<u8>>) {
        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(self.inbound_capacity);
        let pump = tokio::spawn(pump(
            Arc::clone(&socket),
            tx,
            vec![0u8; self.recv_buffer_size],
        ));
        let underlay = UdpUnderlay {
            socket,
            next_hop: self.next_hop,
            pump,
        };
        (Arc::new(underlay), rx)
    }
}

async fn pump(socket: Arc<UdpSocket>, tx: mpsc::Sender<Vec<u8>>, mut buf: Vec<u8>) {
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    trace!(len, %from, "underlay received");
                    if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(buf[..len].to_vec()) {
                        break;
                    }
                }
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) => {
                    trace!(error = %e, "ignoring icmp error");
                }
                Err(e) => {
                    warn!(error = %e, "underlay receive failed");
                    break;
                }
            },
            _ = tx.closed() => break,
        }
    }
    debug!("underlay pump stopped");
}
