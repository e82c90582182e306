//! Datagram sockets over SCION/UDP.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Mutex as AsyncMutex;
use tracing::trace;

use super::host::HostInner;
use crate::core::{ConnectionError, DispatchError, L4_UDP, ScionSocketAddr, SspResult};
use crate::dispatcher::Binding;
use crate::extensions::{ExtensionBuf, TracerouteHop};
use crate::packet::{PacketBuilder, UdpHeader};
use crate::path::{
    Path, PathCandidate, PathConstraints, PathPolicy, PathState, PathStateConfig,
};

/// A received datagram and how it got here.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Payload.
    pub data: Vec<u8>,
    /// Sender.
    pub src: ScionSocketAddr,
    /// Path the datagram travelled, in forwarding direction. Its reverse
    /// reaches the sender.
    pub path: Path,
    /// End-to-end extensions.
    pub extensions: Vec<ExtensionBuf>,
    /// Hops recorded by a traceroute extension.
    pub traceroute: Option<Vec<TracerouteHop>>,
}

/// Connectionless socket. Paths are picked per send by [`PathPolicy`].
#[derive(Debug)]
pub struct DatagramSocket {
    host: Arc<HostInner>,
    local: ScionSocketAddr,
    binding: AsyncMutex<Binding>,
    policy: Mutex<PathPolicy>,
}

impl DatagramSocket {
    pub(crate) fn new(host: Arc<HostInner>, binding: Binding) -> Self {
        let key = binding.key();
        Self {
            host,
            local: ScionSocketAddr::new(key.addr, key.port),
            binding: AsyncMutex::new(binding),
            policy: Mutex::new(PathPolicy::default()),
        }
    }

    /// Bound address.
    pub fn local_addr(&self) -> ScionSocketAddr {
        self.local
    }

    /// Replace the path constraints used by [`DatagramSocket::send_to`].
    pub fn set_policy(&self, constraints: PathConstraints) {
        self.policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_constraints(constraints);
    }

    /// The path [`DatagramSocket::send_to`] would use towards `remote`.
    pub fn select_path(&self, remote: ScionSocketAddr) -> Option<Path> {
        let paths = self.host.paths_to(remote.isd_as());
        let candidates: Vec<PathCandidate<'_>> = paths
            .iter()
            .map(|path| PathCandidate {
                path,
                state: PathState::new(path.id(), PathStateConfig::default()).snapshot(),
            })
            .collect();
        let best = *self
            .policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .select(&candidates)
            .first()?;
        paths.into_iter().find(|p| p.id() == best)
    }

    /// Send `data` to `remote` over the best admissible path.
    pub async fn send_to(&self, data: &[u8], remote: ScionSocketAddr) -> SspResult<usize> {
        let path = self
            .select_path(remote)
            .ok_or(ConnectionError::NoPathAvailable)?;
        self.send_via(data, remote, &path, Vec::new())
    }

    /// Send `data` over an explicit path, for example the reverse of the path
    /// a request arrived on, with extra extensions.
    pub fn send_via(
        &self,
        data: &[u8],
        remote: ScionSocketAddr,
        path: &Path,
        extensions: Vec<ExtensionBuf>,
    ) -> SspResult<usize> {
        let payload = UdpHeader {
            src_port: self.local.port,
            dst_port: remote.port,
        }
        .encode(data)?;
        let packet = PacketBuilder::new(self.local.addr, remote.addr, path, L4_UDP)
            .extensions(extensions)
            .build(&payload)?;
        self.host.underlay.send(&packet)?;
        trace!(remote = %remote, path = %path.id(), len = data.len(), "datagram sent");
        Ok(data.len())
    }

    /// Next datagram with its metadata.
    pub async fn recv_datagram(&self) -> SspResult<Datagram> {
        let mut binding = self.binding.lock().await;
        loop {
            let delivery = binding.recv().await.ok_or(DispatchError::Shutdown)?;
            let (header, body) = match UdpHeader::decode(&delivery.payload) {
                Ok(decoded) => decoded,
                Err(e) => {
                    trace!(error = %e, "dropping malformed datagram");
                    continue;
                }
            };
            return Ok(Datagram {
                data: body.to_vec(),
                src: ScionSocketAddr::new(delivery.src, header.src_port),
                path: delivery.path,
                extensions: delivery.extensions,
                traceroute: delivery.traceroute,
            });
        }
    }

    /// Receive into `buf`. Datagrams longer than `buf` are truncated.
    pub async fn recv_from(&self, buf: &mut [u8]) -> SspResult<(usize, ScionSocketAddr)> {
        let datagram = self.recv_datagram().await?;
        let n = buf.len().min(datagram.data.len());
        buf[..n].copy_from_slice(&datagram.data[..n]);
        Ok((n, datagram.src))
    }

    /// Release the port.
    pub fn close(self) {}
}
