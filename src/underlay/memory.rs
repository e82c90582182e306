//! In-process network for tests and simulations.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::trace;

use crate::core::{EXT_TRACEROUTE, ScionAddr, Underlay};
use crate::extensions::{ExtClass, Traceroute, TracerouteHop};
use crate::packet::Packet;
use crate::path::PathId;

/// Delivery counters of a [`MemoryNetwork`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Packets handed to a host.
    pub forwarded: u64,
    /// Packets lost on a failed path.
    pub path_down: u64,
    /// Packets lost on a full host queue.
    pub queue_full: u64,
    /// Packets for unknown hosts or that did not parse.
    pub unroutable: u64,
}

#[derive(Debug)]
struct NetworkState {
    hosts: HashMap<ScionAddr, mpsc::Sender<Vec<u8>>>,
    down: HashSet<PathId>,
    stats: MemoryStats,
    started: Instant,
}

/// Connects attached hosts by their SCION address.
///
/// Every packet travels its own path header: a path marked down loses all
/// traffic in both directions, and traceroute extensions collect one record
/// per hop of the path.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                hosts: HashMap::new(),
                down: HashSet::new(),
                stats: MemoryStats::default(),
                started: Instant::now(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a host. Returns its underlay and the queue of packets for it.
    /// Attaching the same address again replaces the previous host.
    pub fn attach(
        &self,
        addr: ScionAddr,
        capacity: usize,
    ) -> (Arc<MemoryUnderlay>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.state().hosts.insert(addr, tx);
        let underlay = MemoryUnderlay {
            network: self.clone(),
            addr,
        };
        (Arc::new(underlay), rx)
    }

    /// Remove a host; its queue closes.
    pub fn detach(&self, addr: &ScionAddr) {
        self.state().hosts.remove(addr);
    }

    /// Fail or restore a path.
    pub fn set_path_down(&self, id: PathId, down: bool) {
        let mut state = self.state();
        if down {
            state.down.insert(id);
        } else {
            state.down.remove(&id);
        }
        trace!(path = %id, down, "path state injected");
    }

    /// Counter snapshot.
    pub fn stats(&self) -> MemoryStats {
        self.state().stats
    }

    fn forward(&self, packet: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        let mut packet = packet.to_vec();
        let (dst, path_id) = match record_hops(&mut packet, state.started) {
            Ok(route) => route,
            Err(e) => {
                state.stats.unroutable += 1;
                return Err(e);
            }
        };
        if state.down.contains(&path_id) {
            state.stats.path_down += 1;
            trace!(path = %path_id, "lost on failed path");
            return Ok(());
        }
        let Some(host) = state.hosts.get(&dst) else {
            state.stats.unroutable += 1;
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no host {dst}"),
            ));
        };
        match host.try_send(packet) {
            Ok(()) => {
                state.stats.forwarded += 1;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                state.stats.queue_full += 1;
                Err(io::Error::new(io::ErrorKind::WouldBlock, "host queue full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                state.stats.unroutable += 1;
                Err(io::Error::new(io::ErrorKind::NotConnected, "host detached"))
            }
        }
    }
}

/// Append one traceroute record per path hop, if the packet asks for it.
/// Returns the destination and the path id.
fn record_hops(packet: &mut [u8], started: Instant) -> io::Result<(ScionAddr, PathId)> {
    let parsed = Packet::parse(packet).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let route = (parsed.dst(), parsed.path().id());
    let Some(ext) = parsed.find_extension(ExtClass::HopByHop, EXT_TRACEROUTE) else {
        return Ok(route);
    };
    let at = parsed.extension_offset() + ext.offset();
    let end = at + ext.len_bytes();
    let timestamp = (started.elapsed().as_millis() % (1 << 16)) as u16;
    let hops: Vec<TracerouteHop> = parsed
        .path()
        .hops()
        .iter()
        .map(|hop| TracerouteHop {
            isd_as: hop.isd_as,
            ifid: if hop.egress != 0 { hop.egress } else { hop.ingress },
            timestamp,
        })
        .collect();
    if let Some(subheader) = packet.get_mut(at..end) {
        for hop in hops {
            if !Traceroute::append(subheader, hop) {
                break;
            }
        }
    }
    Ok(route)
}

/// A host's attachment to a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryUnderlay {
    network: MemoryNetwork,
    addr: ScionAddr,
}

impl MemoryUnderlay {
    /// Address the host was attached under.
    pub fn addr(&self) -> ScionAddr {
        self.addr
    }

    /// The network.
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl Underlay for MemoryUnderlay {
    fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.network.forward(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IsdAs, L4_UDP};
    use crate::packet::{PacketBuilder, UdpHeader};
    use crate::path::{Hop, Path};

    fn addr(ia: u32, host: &str) -> ScionAddr {
        ScionAddr::new(IsdAs::new(1, ia), host.parse().unwrap())
    }

    fn path() -> Path {
        Path::new(
            vec![
                Hop::new(IsdAs::new(1, 10), 0, 2),
                Hop::new(IsdAs::new(1, 12), 5, 6),
                Hop::new(IsdAs::new(1, 11), 9, 0),
            ],
            1400,
        )
    }

    fn packet(with_traceroute: bool) -> Vec<u8> {
        let path = path();
        let payload = UdpHeader {
            src_port: 1,
            dst_port: 2,
        }
        .encode(b"ping")
        .unwrap();
        let mut builder = PacketBuilder::new(addr(10, "10.0.0.1"), addr(11, "10.0.0.2"), &path, L4_UDP);
        if with_traceroute {
            builder = builder.extension(Traceroute::with_capacity(4).unwrap());
        }
        builder.build(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_forwards_and_records_hops() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.attach(addr(10, "10.0.0.1"), 4);
        let (_b, mut b_rx) = net.attach(addr(11, "10.0.0.2"), 4);

        a.send(&packet(true)).unwrap();
        let received = b_rx.recv().await.unwrap();
        let parsed = Packet::parse(&received).unwrap();
        let ext = parsed
            .find_extension(ExtClass::HopByHop, EXT_TRACEROUTE)
            .unwrap();
        let hops = Traceroute::hops(&ext).unwrap();
        let ifids: Vec<u16> = hops.iter().map(|h| h.ifid).collect();
        assert_eq!(ifids, vec![2, 6, 9]);
        assert_eq!(hops[1].isd_as, IsdAs::new(1, 12));
        assert_eq!(net.stats().forwarded, 1);
    }

    #[tokio::test]
    async fn test_failed_path_loses_both_directions() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.attach(addr(10, "10.0.0.1"), 4);
        let (_b, mut b_rx) = net.attach(addr(11, "10.0.0.2"), 4);

        net.set_path_down(path().reverse().id(), true);
        a.send(&packet(false)).unwrap();
        assert!(b_rx.try_recv().is_err());
        assert_eq!(net.stats().path_down, 1);

        net.set_path_down(path().id(), false);
        a.send(&packet(false)).unwrap();
        assert!(b_rx.try_recv().is_ok());
    }

    #[test]
    fn test_full_queue_and_unknown_host() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.attach(addr(10, "10.0.0.1"), 1);
        assert!(a.send(&packet(false)).is_err());

        let (_b, _b_rx) = net.attach(addr(11, "10.0.0.2"), 1);
        a.send(&packet(false)).unwrap();
        let err = a.send(&packet(false)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(a.send(&[0u8; 3]).is_err());

        let stats = net.stats();
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.queue_full, 1);
        assert_eq!(stats.unroutable, 2);
    }
}
