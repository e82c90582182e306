//! Stream sockets: connect, listen/accept, and the established stream.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, trace, warn};

use super::driver::{Driver, Inbox, Shared, now};
use super::host::HostInner;
use crate::core::{ConnectionError, ScionSocketAddr, SspError, SspResult};
use crate::dispatcher::{Binding, Delivery};
use crate::extensions::PathReservation;
use crate::packet::{SspFlags, SspSegment};
use crate::path::{PathConstraints, PathId};
use crate::stream::{Connection, ConnectionPhase, ConnectionStats, StreamConfig};

/// A bound, unconnected stream port.
#[derive(Debug)]
pub struct SspSocket {
    host: Arc<HostInner>,
    binding: Binding,
}

impl SspSocket {
    pub(crate) fn new(host: Arc<HostInner>, binding: Binding) -> Self {
        Self { host, binding }
    }

    /// Bound address.
    pub fn local_addr(&self) -> ScionSocketAddr {
        let key = self.binding.key();
        ScionSocketAddr::new(key.addr, key.port)
    }

    /// Open a stream to `remote`. Suspends until the handshake completes or
    /// fails.
    pub async fn connect(self, remote: ScionSocketAddr, config: StreamConfig) -> SspResult<SspStream> {
        let local = self.local_addr();
        let candidates = self.host.paths_to(remote.isd_as());
        let timeout = config.timeout;
        let conn = Connection::connect(now(), rand::random(), local, remote, candidates, config)?;
        let shared = Shared::new(conn, timeout);
        Driver::spawn(Arc::clone(&shared), Inbox::Bound(self.binding), self.host);

        let stream = SspStream { shared };
        if let Err(e) = stream.shared.established().await {
            stream.shared.update(|conn| conn.close(false));
            return Err(e.into());
        }
        debug!(local = %local, remote = %remote, "connected");
        Ok(stream)
    }

    /// Start accepting streams.
    pub fn listen(self, config: StreamConfig) -> SspListener {
        let local = self.local_addr();
        let (accept_tx, accepted) = mpsc::channel(config.accept_backlog.max(1));
        let (stop, stop_rx) = watch::channel(false);
        let timeout = config.timeout;
        let router = Router {
            host: self.host,
            binding: self.binding,
            local,
            config,
            flows: HashMap::new(),
        };
        tokio::spawn(router.run(accept_tx, stop_rx));
        debug!(local = %local, "listening");
        SspListener {
            local,
            accepted: AsyncMutex::new(accepted),
            stop,
            timeout,
        }
    }
}

/// Accepts inbound streams on one port.
#[derive(Debug)]
pub struct SspListener {
    local: ScionSocketAddr,
    accepted: AsyncMutex<mpsc::Receiver<SspStream>>,
    stop: watch::Sender<bool>,
    timeout: Option<Duration>,
}

impl SspListener {
    /// Listening address.
    pub fn local_addr(&self) -> ScionSocketAddr {
        self.local
    }

    /// Next established stream.
    ///
    /// Fails with [`ConnectionError::Closed`] once the listener is closed and
    /// with [`ConnectionError::TimedOut`] after the configured timeout.
    pub async fn accept(&self) -> SspResult<SspStream> {
        let mut stop = self.stop.subscribe();
        let next = async {
            let mut accepted = self.accepted.lock().await;
            tokio::select! {
                stream = accepted.recv() => stream.ok_or(ConnectionError::Closed),
                _ = stop.wait_for(|stopped| *stopped) => Err(ConnectionError::Closed),
            }
        };
        let result = match self.timeout {
            Some(t) => tokio::time::timeout(t, next)
                .await
                .unwrap_or(Err(ConnectionError::TimedOut)),
            None => next.await,
        };
        Ok(result?)
    }

    /// Stop accepting. Streams already accepted keep running.
    pub fn close(&self) {
        self.stop.send_replace(true);
    }
}

impl Drop for SspListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Routes a listener's inbound segments to per-connection drivers.
struct Router {
    host: Arc<HostInner>,
    binding: Binding,
    local: ScionSocketAddr,
    config: StreamConfig,
    flows: HashMap<(ScionSocketAddr, u64), mpsc::Sender<Delivery>>,
}

impl Router {
    async fn run(mut self, accept_tx: mpsc::Sender<SspStream>, mut stop: watch::Receiver<bool>) {
        let mut accept_tx = Some(accept_tx);
        loop {
            tokio::select! {
                delivery = self.binding.recv() => match delivery {
                    Some(delivery) => self.route(delivery, accept_tx.as_ref()),
                    None => break,
                },
                _ = stop.wait_for(|stopped| *stopped), if accept_tx.is_some() => {
                    debug!(local = %self.local, "listener closed");
                    accept_tx = None;
                }
            }
            self.flows.retain(|_, tx| !tx.is_closed());
            if accept_tx.is_none() && self.flows.is_empty() {
                break;
            }
        }
        debug!(local = %self.local, "listener router stopped");
    }

    fn route(&mut self, delivery: Delivery, accept_tx: Option<&mpsc::Sender<SspStream>>) {
        let segment = match SspSegment::decode(&delivery.payload) {
            Ok(segment) => segment,
            Err(e) => {
                trace!(error = %e, "dropping undecodable segment");
                return;
            }
        };
        let h = segment.header;
        let remote = ScionSocketAddr::new(delivery.src, h.src_port);
        let key = (remote, h.flow_id);

        let delivery = match self.flows.get(&key) {
            Some(tx) => match tx.try_send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(flow = h.flow_id, "connection inbox full");
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(delivery)) => {
                    self.flows.remove(&key);
                    delivery
                }
            },
            None => delivery,
        };

        if !h.flags.contains(SspFlags::SYN) || h.flags.contains(SspFlags::ACK) {
            trace!(flow = h.flow_id, remote = %remote, "segment for unknown flow");
            return;
        }
        let Some(accept_tx) = accept_tx else {
            trace!(remote = %remote, "not accepting");
            return;
        };
        let conn = match Connection::accept(
            now(),
            self.local,
            remote,
            &segment,
            &delivery.path,
            &delivery.extensions,
            self.config.clone(),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, remote = %remote, "rejecting SYN");
                return;
            }
        };

        let (tx, rx) = mpsc::channel(self.config.inbox_capacity.max(1));
        let shared = Shared::new(conn, self.config.timeout);
        Driver::spawn(Arc::clone(&shared), Inbox::Routed(rx), Arc::clone(&self.host));
        self.flows.insert(key, tx);

        let accept_tx = accept_tx.clone();
        tokio::spawn(async move {
            let stream = SspStream { shared };
            if let Err(e) = stream.shared.established().await {
                debug!(error = %e, remote = %remote, "inbound handshake failed");
                stream.close(false);
                return;
            }
            if let Err(e) = accept_tx.try_send(stream) {
                let stream = match e {
                    mpsc::error::TrySendError::Full(stream) => {
                        warn!(remote = %remote, "accept backlog full, resetting");
                        stream
                    }
                    mpsc::error::TrySendError::Closed(stream) => stream,
                };
                stream.close(false);
            }
        });
    }
}

/// An established stream.
///
/// Every method takes `&self`; share the stream in an `Arc` to send and
/// receive from different tasks. A blocked call returns as soon as the
/// stream is closed from anywhere.
#[derive(Debug)]
pub struct SspStream {
    shared: Arc<Shared>,
}

impl SspStream {
    /// Local address.
    pub fn local_addr(&self) -> ScionSocketAddr {
        self.shared.lock().local()
    }

    /// Remote address.
    pub fn peer_addr(&self) -> ScionSocketAddr {
        self.shared.lock().remote()
    }

    /// Connection identifier.
    pub fn flow_id(&self) -> u64 {
        self.shared.lock().flow_id()
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.shared.lock().phase()
    }

    /// Path ids the peer advertised during the handshake.
    pub fn peer_paths(&self) -> Vec<PathId> {
        self.shared.lock().peer_paths().to_vec()
    }

    /// Reservation the initiator attached to its SYN, if any.
    pub fn peer_reservation(&self) -> Option<PathReservation> {
        self.shared.lock().peer_reservation().copied()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ConnectionStats {
        self.shared.lock().stats()
    }

    /// Queue as much of `data` as the peer's window allows, suspending while
    /// it is exhausted. Returns the number of bytes queued.
    pub async fn send(&self, data: &[u8]) -> SspResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        // The driver has to see a refused send to start probing the window.
        match self.shared.update(|conn| conn.send(data))? {
            0 => {}
            n => return Ok(n),
        }
        let n = self
            .shared
            .wait(|conn| match conn.send(data) {
                Ok(0) => None,
                other => Some(other),
            })
            .await?;
        Ok(n)
    }

    /// Queue all of `data`.
    pub async fn send_all(&self, mut data: &[u8]) -> SspResult<()> {
        while !data.is_empty() {
            let n = self.send(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Read in-order bytes, suspending until some arrive. `Ok(0)` means the
    /// peer closed its side.
    pub async fn recv(&self, buf: &mut [u8]) -> SspResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.shared.wait(|conn| conn.recv(buf).transpose()).await?;
        Ok(n)
    }

    /// Fill `buf` completely.
    pub async fn recv_exact(&self, buf: &mut [u8]) -> SspResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.recv(&mut buf[filled..]).await? {
                0 => return Err(SspError::Io(io::ErrorKind::UnexpectedEof.into())),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Wait until every queued byte is acknowledged.
    pub async fn flush(&self) -> SspResult<()> {
        self.shared
            .wait(|conn| {
                if let Some(err) = conn.error() {
                    return Some(Err(err.clone()));
                }
                conn.is_flushed().then_some(Ok(()))
            })
            .await?;
        Ok(())
    }

    /// Close the stream. Graceful closes deliver the queued data and a FIN;
    /// abrupt closes drop it and reset the peer. Suspended calls fail with
    /// [`ConnectionError::Closed`].
    pub fn close(&self, graceful: bool) {
        self.shared.update(|conn| conn.close(graceful));
    }

    /// Wait until the connection is fully closed. Returns the error that
    /// ended it, if any other than a local close.
    pub async fn closed(&self) -> SspResult<()> {
        self.shared
            .wait(|conn| {
                if !conn.is_closed() {
                    return None;
                }
                match conn.error() {
                    None | Some(ConnectionError::Closed) => Some(Ok(())),
                    Some(err) => Some(Err(err.clone())),
                }
            })
            .await?;
        Ok(())
    }

    /// Timeout for blocking calls; `None` waits forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.shared.set_timeout(timeout);
    }

    /// Replace the path constraints of the live connection.
    pub fn set_policy(&self, constraints: PathConstraints) {
        self.shared.update(|conn| conn.set_policy(constraints));
    }
}

impl Drop for SspStream {
    fn drop(&mut self) {
        self.shared.update(|conn| {
            if !conn.is_closed() {
                conn.close(true);
            }
        });
    }
}
