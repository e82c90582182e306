//! Per-connection driver task.
//!
//! The [`Connection`] itself is sans-IO. One task per connection moves its
//! segments between the dispatcher inbox and the underlay and runs its
//! timers. Application calls lock the same connection, change it, and wake
//! the driver; the driver wakes every suspended call after each step.

use std::future::pending;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::host::HostInner;
use crate::core::{ConnectionError, DEFAULT_PATH_MTU, IsdAs, L4_SSP, PathLookup};
use crate::dispatcher::{Binding, Delivery};
use crate::packet::{PacketBuilder, SspSegment};
use crate::path::Path;
use crate::stream::Connection;

/// Current time on the tokio clock, so a paused test clock applies.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Paths from `src` to `dst`; inside one AS the direct path is always known.
pub(crate) fn lookup_paths(lookup: &dyn PathLookup, src: IsdAs, dst: IsdAs) -> Vec<Path> {
    let paths = lookup.paths(src, dst);
    if paths.is_empty() && src == dst {
        return vec![Path::local(DEFAULT_PATH_MTU)];
    }
    paths
}

/// Connection state shared between the driver and the application handles.
#[derive(Debug)]
pub(crate) struct Shared {
    conn: Mutex<Connection>,
    wake: Notify,
    changed: Notify,
    timeout: Mutex<Option<Duration>>,
}

impl Shared {
    pub(crate) fn new(conn: Connection, timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            conn: Mutex::new(conn),
            wake: Notify::new(),
            changed: Notify::new(),
            timeout: Mutex::new(timeout),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_timeout(&self, timeout: Option<Duration>) {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    /// Let the driver look at the connection again.
    pub(crate) fn wake_driver(&self) {
        self.wake.notify_one();
    }

    fn notify_waiters(&self) {
        self.changed.notify_waiters();
    }

    /// Apply `op` under the connection lock and wake everyone.
    pub(crate) fn update<T>(&self, op: impl FnOnce(&mut Connection) -> T) -> T {
        let out = op(&mut self.lock());
        self.wake_driver();
        self.notify_waiters();
        out
    }

    /// Suspend until `ready` yields a result. `ready` runs under the
    /// connection lock after every change. Fails with
    /// [`ConnectionError::TimedOut`] once the socket timeout passes.
    pub(crate) async fn wait<T>(
        &self,
        mut ready: impl FnMut(&mut Connection) -> Option<Result<T, ConnectionError>>,
    ) -> Result<T, ConnectionError> {
        let deadline = self.timeout().map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcome = ready(&mut self.lock());
            if let Some(result) = outcome {
                self.wake_driver();
                return result;
            }
            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        return Err(ConnectionError::TimedOut);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Wait for the handshake to finish.
    pub(crate) async fn established(&self) -> Result<(), ConnectionError> {
        self.wait(|conn| {
            if let Some(err) = conn.error() {
                return Some(Err(err.clone()));
            }
            if conn.phase().is_synchronized() {
                return Some(Ok(()));
            }
            conn.is_closed().then_some(Err(ConnectionError::Closed))
        })
        .await
    }
}

/// Where a driver reads its inbound segments from.
#[derive(Debug)]
pub(crate) enum Inbox {
    /// Own registration: a connecting socket.
    Bound(Binding),
    /// Fed by a listener's router.
    Routed(mpsc::Receiver<Delivery>),
}

impl Inbox {
    async fn recv(&mut self) -> Option<Delivery> {
        match self {
            Self::Bound(binding) => binding.recv().await,
            Self::Routed(rx) => rx.recv().await,
        }
    }
}

pub(crate) struct Driver {
    shared: Arc<Shared>,
    inbox: Inbox,
    host: Arc<HostInner>,
}

impl Driver {
    pub(crate) fn spawn(shared: Arc<Shared>, inbox: Inbox, host: Arc<HostInner>) -> JoinHandle<()> {
        tokio::spawn(
            Self {
                shared,
                inbox,
                host,
            }
            .run(),
        )
    }

    async fn run(mut self) {
        let (flow, local, remote) = {
            let conn = self.shared.lock();
            (conn.flow_id(), conn.local(), conn.remote())
        };
        debug!(flow, %local, %remote, "driver started");
        loop {
            let refresh = {
                let mut conn = self.shared.lock();
                self.flush(&mut conn);
                if conn.is_closed() {
                    break;
                }
                conn.needs_path_refresh(now())
            };
            if refresh {
                let paths = lookup_paths(self.host.lookup.as_ref(), local.isd_as(), remote.isd_as());
                let mut conn = self.shared.lock();
                conn.update_paths(now(), paths);
                self.flush(&mut conn);
            }
            let deadline = self.shared.lock().poll_timeout();
            self.shared.notify_waiters();

            tokio::select! {
                delivery = self.inbox.recv() => match delivery {
                    Some(delivery) => self.on_delivery(delivery),
                    None => {
                        debug!(flow, "inbox closed");
                        self.shared.lock().close(false);
                    }
                },
                _ = sleep_until(deadline) => self.shared.lock().handle_timeout(now()),
                _ = self.shared.wake.notified() => {}
            }
        }
        self.shared.notify_waiters();
        debug!(flow, "driver stopped");
    }

    fn on_delivery(&self, delivery: Delivery) {
        let segment = match SspSegment::decode(&delivery.payload) {
            Ok(segment) => segment,
            Err(e) => {
                trace!(error = %e, "dropping undecodable segment");
                return;
            }
        };
        let mut conn = self.shared.lock();
        let remote = conn.remote();
        if delivery.src != remote.addr || segment.header.src_port != remote.port {
            trace!(src = %delivery.src, "segment from a foreign endpoint");
            return;
        }
        conn.handle_segment(now(), &segment, &delivery.path, &delivery.extensions);
    }

    fn flush(&self, conn: &mut Connection) {
        let (local, remote) = (conn.local(), conn.remote());
        let now = now();
        while let Some(t) = conn.poll_transmit(now) {
            let packet = PacketBuilder::new(local.addr, remote.addr, &t.path, L4_SSP)
                .extensions(t.extensions)
                .build(&t.segment.encode());
            match packet {
                Ok(packet) => {
                    if let Err(e) = self.host.underlay.send(&packet) {
                        trace!(error = %e, path = %t.path.id(), "underlay dropped segment");
                    }
                }
                Err(e) => warn!(error = %e, "cannot encode segment"),
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => pending().await,
    }
}
