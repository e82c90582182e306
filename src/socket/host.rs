//! The end host: one dispatcher, one underlay, one path lookup.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::datagram::DatagramSocket;
use super::stream::{SspListener, SspSocket, SspStream};
use crate::core::{
    DEFAULT_INBOX_CAPACITY, IsdAs, PathLookup, ScionAddr, ScionSocketAddr, SspResult, Underlay,
};
use crate::dispatcher::{BindKey, Binding, Dispatcher};
use crate::packet::L4Protocol;
use crate::path::Path;
use crate::stream::StreamConfig;

pub(crate) struct HostInner {
    pub(crate) local: ScionAddr,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) underlay: Arc<dyn Underlay>,
    pub(crate) lookup: Arc<dyn PathLookup>,
    serve: JoinHandle<()>,
}

impl HostInner {
    pub(crate) fn bind(&self, port: u16, protocol: L4Protocol, capacity: usize) -> SspResult<Binding> {
        let binding = if port == 0 {
            self.dispatcher.bind_ephemeral(self.local, protocol, capacity)?
        } else {
            self.dispatcher
                .bind(BindKey::new(self.local, port, protocol), capacity)?
        };
        Ok(binding)
    }

    pub(crate) fn paths_to(&self, remote: IsdAs) -> Vec<Path> {
        super::driver::lookup_paths(self.lookup.as_ref(), self.local.isd_as, remote)
    }
}

impl fmt::Debug for HostInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostInner")
            .field("local", &self.local)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl Drop for HostInner {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
        self.serve.abort();
    }
}

/// A SCION end host.
///
/// Owns the dispatcher and pumps the underlay's inbound packets into it.
/// Sockets keep the host alive; [`EndHost::shutdown`] ends every socket at
/// once.
#[derive(Debug, Clone)]
pub struct EndHost {
    inner: Arc<HostInner>,
}

impl EndHost {
    /// Start a host at `local`. Must be called inside a tokio runtime.
    pub fn new(
        local: ScionAddr,
        underlay: Arc<dyn Underlay>,
        inbound: mpsc::Receiver<Vec<u8>>,
        lookup: Arc<dyn PathLookup>,
    ) -> Self {
        Self::with_dispatcher(local, Arc::new(Dispatcher::new()), underlay, inbound, lookup)
    }

    /// Start a host around an existing dispatcher, for example one with a
    /// custom control handler.
    pub fn with_dispatcher(
        local: ScionAddr,
        dispatcher: Arc<Dispatcher>,
        underlay: Arc<dyn Underlay>,
        inbound: mpsc::Receiver<Vec<u8>>,
        lookup: Arc<dyn PathLookup>,
    ) -> Self {
        let serve = tokio::spawn(Arc::clone(&dispatcher).serve(inbound));
        info!(local = %local, "end host started");
        Self {
            inner: Arc::new(HostInner {
                local,
                dispatcher,
                underlay,
                lookup,
                serve,
            }),
        }
    }

    /// Host address.
    pub fn local_addr(&self) -> ScionAddr {
        self.inner.local
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    /// Reserve a stream port; `0` picks an ephemeral one.
    pub fn bind(&self, port: u16) -> SspResult<SspSocket> {
        let binding = self.inner.bind(port, L4Protocol::Ssp, DEFAULT_INBOX_CAPACITY)?;
        Ok(SspSocket::new(Arc::clone(&self.inner), binding))
    }

    /// Open a stream from an ephemeral port.
    pub async fn connect(&self, remote: ScionSocketAddr, config: StreamConfig) -> SspResult<SspStream> {
        let binding = self.inner.bind(0, L4Protocol::Ssp, config.inbox_capacity)?;
        SspSocket::new(Arc::clone(&self.inner), binding)
            .connect(remote, config)
            .await
    }

    /// Accept streams on `port`.
    pub fn listen(&self, port: u16, config: StreamConfig) -> SspResult<SspListener> {
        let binding = self.inner.bind(port, L4Protocol::Ssp, config.inbox_capacity)?;
        Ok(SspSocket::new(Arc::clone(&self.inner), binding).listen(config))
    }

    /// Bind a datagram socket; `0` picks an ephemeral port.
    pub fn bind_datagram(&self, port: u16) -> SspResult<DatagramSocket> {
        let binding = self.inner.bind(port, L4Protocol::Udp, DEFAULT_INBOX_CAPACITY)?;
        Ok(DatagramSocket::new(Arc::clone(&self.inner), binding))
    }

    /// Drop every registration. Connections fail, listeners and datagram
    /// sockets stop receiving, and new binds fail.
    pub fn shutdown(&self) {
        self.inner.dispatcher.shutdown();
    }
}
