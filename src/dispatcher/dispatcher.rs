//! Inbound packet demultiplexing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::table::{BindKey, DeliveryTarget, RegistrationTable};
use crate::core::{DispatchError, ScionAddr};
use crate::extensions::{ExtClass, ExtensionBuf, Traceroute, TracerouteHop};
use crate::packet::{L4Protocol, Packet};
use crate::path::Path;

/// A packet handed to a registered target.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Sender.
    pub src: ScionAddr,
    /// Local address the packet was sent to.
    pub dst: ScionAddr,
    /// Path the packet travelled, in forwarding direction.
    pub path: Path,
    /// L4 protocol.
    pub protocol: L4Protocol,
    /// End-to-end extensions.
    pub extensions: Vec<ExtensionBuf>,
    /// Hops recorded by a traceroute extension, if the packet carried one.
    pub traceroute: Option<Vec<TracerouteHop>>,
    /// L4 header and payload.
    pub payload: Vec<u8>,
}

/// Receives control messages nobody registered for.
///
/// Called with the registration table locked; implementations must not call
/// back into the dispatcher.
pub trait ControlHandler: Send + Sync {
    /// Handle one message.
    fn handle(&self, delivery: Delivery);
}

/// Logs every control message and drops it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingControlHandler;

impl ControlHandler for LoggingControlHandler {
    fn handle(&self, delivery: Delivery) {
        info!(
            src = %delivery.src,
            path = %delivery.path.id(),
            len = delivery.payload.len(),
            "unsolicited control message"
        );
    }
}

/// What happened to one inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Queued in a target inbox.
    Delivered,
    /// Passed to a control handler.
    Control,
    /// Dropped: the target inbox was full.
    InboxFull,
    /// Dropped: nothing is registered for the key.
    NoTarget,
    /// Dropped: unknown L4 protocol.
    Unsupported,
    /// Dropped: the packet did not parse.
    Malformed,
    /// Dropped: the dispatcher is shut down.
    ShutDown,
}

/// Counters since the dispatcher was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Packets seen.
    pub received: u64,
    /// Packets queued to an inbox.
    pub delivered: u64,
    /// Packets given to a control handler.
    pub control: u64,
    /// Drops on a full inbox.
    pub inbox_full: u64,
    /// Drops without a registration.
    pub no_target: u64,
    /// Drops of unknown protocols.
    pub unsupported: u64,
    /// Drops of malformed packets.
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    delivered: AtomicU64,
    control: AtomicU64,
    inbox_full: AtomicU64,
    no_target: AtomicU64,
    unsupported: AtomicU64,
    malformed: AtomicU64,
}

/// Routes inbound packets to registered endpoints by
/// `(destination address, destination port, protocol)`.
///
/// Deliveries happen under the table's read lock, so once
/// [`Dispatcher::deregister`] returns no packet reaches the removed target.
pub struct Dispatcher {
    table: RwLock<RegistrationTable>,
    default_control: Arc<dyn ControlHandler>,
    shutdown: watch::Sender<bool>,
    counters: Counters,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("bindings", &self.read_table().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// A dispatcher that logs unclaimed control messages.
    pub fn new() -> Self {
        Self::with_control_handler(Arc::new(LoggingControlHandler))
    }

    /// A dispatcher with a custom default control handler.
    pub fn with_control_handler(handler: Arc<dyn ControlHandler>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            table: RwLock::new(RegistrationTable::default()),
            default_control: handler,
            shutdown,
            counters: Counters::default(),
        }
    }

    fn read_table(&self) -> RwLockReadGuard<'_, RegistrationTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, RegistrationTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether [`Dispatcher::shutdown`] was called.
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Register `target` under `key`.
    pub fn register(&self, key: BindKey, target: DeliveryTarget) -> Result<(), DispatchError> {
        let mut table = self.write_table();
        // Shutdown sets the flag before it clears the table.
        if self.is_shut_down() {
            return Err(DispatchError::Shutdown);
        }
        table.insert(key, target)?;
        drop(table);
        debug!(key = %key, "registered");
        Ok(())
    }

    /// Remove the registration for `key`. Once this returns, no further
    /// packet is queued to the removed target.
    pub fn deregister(&self, key: &BindKey) -> Result<DeliveryTarget, DispatchError> {
        let target = self.write_table().remove(key)?;
        debug!(key = %key, "deregistered");
        Ok(target)
    }

    /// Whether `key` is registered.
    pub fn is_bound(&self, key: &BindKey) -> bool {
        self.read_table().contains(key)
    }

    /// Register a fresh inbox of `capacity` under `key`.
    pub fn bind(self: &Arc<Self>, key: BindKey, capacity: usize) -> Result<Binding, DispatchError> {
        let (tx, inbox) = mpsc::channel(capacity.max(1));
        self.register(key, DeliveryTarget::Inbox(tx))?;
        Ok(Binding {
            key,
            inbox,
            dispatcher: Arc::clone(self),
        })
    }

    /// Register a fresh inbox on a free ephemeral port.
    pub fn bind_ephemeral(
        self: &Arc<Self>,
        addr: ScionAddr,
        protocol: L4Protocol,
        capacity: usize,
    ) -> Result<Binding, DispatchError> {
        let (tx, inbox) = mpsc::channel(capacity.max(1));
        let key = {
            let mut table = self.write_table();
            if self.is_shut_down() {
                return Err(DispatchError::Shutdown);
            }
            let port = table
                .free_port(addr, protocol, rand::random::<u16>())
                .ok_or(DispatchError::PortsExhausted)?;
            let key = BindKey::new(addr, port, protocol);
            table.insert(key, DeliveryTarget::Inbox(tx))?;
            key
        };
        debug!(key = %key, "registered ephemeral port");
        Ok(Binding {
            key,
            inbox,
            dispatcher: Arc::clone(self),
        })
    }

    /// Route one raw packet. Never fails; anything undeliverable is counted
    /// and dropped.
    pub fn dispatch(&self, raw: &[u8]) -> DispatchOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        if self.is_shut_down() {
            return DispatchOutcome::ShutDown;
        }
        let outcome = self.route(raw);
        let counter = match outcome {
            DispatchOutcome::Delivered => &self.counters.delivered,
            DispatchOutcome::Control => &self.counters.control,
            DispatchOutcome::InboxFull => &self.counters.inbox_full,
            DispatchOutcome::NoTarget => &self.counters.no_target,
            DispatchOutcome::Unsupported => &self.counters.unsupported,
            DispatchOutcome::Malformed => &self.counters.malformed,
            DispatchOutcome::ShutDown => return outcome,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    fn route(&self, raw: &[u8]) -> DispatchOutcome {
        let packet = match Packet::parse(raw) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(error = %err, len = raw.len(), "dropping malformed packet");
                return DispatchOutcome::Malformed;
            }
        };
        let Some(protocol) = L4Protocol::from_u8(packet.l4_protocol()) else {
            trace!(protocol = packet.l4_protocol(), "dropping unsupported protocol");
            return DispatchOutcome::Unsupported;
        };
        let Some(port) = protocol.dst_port(packet.payload()) else {
            debug!(?protocol, "dropping truncated L4 header");
            return DispatchOutcome::Malformed;
        };

        let mut extensions = Vec::new();
        let mut traceroute = None;
        for ext in packet.extensions() {
            let Ok(ext) = ext else { break };
            match ext.class() {
                ExtClass::EndToEnd => extensions.push(ext.to_buf()),
                ExtClass::HopByHop => {
                    if let Some(hops) = Traceroute::hops(&ext) {
                        traceroute = Some(hops);
                    }
                }
            }
        }

        let key = BindKey::new(packet.dst(), port, protocol);
        let delivery = Delivery {
            src: packet.src(),
            dst: packet.dst(),
            path: packet.path().clone(),
            protocol,
            extensions,
            traceroute,
            payload: packet.payload().to_vec(),
        };

        let table = self.read_table();
        match table.lookup(&key) {
            Some(DeliveryTarget::Inbox(tx)) => match tx.try_send(delivery) {
                Ok(()) => DispatchOutcome::Delivered,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(key = %key, "inbox full, dropping");
                    DispatchOutcome::InboxFull
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(key = %key, "inbox closed, dropping");
                    DispatchOutcome::NoTarget
                }
            },
            Some(DeliveryTarget::Control(handler)) => {
                handler.handle(delivery);
                DispatchOutcome::Control
            }
            None if protocol == L4Protocol::Scmp => {
                self.default_control.handle(delivery);
                DispatchOutcome::Control
            }
            None => {
                trace!(key = %key, "no registration, dropping");
                DispatchOutcome::NoTarget
            }
        }
    }

    /// Pump packets from `inbound` until it closes or the dispatcher shuts
    /// down.
    pub async fn serve(self: Arc<Self>, mut inbound: mpsc::Receiver<Vec<u8>>) {
        let mut stop = self.shutdown.subscribe();
        debug!("dispatcher serving");
        loop {
            tokio::select! {
                packet = inbound.recv() => match packet {
                    Some(packet) => {
                        self.dispatch(&packet);
                    }
                    None => {
                        warn!("underlay closed");
                        break;
                    }
                },
                _ = stop.wait_for(|stopped| *stopped) => break,
            }
        }
        debug!("dispatcher stopped");
    }

    /// Drop every registration and refuse new ones. Every [`Binding`] sees
    /// its inbox close.
    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.write_table().clear();
        info!("dispatcher shut down");
    }

    /// Counter snapshot.
    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            received: c.received.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            control: c.control.load(Ordering::Relaxed),
            inbox_full: c.inbox_full.load(Ordering::Relaxed),
            no_target: c.no_target.load(Ordering::Relaxed),
            unsupported: c.unsupported.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
        }
    }
}

/// An inbox registered in a [`Dispatcher`]. Dropping it deregisters the key.
#[derive(Debug)]
pub struct Binding {
    key: BindKey,
    inbox: mpsc::Receiver<Delivery>,
    dispatcher: Arc<Dispatcher>,
}

impl Binding {
    /// The registered key.
    pub fn key(&self) -> BindKey {
        self.key
    }

    /// The dispatcher holding the registration.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Next delivery; `None` once the registration is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.inbox.recv().await
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        // Already gone after a shutdown.
        let _ = self.dispatcher.deregister(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::core::{IsdAs, L4_UDP};
    use crate::extensions::PathProbe;
    use crate::packet::{PacketBuilder, UdpHeader};
    use crate::path::Hop;

    fn addr(host: &str) -> ScionAddr {
        ScionAddr::new(IsdAs::new(1, 10), host.parse().unwrap())
    }

    fn path() -> Path {
        Path::new(
            vec![
                Hop::new(IsdAs::new(1, 11), 0, 3),
                Hop::new(IsdAs::new(1, 10), 7, 0),
            ],
            1400,
        )
    }

    fn udp_packet(dst_port: u16, exts: Vec<ExtensionBuf>, body: &[u8]) -> Vec<u8> {
        let src = ScionAddr::new(IsdAs::new(1, 11), "10.0.0.2".parse().unwrap());
        let payload = UdpHeader {
            src_port: 4000,
            dst_port,
        }
        .encode(body)
        .unwrap();
        let path = path();
        PacketBuilder::new(src, addr("10.0.0.1"), &path, L4_UDP)
            .extensions(exts)
            .build(&payload)
            .unwrap()
    }

    fn udp_key(port: u16) -> BindKey {
        BindKey::new(addr("10.0.0.1"), port, L4Protocol::Udp)
    }

    #[tokio::test]
    async fn test_delivers_with_metadata() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut binding = dispatcher.bind(udp_key(5000), 8).unwrap();

        let exts = vec![
            Traceroute::with_capacity(2).unwrap(),
            PathProbe::request(9).encode().unwrap(),
        ];
        let raw = udp_packet(5000, exts, b"hello");
        assert_eq!(dispatcher.dispatch(&raw), DispatchOutcome::Delivered);

        let delivery = binding.recv().await.unwrap();
        assert_eq!(delivery.src.isd_as, IsdAs::new(1, 11));
        assert_eq!(delivery.path, path());
        assert_eq!(delivery.traceroute, Some(Vec::new()));
        assert_eq!(delivery.extensions.len(), 1);
        let (_, body) = UdpHeader::decode(&delivery.payload).unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_drops_are_counted() {
        let dispatcher = Arc::new(Dispatcher::new());
        let _binding = dispatcher.bind(udp_key(5000), 1).unwrap();

        assert_eq!(dispatcher.dispatch(&[0xff; 5]), DispatchOutcome::Malformed);
        assert_eq!(
            dispatcher.dispatch(&udp_packet(5001, vec![], b"x")),
            DispatchOutcome::NoTarget
        );

        let path = path();
        let unknown = PacketBuilder::new(addr("10.0.0.2"), addr("10.0.0.1"), &path, 99)
            .build(b"xxxx")
            .unwrap();
        assert_eq!(dispatcher.dispatch(&unknown), DispatchOutcome::Unsupported);

        let raw = udp_packet(5000, vec![], b"x");
        assert_eq!(dispatcher.dispatch(&raw), DispatchOutcome::Delivered);
        assert_eq!(dispatcher.dispatch(&raw), DispatchOutcome::InboxFull);

        let stats = dispatcher.stats();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.inbox_full, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.unsupported, 1);
        assert_eq!(stats.no_target, 1);
    }

    #[derive(Default)]
    struct Recording(AtomicUsize);

    impl ControlHandler for Recording {
        fn handle(&self, _delivery: Delivery) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_control_messages_reach_default_handler() {
        let handler = Arc::new(Recording::default());
        let dispatcher = Dispatcher::with_control_handler(handler.clone());
        let path = path();
        let scmp = PacketBuilder::new(addr("10.0.0.2"), addr("10.0.0.1"), &path, 1)
            .build(b"dest unreachable")
            .unwrap();
        assert_eq!(dispatcher.dispatch(&scmp), DispatchOutcome::Control);
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_binding_drop_deregisters() {
        let dispatcher = Arc::new(Dispatcher::new());
        let binding = dispatcher.bind(udp_key(5000), 1).unwrap();
        assert!(matches!(
            dispatcher.bind(udp_key(5000), 1),
            Err(DispatchError::AlreadyBound { .. })
        ));
        drop(binding);
        assert!(!dispatcher.is_bound(&udp_key(5000)));
        assert!(matches!(
            dispatcher.deregister(&udp_key(5000)),
            Err(DispatchError::NotBound { .. })
        ));
        dispatcher.bind(udp_key(5000), 1).unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_inboxes() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut binding = dispatcher.bind(udp_key(5000), 1).unwrap();
        let ephemeral = dispatcher
            .bind_ephemeral(addr("10.0.0.1"), L4Protocol::Ssp, 1)
            .unwrap();
        assert!(ephemeral.key().port >= crate::core::EPHEMERAL_PORT_MIN);

        dispatcher.shutdown();
        assert!(binding.recv().await.is_none());
        assert!(matches!(
            dispatcher.bind(udp_key(5001), 1),
            Err(DispatchError::Shutdown)
        ));
        assert_eq!(
            dispatcher.dispatch(&udp_packet(5000, vec![], b"x")),
            DispatchOutcome::ShutDown
        );
    }

    #[tokio::test]
    async fn test_serve_pumps_until_shutdown() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut binding = dispatcher.bind(udp_key(5000), 4).unwrap();
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(Arc::clone(&dispatcher).serve(rx));

        tx.send(udp_packet(5000, vec![], b"pumped")).await.unwrap();
        let delivery = binding.recv().await.unwrap();
        assert_eq!(&delivery.payload[8..], b"pumped");

        dispatcher.shutdown();
        task.await.unwrap();
    }
}
