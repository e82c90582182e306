//! Registration table: `(address, port, protocol) -> target`.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::dispatcher::{ControlHandler, Delivery};
use crate::core::{DispatchError, EPHEMERAL_PORT_MAX, EPHEMERAL_PORT_MIN, ScionAddr};
use crate::packet::L4Protocol;

/// Registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindKey {
    /// Local address. An unspecified host matches every host of the AS.
    pub addr: ScionAddr,
    /// Local port; 0 for control messages.
    pub port: u16,
    /// L4 protocol.
    pub protocol: L4Protocol,
}

impl BindKey {
    /// Create a key.
    pub fn new(addr: ScionAddr, port: u16, protocol: L4Protocol) -> Self {
        Self {
            addr,
            port,
            protocol,
        }
    }

    /// The same key with the host replaced by the unspecified address.
    fn wildcard(&self) -> Option<Self> {
        let any = match self.addr.host {
            IpAddr::V4(ip) if !ip.is_unspecified() => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(ip) if !ip.is_unspecified() => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            _ => return None,
        };
        Some(Self {
            addr: ScionAddr::new(self.addr.isd_as, any),
            ..*self
        })
    }

    pub(crate) fn already_bound(&self) -> DispatchError {
        DispatchError::AlreadyBound {
            addr: self.addr,
            port: self.port,
            protocol: self.protocol.as_u8(),
        }
    }

    pub(crate) fn not_bound(&self) -> DispatchError {
        DispatchError::NotBound {
            addr: self.addr,
            port: self.port,
            protocol: self.protocol.as_u8(),
        }
    }
}

impl fmt::Display for BindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{:?}", self.addr, self.port, self.protocol)
    }
}

/// Where deliveries for a key go.
#[derive(Clone)]
pub enum DeliveryTarget {
    /// Bounded inbox of one endpoint.
    Inbox(mpsc::Sender<Delivery>),
    /// Handler for unsolicited control messages.
    Control(Arc<dyn ControlHandler>),
}

impl fmt::Debug for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbox(tx) => f
                .debug_struct("Inbox")
                .field("capacity", &tx.capacity())
                .finish(),
            Self::Control(_) => f.write_str("Control"),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct RegistrationTable {
    entries: HashMap<BindKey, DeliveryTarget>,
}

impl RegistrationTable {
    pub(crate) fn insert(&mut self, key: BindKey, target: DeliveryTarget) -> Result<(), DispatchError> {
        if self.entries.contains_key(&key) {
            return Err(key.already_bound());
        }
        self.entries.insert(key, target);
        Ok(())
    }

    pub(crate) fn remove(&mut self, key: &BindKey) -> Result<DeliveryTarget, DispatchError> {
        self.entries.remove(key).ok_or_else(|| key.not_bound())
    }

    pub(crate) fn contains(&self, key: &BindKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Exact match first, then the wildcard host of the same AS.
    pub(crate) fn lookup(&self, key: &BindKey) -> Option<&DeliveryTarget> {
        self.entries
            .get(key)
            .or_else(|| key.wildcard().and_then(|any| self.entries.get(&any)))
    }

    /// A free ephemeral port for `addr` and `protocol`, scanning from `start`.
    pub(crate) fn free_port(&self, addr: ScionAddr, protocol: L4Protocol, start: u16) -> Option<u16> {
        let span = u32::from(EPHEMERAL_PORT_MAX - EPHEMERAL_PORT_MIN) + 1;
        let offset = u32::from(start.saturating_sub(EPHEMERAL_PORT_MIN)) % span;
        (0..span)
            .map(|i| EPHEMERAL_PORT_MIN + ((offset + i) % span) as u16)
            .find(|port| !self.contains(&BindKey::new(addr, *port, protocol)))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::IsdAs;

    fn addr(host: &str) -> ScionAddr {
        ScionAddr::new(IsdAs::new(1, 10), host.parse().unwrap())
    }

    fn inbox() -> DeliveryTarget {
        let (tx, _rx) = mpsc::channel(1);
        DeliveryTarget::Inbox(tx)
    }

    #[test]
    fn test_keys_are_unique() {
        let mut table = RegistrationTable::default();
        let key = BindKey::new(addr("10.0.0.1"), 8000, L4Protocol::Ssp);
        table.insert(key, inbox()).unwrap();
        assert!(matches!(
            table.insert(key, inbox()),
            Err(DispatchError::AlreadyBound { port: 8000, .. })
        ));

        // Same port, other protocol.
        table
            .insert(BindKey::new(addr("10.0.0.1"), 8000, L4Protocol::Udp), inbox())
            .unwrap();

        table.remove(&key).unwrap();
        assert!(matches!(
            table.remove(&key),
            Err(DispatchError::NotBound { .. })
        ));
        table.insert(key, inbox()).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_wildcard_host_fallback() {
        let mut table = RegistrationTable::default();
        table
            .insert(BindKey::new(addr("0.0.0.0"), 53, L4Protocol::Udp), inbox())
            .unwrap();
        assert!(table.lookup(&BindKey::new(addr("10.0.0.9"), 53, L4Protocol::Udp)).is_some());
        assert!(table.lookup(&BindKey::new(addr("10.0.0.9"), 54, L4Protocol::Udp)).is_none());

        let other_as = ScionAddr::new(IsdAs::new(1, 11), "10.0.0.9".parse().unwrap());
        assert!(table.lookup(&BindKey::new(other_as, 53, L4Protocol::Udp)).is_none());
    }

    #[test]
    fn test_free_port_skips_taken() {
        let mut table = RegistrationTable::default();
        let a = addr("10.0.0.1");
        table
            .insert(BindKey::new(a, EPHEMERAL_PORT_MAX, L4Protocol::Ssp), inbox())
            .unwrap();
        assert_eq!(
            table.free_port(a, L4Protocol::Ssp, EPHEMERAL_PORT_MAX),
            Some(EPHEMERAL_PORT_MIN)
        );
        assert_eq!(
            table.free_port(a, L4Protocol::Udp, EPHEMERAL_PORT_MAX),
            Some(EPHEMERAL_PORT_MAX)
        );
    }
}
