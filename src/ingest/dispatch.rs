//! Routes datagrams from a receiver to the probe that owns the sender.

use ahash::AHashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::probe::Probe;

/// Normalise v4-mapped IPv6 peers so they match IPv4 accept lists.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

#[derive(Debug, Default)]
pub enum PeerDispatcher {
    /// No probes attached.
    #[default]
    Empty,
    /// One probe takes datagrams from any sender.
    Any(Arc<Probe>),
    ByPeer(AHashMap<IpAddr, Arc<Probe>>),
}

/// Peer table plus the bookkeeping for unrouted datagrams.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub peers: PeerDispatcher,
    /// Inside a run of unrouted datagrams; only its first one is logged.
    missing: bool,
}

impl Dispatch {
    pub fn new() -> Self {
        Dispatch::default()
    }

    /// Find the probe for a datagram from `from`. UNIX sockets have no
    /// peer address and only ever route to an `Any` probe.
    pub fn route(&mut self, from: Option<SocketAddr>) -> Option<Arc<Probe>> {
        let found = match (&self.peers, from) {
            (PeerDispatcher::Empty, _) => None,
            (PeerDispatcher::Any(probe), _) => Some(probe.clone()),
            (PeerDispatcher::ByPeer(map), Some(addr)) => map.get(&canonical_ip(addr.ip())).cloned(),
            (PeerDispatcher::ByPeer(_), None) => None,
        };
        match found {
            Some(probe) => {
                self.missing = false;
                Some(probe)
            }
            None => {
                if !self.missing {
                    self.missing = true;
                    match from {
                        Some(addr) => {
                            tracing::info!("Ignoring packets from host {}", canonical_ip(addr.ip()))
                        }
                        None => tracing::info!("Ignoring packets from unnamed peer"),
                    }
                }
                None
            }
        }
    }

    /// Attach `probe` for the given accept list (`None` = any host).
    pub fn attach(&mut self, probe: Arc<Probe>, accept: Option<&[IpAddr]>) {
        match accept {
            None => self.peers = PeerDispatcher::Any(probe),
            Some(hosts) => {
                if !matches!(self.peers, PeerDispatcher::ByPeer(_)) {
                    self.peers = PeerDispatcher::ByPeer(AHashMap::new());
                }
                if let PeerDispatcher::ByPeer(map) = &mut self.peers {
                    for host in hosts {
                        map.insert(canonical_ip(*host), probe.clone());
                    }
                }
            }
        }
    }

    /// Remove every route to `probe`. Returns true if none remain.
    pub fn detach(&mut self, probe: &Arc<Probe>) -> bool {
        match &mut self.peers {
            PeerDispatcher::Empty => {}
            PeerDispatcher::Any(p) => {
                if Arc::ptr_eq(p, probe) {
                    self.peers = PeerDispatcher::Empty;
                }
            }
            PeerDispatcher::ByPeer(map) => {
                map.retain(|_, p| !Arc::ptr_eq(p, probe));
                if map.is_empty() {
                    self.peers = PeerDispatcher::Empty;
                }
            }
        }
        self.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.peers, PeerDispatcher::Empty)
    }

    pub fn is_any(&self) -> bool {
        matches!(self.peers, PeerDispatcher::Any(_))
    }

    pub fn claims(&self, host: IpAddr) -> bool {
        match &self.peers {
            PeerDispatcher::ByPeer(map) => map.contains_key(&canonical_ip(host)),
            _ => false,
        }
    }

    /// Every distinct probe attached.
    pub fn probes(&self) -> Vec<Arc<Probe>> {
        let mut out: Vec<Arc<Probe>> = Vec::new();
        match &self.peers {
            PeerDispatcher::Empty => {}
            PeerDispatcher::Any(p) => out.push(p.clone()),
            PeerDispatcher::ByPeer(map) => {
                for p in map.values() {
                    if !out.iter().any(|q| Arc::ptr_eq(q, p)) {
                        out.push(p.clone());
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::probe::ProbeOptions;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, last)), 9000)
    }

    #[test]
    fn any_probe_takes_everything() {
        let probe = Probe::new(ProbeOptions::new("any"));
        let mut d = Dispatch::new();
        d.attach(probe.clone(), None);
        assert!(d.is_any());
        assert!(Arc::ptr_eq(&d.route(Some(addr(1))).unwrap(), &probe));
        assert!(d.route(None).is_some());
    }

    #[test]
    fn peers_route_to_their_probe() {
        let a = Probe::new(ProbeOptions::new("a"));
        let b = Probe::new(ProbeOptions::new("b"));
        let mut d = Dispatch::new();
        d.attach(a.clone(), Some(&[addr(1).ip()]));
        d.attach(b.clone(), Some(&[addr(2).ip(), addr(3).ip()]));

        assert_eq!(d.route(Some(addr(1))).unwrap().name(), "a");
        assert_eq!(d.route(Some(addr(3))).unwrap().name(), "b");
        assert!(d.route(Some(addr(4))).is_none());
        assert!(d.route(Some(addr(4))).is_none());
        assert!(d.claims(addr(2).ip()));
        assert_eq!(d.probes().len(), 2);
    }

    #[test]
    fn miss_run_ends_on_hit() {
        let a = Probe::new(ProbeOptions::new("a"));
        let mut d = Dispatch::new();
        d.attach(a, Some(&[addr(1).ip()]));
        assert!(d.route(Some(addr(5))).is_none());
        assert!(d.missing);
        assert!(d.route(Some(addr(6))).is_none());
        assert!(d.route(Some(addr(1))).is_some());
        assert!(!d.missing);
    }

    #[test]
    fn mapped_v6_peer_matches_v4_entry() {
        let a = Probe::new(ProbeOptions::new("a"));
        let mut d = Dispatch::new();
        d.attach(a, Some(&[addr(1).ip()]));
        let mapped = Ipv4Addr::new(192, 0, 2, 1).to_ipv6_mapped();
        let from = SocketAddr::new(IpAddr::V6(mapped), 9000);
        assert!(d.route(Some(from)).is_some());
        let other = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 9000);
        assert!(d.route(Some(other)).is_none());
    }

    #[test]
    fn detach_empties_dispatch() {
        let a = Probe::new(ProbeOptions::new("a"));
        let b = Probe::new(ProbeOptions::new("b"));
        let mut d = Dispatch::new();
        d.attach(a.clone(), Some(&[addr(1).ip()]));
        d.attach(b.clone(), Some(&[addr(2).ip()]));
        assert!(!d.detach(&a));
        assert!(d.route(Some(addr(1))).is_none());
        assert!(d.detach(&b));
        assert!(d.is_empty());
    }
}
