//! Shares receivers between probes that listen on the same addresses.
//!
//! Probes are registered first, which only checks for conflicts. `start`
//! then binds one receiver per distinct listen set, sizes the socket
//! buffers across all of them, attaches the probes and starts polling.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};

use super::dispatch::canonical_ip;
use super::probe::Probe;
use super::receiver::{DatagramSocket, Receiver, ReceiverError};

pub const SOCKETBUFFER_NOMINAL_TOTAL: usize = 8 * 1024 * 1024;
pub const SOCKETBUFFER_MINIMUM: usize = 128 * 1024;
pub const ENV_SOCKETBUFFER_NOMINAL_TOTAL: &str = "FLOWPIPE_SOCKETBUFFER_NOMINAL_TOTAL";
pub const ENV_SOCKETBUFFER_MINIMUM: &str = "FLOWPIPE_SOCKETBUFFER_MINIMUM";

#[derive(Debug)]
pub enum RegistryError {
    /// A listen address did not resolve to anything.
    Resolve { spec: String, err: io::Error },
    NoAddress(String),
    /// None of the resolved addresses could be bound.
    Bind { spec: String, err: io::Error },
    /// The probe accepts any host but the listen set already has probes.
    AnyConflict { probe: String, listen: String },
    /// The listen set already belongs to a probe accepting any host.
    TakenByAny { probe: String, other: String, listen: String },
    PeerConflict { probe: String, other: String, peer: IpAddr },
    Receiver(ReceiverError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Resolve { spec, err } => {
                write!(f, "cannot resolve '{}': {}", spec, err)
            }
            RegistryError::NoAddress(spec) => write!(f, "'{}' resolved to no addresses", spec),
            RegistryError::Bind { spec, err } => {
                write!(f, "cannot bind any address for '{}': {}", spec, err)
            }
            RegistryError::AnyConflict { probe, listen } => write!(
                f,
                "probe '{}' accepts any host on {} but other probes already listen there",
                probe, listen
            ),
            RegistryError::TakenByAny { probe, other, listen } => write!(
                f,
                "probe '{}' cannot share {} with probe '{}', which accepts any host",
                probe, listen, other
            ),
            RegistryError::PeerConflict { probe, other, peer } => write!(
                f,
                "probe '{}' and probe '{}' both accept host {}",
                probe, other, peer
            ),
            RegistryError::Receiver(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<ReceiverError> for RegistryError {
    fn from(e: ReceiverError) -> Self {
        RegistryError::Receiver(e)
    }
}

/// Where a receiver listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenSpec {
    /// Every address a `host:port` resolved to, sorted.
    Udp { spec: String, addrs: Vec<SocketAddr> },
    Unix(PathBuf),
}

impl ListenSpec {
    /// Resolve `host:port` (or `[v6]:port`, or `:port` for the wildcard).
    pub fn udp(spec: &str) -> Result<ListenSpec, RegistryError> {
        let target = match spec.strip_prefix(':') {
            Some(port) => format!("[::]:{}", port),
            None => spec.to_string(),
        };
        let mut addrs: Vec<SocketAddr> = target
            .to_socket_addrs()
            .map_err(|err| RegistryError::Resolve {
                spec: spec.to_string(),
                err,
            })?
            .collect();
        if spec.starts_with(':') {
            if let Some(port) = addrs.first().map(|a| a.port()) {
                addrs.push(SocketAddr::from(([0, 0, 0, 0], port)));
            }
        }
        addrs.sort();
        addrs.dedup();
        if addrs.is_empty() {
            return Err(RegistryError::NoAddress(spec.to_string()));
        }
        Ok(ListenSpec::Udp {
            spec: spec.to_string(),
            addrs,
        })
    }

    /// One listen set covering several `host:port` specs.
    pub fn udp_all<S: AsRef<str>>(specs: &[S]) -> Result<ListenSpec, RegistryError> {
        let mut all = Vec::new();
        for spec in specs {
            if let ListenSpec::Udp { addrs, .. } = ListenSpec::udp(spec.as_ref())? {
                all.extend(addrs);
            }
        }
        all.sort();
        all.dedup();
        if all.is_empty() {
            return Err(RegistryError::NoAddress(String::new()));
        }
        Ok(ListenSpec::Udp {
            spec: specs.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(","),
            addrs: all,
        })
    }

    pub fn unix(path: impl Into<PathBuf>) -> ListenSpec {
        ListenSpec::Unix(path.into())
    }

    /// Identity used to share receivers; the textual spec is ignored.
    fn same_listen_set(&self, other: &ListenSpec) -> bool {
        match (self, other) {
            (ListenSpec::Udp { addrs: a, .. }, ListenSpec::Udp { addrs: b, .. }) => a == b,
            (ListenSpec::Unix(a), ListenSpec::Unix(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenSpec::Udp { spec, .. } => write!(f, "{}", spec),
            ListenSpec::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Socket receive-buffer sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketBufferConfig {
    /// Budget shared by every socket the process opens.
    pub nominal_total: usize,
    /// Never ask for less than this per socket.
    pub minimum: usize,
}

impl Default for SocketBufferConfig {
    fn default() -> Self {
        SocketBufferConfig {
            nominal_total: SOCKETBUFFER_NOMINAL_TOTAL,
            minimum: SOCKETBUFFER_MINIMUM,
        }
    }
}

impl SocketBufferConfig {
    /// Defaults overridden by the environment, where set and parsable.
    pub fn from_env() -> Self {
        let mut cfg = SocketBufferConfig::default();
        if let Some(v) = env_size(ENV_SOCKETBUFFER_NOMINAL_TOTAL) {
            cfg.nominal_total = v;
        }
        if let Some(v) = env_size(ENV_SOCKETBUFFER_MINIMUM) {
            cfg.minimum = v;
        }
        cfg
    }

    pub fn per_socket(&self, sockets: usize) -> usize {
        (self.nominal_total / sockets.max(1)).max(self.minimum)
    }
}

fn env_size(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}='{}'", name, raw);
            None
        }
    }
}

/// Ask for `size` bytes of receive buffer, halving until the kernel
/// accepts or the minimum is reached.
fn adjust_recv_buffer(sock: &Socket, size: usize, minimum: usize) {
    let mut size = size;
    loop {
        match sock.set_recv_buffer_size(size) {
            Ok(()) => {
                tracing::debug!("Receive buffer set to {} bytes", size);
                return;
            }
            Err(e) if size > minimum => {
                tracing::debug!("Receive buffer of {} bytes refused: {}", size, e);
                size = (size / 2).max(minimum);
            }
            Err(e) => {
                tracing::warn!("Cannot set receive buffer to {} bytes: {}", size, e);
                return;
            }
        }
    }
}

fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    if addr.is_ipv6() {
        sock.set_only_v6(true)?;
    }
    sock.bind(&addr.into())?;
    Ok(sock.into())
}

fn bind_unix(path: &Path) -> io::Result<UnixDatagram> {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixDatagram::bind(path)
}

fn bind(listen: &ListenSpec) -> Result<Vec<DatagramSocket>, RegistryError> {
    match listen {
        ListenSpec::Unix(path) => {
            let sock = bind_unix(path).map_err(|err| RegistryError::Bind {
                spec: listen.to_string(),
                err,
            })?;
            Ok(vec![DatagramSocket::Unix(sock)])
        }
        ListenSpec::Udp { spec, addrs } => {
            let mut sockets = Vec::with_capacity(addrs.len());
            let mut last_err = None;
            for addr in addrs {
                match bind_udp(*addr) {
                    Ok(sock) => sockets.push(DatagramSocket::Udp(sock)),
                    Err(e) => {
                        tracing::debug!("Skipping address {} for '{}': {}", addr, spec, e);
                        last_err = Some(e);
                    }
                }
            }
            if sockets.is_empty() {
                return Err(RegistryError::Bind {
                    spec: spec.clone(),
                    err: last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)),
                });
            }
            Ok(sockets)
        }
    }
}

struct Member {
    probe: Arc<Probe>,
    accept: Option<Vec<IpAddr>>,
}

struct Entry {
    listen: ListenSpec,
    members: Vec<Member>,
    receiver: Option<Arc<Receiver>>,
}

impl Entry {
    fn check(&self, probe: &Probe, accept: Option<&[IpAddr]>) -> Result<(), RegistryError> {
        if accept.is_none() && !self.members.is_empty() {
            return Err(RegistryError::AnyConflict {
                probe: probe.name().to_string(),
                listen: self.listen.to_string(),
            });
        }
        for m in &self.members {
            let Some(theirs) = m.accept.as_deref() else {
                return Err(RegistryError::TakenByAny {
                    probe: probe.name().to_string(),
                    other: m.probe.name().to_string(),
                    listen: self.listen.to_string(),
                });
            };
            for peer in accept.unwrap_or(&[]) {
                let peer = canonical_ip(*peer);
                if theirs.iter().any(|t| canonical_ip(*t) == peer) {
                    return Err(RegistryError::PeerConflict {
                        probe: probe.name().to_string(),
                        other: m.probe.name().to_string(),
                        peer,
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct Registry {
    entries: Vec<Entry>,
    buffers: SocketBufferConfig,
}

impl Registry {
    pub fn new(buffers: SocketBufferConfig) -> Self {
        Registry {
            entries: Vec::new(),
            buffers,
        }
    }

    /// Claim `listen` for `probe`, accepting datagrams from `accept`
    /// (`None` = any host).
    pub fn register(
        &mut self,
        probe: Arc<Probe>,
        listen: ListenSpec,
        accept: Option<Vec<IpAddr>>,
    ) -> Result<(), RegistryError> {
        let member = Member { probe, accept };
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.listen.same_listen_set(&listen))
        {
            entry.check(&member.probe, member.accept.as_deref())?;
            if let Some(rx) = &entry.receiver {
                rx.attach_probe(member.probe.clone(), member.accept.as_deref());
            }
            tracing::debug!("'{}': sharing receiver on {}", member.probe.name(), entry.listen);
            entry.members.push(member);
            return Ok(());
        }
        self.entries.push(Entry {
            listen,
            members: vec![member],
            receiver: None,
        });
        Ok(())
    }

    pub fn receiver_count(&self) -> usize {
        self.entries.len()
    }

    pub fn receivers(&self) -> Vec<Arc<Receiver>> {
        self.entries
            .iter()
            .filter_map(|e| e.receiver.clone())
            .collect()
    }

    /// Bind and start every receiver not yet running, then spread the
    /// socket buffer budget over all sockets now open.
    pub fn start(&mut self) -> Result<(), RegistryError> {
        for entry in self.entries.iter_mut().filter(|e| e.receiver.is_none()) {
            let socks = bind(&entry.listen)?;
            let rx = Receiver::new(entry.listen.to_string(), socks)?;
            for m in &entry.members {
                rx.attach_probe(m.probe.clone(), m.accept.as_deref());
            }
            rx.start()?;
            tracing::info!(
                "Listening on {} for {}",
                entry.listen,
                entry
                    .members
                    .iter()
                    .map(|m| format!("'{}'", m.probe.name()))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            entry.receiver = Some(Arc::new(rx));
        }
        self.adjust_socket_buffers();
        Ok(())
    }

    fn adjust_socket_buffers(&self) {
        let receivers = self.receivers();
        let count: usize = receivers.iter().map(|rx| rx.socket_count()).sum();
        if count == 0 {
            return;
        }
        let size = self.buffers.per_socket(count);
        tracing::debug!("Setting receive buffers of {} sockets to {} bytes", count, size);
        for rx in &receivers {
            for sock in rx.sockets() {
                adjust_recv_buffer(sock, size, self.buffers.minimum);
            }
        }
    }

    /// Stop every receiver, then let the probes drain. Returns the first
    /// receiver failure.
    pub fn stop(&mut self) -> Result<(), RegistryError> {
        let mut result = Ok(());
        for entry in &self.entries {
            if let Some(rx) = &entry.receiver {
                if let Err(e) = rx.stop() {
                    tracing::error!("'{}': {}", rx.label(), e);
                    if result.is_ok() {
                        result = Err(RegistryError::Receiver(e));
                    }
                }
            }
        }
        for entry in &self.entries {
            for m in &entry.members {
                m.probe.finish();
            }
        }
        result
    }

    /// Remove `probe`; a receiver left without probes is stopped and
    /// dropped.
    pub fn unregister(&mut self, probe: &Arc<Probe>) {
        for entry in &mut self.entries {
            entry.members.retain(|m| !Arc::ptr_eq(&m.probe, probe));
            if let Some(rx) = &entry.receiver {
                if rx.detach_probe(probe) {
                    if let Err(e) = rx.stop() {
                        tracing::warn!("'{}': {}", rx.label(), e);
                    }
                }
            }
        }
        self.entries.retain(|e| !e.members.is_empty());
        self.adjust_socket_buffers();
    }
}
