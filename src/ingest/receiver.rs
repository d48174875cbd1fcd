//! A receiver owns the sockets bound for one listen set and a thread that
//! polls them, handing each datagram to the probe its sender belongs to.

use std::collections::TryReserveError;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use socket2::Socket;

use super::dispatch::Dispatch;
use super::probe::Probe;
use crate::protocol::v5::V5_PDU_LEN;

/// How long one poll waits before re-checking the stop flag.
pub const POLL_TIMEOUT_MS: i32 = 500;

#[derive(Debug)]
pub enum ReceiverError {
    Io(io::Error),
    Alloc(TryReserveError),
    /// `start` called on a receiver that is not freshly created.
    AlreadyStarted,
    /// The polling thread panicked.
    Panicked,
}

impl fmt::Display for ReceiverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiverError::Io(e) => write!(f, "receiver I/O error: {}", e),
            ReceiverError::Alloc(e) => write!(f, "cannot allocate receive buffer: {}", e),
            ReceiverError::AlreadyStarted => write!(f, "receiver already started"),
            ReceiverError::Panicked => write!(f, "receiver thread panicked"),
        }
    }
}

impl std::error::Error for ReceiverError {}

impl From<io::Error> for ReceiverError {
    fn from(e: io::Error) -> Self {
        ReceiverError::Io(e)
    }
}

impl From<TryReserveError> for ReceiverError {
    fn from(e: TryReserveError) -> Self {
        ReceiverError::Alloc(e)
    }
}

/// A bound datagram socket.
#[derive(Debug)]
pub enum DatagramSocket {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

impl DatagramSocket {
    pub fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            DatagramSocket::Udp(s) => s.set_nonblocking(true),
            DatagramSocket::Unix(s) => s.set_nonblocking(true),
        }
    }

    /// Receive one datagram. UNIX sockets report no peer.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        match self {
            DatagramSocket::Udp(s) => s.recv_from(buf).map(|(n, from)| (n, Some(from))),
            DatagramSocket::Unix(s) => s.recv_from(buf).map(|(n, _)| (n, None)),
        }
    }

    /// A second handle on the same socket, for option tuning while the
    /// original is owned by the polling thread.
    pub fn tuning_handle(&self) -> io::Result<Socket> {
        match self {
            DatagramSocket::Udp(s) => s.try_clone().map(Socket::from),
            DatagramSocket::Unix(s) => s.try_clone().map(|s| Socket::from(OwnedFd::from(s))),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            DatagramSocket::Udp(s) => s.local_addr().ok(),
            DatagramSocket::Unix(_) => None,
        }
    }
}

impl AsRawFd for DatagramSocket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            DatagramSocket::Udp(s) => s.as_raw_fd(),
            DatagramSocket::Unix(s) => s.as_raw_fd(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Created,
    Running,
    Stopping,
    Stopped,
}

struct Shared {
    label: String,
    state: Mutex<ReceiverState>,
    changed: Condvar,
    dispatch: Mutex<Dispatch>,
    /// Error that ended the polling loop.
    failure: Mutex<Option<io::Error>>,
}

impl Shared {
    fn set_state(&self, state: ReceiverState) {
        *self.state.lock().unwrap() = state;
        self.changed.notify_all();
    }

    fn running(&self) -> bool {
        *self.state.lock().unwrap() == ReceiverState::Running
    }
}

pub struct Receiver {
    shared: Arc<Shared>,
    sockets: Mutex<Option<Vec<DatagramSocket>>>,
    local_addrs: Vec<SocketAddr>,
    tuning: Vec<Socket>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("label", &self.shared.label)
            .field("state", &self.state())
            .finish()
    }
}

impl Receiver {
    /// Wrap already-bound sockets. They are switched to non-blocking mode.
    pub fn new(label: impl Into<String>, sockets: Vec<DatagramSocket>) -> Result<Self, ReceiverError> {
        for s in &sockets {
            s.set_nonblocking()?;
        }
        let local_addrs = sockets.iter().filter_map(|s| s.local_addr()).collect();
        let tuning = sockets
            .iter()
            .map(|s| s.tuning_handle())
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Receiver {
            shared: Arc::new(Shared {
                label: label.into(),
                state: Mutex::new(ReceiverState::Created),
                changed: Condvar::new(),
                dispatch: Mutex::new(Dispatch::new()),
                failure: Mutex::new(None),
            }),
            sockets: Mutex::new(Some(sockets)),
            local_addrs,
            tuning,
            thread: Mutex::new(None),
        })
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn state(&self) -> ReceiverState {
        *self.shared.state.lock().unwrap()
    }

    /// Addresses the UDP sockets ended up bound to.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn socket_count(&self) -> usize {
        self.tuning.len()
    }

    /// Handles for adjusting socket options such as the receive buffer.
    pub fn sockets(&self) -> &[Socket] {
        &self.tuning
    }

    /// Run `f` against the peer table.
    pub fn with_dispatch<T>(&self, f: impl FnOnce(&mut Dispatch) -> T) -> T {
        f(&mut self.shared.dispatch.lock().unwrap())
    }

    pub fn attach_probe(&self, probe: Arc<Probe>, accept: Option<&[std::net::IpAddr]>) {
        self.with_dispatch(|d| d.attach(probe, accept));
    }

    /// Returns true once no probe is attached.
    pub fn detach_probe(&self, probe: &Arc<Probe>) -> bool {
        self.with_dispatch(|d| d.detach(probe))
    }

    /// Spawn the polling thread and wait until it is running.
    pub fn start(&self) -> Result<(), ReceiverError> {
        let sockets = self
            .sockets
            .lock()
            .unwrap()
            .take()
            .ok_or(ReceiverError::AlreadyStarted)?;

        let size = self
            .shared
            .dispatch
            .lock()
            .unwrap()
            .probes()
            .iter()
            .map(|p| p.ring().slot_size())
            .max()
            .unwrap_or(V5_PDU_LEN)
            .max(V5_PDU_LEN);
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)?;
        buf.resize(size, 0u8);

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("fp-recv-{}", self.shared.label))
            .spawn(move || {
                shared.set_state(ReceiverState::Running);
                receive_loop(&shared, sockets, buf);
                shared.set_state(ReceiverState::Stopped);
            })?;
        *self.thread.lock().unwrap() = Some(handle);

        let mut state = self.shared.state.lock().unwrap();
        while *state == ReceiverState::Created {
            state = self.shared.changed.wait(state).unwrap();
        }
        tracing::debug!("'{}': receiver started", self.shared.label);
        Ok(())
    }

    /// Ask the thread to exit and wait for it.
    pub fn stop(&self) -> Result<(), ReceiverError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state == ReceiverState::Running {
                *state = ReceiverState::Stopping;
            }
        }
        self.shared.changed.notify_all();
        self.join()
    }

    /// Wait for the thread; returns the error that ended it, if any.
    pub fn join(&self) -> Result<(), ReceiverError> {
        let handle = self.thread.lock().unwrap().take();
        let mut result = Ok(());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("'{}': receiver thread panicked", self.shared.label);
                result = Err(ReceiverError::Panicked);
            }
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != ReceiverState::Created {
                *state = ReceiverState::Stopped;
            }
        }
        if let Some(err) = self.shared.failure.lock().unwrap().take() {
            return Err(ReceiverError::Io(err));
        }
        result
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn receive_loop(shared: &Shared, sockets: Vec<DatagramSocket>, mut buf: Vec<u8>) {
    let mut sockets: Vec<Option<DatagramSocket>> = sockets.into_iter().map(Some).collect();
    let mut fds: Vec<libc::pollfd> = Vec::with_capacity(sockets.len());
    let mut index: Vec<usize> = Vec::with_capacity(sockets.len());

    'poll: while shared.running() {
        fds.clear();
        index.clear();
        for (i, sock) in sockets.iter().enumerate() {
            if let Some(sock) = sock {
                fds.push(libc::pollfd {
                    fd: sock.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
                index.push(i);
            }
        }
        if fds.is_empty() {
            tracing::warn!("'{}': all sockets closed; receiver exiting", shared.label);
            break;
        }

        // SAFETY: `fds` is a live, correctly sized array of pollfd.
        let rv = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
        if rv < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => continue,
                _ => {
                    tracing::error!("'{}': poll failed: {}", shared.label, err);
                    *shared.failure.lock().unwrap() = Some(err);
                    break;
                }
            }
        }
        if rv == 0 {
            if shared.dispatch.lock().unwrap().is_empty() {
                tracing::info!("'{}': no probes attached; receiver exiting", shared.label);
                break;
            }
            continue;
        }

        for (pfd, &i) in fds.iter().zip(index.iter()) {
            if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                tracing::warn!("'{}': closing socket after poll error", shared.label);
                sockets[i] = None;
                continue;
            }
            if pfd.revents & libc::POLLIN == 0 {
                continue;
            }
            let Some(sock) = sockets[i].as_ref() else {
                continue;
            };
            match sock.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let probe = shared.dispatch.lock().unwrap().route(from);
                    if let Some(probe) = probe {
                        probe.deposit(&buf[..n]);
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::error!("'{}': recv failed: {}", shared.label, e);
                    *shared.failure.lock().unwrap() = Some(e);
                    break 'poll;
                }
            }
        }
    }
    tracing::debug!("'{}': receiver loop finished", shared.label);
}
