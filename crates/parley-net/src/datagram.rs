//! Datagram relay for live call audio.
//!
//! One UDP socket per client, bound for the lifetime of the client. A call
//! points it at a single peer with [`DatagramRelay::configure_peer`]; a
//! dedicated receive thread delivers every inbound packet to a listener.
//! The socket uses a 100 ms read timeout so the loop notices `close()`.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, trace, warn};

use crate::error::NetError;

/// Largest datagram we accept. Audio frames are 1 KiB.
const MAX_PACKET_SIZE: usize = 4096;

/// Socket buffer size (256 KB), a few seconds of audio either way.
const SOCKET_BUF_SIZE: usize = 256 * 1024;

/// Receive timeout, which bounds how long `close()` waits for the loop.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub trait DatagramListener: Send + Sync + 'static {
    fn on_packet(&self, data: &[u8], from: SocketAddr);
}

impl<F> DatagramListener for F
where
    F: Fn(&[u8], SocketAddr) + Send + Sync + 'static,
{
    fn on_packet(&self, data: &[u8], from: SocketAddr) {
        self(data, from)
    }
}

pub struct DatagramRelay {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    peer: RwLock<Option<SocketAddr>>,
    running: Arc<AtomicBool>,
    closed: AtomicBool,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl DatagramRelay {
    pub fn bind(addr: SocketAddr) -> Result<Self, NetError> {
        let sock = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUF_SIZE) {
            warn!("UDP relay: failed to set recv buffer: {}", e);
        }
        if let Err(e) = sock.set_send_buffer_size(SOCKET_BUF_SIZE) {
            warn!("UDP relay: failed to set send buffer: {}", e);
        }
        sock.set_nonblocking(false)?;
        sock.set_read_timeout(Some(READ_TIMEOUT))?;
        sock.bind(&addr.into())?;

        let socket: UdpSocket = sock.into();
        let local_addr = socket.local_addr()?;
        info!("UDP relay bound on {}", local_addr);

        Ok(Self {
            socket: RwLock::new(Some(Arc::new(socket))),
            local_addr,
            peer: RwLock::new(None),
            running: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            receiver: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The port advertised to the other side as `udpPort`.
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Set or replace the single counterpart.
    pub fn configure_peer(&self, addr: SocketAddr) {
        *self.peer.write().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        info!("UDP relay: peer set to {}", addr);
    }

    pub fn clear_peer(&self) {
        if self
            .peer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("UDP relay: peer cleared");
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send one packet to the configured peer. Without a peer this is a
    /// logged no-op.
    pub fn send(&self, data: &[u8]) -> Result<(), NetError> {
        let Some(peer) = self.peer() else {
            trace!("UDP relay: no peer configured, dropping {} bytes", data.len());
            return Ok(());
        };
        let socket = self.socket()?;
        socket.send_to(data, peer)?;
        Ok(())
    }

    /// Start the receive loop on its own thread. Every packet is delivered,
    /// whatever its source address.
    pub fn start(&self, listener: Arc<dyn DatagramListener>) -> Result<(), NetError> {
        let socket = self.socket()?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyStarted);
        }

        let running = self.running.clone();
        let handle = std::thread::Builder::new()
            .name("udp-recv".into())
            .spawn(move || receive_loop(socket, running, listener))
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                NetError::Io(e)
            })?;

        *self.receiver.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Stop the receive loop and release the socket. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);
        self.clear_peer();

        let handle = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // A listener may close the relay from the receive thread itself.
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                error!("UDP relay: receive thread panicked");
            }
        }

        self.socket
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!("UDP relay on {} closed", self.local_addr);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, NetError> {
        self.socket
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(NetError::Closed)
    }
}

impl Drop for DatagramRelay {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop(socket: Arc<UdpSocket>, running: Arc<AtomicBool>, listener: Arc<dyn DatagramListener>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut packets: u64 = 0;

    while running.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                packets += 1;
                trace!("UDP relay: {} bytes from {}", len, from);
                listener.on_packet(&buf[..len], from);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                // ICMP port unreachable from a peer that went away.
                continue;
            }
            Err(e) => {
                error!("UDP relay: recv error: {}", e);
                std::thread::sleep(READ_TIMEOUT);
            }
        }
    }

    debug!("UDP relay: receive loop stopped after {} packets", packets);
}
