//! A reliable, connection-oriented byte-stream transport over UDP.
//!
//! A [`Host`] accepts many concurrent connections on one datagram socket;
//! [`Connection::connect`] opens an outbound connection on a socket of its
//! own. Both yield a [`Connection`]: an ordered, duplicate-suppressed,
//! flow-controlled duplex stream with `send`/`recv`/`close` semantics.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use log::{debug, trace, warn};
use nix::poll::{poll, PollFd, PollFlags};
use rand::Rng;

mod conn;
mod err;
pub mod segment;

pub use conn::{Config, Connection, State};
pub use err::Error;

use conn::{ConnParams, Link};
use segment::{Segment, ACK, MAX_SEGMENT, SYN};

type Inbox = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// Server-side half-open entry: SYN seen, final ACK still outstanding. The
/// encoded SYN+ACK is kept around so a retransmitted SYN gets the identical
/// reply (same ISN).
struct HalfOpen {
    isn: u32,
    peer_isn: u32,
    peer_window: u16,
    synack: Vec<u8>,
}

#[derive(Default)]
struct Tables {
    pending: HashMap<SocketAddr, HalfOpen>,
    established: HashMap<SocketAddr, Inbox>,
    accept_queue: VecDeque<Connection>,
}

struct HostShared {
    sock: UdpSocket,
    /// Only the reader thread reads the socket; writers serialize here.
    send_lock: Mutex<()>,
    tables: Mutex<Tables>,
    closed: AtomicBool,
    cfg: Config,
    local_addr: SocketAddr,
    max_connections: usize,
}

impl HostShared {
    fn send_to(&self, datagram: &[u8], addr: SocketAddr) {
        let _guard = self.send_lock.lock().unwrap();
        if let Err(e) = self.sock.send_to(datagram, addr) {
            trace!("send to {addr} failed: {e}");
        }
    }
}

/// Host-side link of one connection: transmits through the host's shared
/// socket and reads from the inbox the reader thread fills for this peer.
/// The handle is non-owning; the host strictly outlives its connections, and
/// a host that is gone reads as a dead link.
struct HostLink {
    host: Weak<HostShared>,
    peer: SocketAddr,
    inbox: Inbox,
}

impl Link for HostLink {
    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        match self.host.upgrade() {
            Some(host) if !host.closed.load(Ordering::Acquire) => {
                host.send_to(datagram, self.peer);
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "host is closed",
            )),
        }
    }

    fn recv(&self) -> io::Result<Option<Vec<u8>>> {
        if let Some(datagram) = self.inbox.lock().unwrap().pop_front() {
            return Ok(Some(datagram));
        }
        match self.host.upgrade() {
            Some(host) if !host.closed.load(Ordering::Acquire) => Ok(None),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "host is closed",
            )),
        }
    }

    fn on_disconnect(&self) {
        if let Some(host) = self.host.upgrade() {
            host.tables.lock().unwrap().established.remove(&self.peer);
            debug!("released connection slot for {}", self.peer);
        }
    }
}

/// A listening endpoint that demultiplexes one UDP socket among many peers.
///
/// A single reader thread classifies every incoming datagram by source
/// address: datagrams from established peers go to that connection's inbox,
/// datagrams from half-open peers complete (or replay) the handshake, and a
/// lone SYN from an unknown peer opens a new half-open entry, capped at
/// `max_connections`. Everything else is dropped.
pub struct Host {
    shared: Arc<HostShared>,
    reader: Option<thread::JoinHandle<()>>,
}

impl Host {
    pub fn new(
        bind_addr: impl ToSocketAddrs,
        max_connections: usize,
        cfg: Config,
    ) -> Result<Host, Error> {
        let sock = UdpSocket::bind(bind_addr)?;
        sock.set_nonblocking(true)?;
        let local_addr = sock.local_addr()?;

        let shared = Arc::new(HostShared {
            sock,
            send_lock: Mutex::new(()),
            tables: Mutex::new(Tables::default()),
            closed: AtomicBool::new(false),
            cfg,
            local_addr,
            max_connections,
        });

        let reader = {
            let shared = shared.clone();

            thread::spawn(move || reader_loop(shared))
        };

        debug!("host listening on {local_addr}");
        Ok(Host {
            shared,
            reader: Some(reader),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Non-blocking: the next fully established connection, if any.
    pub fn listen(&self) -> Option<Connection> {
        if self.shared.closed.load(Ordering::Acquire) {
            return None;
        }
        self.shared.tables.lock().unwrap().accept_queue.pop_front()
    }

    /// Stops and joins the reader, discards half-open entries and closes
    /// every connection still waiting in the accept queue. Connections
    /// already handed out see their link fail and shut down on their own.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::HostClosed);
        }

        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }

        let queued: Vec<Connection> = {
            let mut tables = self.shared.tables.lock().unwrap();
            tables.pending.clear();
            tables.accept_queue.drain(..).collect()
        };
        for mut connection in queued {
            let _ = connection.close();
        }

        debug!("host on {} closed", self.local_addr());
        Ok(())
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if self.reader.is_some() {
            let _ = self.close();
        }
    }
}

fn reader_loop(shared: Arc<HostShared>) {
    let poll_ms = shared.cfg.resend_interval.as_millis().clamp(1, 1000) as i32;
    let mut buf = [0u8; 2 * MAX_SEGMENT];

    while !shared.closed.load(Ordering::Acquire) {
        let mut fds = [PollFd::new(shared.sock.as_raw_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, poll_ms) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("poll on the host socket failed: {e}");
                break;
            }
        }

        loop {
            match shared.sock.recv_from(&mut buf) {
                Ok((n, addr)) => route_datagram(&shared, &buf[..n], addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    trace!("host socket read failed: {e}");
                    break;
                }
            }
        }
    }
}

/// Classifies one datagram by source address and routes it. Replies are sent
/// after the table lock is released.
fn route_datagram(shared: &Arc<HostShared>, datagram: &[u8], addr: SocketAddr) {
    let reply = {
        let mut tables = shared.tables.lock().unwrap();

        // Established and accepted peers get the raw datagram; their own
        // worker validates it.
        if let Some(inbox) = tables.established.get(&addr) {
            inbox.lock().unwrap().push_back(datagram.to_vec());
            return;
        }

        let Ok(seg) = Segment::decode(datagram) else {
            trace!("dropping malformed datagram from {addr}");
            return;
        };

        if tables.pending.contains_key(&addr) {
            pending_datagram(shared, &mut tables, addr, &seg, datagram)
        } else if seg.is_syn() && !seg.is_ack() && !seg.is_fin() {
            syn_datagram(shared, &mut tables, addr, &seg)
        } else {
            trace!("dropping datagram from unknown peer {addr}");
            None
        }
    };

    if let Some(reply) = reply {
        shared.send_to(&reply, addr);
    }
}

/// A datagram from a peer whose handshake is half done: either a
/// retransmitted SYN (replay the SYN+ACK) or the final ACK (establish).
fn pending_datagram(
    shared: &Arc<HostShared>,
    tables: &mut Tables,
    addr: SocketAddr,
    seg: &Segment,
    datagram: &[u8],
) -> Option<Vec<u8>> {
    let half = &tables.pending[&addr];

    if seg.is_syn() && !seg.is_ack() {
        trace!("replaying SYN+ACK to {addr}");
        return Some(half.synack.clone());
    }

    if seg.is_ack() && seg.ack_num == half.isn.wrapping_add(1) {
        let half = tables.pending.remove(&addr).unwrap();
        debug!("connection from {addr} established");

        // The completing datagram goes to the new connection too: when the
        // final ACK rode a data segment, its payload must not be lost.
        let inbox: Inbox = Arc::new(Mutex::new(VecDeque::from([datagram.to_vec()])));
        let link = HostLink {
            host: Arc::downgrade(shared),
            peer: addr,
            inbox: inbox.clone(),
        };
        let connection = Connection::spawn(
            Box::new(link),
            shared.cfg.clone(),
            ConnParams {
                local_addr: shared.local_addr,
                peer_addr: addr,
                next_send_seq: half.isn.wrapping_add(1),
                next_expected_seq: half.peer_isn.wrapping_add(1),
                peer_window: half.peer_window,
            },
        );

        tables.established.insert(addr, inbox);
        tables.accept_queue.push_back(connection);
    }

    None
}

/// A lone SYN from an unknown peer: record a half-open entry and answer with
/// a SYN+ACK carrying a freshly drawn ISN, unless the connection cap is hit.
fn syn_datagram(
    shared: &Arc<HostShared>,
    tables: &mut Tables,
    addr: SocketAddr,
    seg: &Segment,
) -> Option<Vec<u8>> {
    if tables.pending.len() + tables.established.len() >= shared.max_connections {
        debug!("connection cap reached, dropping SYN from {addr}");
        return None;
    }

    let isn = rand::thread_rng().gen_range(0..1u32 << 31);
    let synack = Segment::control(
        shared.local_addr.port(),
        addr.port(),
        isn,
        seg.seq_num.wrapping_add(1),
        SYN | ACK,
        shared.cfg.window_size,
    )
    .to_datagram();

    debug!("half-open from {addr} (isn {isn})");
    tables.pending.insert(
        addr,
        HalfOpen {
            isn,
            peer_isn: seg.seq_num,
            peer_window: seg.window,
            synack: synack.clone(),
        },
    );

    Some(synack)
}
