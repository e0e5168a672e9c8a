use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Instant;

use log::{debug, trace};
use rand::Rng;

use crate::conn::{Config, Connection, Link};
use crate::err::Error;
use crate::segment::{Segment, ACK, MAX_SEGMENT, SYN};

/// Client-side link: a dedicated socket bound to an ephemeral port and
/// connected to the peer, read non-blockingly by the connection worker.
struct ClientSock {
    sock: UdpSocket,
}

impl Link for ClientSock {
    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.sock.send(datagram).map(|_| ())
    }

    fn recv(&self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = [0u8; 2 * MAX_SEGMENT];
        match self.sock.recv(&mut buf) {
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Connection {
    /// Active open: binds an ephemeral UDP socket, performs the three-way
    /// handshake with the host at `peer`, and returns the established
    /// connection. Fails with [`Error::HandshakeTimeout`] when the host does
    /// not answer within `cfg.timeout`.
    pub fn connect(peer: impl ToSocketAddrs, cfg: Config) -> Result<Connection, Error> {
        let peer = peer
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no peer address"))?;

        let bind_addr: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let sock = UdpSocket::bind(bind_addr)?;
        sock.connect(peer)?;
        sock.set_read_timeout(Some(cfg.resend_interval))?;
        let local_addr = sock.local_addr()?;

        let isn = rand::thread_rng().gen_range(0..1u32 << 31);

        // The connection exists in the HANDSHAKE state while the exchange
        // below runs; stream operations on it are rejected until it is
        // established.
        let mut conn = Connection::handshaking(local_addr, peer, &cfg, isn.wrapping_add(1));

        let syn = Segment::control(
            local_addr.port(),
            peer.port(),
            isn,
            0,
            SYN,
            cfg.window_size,
        );
        let deadline = Instant::now() + cfg.timeout;

        debug!("connecting to {peer} (isn {isn})");
        sock.send(&syn.to_datagram())?;

        // Retransmit the SYN every resend interval until a SYN+ACK that
        // acknowledges it arrives or the handshake deadline passes.
        let mut buf = [0u8; 2 * MAX_SEGMENT];
        let (peer_isn, peer_window) = loop {
            match sock.recv(&mut buf) {
                Ok(n) => match Segment::decode(&buf[..n]) {
                    Ok(seg)
                        if seg.is_syn() && seg.is_ack() && seg.ack_num == isn.wrapping_add(1) =>
                    {
                        break (seg.seq_num, seg.window);
                    }
                    _ => trace!("ignoring stray datagram during handshake"),
                },
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    if Instant::now() >= deadline {
                        return Err(Error::HandshakeTimeout(peer));
                    }
                    trace!("no SYN+ACK yet, retransmitting SYN");
                    sock.send(&syn.to_datagram())?;
                }
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Err(Error::HandshakeTimeout(peer));
            }
        };

        let ack = Segment::control(
            local_addr.port(),
            peer.port(),
            isn.wrapping_add(1),
            peer_isn.wrapping_add(1),
            ACK,
            cfg.window_size,
        );
        sock.send(&ack.to_datagram())?;
        debug!("connected to {peer} (peer isn {peer_isn}, window {peer_window})");

        sock.set_read_timeout(None)?;
        sock.set_nonblocking(true)?;

        conn.establish(
            Box::new(ClientSock { sock }),
            cfg,
            peer_isn.wrapping_add(1),
            peer_window,
        );
        Ok(conn)
    }
}
