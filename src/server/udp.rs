//! mio UDP echo multiplexer.
//!
//! One socket receives datagrams from every peer. Sessions are keyed by peer
//! address and created on the first datagram. There is no connection to
//! close, so sessions are never evicted: a peer silent for longer than the
//! reset window simply starts a fresh rate window on its next datagram.

use crate::config::Config;
use crate::rate::kb_per_sec;
use crate::runtime::socket::{bind_udp, is_transient, resolve};
use crate::server::session::ClientSession;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SOCKET_TOKEN: Token = Token(0);

/// Large enough for any UDP datagram.
const DATAGRAM_BUF: usize = u16::MAX as usize;

/// Single-threaded UDP echo server.
pub struct UdpEchoServer {
    poll: Poll,
    events: Events,
    socket: UdpSocket,
    peers: HashMap<SocketAddr, ClientSession>,
    buf: Vec<u8>,
    reset_after: Duration,
    report_interval: Duration,
}

impl UdpEchoServer {
    /// Bind the socket and register it for readiness.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = resolve(&config.addr())?;
        let poll = Poll::new()?;

        let mut socket = UdpSocket::from_std(bind_udp(addr)?);
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        info!(addr = %socket.local_addr()?, "Listening");

        Ok(Self {
            poll,
            events: Events::with_capacity(64),
            socket,
            peers: HashMap::new(),
            buf: vec![0u8; DATAGRAM_BUF],
            reset_after: config.udp_idle_reset,
            report_interval: config.report_interval,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until a poll failure.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.poll_once(None)?;
        }
    }

    /// Wait for readiness once and echo every queued datagram.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        if self.events.iter().any(|event| event.token() == SOCKET_TOKEN) {
            self.drain();
        }
        Ok(())
    }

    fn drain(&mut self) {
        loop {
            let (n, peer) = match self.socket.recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if is_transient(e) => {
                    debug!(error = %e, "Receive error, continuing");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Receive error");
                    break;
                }
            };

            if let Some(rate) = self.record_datagram(peer, n, Instant::now()) {
                info!(peer = %peer, "Data exchange rate: {} kB/s", kb_per_sec(rate));
            }

            match self.socket.send_to(&self.buf[..n], peer) {
                Ok(_) => {}
                // Datagrams carry no delivery promise; drop the echo
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    debug!(peer = %peer, len = n, "Send buffer full, echo dropped");
                }
                Err(e) => warn!(peer = %peer, error = %e, "Echo failed"),
            }
        }
    }

    /// Account a datagram of `n` bytes from `peer` received at `now`.
    ///
    /// Returns a rate when the peer's report is due.
    fn record_datagram(&mut self, peer: SocketAddr, n: usize, now: Instant) -> Option<f64> {
        let report_interval = self.report_interval;
        let session = self.peers.entry(peer).or_insert_with(|| {
            info!(peer = %peer, "Client incoming");
            ClientSession::new(now, report_interval)
        });

        if session.reset_if_stale(now, self.reset_after) {
            debug!(peer = %peer, "Peer was silent, rate window reset");
        }
        session.record(n, now)
    }

    #[cfg(test)]
    fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    fn session(&self, peer: &SocketAddr) -> Option<&ClientSession> {
        self.peers.get(peer)
    }
}

/// Run the UDP echo server until a fatal error.
pub fn run(config: &Config) -> io::Result<()> {
    let mut server = UdpEchoServer::bind(config)?;
    server.run()
}
