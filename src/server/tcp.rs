//! mio TCP echo multiplexer.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. One thread owns the listener,
//! every accepted connection, and the session table, so no locking is
//! needed.

use crate::config::Config;
use crate::error::SessionError;
use crate::rate::kb_per_sec;
use crate::runtime::socket::{create_listener, is_transient, resolve};
use crate::runtime::{IoStatus, Transport};
use crate::server::session::{ClientSession, SessionRegistry};
use bytes::{Buf, BytesMut};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Upper bound on how long the loop sleeps, so the idle sweep keeps running
/// when no socket is ready.
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);

/// One accepted connection.
struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    session: ClientSession,
    /// Echo bytes the socket has not accepted yet. Reading pauses until
    /// this drains.
    outbound: BytesMut,
}

/// Everything the event handlers mutate, split from `Poll` and `Events` so
/// the event iterator can borrow alongside it.
struct Multiplexer {
    listener: TcpListener,
    connections: SessionRegistry<TcpConnection>,
    read_buf: Vec<u8>,
    idle_timeout: Duration,
    report_interval: Duration,
}

/// Single-threaded TCP echo server.
pub struct TcpEchoServer {
    poll: Poll,
    events: Events,
    mux: Multiplexer,
}

impl TcpEchoServer {
    /// Bind the listener and register it for readiness.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = resolve(&config.addr())?;
        let poll = Poll::new()?;

        let mut listener = TcpListener::from_std(create_listener(addr)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        info!(addr = %listener.local_addr()?, "Listening");

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            mux: Multiplexer {
                listener,
                connections: SessionRegistry::new(config.max_connections),
                read_buf: vec![0u8; config.recv_chunk_size],
                idle_timeout: config.idle_timeout,
                report_interval: config.report_interval,
            },
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.mux.listener.local_addr()
    }

    /// Serve until a poll failure.
    pub fn run(&mut self) -> io::Result<()> {
        let wait = self.mux.idle_timeout.min(MAX_POLL_WAIT);
        loop {
            self.poll_once(Some(wait))?;
        }
    }

    /// Wait for readiness once, dispatch every event, then sweep idle
    /// connections.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let registry = self.poll.registry();
        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.mux.accept_connections(registry),
                Token(conn_id) => self.mux.handle_connection_event(registry, conn_id, event),
            }
        }

        self.mux.sweep_idle(registry, Instant::now());
        Ok(())
    }

    /// Number of live sessions.
    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.mux.connections.len()
    }

    #[cfg(test)]
    fn sweep_idle(&mut self, now: Instant) {
        self.mux.sweep_idle(self.poll.registry(), now);
    }
}

impl Drop for TcpEchoServer {
    fn drop(&mut self) {
        for conn in self.mux.connections.drain() {
            conn.stream.close();
        }
    }
}

impl Multiplexer {
    fn accept_connections(&mut self, registry: &Registry) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.is_full() {
                        warn!(peer = %peer, "Connection limit reached, refusing");
                        continue;
                    }
                    if let Err(e) = self.register(registry, stream, peer) {
                        error!(peer = %peer, error = %e, "Failed to register connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // A peer that gave up before accept; later ones may be queued
                Err(ref e) if is_transient(e) => {
                    debug!(error = %e, "Accept failed, continuing");
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn register(&mut self, registry: &Registry, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        stream.set_nodelay(true)?;

        let conn = TcpConnection {
            stream,
            peer,
            session: ClientSession::new(Instant::now(), self.report_interval),
            outbound: BytesMut::new(),
        };
        let Some(conn_id) = self.connections.insert(conn) else {
            return Ok(());
        };

        // Re-borrow after insert
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };
        if let Err(e) = registry.register(
            &mut conn.stream,
            Token(conn_id),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.connections.remove(conn_id);
            return Err(e);
        }

        info!(conn_id, peer = %peer, "Connection accepted");
        Ok(())
    }

    fn handle_connection_event(&mut self, registry: &Registry, conn_id: usize, event: &Event) {
        if !self.connections.contains(conn_id) {
            return;
        }

        let mut result = Ok(());
        if event.is_writable() {
            result = self.flush(conn_id);
        }
        // Read even on a pure writable event: a flush that just completed
        // may have unblocked data the edge-triggered poll already reported.
        if result.is_ok() {
            result = self.echo_available(conn_id);
        }

        if let Err(reason) = result {
            self.evict(registry, conn_id, reason);
        }
    }

    /// Write queued echo bytes until done or the socket would block.
    fn flush(&mut self, conn_id: usize) -> Result<(), SessionError> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };

        while !conn.outbound.is_empty() {
            match conn.stream.send(&conn.outbound)? {
                IoStatus::Ready(n) => conn.outbound.advance(n),
                IoStatus::WouldBlock => break,
                IoStatus::Closed => return Err(SessionError::Closed),
            }
        }
        Ok(())
    }

    /// Read available chunks and echo each back, until the socket would
    /// block or an echo is left partially written.
    fn echo_available(&mut self, conn_id: usize) -> Result<(), SessionError> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };

        while conn.outbound.is_empty() {
            let n = match conn.stream.receive(&mut self.read_buf)? {
                IoStatus::Ready(n) => n,
                IoStatus::WouldBlock => break,
                IoStatus::Closed => return Err(SessionError::Closed),
            };
            let data = &self.read_buf[..n];

            let mut written = 0;
            while written < n {
                match conn.stream.send(&data[written..])? {
                    IoStatus::Ready(k) => written += k,
                    IoStatus::WouldBlock => {
                        // Finish on the next writable event
                        conn.outbound.extend_from_slice(&data[written..]);
                        break;
                    }
                    IoStatus::Closed => return Err(SessionError::Closed),
                }
            }

            if let Some(rate) = conn.session.record(n, Instant::now()) {
                info!(conn_id, "Data exchange rate: {} kB/s", kb_per_sec(rate));
            }
        }
        Ok(())
    }

    /// Evict every connection quiet for longer than the idle timeout.
    fn sweep_idle(&mut self, registry: &Registry, now: Instant) {
        let idle: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.session.idle_for(now) > self.idle_timeout)
            .map(|(conn_id, _)| conn_id)
            .collect();

        for conn_id in idle {
            self.evict(registry, conn_id, SessionError::Timeout(self.idle_timeout));
        }
    }

    /// Deregister, close, and forget a connection in one step.
    fn evict(&mut self, registry: &Registry, conn_id: usize, reason: SessionError) {
        let Some(mut conn) = self.connections.remove(conn_id) else {
            return;
        };
        let _ = registry.deregister(&mut conn.stream);
        conn.stream.close();

        match reason {
            SessionError::Closed => info!(conn_id, peer = %conn.peer, "Connection closed"),
            SessionError::Timeout(_) => info!(conn_id, peer = %conn.peer, "Timeout"),
            e => error!(conn_id, peer = %conn.peer, error = %e, "Closed due to error"),
        }
        debug!(remaining = self.connections.len(), "Session removed");
    }
}

/// Run the TCP echo server until a fatal error.
pub fn run(config: &Config) -> io::Result<()> {
    let mut server = TcpEchoServer::bind(config)?;
    server.run()
}
