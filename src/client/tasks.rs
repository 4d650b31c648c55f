//! Multi-session client on a single-threaded tokio runtime.
//!
//! Each session is an independent task that overlaps its sends and
//! receives with `select!`. A supervisor spawns all sessions and collects
//! them as they finish; one session failing never cancels its siblings.

use crate::client::flow::{FlowSettings, SessionSummary, TcpFlow, UdpFlow};
use crate::config::{Config, TransportType};
use crate::error::SessionError;
use crate::payload;
use crate::rate::kb_per_sec;
use crate::runtime::socket::{connect_udp, resolve};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Receive buffer large enough for any UDP datagram.
const UDP_RECV_BUF: usize = u16::MAX as usize;

/// How the supervised sessions ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorReport {
    /// Reached the byte limit.
    pub completed: usize,
    /// Ended by timeout or peer close.
    pub stopped: usize,
    /// Ended by a transport error, corrupted echo, or panic.
    pub failed: usize,
}

enum Op {
    Sent(io::Result<usize>),
    Received(io::Result<usize>),
}

/// Pump one TCP stream until the byte limit, a timeout, or an error.
///
/// Generic over the stream so scripted I/O can stand in for a socket.
pub async fn run_tcp_session<S>(
    id: usize,
    stream: S,
    mut flow: TcpFlow,
    io_timeout: Duration,
) -> Result<SessionSummary, SessionError>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; flow.recv_chunk_size()];
    let payload = flow.payload();

    loop {
        let offset = flow.offset();
        let can_send = flow.can_send();

        // Both operations are cancel safe: the one that loses the race has
        // moved no bytes. Receives are polled first so echoes drain before
        // the backlog grows further.
        let op = timeout(io_timeout, async {
            tokio::select! {
                biased;
                res = reader.read(&mut buf) => Op::Received(res),
                res = writer.write(&payload[offset..]), if can_send => Op::Sent(res),
            }
        })
        .await
        .map_err(|_| SessionError::Timeout(io_timeout))?;

        match op {
            Op::Sent(Ok(0)) | Op::Received(Ok(0)) => return Err(SessionError::Closed),
            Op::Sent(Ok(n)) => {
                if let Some(mib) = flow.on_sent(n) {
                    info!(session = id, "Exchanged {mib} MiB");
                }
            }
            Op::Received(Ok(n)) => {
                if let Some(rate) = flow.on_received(&buf[..n], Instant::now())? {
                    info!(session = id, "Data exchange rate: {} kB/s", kb_per_sec(rate));
                }
                if flow.is_complete() {
                    let _ = writer.shutdown().await;
                    return Ok(flow.summary(Instant::now()));
                }
            }
            Op::Sent(Err(e)) | Op::Received(Err(e)) => return Err(SessionError::from_io(e)),
        }
    }
}

/// Pump one connected UDP socket.
pub async fn run_udp_session(
    id: usize,
    socket: UdpSocket,
    mut flow: UdpFlow,
    io_timeout: Duration,
) -> Result<SessionSummary, SessionError> {
    let mut buf = vec![0u8; UDP_RECV_BUF];

    loop {
        loop {
            match socket.try_recv(&mut buf) {
                Ok(n) => {
                    let received = flow.on_received(&buf[..n], Instant::now());
                    if !received.intact {
                        warn!(session = id, len = n, "Datagram does not match payload");
                    }
                    if let Some(rate) = received.rate {
                        info!(session = id, "Data exchange rate: {} kB/s", kb_per_sec(rate));
                    }
                    if flow.is_complete() {
                        return Ok(flow.summary(Instant::now()));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !flow.keep_draining() {
                        break;
                    }
                    timeout(io_timeout, socket.readable())
                        .await
                        .map_err(|_| SessionError::Timeout(io_timeout))??;
                }
                Err(e) => return Err(SessionError::from_io(e)),
            }
        }

        let n = timeout(io_timeout, socket.send(flow.datagram()))
            .await
            .map_err(|_| SessionError::Timeout(io_timeout))??;
        if let Some(mib) = flow.on_sent(n) {
            info!(session = id, "Exchanged {mib} MiB");
        }

        // Datagram sends rarely block, so hand the thread to sibling sessions
        tokio::task::yield_now().await;
    }
}

async fn tcp_session(
    id: usize,
    peer: SocketAddr,
    settings: FlowSettings,
    io_timeout: Duration,
) -> Result<SessionSummary, SessionError> {
    info!(session = id, peer = %peer, "Connecting");
    let stream = timeout(io_timeout, TcpStream::connect(peer))
        .await
        .map_err(|_| SessionError::Timeout(io_timeout))??;
    stream.set_nodelay(true)?;

    let flow = TcpFlow::new(payload::payload(), &settings, Instant::now());
    run_tcp_session(id, stream, flow, io_timeout).await
}

async fn udp_session(
    id: usize,
    peer: SocketAddr,
    settings: FlowSettings,
    io_timeout: Duration,
) -> Result<SessionSummary, SessionError> {
    info!(session = id, peer = %peer, "Connecting");
    let socket = UdpSocket::from_std(connect_udp(peer)?)?;

    let flow = UdpFlow::new(payload::payload(), &settings, Instant::now());
    run_udp_session(id, socket, flow, io_timeout).await
}

/// Run every session to completion, logging each termination as it happens.
pub async fn supervise<F>(sessions: Vec<F>) -> SupervisorReport
where
    F: Future<Output = Result<SessionSummary, SessionError>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for (id, session) in sessions.into_iter().enumerate() {
        info!(session = id, "Creating client");
        set.spawn(async move { (id, session.await) });
    }

    let mut report = SupervisorReport::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((id, Ok(summary))) => {
                info!(
                    session = id,
                    sent = summary.sent,
                    received = summary.received,
                    "Byte limit reached, average rate {} kB/s",
                    kb_per_sec(summary.throughput())
                );
                report.completed += 1;
            }
            Ok((id, Err(e))) if e.is_expected() => {
                info!(session = id, "Session ended: {e}");
                report.stopped += 1;
            }
            Ok((id, Err(e))) => {
                error!(session = id, error = %e, "Session failed");
                report.failed += 1;
            }
            Err(e) => {
                error!(error = %e, "Session task aborted");
                report.failed += 1;
            }
        }
        if !set.is_empty() {
            info!(remaining = set.len(), "Sessions still running");
        }
    }

    report
}

/// Run `config.sessions` client sessions on a current-thread runtime.
pub fn run(config: &Config) -> io::Result<()> {
    let peer = resolve(&config.addr())?;
    let settings = FlowSettings::from(config);
    let io_timeout = config.io_timeout;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let report = rt.block_on(async move {
        match config.transport {
            TransportType::Tcp => {
                let sessions = (0..config.sessions)
                    .map(|id| tcp_session(id, peer, settings, io_timeout))
                    .collect();
                supervise(sessions).await
            }
            TransportType::Udp => {
                let sessions = (0..config.sessions)
                    .map(|id| udp_session(id, peer, settings, io_timeout))
                    .collect();
                supervise(sessions).await
            }
        }
    });

    info!(
        completed = report.completed,
        stopped = report.stopped,
        failed = report.failed,
        "All sessions finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tcp::TcpEchoServer;
    use crate::server::udp::UdpEchoServer;
    use bytes::Bytes;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use tokio_test::io::Builder;

    type BoxedSession = Pin<Box<dyn Future<Output = Result<SessionSummary, SessionError>> + Send>>;

    fn settings(limit_bytes: Option<u64>) -> FlowSettings {
        FlowSettings {
            max_inflight_bytes: 8192,
            recv_chunk_size: 1024,
            report_interval: Duration::from_secs(2),
            verify: true,
            limit_bytes,
        }
    }

    #[tokio::test]
    async fn test_session_ends_on_reset_after_echo() {
        let payload = Bytes::from_static(b"hello echo");
        let flow = TcpFlow::new(payload.clone(), &settings(None), Instant::now());
        let stream = Builder::new()
            .write(&payload)
            .read(&payload)
            .read_error(io::ErrorKind::ConnectionReset.into())
            .build();

        let result = run_tcp_session(0, stream, flow, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(SessionError::Reset(_))));
    }

    #[tokio::test]
    async fn test_session_completes_at_limit() {
        let payload = Bytes::from_static(b"hello echo");
        let flow = TcpFlow::new(payload.clone(), &settings(Some(10)), Instant::now());
        let stream = Builder::new().write(&payload).read(&payload).build();

        let summary = run_tcp_session(0, stream, flow, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(summary.sent, 10);
        assert_eq!(summary.received, 10);
    }

    #[tokio::test]
    async fn test_sibling_sessions_survive_failure() {
        async fn ok_after(ms: u64, bytes: u64) -> Result<SessionSummary, SessionError> {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(SessionSummary {
                sent: bytes,
                received: bytes,
                elapsed: Duration::from_millis(ms),
            })
        }

        let failing: BoxedSession = Box::pin(async {
            Err(SessionError::Reset(io::ErrorKind::ConnectionReset.into()))
        });
        let timed_out: BoxedSession = Box::pin(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(SessionError::Timeout(Duration::from_millis(5)))
        });
        let sessions: Vec<BoxedSession> = vec![
            Box::pin(ok_after(20, 100)),
            failing,
            Box::pin(ok_after(40, 200)),
            timed_out,
        ];

        let report = supervise(sessions).await;

        assert_eq!(
            report,
            SupervisorReport {
                completed: 2,
                stopped: 1,
                failed: 1,
            }
        );
    }

    #[test]
    fn test_sessions_against_loopback_server() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        };
        let mut server = TcpEchoServer::bind(&config).unwrap();
        let addr = server.local_addr().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let server_stop = Arc::clone(&stop);
        let server_thread = thread::spawn(move || {
            while !server_stop.load(Ordering::Relaxed) {
                server.poll_once(Some(Duration::from_millis(10))).unwrap();
            }
        });

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let limit = 256 * 1024;
        let report = rt.block_on(async {
            let sessions = (0..3)
                .map(|id| tcp_session(id, addr, settings(Some(limit)), Duration::from_secs(5)))
                .collect();
            supervise(sessions).await
        });

        stop.store(true, Ordering::Relaxed);
        server_thread.join().unwrap();

        assert_eq!(report.completed, 3);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn test_udp_sessions_against_loopback_server() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        };
        let mut server = UdpEchoServer::bind(&config).unwrap();
        let addr = server.local_addr().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let server_stop = Arc::clone(&stop);
        let server_thread = thread::spawn(move || {
            while !server_stop.load(Ordering::Relaxed) {
                server.poll_once(Some(Duration::from_millis(10))).unwrap();
            }
        });

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let limit = 256 * 1024;
        let report = rt.block_on(async {
            let sessions = (0..3)
                .map(|id| udp_session(id, addr, settings(Some(limit)), Duration::from_secs(5)))
                .collect();
            supervise(sessions).await
        });

        stop.store(true, Ordering::Relaxed);
        server_thread.join().unwrap();

        assert_eq!(
            report,
            SupervisorReport {
                completed: 3,
                stopped: 0,
                failed: 0,
            }
        );
    }
}
