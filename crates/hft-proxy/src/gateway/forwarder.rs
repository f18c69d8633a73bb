//! Forwarding sessions: one accepted client relayed to one dialed
//! destination.
//!
//! A session dials the rule's destination (bound to the rule's via address),
//! registers itself, then polls two copy loops concurrently inside its own
//! task. Whichever loop finishes first ends the session: the other loop is
//! dropped mid-flight and both sockets are closed. Each loop owns its buffer
//! and borrows one half of each socket, so nothing on this path takes a
//! lock.

use super::policy::Admission;
use crate::registry::ConnectionRegistry;
use crate::reporter::ErrorReporter;
use crate::settings::RelayTuning;
use hft_core::ForwardingRule;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Direction of one copy loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to destination.
    Upstream,
    /// Destination to client.
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => f.write_str("client->destination"),
            Direction::Downstream => f.write_str("destination->client"),
        }
    }
}

/// Why a copy loop stopped without an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The source reached end of stream. `bytes` were copied in total.
    Eof { bytes: u64 },
    /// The scope was cancelled after `bytes` were copied. A read that was
    /// in flight is dropped; a write in flight may be partial.
    Cancelled { bytes: u64 },
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The destination could not be reached; no relay was opened.
    DialFailed,
    /// The session's scope was cancelled, while dialing or while relaying.
    Cancelled,
    /// The source of `Direction` closed cleanly.
    Closed(Direction),
    /// An I/O error in `Direction` tore the session down.
    Failed(Direction),
}

/// One accepted client waiting to be relayed.
///
/// Built by the listener right after accept and consumed by
/// [`run`](Self::run) on its own task. The session is registered in the
/// [`ConnectionRegistry`] only once the destination answers, so a failed
/// dial never shows up as a live session.
pub struct ForwardingSession {
    inbound: TcpStream,
    peer: SocketAddr,
    rule: Arc<ForwardingRule>,
    scope: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    reporter: Arc<ErrorReporter>,
    tuning: RelayTuning,
    admission: Admission,
}

impl ForwardingSession {
    /// # Arguments
    ///
    /// * `inbound` - The accepted client socket, Nagle already disabled.
    /// * `peer` - The client's address, for logs and the session record.
    /// * `rule` - Rule the client connected through.
    /// * `scope` - Session-level token; normally a child of the rule's
    ///   scope, so stopping the rule stops the session but not vice versa.
    /// * `admission` - Slot from the rule's admission control, held until
    ///   the session ends.
    pub fn new(
        inbound: TcpStream,
        peer: SocketAddr,
        rule: Arc<ForwardingRule>,
        scope: CancellationToken,
        registry: Arc<ConnectionRegistry>,
        reporter: Arc<ErrorReporter>,
        tuning: RelayTuning,
        admission: Admission,
    ) -> Self {
        Self {
            inbound,
            peer,
            rule,
            scope,
            registry,
            reporter,
            tuning,
            admission,
        }
    }

    /// Dial, relay until either side ends, then tear everything down.
    ///
    /// Dial and relay errors go to the [`ErrorReporter`]; the outcome is the
    /// returned [`SessionEnd`]. Both sockets are closed and the session is
    /// unregistered before this returns.
    pub async fn run(self) -> SessionEnd {
        let Self {
            inbound,
            peer,
            rule,
            scope,
            registry,
            reporter,
            tuning,
            admission: _admission,
        } = self;

        let outbound = tokio::select! {
            biased;
            _ = scope.cancelled() => {
                debug!(port = rule.listening_port, peer = %peer, "session cancelled while dialing");
                return SessionEnd::Cancelled;
            }
            result = dial(&rule, tuning.connect_timeout) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    reporter.report(
                        "ForwardingSession::dial",
                        format!("{} via {}: {e}", rule.destination, rule.via),
                    );
                    return SessionEnd::DialFailed;
                }
            }
        };

        let guard = registry.open_session(rule.clone(), peer);
        info!(
            session = guard.id(),
            port = rule.listening_port,
            peer = %peer,
            dest = %rule.destination,
            "session started"
        );

        let end = match relay(inbound, outbound, tuning.buffer_size, &scope).await {
            (direction, Ok(PumpEnd::Eof { bytes })) => {
                debug!(session = guard.id(), %direction, bytes, "source closed");
                SessionEnd::Closed(direction)
            }
            (_, Ok(PumpEnd::Cancelled { .. })) => SessionEnd::Cancelled,
            (direction, Err(e)) => {
                reporter.report(
                    "ForwardingSession::relay",
                    format!("session {} on :{} ({direction}): {e}", guard.id(), rule.listening_port),
                );
                SessionEnd::Failed(direction)
            }
        };

        info!(session = guard.id(), port = rule.listening_port, end = ?end, "session stopped");
        end
    }
}

/// Connect to the rule's destination, from the rule's via address when one
/// is set, with Nagle disabled.
///
/// # Arguments
///
/// * `rule` - Supplies the destination and the via address. A via of
///   `0.0.0.0` leaves the source address to the OS.
/// * `timeout` - Upper bound on the TCP handshake.
///
/// # Errors
///
/// - `InvalidInput` when via and destination are different address
///   families.
/// - `TimedOut` when the handshake does not finish within `timeout`.
/// - Any socket, bind or connect error from the OS, e.g. `AddrNotAvailable`
///   for a via address this host does not own.
pub async fn dial(rule: &ForwardingRule, timeout: Duration) -> io::Result<TcpStream> {
    let dest = rule.destination;
    let socket = if dest.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if rule.binds_source() {
        if rule.via.is_ipv4() != dest.is_ipv4() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("via {} and destination {dest} are different address families", rule.via),
            ));
        }
        socket.bind(SocketAddr::new(rule.via, 0))?;
    }

    let stream = tokio::time::timeout(timeout, socket.connect(dest))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {dest} timed out after {}ms", timeout.as_millis()),
            )
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Run both copy loops until the first one finishes. Both sockets are
/// closed when this returns.
async fn relay(
    mut inbound: TcpStream,
    mut outbound: TcpStream,
    buffer_size: usize,
    scope: &CancellationToken,
) -> (Direction, io::Result<PumpEnd>) {
    let (mut client_rx, mut client_tx) = inbound.split();
    let (mut dest_rx, mut dest_tx) = outbound.split();

    tokio::select! {
        result = pump(&mut client_rx, &mut dest_tx, buffer_size, scope) => (Direction::Upstream, result),
        result = pump(&mut dest_rx, &mut client_tx, buffer_size, scope) => (Direction::Downstream, result),
    }
}

/// Copy `src` into `dst` until end of stream, cancellation or an I/O error.
///
/// Each read is written out in full before the next read, so bytes leave in
/// exactly the order and amount they arrived.
///
/// # Arguments
///
/// * `buffer_size` - Size of the single read buffer; `0` is treated as `1`.
/// * `scope` - Checked before every read and raced against every read and
///   write.
///
/// # Errors
///
/// The first read or write error. Bytes copied before it are not reported.
pub async fn pump<R, W>(
    src: &mut R,
    dst: &mut W,
    buffer_size: usize,
    scope: &CancellationToken,
) -> io::Result<PumpEnd>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut bytes: u64 = 0;

    loop {
        if scope.is_cancelled() {
            return Ok(PumpEnd::Cancelled { bytes });
        }

        let n = tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(PumpEnd::Cancelled { bytes }),
            result = src.read(&mut buf) => result?,
        };
        if n == 0 {
            return Ok(PumpEnd::Eof { bytes });
        }

        tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(PumpEnd::Cancelled { bytes }),
            result = dst.write_all(&buf[..n]) => result?,
        }
        bytes += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::policy::AdmissionControl;
    use crate::test_support::{closed_port, spawn_echo_server};
    use tokio::net::TcpListener;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn rule_to(dest: SocketAddr, via: &str) -> Arc<ForwardingRule> {
        Arc::new(ForwardingRule::new(40000, dest, via.parse().unwrap(), "test").unwrap())
    }

    /// Accept one client on a fresh loopback listener and return both ends.
    async fn client_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        (client, accepted, peer)
    }

    #[tokio::test]
    async fn pump_preserves_bytes_for_any_buffer_size() {
        let data = pattern(100_000);
        for size in [1, 7, 1024, 8192, 65536] {
            let mut src: &[u8] = &data;
            let mut dst: Vec<u8> = Vec::new();
            let end = pump(&mut src, &mut dst, size, &CancellationToken::new()).await.unwrap();
            assert_eq!(end, PumpEnd::Eof { bytes: data.len() as u64 });
            assert_eq!(dst, data, "buffer size {size} altered the stream");
        }
    }

    #[tokio::test]
    async fn pump_stops_on_cancel_while_blocked() {
        // The far end of the duplex never writes, so the read blocks.
        let (mut src, _keep_open) = tokio::io::duplex(64);
        let mut dst: Vec<u8> = Vec::new();
        let scope = CancellationToken::new();

        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let end = tokio::time::timeout(Duration::from_secs(2), pump(&mut src, &mut dst, 16, &scope))
            .await
            .expect("pump did not observe cancellation")
            .unwrap();
        assert_eq!(end, PumpEnd::Cancelled { bytes: 0 });
    }

    #[tokio::test]
    async fn session_relays_and_unregisters_on_client_close() {
        let echo = spawn_echo_server().await;
        let registry = Arc::new(ConnectionRegistry::new());
        let reporter = Arc::new(ErrorReporter::new());
        let (mut client, accepted, peer) = client_pair().await;

        let session = ForwardingSession::new(
            accepted,
            peer,
            rule_to(echo, "127.0.0.1"),
            CancellationToken::new(),
            registry.clone(),
            reporter.clone(),
            RelayTuning::default(),
            AdmissionControl::unbounded().admit().unwrap(),
        );
        let task = tokio::spawn(session.run());

        let payload = pattern(10_000);
        client.write_all(&payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);
        assert_eq!(registry.session_count(), 1);

        drop(client);
        let end = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Closed(Direction::Upstream));
        assert_eq!(registry.session_count(), 0);
        assert_eq!(reporter.uncleared(), 0);
    }

    #[tokio::test]
    async fn dial_failure_is_reported_and_never_registered() {
        let registry = Arc::new(ConnectionRegistry::new());
        let reporter = Arc::new(ErrorReporter::new());
        let mut events = registry.subscribe();
        let (mut client, accepted, peer) = client_pair().await;

        let session = ForwardingSession::new(
            accepted,
            peer,
            rule_to(closed_port(), "127.0.0.1"),
            CancellationToken::new(),
            registry.clone(),
            reporter.clone(),
            RelayTuning::default(),
            AdmissionControl::unbounded().admit().unwrap(),
        );
        assert_eq!(session.run().await, SessionEnd::DialFailed);
        assert_eq!(reporter.uncleared(), 1);
        assert!(events.try_recv().is_err());

        // The client socket was closed with the session.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn cancelled_session_closes_client() {
        let echo = spawn_echo_server().await;
        let registry = Arc::new(ConnectionRegistry::new());
        let reporter = Arc::new(ErrorReporter::new());
        let (mut client, accepted, peer) = client_pair().await;
        let scope = CancellationToken::new();

        let session = ForwardingSession::new(
            accepted,
            peer,
            rule_to(echo, "0.0.0.0"),
            scope.clone(),
            registry.clone(),
            reporter,
            RelayTuning::default(),
            AdmissionControl::unbounded().admit().unwrap(),
        );
        let task = tokio::spawn(session.run());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();

        scope.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Cancelled);
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn mismatched_via_family_fails_dial() {
        let echo = spawn_echo_server().await;
        let rule = rule_to(echo, "::1");
        let err = dial(&rule, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn dial_binds_via_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest = listener.local_addr().unwrap();
        let rule = rule_to(dest, "127.0.0.1");
        let stream = dial(&rule, Duration::from_secs(1)).await.unwrap();
        assert!(stream.nodelay().unwrap());
        let (_, seen) = listener.accept().await.unwrap();
        assert_eq!(seen.ip(), rule.via);
        assert_eq!(stream.local_addr().unwrap().ip(), rule.via);
    }
}
