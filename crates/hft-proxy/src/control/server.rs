//! Control-plane TCP server.
//!
//! One request per connection: read a JSON line, allocate a port through
//! the coordinator, write a JSON line back and close. Every connection runs
//! on its own task so a slow client never delays another request.

use crate::coordinator::ProxyCoordinator;
use crate::gateway::listener::{is_fd_exhaustion, ACCEPT_BACKOFF};
use hft_core::{decode_line, encode_line, ControlRequest, ControlResponse, HftError, HftResult, MAX_LINE_LEN};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ControlServer {
    listener: TcpListener,
    coordinator: Arc<ProxyCoordinator>,
}

impl ControlServer {
    /// Bind the control port.
    ///
    /// # Errors
    ///
    /// The bind error; the caller treats it as fatal.
    pub async fn bind(addr: SocketAddr, coordinator: Arc<ProxyCoordinator>) -> HftResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "control server listening");
        Ok(Self { listener, coordinator })
    }

    pub fn local_addr(&self) -> HftResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve requests until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.listener.accept() => result,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let coordinator = self.coordinator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, &coordinator).await {
                            warn!(peer = %peer, error = %e, "control connection failed");
                        }
                    });
                }
                Err(e) => {
                    // Accept errors on the control port are per-client; keep serving.
                    self.coordinator.reporter().report("ControlServer::accept", &e);
                    if is_fd_exhaustion(&e) {
                        // accept keeps failing until some descriptor closes.
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                }
            }
        }
        info!("control server stopped");
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    coordinator: &ProxyCoordinator,
) -> HftResult<()> {
    let timeout = coordinator.settings().request_timeout;
    let (reader, mut writer) = stream.split();

    let response = match read_request_line(reader, timeout).await {
        Ok(line) => respond(coordinator, &line).await,
        Err(e) => {
            coordinator.reporter().report("ControlServer::read", format!("{peer}: {e}"));
            ControlResponse::internal_error(e)
        }
    };
    debug!(peer = %peer, port = response.port, "control response");

    writer.write_all(&encode_line(&response)?).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Read one line of at most [`MAX_LINE_LEN`] bytes within `timeout`.
async fn read_request_line<R>(reader: R, timeout: Duration) -> HftResult<String>
where
    R: AsyncRead + Unpin,
{
    let mut limited = BufReader::new(reader).take(MAX_LINE_LEN as u64 + 1);
    let mut buf = Vec::new();

    tokio::time::timeout(timeout, limited.read_until(b'\n', &mut buf))
        .await
        .map_err(|_| HftError::Protocol(format!("no request within {}ms", timeout.as_millis())))??;

    if buf.len() > MAX_LINE_LEN {
        return Err(HftError::Protocol(format!("request exceeds {MAX_LINE_LEN} bytes")));
    }
    String::from_utf8(buf).map_err(|_| HftError::Protocol("request is not valid UTF-8".into()))
}

/// Turn one request line into the response the peer receives.
///
/// Lines that do not decode get `Port: 0`; decoded requests that cannot be
/// served (bad address, no free port) get `Port: -1`.
pub async fn respond(coordinator: &ProxyCoordinator, line: &str) -> ControlResponse {
    let request: ControlRequest = match decode_line(line) {
        Ok(request) => request,
        Err(e) => {
            coordinator.reporter().report("ControlServer::decode", &e);
            return ControlResponse::internal_error(e);
        }
    };

    match coordinator.allocate(&request).await {
        Ok(port) => {
            info!(
                port,
                target = %request.target_ip,
                target_port = request.target_port,
                via = %request.via_ip,
                "control request served"
            );
            ControlResponse::success(port)
        }
        Err(e) => {
            coordinator.reporter().report("ControlServer::allocate", &e);
            ControlResponse::rejected(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ProxySettings;
    use crate::test_support::{free_port, round_trip, spawn_echo_server};
    use hft_core::control::{PORT_INTERNAL_ERROR, PORT_REJECTED};
    use hft_core::{ForwardingRule, ResponseType};
    use std::collections::HashSet;

    async fn serve(settings: ProxySettings) -> (Arc<ProxyCoordinator>, SocketAddr, CancellationToken) {
        let coordinator = Arc::new(ProxyCoordinator::new(settings));
        let server = ControlServer::bind("127.0.0.1:0".parse().unwrap(), coordinator.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));
        (coordinator, addr, shutdown)
    }

    async fn exchange(addr: SocketAddr, line: &[u8]) -> ControlResponse {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(line).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        decode_line(&reply).unwrap()
    }

    fn request_line(target: SocketAddr, via: &str) -> Vec<u8> {
        encode_line(&ControlRequest::new(
            target.ip().to_string(),
            i64::from(target.port()),
            via,
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn bind_fails_on_occupied_port() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = occupied.local_addr().unwrap();
        let coordinator = Arc::new(ProxyCoordinator::new(ProxySettings::default()));

        let err = ControlServer::bind(addr, coordinator).await.err().unwrap();
        assert!(matches!(err, HftError::Io(_)));
    }

    #[tokio::test]
    async fn request_gets_next_free_port() {
        let echo = spawn_echo_server().await;
        let base = free_port();
        let (coordinator, addr, shutdown) = serve(ProxySettings {
            base_port: base,
            ..ProxySettings::default()
        })
        .await;
        coordinator
            .start_rule(ForwardingRule::new(base, echo, "127.0.0.1".parse().unwrap(), "static").unwrap())
            .await
            .unwrap();

        let response = exchange(addr, &request_line(echo, "127.0.0.1")).await;
        assert_eq!(response.response_type, ResponseType::Success);
        assert_eq!(response.comment, "Your request has been processed.");
        let port = u16::try_from(response.port).unwrap();
        assert!(port > base);

        // The listener is already running when the response arrives.
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert_eq!(round_trip(&mut client, b"ping").await, b"ping");

        shutdown.cancel();
        coordinator.stop_proxy().await;
    }

    #[tokio::test]
    async fn bad_via_is_rejected_without_allocating() {
        let (coordinator, addr, shutdown) = serve(ProxySettings::default()).await;
        let line = b"{\"TargetIP\":\"10.0.0.5\",\"TargetPort\":443,\"ViaIP\":\"abc\"}\n";

        let response = exchange(addr, line).await;
        assert_eq!(response.response_type, ResponseType::Error);
        assert_eq!(response.port, PORT_REJECTED);
        assert!(response.comment.starts_with("Could not get port for you"));
        assert_eq!(coordinator.rules().len(), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn malformed_requests_get_port_zero() {
        let (coordinator, addr, shutdown) = serve(ProxySettings::default()).await;

        for line in [&b"not json\n"[..], b"\n", b"{\"TargetIP\":\"10.0.0.5\"}\n"] {
            let response = exchange(addr, line).await;
            assert_eq!(response.response_type, ResponseType::Error);
            assert_eq!(response.port, PORT_INTERNAL_ERROR);
            assert!(response.comment.starts_with("Error processing request"));
        }
        assert_eq!(coordinator.reporter().uncleared(), 3);
        assert_eq!(coordinator.rules().len(), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn oversized_request_is_refused() {
        let mut line = vec![b'x'; MAX_LINE_LEN * 2];
        line.push(b'\n');

        let err = read_request_line(&line[..], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, HftError::Protocol(_)));
        let ok = read_request_line(&b"{}\n"[..], Duration::from_secs(1)).await.unwrap();
        assert_eq!(ok, "{}\n");
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let (_coordinator, addr, shutdown) = serve(ProxySettings {
            request_timeout: Duration::from_millis(100),
            ..ProxySettings::default()
        })
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut reply = String::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut reply))
            .await
            .unwrap()
            .unwrap();
        let response: ControlResponse = decode_line(&reply).unwrap();
        assert_eq!(response.port, PORT_INTERNAL_ERROR);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn concurrent_requests_get_distinct_ports() {
        let echo = spawn_echo_server().await;
        let (coordinator, addr, shutdown) = serve(ProxySettings {
            base_port: free_port(),
            ..ProxySettings::default()
        })
        .await;

        let tasks: Vec<_> = (0..6)
            .map(|_| tokio::spawn(async move { exchange(addr, &request_line(echo, "127.0.0.1")).await }))
            .collect();

        let mut ports = HashSet::new();
        for task in tasks {
            let response = task.await.unwrap();
            assert!(response.is_success());
            assert!(ports.insert(response.port));
        }
        assert_eq!(coordinator.rules().len(), 6);

        shutdown.cancel();
        coordinator.stop_proxy().await;
    }
}
