//! Per-rule accept loop.
//!
//! The coordinator binds the listening socket, registers the rule and then
//! spawns one [`ListenerTask`] per rule. The task accepts clients until its
//! scope is cancelled or accepting fails for good, handing every client to
//! its own [`ForwardingSession`] task so the loop never waits on a session.

use super::forwarder::ForwardingSession;
use super::policy::AdmissionControl;
use crate::registry::{ConnectionRegistry, ProxyEvent, RuleHandle};
use crate::reporter::ErrorReporter;
use crate::settings::RelayTuning;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Why a listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// The rule's scope (or an ancestor) was cancelled by `stop_rule`,
    /// `stop_proxy` or a refresh. The registry entry is the caller's to
    /// remove.
    Cancelled,
    /// Accepting failed with a non-transient error; the rule was torn down.
    ///
    /// The listener itself cancelled the rule's scope, removed its registry
    /// entry and published [`ProxyEvent::RuleStopped`].
    Failed,
}

/// Accept loop for one rule.
///
/// Clients over the rule's session limit are closed right after accept and
/// reported. Running out of file descriptors pauses accepting briefly
/// instead of failing the rule.
pub struct ListenerTask {
    listener: TcpListener,
    handle: RuleHandle,
    registry: Arc<ConnectionRegistry>,
    reporter: Arc<ErrorReporter>,
    tuning: RelayTuning,
    admission: AdmissionControl,
}

impl ListenerTask {
    /// # Arguments
    ///
    /// * `listener` - Socket already bound to the rule's listening port.
    /// * `handle` - The rule's registry entry; its scope is this listener's
    ///   scope and the parent of every session it spawns.
    /// * `registry` - Where sessions register themselves, and where a failed
    ///   listener removes its rule.
    /// * `reporter` - Receives refused clients and accept errors.
    /// * `tuning` - Buffer size, connect timeout and per-rule session limit
    ///   for every session this listener spawns.
    pub fn new(
        listener: TcpListener,
        handle: RuleHandle,
        registry: Arc<ConnectionRegistry>,
        reporter: Arc<ErrorReporter>,
        tuning: RelayTuning,
    ) -> Self {
        Self {
            listener,
            handle,
            registry,
            reporter,
            admission: AdmissionControl::new(tuning.max_sessions_per_rule),
            tuning,
        }
    }

    /// Accept clients until cancelled or a fatal accept error.
    ///
    /// On a fatal error the rule's scope is cancelled (stopping its
    /// sessions) and the rule is removed from the registry, leaving every
    /// other rule untouched.
    ///
    /// Never returns an error: accept failures are reported through the
    /// [`ErrorReporter`] and reflected in the returned [`ListenerExit`].
    pub async fn run(self) -> ListenerExit {
        let port = self.handle.rule.listening_port;
        let scope = self.handle.scope.clone();

        let exit = loop {
            let accepted = tokio::select! {
                biased;
                _ = scope.cancelled() => break ListenerExit::Cancelled,
                result = self.listener.accept() => result,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(port, peer = %peer, error = %e, "could not disable nagle on client socket");
                    }

                    let admission = match self.admission.admit() {
                        Ok(admission) => admission,
                        Err(reason) => {
                            self.reporter
                                .report("ListenerTask::admit", format!(":{port} refused {peer}: {reason}"));
                            continue;
                        }
                    };

                    debug!(port, peer = %peer, "client accepted");
                    let session = ForwardingSession::new(
                        stream,
                        peer,
                        self.handle.rule.clone(),
                        scope.child_token(),
                        self.registry.clone(),
                        self.reporter.clone(),
                        self.tuning,
                        admission,
                    );
                    tokio::spawn(session.run());
                }
                Err(e) if is_fd_exhaustion(&e) => {
                    self.reporter
                        .report("ListenerTask::accept", format!(":{port}: {e}"));
                    tokio::select! {
                        biased;
                        _ = scope.cancelled() => break ListenerExit::Cancelled,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
                Err(e) if is_transient(&e) => {
                    warn!(port, error = %e, "transient accept error");
                }
                Err(e) => {
                    self.reporter
                        .report("ListenerTask::accept", format!(":{port}: {e}"));
                    break ListenerExit::Failed;
                }
            }
        };

        if exit == ListenerExit::Failed {
            scope.cancel();
            if let Some(removed) = self.registry.remove_rule_if(port, self.handle.id) {
                self.registry.publish(ProxyEvent::RuleStopped(removed.rule));
            }
        }

        // Dropping the listener closes the socket.
        drop(self.listener);
        info!(port, exit = ?exit, "listener stopped");
        exit
    }
}

/// Pause after an accept failed for lack of file descriptors, giving
/// sessions time to close theirs.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// `EMFILE` / `ENFILE`: the process or the system ran out of file
/// descriptors. The listening socket is fine and accepting again later
/// succeeds.
pub(crate) fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(EMFILE | ENFILE))
}

#[cfg(unix)]
const EMFILE: i32 = 24;
#[cfg(unix)]
const ENFILE: i32 = 23;
// WSAEMFILE; Windows has no system-wide equivalent.
#[cfg(not(unix))]
const EMFILE: i32 = 10024;
#[cfg(not(unix))]
const ENFILE: i32 = 10024;

/// Accept errors caused by a single client going away; the listening socket
/// itself is still fine.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
