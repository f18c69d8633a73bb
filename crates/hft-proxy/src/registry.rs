//! Connection registry: the authoritative set of running rules and live
//! sessions.
//!
//! Every listener and session mutates the registry from its own task, so the
//! state sits behind one mutex that is only held for short, non-`await`ing
//! critical sections. Observers never touch that state: they read snapshots
//! ([`ConnectionRegistry::rules`], [`ConnectionRegistry::sessions`]) and
//! receive [`ProxyEvent`]s over a broadcast channel.

use hft_core::{ForwardingRule, HftError, HftResult};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const EVENT_CAPACITY: usize = 1024;

/// Lifecycle notification published by the registry.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    RuleStarted(Arc<ForwardingRule>),
    RuleStopped(Arc<ForwardingRule>),
    SessionStarted {
        id: u64,
        rule: Arc<ForwardingRule>,
        peer: SocketAddr,
    },
    SessionStopped {
        id: u64,
        rule: Arc<ForwardingRule>,
    },
}

/// Where a running rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOrigin {
    /// Loaded from the rule file (or started directly); reloads diff
    /// against these.
    Configured,
    /// Allocated through the control plane; reloads leave these alone.
    Allocated,
}

/// A registered rule together with the scope that stops it.
#[derive(Debug, Clone)]
pub struct RuleHandle {
    /// Registry-unique generation id; distinguishes a restarted rule from
    /// its predecessor on the same port.
    pub id: u64,
    pub rule: Arc<ForwardingRule>,
    pub origin: RuleOrigin,
    pub scope: CancellationToken,
}

/// Snapshot of one live session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: u64,
    pub rule: Arc<ForwardingRule>,
    pub peer: SocketAddr,
    pub started_at: Instant,
}

#[derive(Default)]
struct RegistryState {
    rules: HashMap<u16, RuleHandle>,
    /// Ports claimed by in-flight allocations, not yet listening.
    claimed: HashSet<u16>,
    sessions: HashMap<u64, SessionRecord>,
    next_rule_id: u64,
    next_session_id: u64,
}

impl RegistryState {
    fn port_taken(&self, port: u16) -> bool {
        self.rules.contains_key(&port) || self.claimed.contains(&port)
    }

    fn insert(
        &mut self,
        rule: ForwardingRule,
        origin: RuleOrigin,
        scope: CancellationToken,
    ) -> RuleHandle {
        self.next_rule_id += 1;
        let handle = RuleHandle {
            id: self.next_rule_id,
            rule: Arc::new(rule),
            origin,
            scope,
        };
        self.rules.insert(handle.rule.listening_port, handle.clone());
        handle
    }
}

pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    events: broadcast::Sender<ProxyEvent>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(RegistryState::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: ProxyEvent) {
        let _ = self.events.send(event);
    }

    // ── Rules ────────────────────────────────────────────────────────

    /// Register a configured rule.
    ///
    /// # Arguments
    ///
    /// * `rule` - The rule to register; its listening port is the key.
    /// * `scope` - Token that stops the rule's listener and sessions.
    ///
    /// # Errors
    ///
    /// [`HftError::PortInUse`] when the port is already registered or
    /// claimed by an in-flight allocation.
    pub fn register_rule(
        &self,
        rule: ForwardingRule,
        scope: CancellationToken,
    ) -> HftResult<RuleHandle> {
        let mut state = self.state();
        let port = rule.listening_port;
        if state.port_taken(port) {
            return Err(HftError::PortInUse(port));
        }
        Ok(state.insert(rule, RuleOrigin::Configured, scope))
    }

    /// Claim the first port at or above `from` that is neither registered
    /// nor claimed.
    ///
    /// The claim blocks every other registration of that port until
    /// [`register_claimed`](Self::register_claimed) or
    /// [`release_claim`](Self::release_claim), so two allocations running at
    /// the same time never pick the same port.
    ///
    /// # Arguments
    ///
    /// * `from` - First candidate port, normally the configured base port.
    ///
    /// # Errors
    ///
    /// [`HftError::PortsExhausted`] when every port from `from` up to 65535
    /// is taken.
    ///
    /// # Example
    ///
    /// ```
    /// use hft_proxy::ConnectionRegistry;
    ///
    /// let registry = ConnectionRegistry::new();
    /// let first = registry.claim_port(9000).unwrap();
    /// let second = registry.claim_port(9000).unwrap();
    /// assert_eq!((first, second), (9000, 9001));
    ///
    /// registry.release_claim(first);
    /// assert_eq!(registry.claim_port(9000).unwrap(), 9000);
    /// ```
    pub fn claim_port(&self, from: u16) -> HftResult<u16> {
        let mut state = self.state();
        let port = (from..=u16::MAX)
            .find(|p| !state.port_taken(*p))
            .ok_or(HftError::PortsExhausted(from))?;
        state.claimed.insert(port);
        debug!(port, "port claimed");
        Ok(port)
    }

    /// Turn a claim into a registered [`RuleOrigin::Allocated`] rule.
    ///
    /// # Errors
    ///
    /// [`HftError::Other`] when the rule's port was never claimed (or the
    /// claim was already consumed or released).
    pub fn register_claimed(
        &self,
        rule: ForwardingRule,
        scope: CancellationToken,
    ) -> HftResult<RuleHandle> {
        let mut state = self.state();
        let port = rule.listening_port;
        if !state.claimed.remove(&port) {
            return Err(HftError::Other(format!("port {port} was not claimed")));
        }
        if state.rules.contains_key(&port) {
            return Err(HftError::PortInUse(port));
        }
        Ok(state.insert(rule, RuleOrigin::Allocated, scope))
    }

    /// Give back a claim whose allocation failed before registering.
    pub fn release_claim(&self, port: u16) {
        self.state().claimed.remove(&port);
    }

    /// Remove the rule on `port`, whatever its generation.
    pub fn remove_rule(&self, port: u16) -> Option<RuleHandle> {
        self.state().rules.remove(&port)
    }

    /// Remove the rule on `port` only if it is still generation `id`.
    pub fn remove_rule_if(&self, port: u16, id: u64) -> Option<RuleHandle> {
        let mut state = self.state();
        let current = state.rules.get(&port).is_some_and(|h| h.id == id);
        if current {
            state.rules.remove(&port)
        } else {
            None
        }
    }

    /// Remove every rule, returning them ordered by port.
    pub fn drain_rules(&self) -> Vec<RuleHandle> {
        let mut drained: Vec<RuleHandle> = self.state().rules.drain().map(|(_, h)| h).collect();
        drained.sort_by_key(|h| h.rule.listening_port);
        drained
    }

    pub fn rule(&self, port: u16) -> Option<Arc<ForwardingRule>> {
        self.state().rules.get(&port).map(|h| h.rule.clone())
    }

    /// Snapshot of all registered rules, ordered by port.
    pub fn rules(&self) -> Vec<Arc<ForwardingRule>> {
        let mut rules: Vec<_> = self.state().rules.values().map(|h| h.rule.clone()).collect();
        rules.sort_by_key(|r| r.listening_port);
        rules
    }

    /// Snapshot of the rules with the given origin, ordered by port.
    pub fn rules_from(&self, origin: RuleOrigin) -> Vec<Arc<ForwardingRule>> {
        let mut rules: Vec<_> = self
            .state()
            .rules
            .values()
            .filter(|h| h.origin == origin)
            .map(|h| h.rule.clone())
            .collect();
        rules.sort_by_key(|r| r.listening_port);
        rules
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.state().rules.contains_key(&port)
    }

    pub fn rule_count(&self) -> usize {
        self.state().rules.len()
    }

    // ── Sessions ─────────────────────────────────────────────────────

    /// Record a new session and publish [`ProxyEvent::SessionStarted`].
    ///
    /// The returned guard unregisters the session (and publishes
    /// [`ProxyEvent::SessionStopped`]) exactly once, when dropped.
    pub fn open_session(
        self: &Arc<Self>,
        rule: Arc<ForwardingRule>,
        peer: SocketAddr,
    ) -> SessionGuard {
        let id = {
            let mut state = self.state();
            state.next_session_id += 1;
            let id = state.next_session_id;
            state.sessions.insert(
                id,
                SessionRecord {
                    id,
                    rule: rule.clone(),
                    peer,
                    started_at: Instant::now(),
                },
            );
            id
        };
        self.publish(ProxyEvent::SessionStarted {
            id,
            rule: rule.clone(),
            peer,
        });
        SessionGuard {
            registry: self.clone(),
            id,
            rule,
        }
    }

    /// Snapshot of all live sessions, oldest first.
    pub fn sessions(&self) -> Vec<SessionRecord> {
        let mut sessions: Vec<_> = self.state().sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    /// Number of live sessions accepted on `port`.
    pub fn sessions_on(&self, port: u16) -> usize {
        self.state()
            .sessions
            .values()
            .filter(|s| s.rule.listening_port == port)
            .count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII registration of one session; see [`ConnectionRegistry::open_session`].
pub struct SessionGuard {
    registry: Arc<ConnectionRegistry>,
    id: u64,
    rule: Arc<ForwardingRule>,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let removed = self.registry.state().sessions.remove(&self.id).is_some();
        if removed {
            self.registry.publish(ProxyEvent::SessionStopped {
                id: self.id,
                rule: self.rule.clone(),
            });
        }
    }
}
