//! Proxy coordinator: owns the rule lifecycle.
//!
//! Loads rule files, starts and stops listeners, applies diff-based reloads
//! and allocates ports for control-plane requests. All state that others can
//! observe lives in the [`ConnectionRegistry`]; the coordinator only adds the
//! cancellation root and the listener task handles.

use crate::gateway::{ListenerExit, ListenerTask};
use crate::registry::{ConnectionRegistry, ProxyEvent, RuleHandle, RuleOrigin, SessionRecord};
use crate::reporter::ErrorReporter;
use crate::settings::ProxySettings;
use hft_core::{load_rules, ControlRequest, ForwardingRule, HftError, HftResult};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What an [`apply`](ProxyCoordinator::apply) changed, by listening port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub started: Vec<u16>,
    pub stopped: Vec<u16>,
    /// Unchanged rules whose listeners and sessions were left running.
    pub kept: Vec<u16>,
    pub failed: Vec<(u16, String)>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ProxyCoordinator {
    settings: ProxySettings,
    registry: Arc<ConnectionRegistry>,
    reporter: Arc<ErrorReporter>,
    root: Mutex<CancellationToken>,
    /// Listener tasks keyed by rule generation id.
    listeners: Mutex<HashMap<u64, JoinHandle<ListenerExit>>>,
    last_rules_path: Mutex<Option<PathBuf>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProxyCoordinator {
    pub fn new(settings: ProxySettings) -> Self {
        Self::with_reporter(settings, Arc::new(ErrorReporter::new()))
    }

    pub fn with_reporter(settings: ProxySettings, reporter: Arc<ErrorReporter>) -> Self {
        Self {
            settings,
            registry: Arc::new(ConnectionRegistry::new()),
            reporter,
            root: Mutex::new(CancellationToken::new()),
            listeners: Mutex::new(HashMap::new()),
            last_rules_path: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn reporter(&self) -> &Arc<ErrorReporter> {
        &self.reporter
    }

    pub fn rules(&self) -> Vec<Arc<ForwardingRule>> {
        self.registry.rules()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.registry.sessions()
    }

    pub fn session_count(&self) -> usize {
        self.registry.session_count()
    }

    fn root(&self) -> CancellationToken {
        lock(&self.root).clone()
    }

    fn listen_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.settings.listen_addr, port)
    }

    // ── Rule lifecycle ───────────────────────────────────────────────

    /// Register one rule, bind its port and start its listener.
    ///
    /// # Errors
    ///
    /// [`HftError::PortInUse`] when the port is already registered, or the
    /// bind error. Either way nothing stays registered.
    pub async fn start_rule(&self, rule: ForwardingRule) -> HftResult<u16> {
        let port = rule.listening_port;
        let handle = self.registry.register_rule(rule, self.root().child_token())?;

        let listener = match TcpListener::bind(self.listen_addr(port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.registry.remove_rule_if(port, handle.id);
                return Err(HftError::Io(e));
            }
        };
        self.launch(handle, listener)?;
        Ok(port)
    }

    /// Spawn the listener for a registered and bound rule.
    fn launch(&self, handle: RuleHandle, listener: TcpListener) -> HftResult<()> {
        let port = handle.rule.listening_port;
        // The root may have been replaced by stop_proxy since this rule was
        // registered; its scope is then already cancelled.
        if handle.scope.is_cancelled() {
            self.registry.remove_rule_if(port, handle.id);
            return Err(HftError::Other(format!("proxy stopped while starting :{port}")));
        }

        let task = ListenerTask::new(
            listener,
            handle.clone(),
            self.registry.clone(),
            self.reporter.clone(),
            self.settings.relay,
        );
        let join = tokio::spawn(task.run());
        {
            let mut listeners = lock(&self.listeners);
            listeners.retain(|_, h| !h.is_finished());
            listeners.insert(handle.id, join);
        }

        info!(
            port,
            dest = %handle.rule.destination,
            via = %handle.rule.via,
            comment = %handle.rule.comment,
            "rule started"
        );
        self.registry.publish(ProxyEvent::RuleStarted(handle.rule));
        Ok(())
    }

    /// Cancel a removed rule and wait until its listener has released the
    /// port. Sessions end on their own tasks.
    async fn shutdown(&self, handle: RuleHandle) {
        handle.scope.cancel();
        let join = lock(&self.listeners).remove(&handle.id);
        if let Some(join) = join {
            if let Err(e) = join.await {
                warn!(port = handle.rule.listening_port, error = %e, "listener task failed");
            }
        }
        info!(port = handle.rule.listening_port, "rule stopped");
        self.registry.publish(ProxyEvent::RuleStopped(handle.rule));
    }

    /// Start a batch of rules.
    ///
    /// The whole batch is rejected when a port repeats within it or is
    /// already registered. Otherwise every rule is attempted; bind failures
    /// are reported and listed in the report without stopping the others.
    pub async fn start_proxy(&self, rules: Vec<ForwardingRule>) -> HftResult<ApplyReport> {
        let mut seen = HashSet::new();
        let mut problems = Vec::new();
        for rule in &rules {
            let port = rule.listening_port;
            if !seen.insert(port) {
                problems.push(format!("port {port} appears more than once"));
            } else if self.registry.contains_port(port) {
                problems.push(format!("port {port} is already registered"));
            }
        }
        if !problems.is_empty() {
            return Err(HftError::RulesRejected(problems));
        }

        let mut report = ApplyReport::default();
        for rule in rules {
            self.start_into(rule, &mut report).await;
        }
        Ok(report)
    }

    async fn start_into(&self, rule: ForwardingRule, report: &mut ApplyReport) {
        let port = rule.listening_port;
        match self.start_rule(rule).await {
            Ok(port) => report.started.push(port),
            Err(e) => {
                self.reporter
                    .report("ProxyCoordinator::start_rule", format!(":{port}: {e}"));
                report.failed.push((port, e.to_string()));
            }
        }
    }

    /// Stop one rule and every session it accepted. Returns `false` when no
    /// rule is registered on `port`.
    pub async fn stop_rule(&self, port: u16) -> bool {
        match self.registry.remove_rule(port) {
            Some(handle) => {
                self.shutdown(handle).await;
                true
            }
            None => false,
        }
    }

    /// Stop every rule and session. Safe to call repeatedly; the proxy can be
    /// started again afterwards.
    pub async fn stop_proxy(&self) {
        let old_root = std::mem::replace(&mut *lock(&self.root), CancellationToken::new());
        old_root.cancel();

        let drained = self.registry.drain_rules();
        if drained.is_empty() {
            debug!("stop_proxy: nothing running");
            return;
        }
        let count = drained.len();
        for handle in drained {
            self.shutdown(handle).await;
        }
        info!(rules = count, "proxy stopped");
    }

    // ── Configuration ────────────────────────────────────────────────

    /// Make the running configured rule set equal to `rules`.
    ///
    /// Rules whose port, destination and via are unchanged keep running
    /// untouched. Changed rules are stopped and started again, rules no
    /// longer present are stopped and new ones are started. Rules allocated
    /// through the control plane are not part of the diff and keep running;
    /// a new rule on a port one of them holds fails with
    /// [`HftError::PortInUse`].
    pub async fn apply(&self, rules: Vec<ForwardingRule>) -> ApplyReport {
        let mut report = ApplyReport::default();
        let wanted: HashMap<u16, &ForwardingRule> =
            rules.iter().map(|r| (r.listening_port, r)).collect();

        for current in self.registry.rules_from(RuleOrigin::Configured) {
            let port = current.listening_port;
            let keep = wanted.get(&port).is_some_and(|r| r.same_route(&current));
            if keep {
                report.kept.push(port);
            } else if self.stop_rule(port).await {
                report.stopped.push(port);
            }
        }

        for rule in rules {
            if report.kept.contains(&rule.listening_port) {
                continue;
            }
            self.start_into(rule, &mut report).await;
        }

        report.started.sort_unstable();
        report.stopped.sort_unstable();
        report.kept.sort_unstable();
        info!(
            started = report.started.len(),
            stopped = report.stopped.len(),
            kept = report.kept.len(),
            failed = report.failed.len(),
            "rule set applied"
        );
        report
    }

    /// Load a rule file and apply it.
    ///
    /// The file is all-or-nothing: any invalid line or duplicated port
    /// rejects it with every problem listed and leaves the running rules
    /// alone. An empty file is rejected with [`HftError::EmptyRuleSet`].
    pub async fn load_config(&self, path: &Path) -> HftResult<ApplyReport> {
        let rules = load_rules(path)?;
        if rules.is_empty() {
            return Err(HftError::EmptyRuleSet);
        }
        info!(path = %path.display(), rules = rules.len(), "rule file loaded");
        *lock(&self.last_rules_path) = Some(path.to_path_buf());
        Ok(self.apply(rules).await)
    }

    /// Reload the last loaded rule file.
    pub async fn refresh_config(&self) -> HftResult<ApplyReport> {
        let path = lock(&self.last_rules_path)
            .clone()
            .ok_or_else(|| HftError::Other("no rule file has been loaded".into()))?;
        self.load_config(&path).await
    }

    // ── Allocation ───────────────────────────────────────────────────

    /// Allocate a listening port for a control-plane request and start
    /// forwarding on it.
    ///
    /// Ports are scanned upward from the configured base port. Each candidate
    /// is claimed in the registry before binding, so concurrent allocations
    /// never pick the same port; a candidate the OS refuses is released and
    /// the scan continues above it. Returns once the listener is running.
    pub async fn allocate(&self, request: &ControlRequest) -> HftResult<u16> {
        // Taken before binding: a stop_proxy that runs while this allocation
        // is in flight cancels it instead of leaving it under the new root.
        let scope = self.root().child_token();
        self.allocate_in(request, scope).await
    }

    async fn allocate_in(&self, request: &ControlRequest, scope: CancellationToken) -> HftResult<u16> {
        request.validate()?;

        let mut from = self.settings.base_port;
        loop {
            let port = self.registry.claim_port(from)?;
            let rule = match request.to_rule(port) {
                Ok(rule) => rule,
                Err(e) => {
                    self.registry.release_claim(port);
                    return Err(e);
                }
            };

            match TcpListener::bind(self.listen_addr(port)).await {
                Ok(listener) => {
                    let handle = match self.registry.register_claimed(rule, scope) {
                        Ok(handle) => handle,
                        Err(e) => {
                            self.registry.release_claim(port);
                            return Err(e);
                        }
                    };
                    self.launch(handle, listener)?;
                    info!(port, target = %request.target_ip, "port allocated");
                    return Ok(port);
                }
                Err(e) => {
                    self.registry.release_claim(port);
                    debug!(port, error = %e, "candidate port unavailable");
                    from = port
                        .checked_add(1)
                        .ok_or(HftError::PortsExhausted(self.settings.base_port))?;
                }
            }
        }
    }
}
