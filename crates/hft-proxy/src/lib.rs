//! hft-proxy: low-latency TCP forwarding proxy.
//!
//! Each [`ForwardingRule`](hft_core::ForwardingRule) gets its own listener;
//! every accepted client is relayed byte-for-byte to the rule's destination
//! from the rule's via address. Rules come from a rule file or are allocated
//! on demand through the JSON control plane.
//!
//! - [`coordinator`] owns the rule lifecycle (load, diff-based refresh,
//!   start/stop, allocation).
//! - [`gateway`] is the data plane (listeners, sessions, admission control).
//! - [`registry`] holds the live rules and sessions and publishes
//!   [`ProxyEvent`](registry::ProxyEvent)s.
//! - [`control`] serves allocation requests.
//! - [`reporter`] counts and broadcasts runtime errors.
//! - [`settings`] loads the TOML settings file.

pub mod control;
pub mod coordinator;
pub mod gateway;
pub mod registry;
pub mod reporter;
pub mod settings;

#[cfg(test)]
pub(crate) mod test_support;

pub use control::ControlServer;
pub use coordinator::{ApplyReport, ProxyCoordinator};
pub use registry::{ConnectionRegistry, ProxyEvent, RuleOrigin};
pub use reporter::{ErrorNotice, ErrorReporter};
pub use settings::{CliOverrides, ProxySettings};
