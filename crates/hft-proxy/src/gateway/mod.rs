//! Data plane: per-rule listeners, forwarding sessions and admission control.
//!
//! # Submodule Architecture
//!
//! - **[`listener`]** [`ListenerTask`] owns one rule's bound socket and
//!   accepts clients until the rule's scope is cancelled.
//! - **[`forwarder`]** [`ForwardingSession`] dials the destination from the
//!   rule's via address and runs the two copy loops.
//! - **[`policy`]** [`AdmissionControl`] bounds concurrent sessions per
//!   rule.
//!
//! # Cancellation
//!
//! ```text
//! root (coordinator)
//!   └─ rule scope (one per ListenerTask)
//!        └─ session scope (one per ForwardingSession)
//! ```
//!
//! Cancelling a node cancels its subtree only.

pub mod forwarder;
pub mod listener;
pub mod policy;

pub use forwarder::{ForwardingSession, SessionEnd};
pub use listener::{ListenerExit, ListenerTask};
pub use policy::AdmissionControl;
