//! hft-core: shared types for the hftproxy workspace.
//!
//! Provides the forwarding rule model, the rule-file parser, the control-plane
//! request/response messages and their newline-delimited JSON codec.

pub mod codec;
pub mod control;
pub mod error;
pub mod rule;
pub mod rules;

// Re-export commonly used items at crate root.
pub use codec::{decode_line, encode_line, MAX_LINE_LEN};
pub use control::{ControlRequest, ControlResponse, ResponseType};
pub use error::{HftError, HftResult};
pub use rule::{parse_endpoint, parse_via, ForwardingRule};
pub use rules::{load_rules, parse_rules};
