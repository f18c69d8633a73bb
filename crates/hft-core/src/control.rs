//! Control-plane messages.
//!
//! A peer opens a TCP connection to the control port, sends one
//! [`ControlRequest`] as a JSON line and receives one [`ControlResponse`]
//! JSON line before the connection is closed.
//!
//! ```text
//! -> {"TargetIP":"10.0.0.5","TargetPort":443,"ViaIP":"192.168.1.2"}
//! <- {"ResponseType":"Success","Port":8082,"Comment":"Your request has been processed."}
//! ```

use crate::error::{HftError, HftResult};
use crate::rule::{parse_via, ForwardingRule};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Default TCP port of the control plane.
pub const DEFAULT_CONTROL_PORT: u16 = 8001;

/// First listening port the allocator tries.
pub const DEFAULT_BASE_PORT: u16 = 8081;

/// Comment attached to rules created through the control plane.
pub const ALLOCATED_RULE_COMMENT: &str = "Requested via command port";

/// Port value of an Error response caused by an invalid request.
pub const PORT_REJECTED: i32 = -1;

/// Port value of an Error response caused by a request that could not be
/// processed at all.
pub const PORT_INTERNAL_ERROR: i32 = 0;

/// Request for a new listening port forwarding to `target_ip:target_port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(rename = "TargetIP")]
    pub target_ip: String,
    /// Kept wide so out-of-range values reach validation instead of failing
    /// to decode.
    #[serde(rename = "TargetPort")]
    pub target_port: i64,
    #[serde(rename = "ViaIP")]
    pub via_ip: String,
}

impl ControlRequest {
    pub fn new(target_ip: impl Into<String>, target_port: i64, via_ip: impl Into<String>) -> Self {
        Self {
            target_ip: target_ip.into(),
            target_port,
            via_ip: via_ip.into(),
        }
    }

    /// Validate the request into a destination endpoint and via address.
    pub fn validate(&self) -> HftResult<(SocketAddr, IpAddr)> {
        let via = parse_via(&self.via_ip)?;
        let ip: IpAddr = self.target_ip.trim().parse().map_err(|_| {
            HftError::InvalidAddress(format!("'{}' is not an ip address", self.target_ip))
        })?;
        let port = u16::try_from(self.target_port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                HftError::InvalidAddress(format!("target port {} is out of range", self.target_port))
            })?;
        Ok((SocketAddr::new(ip, port), via))
    }

    /// Build the rule this request asks for, on the given listening port.
    pub fn to_rule(&self, listening_port: u16) -> HftResult<ForwardingRule> {
        let (destination, via) = self.validate()?;
        ForwardingRule::new(listening_port, destination, via, ALLOCATED_RULE_COMMENT)
    }
}

/// Outcome discriminator of a [`ControlResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(rename = "ResponseType")]
    pub response_type: ResponseType,
    /// Allocated port on success, [`PORT_REJECTED`] or
    /// [`PORT_INTERNAL_ERROR`] otherwise.
    #[serde(rename = "Port")]
    pub port: i32,
    #[serde(rename = "Comment")]
    pub comment: String,
}

impl ControlResponse {
    pub fn success(port: u16) -> Self {
        Self {
            response_type: ResponseType::Success,
            port: i32::from(port),
            comment: "Your request has been processed.".to_string(),
        }
    }

    /// Error for a request that was understood but cannot be served.
    pub fn rejected(reason: impl std::fmt::Display) -> Self {
        Self {
            response_type: ResponseType::Error,
            port: PORT_REJECTED,
            comment: format!("Could not get port for you: {reason}"),
        }
    }

    /// Error for a request that could not be processed (decode failure,
    /// timeout, oversized line).
    pub fn internal_error(reason: impl std::fmt::Display) -> Self {
        Self {
            response_type: ResponseType::Error,
            port: PORT_INTERNAL_ERROR,
            comment: format!("Error processing request: {reason}"),
        }
    }

    pub fn is_success(&self) -> bool {
        self.response_type == ResponseType::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_wire_field_names() {
        let json = r#"{"TargetIP":"10.0.0.5","TargetPort":443,"ViaIP":"192.168.1.2"}"#;
        let req: ControlRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req, ControlRequest::new("10.0.0.5", 443, "192.168.1.2"));
    }

    #[test]
    fn response_uses_wire_field_names() {
        let json = serde_json::to_string(&ControlResponse::success(8082)).unwrap();
        assert_eq!(
            json,
            r#"{"ResponseType":"Success","Port":8082,"Comment":"Your request has been processed."}"#
        );
        let err = serde_json::to_value(ControlResponse::rejected("bad via")).unwrap();
        assert_eq!(err["ResponseType"], "Error");
        assert_eq!(err["Port"], -1);
    }

    #[test]
    fn missing_field_fails_to_decode() {
        let json = r#"{"TargetIP":"10.0.0.5","TargetPort":443}"#;
        assert!(serde_json::from_str::<ControlRequest>(json).is_err());
    }

    #[test]
    fn validate_accepts_good_request() {
        let (dest, via) = ControlRequest::new("10.0.0.5", 443, "192.168.1.2").validate().unwrap();
        assert_eq!(dest, "10.0.0.5:443".parse().unwrap());
        assert_eq!(via, "192.168.1.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn validate_rejects_bad_fields() {
        assert!(ControlRequest::new("10.0.0.5", 443, "nope").validate().is_err());
        assert!(ControlRequest::new("host.example", 443, "192.168.1.2").validate().is_err());
        assert!(ControlRequest::new("10.0.0.5", 70000, "192.168.1.2").validate().is_err());
        assert!(ControlRequest::new("10.0.0.5", -1, "192.168.1.2").validate().is_err());
        assert!(ControlRequest::new("10.0.0.5", 0, "192.168.1.2").validate().is_err());
    }

    #[test]
    fn to_rule_tags_comment() {
        let rule = ControlRequest::new("10.0.0.5", 443, "192.168.1.2").to_rule(8082).unwrap();
        assert_eq!(rule.listening_port, 8082);
        assert_eq!(rule.comment, ALLOCATED_RULE_COMMENT);
    }
}
