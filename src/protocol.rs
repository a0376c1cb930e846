//! Registration control channel wire format
//!
//! Members talk to the proxy's private control port with form-encoded POST
//! requests and receive small JSON replies:
//!
//! - `POST /register` `hostname`, `port`, optional `key`, optional `connections`
//! - `POST /ping` `id`
//! - `POST /unregister` `id`
//!
//! A reply is `{"type":"success", ...}` or
//! `{"type":"error","message":"..."}`. Code `1` on an error means the
//! member is unknown and must register again.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const REGISTER_PATH: &str = "/register";
pub const PING_PATH: &str = "/ping";
pub const UNREGISTER_PATH: &str = "/unregister";

/// Error code telling a member to register again
pub const CODE_UNKNOWN_MEMBER: u8 = 1;

/// Control channel errors. The display string is the wire message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Invalid authentication.")]
    InvalidAuthentication,

    #[error("Invalid method.")]
    InvalidMethod,

    #[error("Invalid request.")]
    InvalidRequest,

    #[error("Invalid post data.")]
    InvalidPostData,

    #[error("Node ID is required.")]
    MissingNodeId,

    #[error("Node was not previously registered")]
    UnknownMember(String),
}

impl ControlError {
    /// Machine-readable code sent along with the message
    pub fn code(&self) -> Option<u8> {
        match self {
            ControlError::UnknownMember(_) => Some(CODE_UNKNOWN_MEMBER),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyType {
    Success,
    Error,
}

/// JSON body of every control channel reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    #[serde(rename = "type")]
    pub kind: ReplyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Seconds between pings the member must honor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u8>,
}

impl ControlReply {
    pub fn success() -> Self {
        Self {
            kind: ReplyType::Success,
            message: None,
            id: None,
            ping: None,
            code: None,
        }
    }

    pub fn registered(id: impl Into<String>, ping_secs: u64) -> Self {
        Self {
            id: Some(id.into()),
            ping: Some(ping_secs),
            ..Self::success()
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == ReplyType::Success
    }
}

impl From<&ControlError> for ControlReply {
    fn from(err: &ControlError) -> Self {
        Self {
            kind: ReplyType::Error,
            message: Some(err.to_string()),
            id: None,
            ping: None,
            code: err.code(),
        }
    }
}

/// Fields of a `/register` request, as sent by the member
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterForm {
    pub hostname: Option<String>,
    pub port: Option<String>,
    pub key: Option<String>,
    pub connections: Option<String>,
}

impl RegisterForm {
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        Self {
            hostname: fields.get("hostname").cloned(),
            port: fields.get("port").cloned(),
            key: fields.get("key").cloned(),
            connections: fields.get("connections").cloned(),
        }
    }

    /// Check the payload and extract `(hostname, port, connections)`
    pub fn validate(&self) -> Result<(String, u16, Option<u32>), ControlError> {
        let hostname = match self.hostname.as_deref().map(str::trim) {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => return Err(ControlError::InvalidPostData),
        };
        let port = self
            .port
            .as_deref()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .ok_or(ControlError::InvalidPostData)?;
        let connections = match self.connections.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(c) => Some(c.parse::<u32>().map_err(|_| ControlError::InvalidPostData)?),
        };
        Ok((hostname, port, connections))
    }
}

/// Decode an `application/x-www-form-urlencoded` payload or query string.
/// Later duplicates win.
pub fn parse_form(input: &[u8]) -> HashMap<String, String> {
    url::form_urlencoded::parse(input).into_owned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(pairs: &[(&str, &str)]) -> RegisterForm {
        let fields = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RegisterForm::from_fields(&fields)
    }

    #[test]
    fn test_success_reply_json() {
        let json = serde_json::to_string(&ControlReply::success()).unwrap();
        assert_eq!(json, r#"{"type":"success"}"#);

        let json = serde_json::to_string(&ControlReply::registered("abc", 1)).unwrap();
        assert_eq!(json, r#"{"type":"success","id":"abc","ping":1}"#);
    }

    #[test]
    fn test_error_reply_json() {
        let reply = ControlReply::from(&ControlError::UnknownMember("abc".into()));
        let json = serde_json::to_string(&reply).unwrap();
        assert_eq!(
            json,
            r#"{"type":"error","message":"Node was not previously registered","code":1}"#
        );

        let reply = ControlReply::from(&ControlError::InvalidAuthentication);
        let json = serde_json::to_string(&reply).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"Invalid authentication."}"#);
    }

    #[test]
    fn test_reply_parses_with_unknown_fields() {
        let reply: ControlReply =
            serde_json::from_str(r#"{"type":"success","message":"","extra":true}"#).unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.message.as_deref(), Some(""));
    }

    #[test]
    fn test_register_form_validation() {
        let valid = form(&[("hostname", "localhost"), ("port", "5000")]);
        assert_eq!(valid.validate(), Ok(("localhost".to_string(), 5000, None)));

        let capped = form(&[("hostname", "h"), ("port", "80"), ("connections", "100")]);
        assert_eq!(capped.validate(), Ok(("h".to_string(), 80, Some(100))));

        for bad in [
            form(&[("port", "5000")]),
            form(&[("hostname", ""), ("port", "5000")]),
            form(&[("hostname", "h")]),
            form(&[("hostname", "h"), ("port", "http")]),
            form(&[("hostname", "h"), ("port", "70000")]),
            form(&[("hostname", "h"), ("port", "80"), ("connections", "lots")]),
        ] {
            assert_eq!(bad.validate(), Err(ControlError::InvalidPostData), "{:?}", bad);
        }
    }

    #[test]
    fn test_parse_form() {
        let fields = parse_form(b"hostname=my%20host&port=5000&key=a+b");
        assert_eq!(fields["hostname"], "my host");
        assert_eq!(fields["port"], "5000");
        assert_eq!(fields["key"], "a b");
        assert!(parse_form(b"").is_empty());
    }
}
