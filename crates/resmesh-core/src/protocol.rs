//! Wire envelopes and subjects of the resource protocol.
//!
//! Inbound requests arrive on one of four subject families:
//!
//! ```text
//! access.<rid>          get.<rid>
//! call.<rid>.<method>   auth.<rid>.<method>
//! ```
//!
//! Their payload is a JSON [`RequestEnvelope`]. Replies are JSON frames built
//! by the functions in [`frame`]; the only non-JSON frame is the timeout
//! notice, `timeout:"<milliseconds>"`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult, ResError};

/// Subject on which system reset events are published.
pub const SYSTEM_RESET_SUBJECT: &str = "system.reset";

// =============================================================================
// RequestKind
// =============================================================================

/// The four request kinds a service answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Access control check for a resource.
    Access,
    /// Fetch of a resource's value.
    Get,
    /// Method call on a resource.
    Call,
    /// Authentication method on a resource.
    Auth,
}

impl RequestKind {
    /// All request kinds, in subscription order.
    pub const ALL: [RequestKind; 4] = [Self::Access, Self::Get, Self::Call, Self::Auth];

    /// Returns the subject prefix of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Get => "get",
            Self::Call => "call",
            Self::Auth => "auth",
        }
    }

    /// Returns `true` if the subject of this kind ends with a method name.
    pub fn has_method(&self) -> bool {
        matches!(self, Self::Call | Self::Auth)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access" => Ok(Self::Access),
            "get" => Ok(Self::Get),
            "call" => Ok(Self::Call),
            "auth" => Ok(Self::Auth),
            other => Err(ProtocolError::InvalidSubject(other.to_string())),
        }
    }
}

// =============================================================================
// Subjects
// =============================================================================

/// A parsed inbound request subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSubject {
    /// The request kind.
    pub kind: RequestKind,
    /// The resource name the request targets.
    pub resource_name: String,
    /// The method name, for call and auth requests.
    pub method: Option<String>,
}

impl RequestSubject {
    /// Parses a subject such as `call.library.book.42.set`.
    pub fn parse(subject: &str) -> ProtocolResult<Self> {
        let invalid = || ProtocolError::InvalidSubject(subject.to_string());

        let (kind, rest) = subject.split_once('.').ok_or_else(invalid)?;
        let kind: RequestKind = kind.parse().map_err(|_| invalid())?;

        let (resource_name, method) = if kind.has_method() {
            let (rid, method) = rest.rsplit_once('.').ok_or_else(invalid)?;
            if method.is_empty() {
                return Err(invalid());
            }
            (rid, Some(method.to_string()))
        } else {
            (rest, None)
        };

        if resource_name.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            kind,
            resource_name: resource_name.to_string(),
            method,
        })
    }

    /// Builds the subject string for this request.
    pub fn to_subject(&self) -> String {
        match &self.method {
            Some(method) => format!("{}.{}.{}", self.kind, self.resource_name, method),
            None => format!("{}.{}", self.kind, self.resource_name),
        }
    }
}

/// Subjects a service named `service_name` subscribes to, one per request kind.
///
/// An empty service name subscribes to every resource.
pub fn request_subscriptions(service_name: &str) -> Vec<(RequestKind, String)> {
    RequestKind::ALL
        .iter()
        .map(|kind| {
            let subject = if service_name.is_empty() {
                format!("{kind}.>")
            } else {
                format!("{kind}.{service_name}.>")
            };
            (*kind, subject)
        })
        .collect()
}

/// Subject of a resource event, e.g. `event.library.book.42.change`.
pub fn event_subject(resource_name: &str, event: &str) -> String {
    format!("event.{resource_name}.{event}")
}

/// Subject of a connection token event.
pub fn token_subject(cid: &str) -> String {
    format!("conn.{cid}.token")
}

// =============================================================================
// RequestEnvelope
// =============================================================================

/// Inbound request payload.
///
/// Every field is optional. `header`, `host`, `remote_addr` and `uri` are only
/// populated for auth requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    /// Connection ID of the originating client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// Call or auth parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Access token of the connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Value>,
    /// Query part of the resource ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// HTTP headers of the client connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<HashMap<String, Vec<String>>>,
    /// Host of the client connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Remote address of the client connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    /// Request URI of the client connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl RequestEnvelope {
    /// Decodes an envelope. An empty payload yields an empty envelope.
    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(payload).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Encodes the envelope, omitting absent fields.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

// =============================================================================
// Outbound frames
// =============================================================================

/// Builders for outbound reply frames.
pub mod frame {
    use super::*;

    /// Success frame without a result.
    pub const EMPTY_SUCCESS: &[u8] = br#"{"result":null}"#;

    /// Access reply granting get and every call method.
    pub const ACCESS_GRANTED: &[u8] = br#"{"result":{"get":true,"call":"*"}}"#;

    /// Access reply denying access.
    pub const ACCESS_DENIED: &[u8] =
        br#"{"error":{"code":"system.accessDenied","message":"Access denied"}}"#;

    /// Used when an error frame itself cannot be encoded.
    const INTERNAL_ERROR: &[u8] =
        br#"{"error":{"code":"system.internalError","message":"Internal error"}}"#;

    /// Prefix of the non-JSON timeout frame.
    pub const TIMEOUT_PREFIX: &[u8] = b"timeout:";

    #[derive(Serialize)]
    struct ResultFrame<'a, T: Serialize + ?Sized> {
        result: &'a T,
    }

    #[derive(Serialize)]
    struct ErrorFrame<'a> {
        error: &'a ResError,
    }

    #[derive(Serialize)]
    struct AccessResult<'a> {
        get: bool,
        #[serde(skip_serializing_if = "str::is_empty")]
        call: &'a str,
    }

    #[derive(Serialize)]
    struct ModelResult<'a> {
        model: &'a Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        query: Option<&'a str>,
    }

    #[derive(Serialize)]
    struct CollectionResult<'a> {
        collection: &'a Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        query: Option<&'a str>,
    }

    #[derive(Serialize)]
    struct ResourceResult<'a> {
        resource: ResourceRid<'a>,
    }

    #[derive(Serialize)]
    struct ResourceRid<'a> {
        rid: &'a str,
    }

    /// `{"result": <value>}`.
    pub fn result<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(&ResultFrame { result: value })
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// `{"error": {code, message, data?}}`.
    pub fn error(err: &ResError) -> Vec<u8> {
        serde_json::to_vec(&ErrorFrame { error: err }).unwrap_or_else(|_| INTERNAL_ERROR.to_vec())
    }

    /// `{"result": {"get": <bool>, "call": <methods>}}`, omitting an empty call list.
    ///
    /// Full access and no access at all use the canonical frames.
    pub fn access(get: bool, call: &str) -> Vec<u8> {
        if get && call == "*" {
            return ACCESS_GRANTED.to_vec();
        }
        if !get && call.is_empty() {
            return ACCESS_DENIED.to_vec();
        }
        serde_json::to_vec(&ResultFrame {
            result: &AccessResult { get, call },
        })
        .unwrap_or_else(|_| INTERNAL_ERROR.to_vec())
    }

    /// `{"result": {"model": <value>, "query"?: <query>}}`.
    pub fn model(value: &Value, query: Option<&str>) -> Vec<u8> {
        serde_json::to_vec(&ResultFrame {
            result: &ModelResult { model: value, query },
        })
        .unwrap_or_else(|_| INTERNAL_ERROR.to_vec())
    }

    /// `{"result": {"collection": <value>, "query"?: <query>}}`.
    pub fn collection(value: &Value, query: Option<&str>) -> Vec<u8> {
        serde_json::to_vec(&ResultFrame {
            result: &CollectionResult {
                collection: value,
                query,
            },
        })
        .unwrap_or_else(|_| INTERNAL_ERROR.to_vec())
    }

    /// `{"resource": {"rid": <rid>}}`, the reply to a call creating a resource.
    pub fn resource(rid: &str) -> Vec<u8> {
        serde_json::to_vec(&ResourceResult {
            resource: ResourceRid { rid },
        })
        .unwrap_or_else(|_| INTERNAL_ERROR.to_vec())
    }

    /// `timeout:"<milliseconds>"`.
    pub fn timeout(duration: Duration) -> Vec<u8> {
        format!("timeout:\"{}\"", duration.as_millis()).into_bytes()
    }
}

// =============================================================================
// ResponseFrame
// =============================================================================

/// A decoded reply frame, as seen by the requesting side.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFrame {
    /// A success frame with its (possibly null) result.
    Result(Value),
    /// A resource reference reply to a call.
    Resource(String),
    /// An error frame.
    Error(ResError),
    /// A non-terminal timeout extension.
    Timeout(Duration),
}

impl ResponseFrame {
    /// Decodes a reply frame.
    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        if let Some(rest) = payload.strip_prefix(frame::TIMEOUT_PREFIX) {
            let text = std::str::from_utf8(rest).map_err(|e| ProtocolError::Decode(e.to_string()))?;
            let millis: u64 = text
                .trim_matches('"')
                .parse()
                .map_err(|_| ProtocolError::Decode(format!("invalid timeout frame '{text}'")))?;
            return Ok(Self::Timeout(Duration::from_millis(millis)));
        }

        #[derive(Deserialize)]
        struct RawFrame {
            #[serde(default)]
            result: Option<Value>,
            #[serde(default)]
            error: Option<ResError>,
            #[serde(default)]
            resource: Option<RawRid>,
        }

        #[derive(Deserialize)]
        struct RawRid {
            rid: String,
        }

        let raw: RawFrame =
            serde_json::from_slice(payload).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        match (raw.error, raw.resource) {
            (Some(err), _) => Ok(Self::Error(err)),
            (None, Some(resource)) => Ok(Self::Resource(resource.rid)),
            (None, None) => Ok(Self::Result(raw.result.unwrap_or(Value::Null))),
        }
    }

    /// Returns `true` for frames that end a request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_get_subject() {
        let subject = RequestSubject::parse("get.library.book.42").unwrap();
        assert_eq!(subject.kind, RequestKind::Get);
        assert_eq!(subject.resource_name, "library.book.42");
        assert_eq!(subject.method, None);
    }

    #[test]
    fn test_parse_call_subject_splits_method() {
        let subject = RequestSubject::parse("call.library.book.42.set").unwrap();
        assert_eq!(subject.kind, RequestKind::Call);
        assert_eq!(subject.resource_name, "library.book.42");
        assert_eq!(subject.method.as_deref(), Some("set"));
        assert_eq!(subject.to_subject(), "call.library.book.42.set");
    }

    #[test]
    fn test_parse_invalid_subjects() {
        assert!(RequestSubject::parse("get").is_err());
        assert!(RequestSubject::parse("get.").is_err());
        assert!(RequestSubject::parse("call.method").is_err());
        assert!(RequestSubject::parse("event.library.book").is_err());
    }

    #[test]
    fn test_request_subscriptions() {
        let subs: Vec<String> = request_subscriptions("library")
            .into_iter()
            .map(|(_, s)| s)
            .collect();
        assert_eq!(
            subs,
            vec!["access.library.>", "get.library.>", "call.library.>", "auth.library.>"]
        );
        assert_eq!(request_subscriptions("")[1].1, "get.>");
    }

    #[test]
    fn test_envelope_omits_absent_fields() {
        let envelope = RequestEnvelope {
            cid: Some("c1".into()),
            ..Default::default()
        };
        assert_eq!(envelope.encode().unwrap(), br#"{"cid":"c1"}"#);
    }

    #[test]
    fn test_envelope_decodes_auth_fields() {
        let payload = br#"{"cid":"c1","remoteAddr":"127.0.0.1","header":{"Accept":["*/*"]}}"#;
        let envelope = RequestEnvelope::decode(payload).unwrap();
        assert_eq!(envelope.remote_addr.as_deref(), Some("127.0.0.1"));
        assert_eq!(envelope.header.unwrap()["Accept"], vec!["*/*".to_string()]);
        assert_eq!(RequestEnvelope::decode(b"").unwrap(), RequestEnvelope::default());
    }

    #[test]
    fn test_frames() {
        assert_eq!(frame::access(true, "*"), frame::ACCESS_GRANTED);
        assert_eq!(frame::access(true, ""), br#"{"result":{"get":true}}"#);
        assert_eq!(frame::access(false, ""), frame::ACCESS_DENIED);
        assert_eq!(frame::access(false, "set"), br#"{"result":{"get":false,"call":"set"}}"#);
        assert_eq!(
            frame::model(&json!({"a": 1}), Some("q=1")),
            br#"{"result":{"model":{"a":1},"query":"q=1"}}"#
        );
        assert_eq!(
            frame::collection(&json!([1]), None),
            br#"{"result":{"collection":[1]}}"#
        );
        assert_eq!(frame::timeout(Duration::from_secs(3)), b"timeout:\"3000\"");
    }

    #[test]
    fn test_response_frame_decode() {
        assert_eq!(
            ResponseFrame::decode(frame::EMPTY_SUCCESS).unwrap(),
            ResponseFrame::Result(Value::Null)
        );
        assert_eq!(
            ResponseFrame::decode(frame::ACCESS_DENIED).unwrap(),
            ResponseFrame::Error(ResError::access_denied())
        );
        assert_eq!(
            ResponseFrame::decode(b"timeout:\"1500\"").unwrap(),
            ResponseFrame::Timeout(Duration::from_millis(1500))
        );
        assert_eq!(
            ResponseFrame::decode(&frame::resource("library.book.7")).unwrap(),
            ResponseFrame::Resource("library.book.7".into())
        );
    }
}
