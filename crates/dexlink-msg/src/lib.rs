//! JSON message envelope for dexlink sessions.
//!
//! Every frame on the wire is a [`Message`]: a `type` discriminator, a
//! 64-bit `id` correlating responses with requests, a `route` naming the
//! operation, and an operation-specific JSON payload. Responses carry a
//! [`ResponsePayload`] holding either a result or a coded error.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope error types.
#[derive(Debug, Error)]
pub enum MsgError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message id must be non-zero")]
    ZeroId,

    #[error("message has no payload")]
    NoPayload,

    #[error("response carries no result")]
    NoResult,

    #[error("server error: {0}")]
    Server(ErrorPayload),
}

/// Result type alias for envelope operations.
pub type MsgResult<T> = std::result::Result<T, MsgError>;

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Expects a response carrying the same id.
    Request,
    /// Reply to an earlier request.
    Response,
    /// Server push with no response expected.
    Notification,
}

/// A single framed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Discriminates requests, responses and notifications.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Correlation id. Zero for notifications.
    #[serde(default)]
    pub id: u64,
    /// Operation name. Empty for responses, whose id names the request.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub route: String,
    /// Operation-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Message {
    /// Create a request. The id must be non-zero so responses can be
    /// matched against it.
    pub fn request<T: Serialize>(
        id: u64,
        route: impl Into<String>,
        payload: &T,
    ) -> MsgResult<Self> {
        if id == 0 {
            return Err(MsgError::ZeroId);
        }
        Ok(Self {
            kind: MessageKind::Request,
            id,
            route: route.into(),
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// Create a response to the request with the given id, carrying
    /// either a result or a coded error.
    pub fn response(
        id: u64,
        result: Option<serde_json::Value>,
        error: Option<ErrorPayload>,
    ) -> MsgResult<Self> {
        if id == 0 {
            return Err(MsgError::ZeroId);
        }
        let payload = ResponsePayload { result, error };
        Ok(Self {
            kind: MessageKind::Response,
            id,
            route: String::new(),
            payload: Some(serde_json::to_value(&payload)?),
        })
    }

    /// Create a notification.
    pub fn notification<T: Serialize>(route: impl Into<String>, payload: &T) -> MsgResult<Self> {
        Ok(Self {
            kind: MessageKind::Notification,
            id: 0,
            route: route.into(),
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// Deserialize the payload into a concrete type.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> MsgResult<T> {
        let payload = self.payload.as_ref().ok_or(MsgError::NoPayload)?;
        Ok(serde_json::from_value(payload.clone())?)
    }

    /// Unwrap a response payload, yielding the decoded result or the
    /// server's coded error.
    pub fn response_result<T: DeserializeOwned>(&self) -> MsgResult<T> {
        let resp: ResponsePayload = self.parse_payload()?;
        if let Some(err) = resp.error {
            return Err(MsgError::Server(err));
        }
        let result = resp.result.ok_or(MsgError::NoResult)?;
        Ok(serde_json::from_value(result)?)
    }
}

/// Payload of a response message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// Present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Coded error carried in a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let msg = Message::request(7, "trade", &json!({"qty": 1})).expect("request");
        let raw = serde_json::to_string(&msg).expect("serialize");
        let parsed: Message = serde_json::from_str(&raw).expect("deserialize");

        assert_eq!(parsed.kind, MessageKind::Request);
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.route, "trade");
        assert_eq!(parsed.payload, Some(json!({"qty": 1})));
    }

    #[test]
    fn test_kind_discriminator_strings() {
        let raw = r#"{"type":"notification","route":"book_update","payload":{}}"#;
        let msg: Message = serde_json::from_str(raw).expect("parse");
        assert_eq!(msg.kind, MessageKind::Notification);
        assert_eq!(msg.id, 0);

        let raw = r#"{"type":"response","id":42,"payload":{"result":true}}"#;
        let msg: Message = serde_json::from_str(raw).expect("parse");
        assert_eq!(msg.kind, MessageKind::Response);
        assert_eq!(msg.id, 42);
        assert!(msg.route.is_empty());
    }

    #[test]
    fn test_request_rejects_zero_id() {
        let err = Message::request(0, "trade", &json!({})).unwrap_err();
        assert!(matches!(err, MsgError::ZeroId));
    }

    #[test]
    fn test_response_result_success() {
        let msg = Message::response(9, Some(json!({"accepted": true})), None).expect("response");
        let result: serde_json::Value = msg.response_result().expect("result");
        assert_eq!(result["accepted"], json!(true));
    }

    #[test]
    fn test_response_result_server_error() {
        let msg = Message::response(9, None, Some(ErrorPayload::new(23, "order not found")))
            .expect("response");
        let err = msg.response_result::<serde_json::Value>().unwrap_err();
        match err {
            MsgError::Server(payload) => {
                assert_eq!(payload.code, 23);
                assert_eq!(payload.message, "order not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_payload_missing() {
        let msg = Message {
            kind: MessageKind::Notification,
            id: 0,
            route: "heartbeat".to_string(),
            payload: None,
        };
        let err = msg.parse_payload::<serde_json::Value>().unwrap_err();
        assert!(matches!(err, MsgError::NoPayload));
    }
}
