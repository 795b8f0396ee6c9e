// src/core/protocol/frame.rs

//! The structured-document frame model exchanged between clients and the server.
//!
//! A frame is a self-describing document tagged with a frame type. Request
//! frames carry a request id that is echoed unchanged in the matching
//! response frame.

use crate::core::errors::LogBusError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A structured document: named fields with scalar, nested-document or array
/// values. Field insertion order is preserved on the wire.
pub type Document = serde_json::Map<String, Value>;

/// The names of the fields used in protocol frames.
pub mod fields {
    pub const OK: &str = "ok";
    pub const ERR_CODE: &str = "errCode";
    pub const ERR_MSG: &str = "errMsg";
    pub const REQUEST_ID: &str = "rID";
    pub const AUTH_INFO: &str = "authInfo";
    pub const CHANNEL: &str = "channel";
    pub const EVENT: &str = "event";
    pub const START_POS: &str = "startPos";
    pub const START_TIMESTAMP: &str = "startTimestamp";
    pub const DURABLE_ID: &str = "durableID";
    pub const MATCHER: &str = "matcher";
    pub const SUB_ID: &str = "subID";
    pub const BYTES: &str = "bytes";
    pub const POS: &str = "pos";
    pub const TIMESTAMP: &str = "timestamp";
    pub const QUERY_ID: &str = "queryID";
    pub const QUERY_NAME: &str = "name";
    pub const QUERY_PARAMS: &str = "params";
    pub const RESULT: &str = "result";
    pub const LAST: &str = "last";
    pub const DOC_ID: &str = "docID";
    pub const BINDER: &str = "binder";
    pub const COMMAND_NAME: &str = "name";
    pub const COMMAND: &str = "command";
    pub const NAME: &str = "name";
    pub const BINDERS: &str = "binders";
    pub const CHANNELS: &str = "channels";
    pub const ALREADY_EXISTS: &str = "exists";
}

/// The type tag of a frame. The string form doubles as the operation name
/// passed to the capability gate for authorization checks.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FrameType {
    // Client -> server.
    Connect,
    Publish,
    StartTx,
    CommitTx,
    AbortTx,
    Subscribe,
    SubClose,
    Unsubscribe,
    AckEv,
    Query,
    QueryAck,
    FindById,
    Command,
    ListBinders,
    ListChannels,
    CreateBinder,
    CreateChannel,
    Ping,
    // Server -> client.
    Response,
    SubResponse,
    Recv,
    QueryResult,
}

/// The numeric error codes carried in the `errCode` field of error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrCode {
    ServerError,
    AuthenticationFailed,
    NotAuthorized,
    AuthorizationFailed,
    NoSuchChannel,
    NoSuchBinder,
    NoSuchQuery,
}

impl ErrCode {
    pub fn as_i64(self) -> i64 {
        match self {
            ErrCode::ServerError => 1,
            ErrCode::AuthenticationFailed => 2,
            ErrCode::NotAuthorized => 3,
            ErrCode::AuthorizationFailed => 4,
            ErrCode::NoSuchChannel => 5,
            ErrCode::NoSuchBinder => 6,
            ErrCode::NoSuchQuery => 7,
        }
    }

    pub fn from_i64(code: i64) -> Option<Self> {
        Some(match code {
            1 => ErrCode::ServerError,
            2 => ErrCode::AuthenticationFailed,
            3 => ErrCode::NotAuthorized,
            4 => ErrCode::AuthorizationFailed,
            5 => ErrCode::NoSuchChannel,
            6 => ErrCode::NoSuchBinder,
            7 => ErrCode::NoSuchQuery,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

/// One discrete protocol message: a frame-type tag plus a document body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub body: Document,
}

impl Frame {
    pub fn new(frame_type: FrameType, body: Document) -> Self {
        Self { frame_type, body }
    }

    /// A convenience method to encode a frame into a `Vec<u8>`.
    /// Used where the wire size of a frame must be known up front, such as
    /// ack-window accounting for deliveries and query results.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, LogBusError> {
        use tokio_util::codec::Encoder;
        let mut buf = bytes::BytesMut::new();
        crate::core::protocol::FrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// Typed accessors over [`Document`] fields, mirroring the loose typing of
/// the wire format. All return `None` when the field is absent or has the
/// wrong type; callers decide whether that is a protocol error.
pub trait DocumentExt {
    fn get_str(&self, field: &str) -> Option<&str>;
    fn get_i64(&self, field: &str) -> Option<i64>;
    fn get_u64(&self, field: &str) -> Option<u64>;
    fn get_bool(&self, field: &str) -> Option<bool>;
    fn get_document(&self, field: &str) -> Option<&Document>;
}

impl DocumentExt for Document {
    fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    fn get_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    fn get_u64(&self, field: &str) -> Option<u64> {
        self.get(field).and_then(Value::as_u64)
    }

    fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    fn get_document(&self, field: &str) -> Option<&Document> {
        self.get(field).and_then(Value::as_object)
    }
}

/// Field-equality matching: `doc` matches when every field of `matcher` is
/// present in `doc` with an equal value. An empty matcher matches everything.
/// Used by filtered subscriptions and binder-scan queries.
pub fn matches_document(matcher: &Document, doc: &Document) -> bool {
    matcher
        .iter()
        .all(|(field, expected)| doc.get(field) == Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matcher_requires_all_fields_to_be_equal() {
        let mut doc = Document::new();
        doc.insert("kind".into(), "order".into());
        doc.insert("qty".into(), 3.into());

        let mut matcher = Document::new();
        assert!(matches_document(&matcher, &doc));
        matcher.insert("kind".into(), "order".into());
        assert!(matches_document(&matcher, &doc));
        matcher.insert("qty".into(), 4.into());
        assert!(!matches_document(&matcher, &doc));
    }

    #[test]
    fn frame_type_tag_round_trips_through_strum() {
        assert_eq!(FrameType::FindById.to_string(), "find_by_id");
        assert_eq!("sub_close".parse::<FrameType>().unwrap(), FrameType::SubClose);
        assert!("no_such_frame".parse::<FrameType>().is_err());
    }

    #[test]
    fn document_accessors_reject_wrong_types() {
        let mut doc = Document::new();
        doc.insert("n".into(), 42.into());
        doc.insert("s".into(), "hello".into());
        assert_eq!(doc.get_i64("n"), Some(42));
        assert_eq!(doc.get_str("n"), None);
        assert_eq!(doc.get_str("s"), Some("hello"));
        assert_eq!(doc.get_u64("missing"), None);
    }
}
