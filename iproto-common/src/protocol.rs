//! # Packet Model
//!
//! Purpose: Represent one protocol packet (header + body) as plain Rust data
//! and build the bodies of every request the client sends.
//!
//! ## Design Principles
//!
//! 1. **Header + Body Pattern**: The header is small and typed; the body is a
//!    sparse key → value map so unknown keys survive a decode/encode cycle.
//! 2. **Builders, Not Setters**: Each request kind has one function producing
//!    its body, so the key layout for a request lives in exactly one place.
//! 3. **Server Errors Are Data**: An error response is a normal packet; the
//!    caller decides whether to turn it into a `Result`.

use std::collections::BTreeMap;

use rmpv::Value;

use crate::error::{ProtocolError, ProtocolResult};
use crate::target::RequestTarget;
use crate::types::*;

/// Packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Request type for requests, status for responses.
    pub code: u32,
    /// Correlation id.
    pub sync: u64,
    /// Schema version stamp; absent when the sender does not care.
    pub schema_version: Option<u64>,
    /// Stream id; absent outside streams.
    pub stream_id: Option<u64>,
}

impl Header {
    /// Builds a request header.
    pub fn request(kind: RequestType, sync: SyncId) -> Self {
        Header {
            code: kind.code(),
            sync: sync.get(),
            schema_version: None,
            stream_id: None,
        }
    }

    /// Builds a response header with the given status code.
    pub fn response(code: u32, sync: u64, schema_version: u64) -> Self {
        Header {
            code,
            sync,
            schema_version: Some(schema_version),
            stream_id: None,
        }
    }

    /// Returns true when the status marks an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.code & STATUS_ERROR_BIT != 0
    }

    /// Server error code carried in the status, if any.
    #[inline]
    pub fn error_code(&self) -> Option<u32> {
        self.is_error().then_some(self.code & !STATUS_ERROR_BIT)
    }

    /// Returns true for out-of-band push chunks.
    #[inline]
    pub fn is_chunk(&self) -> bool {
        self.code == STATUS_CHUNK
    }

    /// Returns true for asynchronous watcher events.
    #[inline]
    pub fn is_event(&self) -> bool {
        self.code == RequestType::Event.code()
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut entries = Vec::with_capacity(4);
        entries.push((Value::from(KEY_REQUEST_TYPE), Value::from(self.code)));
        entries.push((Value::from(KEY_SYNC), Value::from(self.sync)));
        if let Some(version) = self.schema_version {
            entries.push((Value::from(KEY_SCHEMA_VERSION), Value::from(version)));
        }
        if let Some(stream) = self.stream_id {
            entries.push((Value::from(KEY_STREAM_ID), Value::from(stream)));
        }
        Value::Map(entries)
    }

    pub(crate) fn from_value(value: Value) -> ProtocolResult<Self> {
        let entries = match value {
            Value::Map(entries) => entries,
            _ => return Err(ProtocolError::Header("header is not a map")),
        };

        let mut code = None;
        let mut sync = 0;
        let mut schema_version = None;
        let mut stream_id = None;
        for (key, value) in entries {
            let key = key.as_u64().ok_or(ProtocolError::Header("non-integer header key"))?;
            let value = value.as_u64();
            match key as u8 {
                KEY_REQUEST_TYPE => code = value,
                KEY_SYNC => sync = value.ok_or(ProtocolError::Header("sync is not an integer"))?,
                KEY_SCHEMA_VERSION => schema_version = value,
                KEY_STREAM_ID => stream_id = value,
                _ => {}
            }
        }

        let code = code.ok_or(ProtocolError::Header("missing request type"))?;
        Ok(Header {
            code: code as u32,
            sync,
            schema_version,
            stream_id,
        })
    }
}

/// Packet body: a sparse map keyed by protocol body keys.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Body(BTreeMap<u8, Value>);

impl Body {
    /// Creates an empty body.
    pub fn new() -> Self {
        Body(BTreeMap::new())
    }

    /// Adds a key and returns the body (builder style).
    pub fn with(mut self, key: u8, value: impl Into<Value>) -> Self {
        self.0.insert(key, value.into());
        self
    }

    /// Sets a key.
    pub fn insert(&mut self, key: u8, value: impl Into<Value>) {
        self.0.insert(key, value.into());
    }

    /// Reads a key.
    pub fn get(&self, key: u8) -> Option<&Value> {
        self.0.get(&key)
    }

    /// Removes and returns a key.
    pub fn take(&mut self, key: u8) -> Option<Value> {
        self.0.remove(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Response data array, if present.
    pub fn data(&self) -> Option<&Vec<Value>> {
        match self.get(KEY_DATA) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        }
    }

    /// Takes the response data array, returning an empty list when absent.
    pub fn take_data(&mut self) -> Vec<Value> {
        match self.take(KEY_DATA) {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => Vec::new(),
        }
    }

    /// Reads a string-valued key.
    pub fn get_str(&self, key: u8) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Reads an integer-valued key.
    pub fn get_u64(&self, key: u8) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    /// Error message from the extended error stack, falling back to the
    /// legacy string field.
    pub fn error_message(&self) -> Option<String> {
        if let Some(message) = self.extended_error_field(ERROR_FIELD_MESSAGE).and_then(Value::as_str) {
            return Some(message.to_string());
        }
        self.get_str(KEY_ERROR_24).map(str::to_string)
    }

    fn extended_error_field(&self, field: u8) -> Option<&Value> {
        let stack = map_get(self.get(KEY_ERROR)?, ERROR_KEY_STACK)?;
        let first = stack.as_array()?.first()?;
        map_get(first, field)
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Map(
            self.0
                .iter()
                .map(|(key, value)| (Value::from(*key), value.clone()))
                .collect(),
        )
    }

    pub(crate) fn from_value(value: Value) -> ProtocolResult<Self> {
        let entries = match value {
            Value::Map(entries) => entries,
            Value::Nil => return Ok(Body::new()),
            _ => return Err(ProtocolError::Body("body is not a map")),
        };
        let mut body = BTreeMap::new();
        for (key, value) in entries {
            let key = key.as_u64().ok_or(ProtocolError::Body("non-integer body key"))?;
            if key > u8::MAX as u64 {
                continue;
            }
            body.insert(key as u8, value);
        }
        Ok(Body(body))
    }
}

fn map_get(map: &Value, key: u8) -> Option<&Value> {
    map.as_map()?
        .iter()
        .find(|(k, _)| k.as_u64() == Some(key as u64))
        .map(|(_, v)| v)
}

/// One decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: Header,
    pub body: Body,
}

impl Packet {
    pub fn new(header: Header, body: Body) -> Self {
        Packet { header, body }
    }

    /// Server error carried by this packet, if it is an error response.
    pub fn server_error(&self) -> Option<ServerError> {
        let code = self.header.error_code()?;
        let message = self
            .body
            .error_message()
            .unwrap_or_else(|| format!("server error {}", code));
        Some(ServerError { code, message })
    }
}

/// Error reported by the server for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: u32,
    pub message: String,
}

/// Parameters of a select request beyond its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectParams {
    pub limit: u32,
    pub offset: u32,
    pub iterator: IteratorType,
}

impl Default for SelectParams {
    fn default() -> Self {
        SelectParams {
            limit: u32::MAX,
            offset: 0,
            iterator: IteratorType::Eq,
        }
    }
}

impl SelectParams {
    /// Full scan of an index.
    pub fn all() -> Self {
        SelectParams {
            iterator: IteratorType::All,
            ..SelectParams::default()
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_iterator(mut self, iterator: IteratorType) -> Self {
        self.iterator = iterator;
        self
    }
}

/// Body of a `PING` request.
pub fn ping_body() -> Body {
    Body::new()
}

/// Body of a `CALL` request.
pub fn call_body(function: &str, args: Vec<Value>) -> Body {
    Body::new()
        .with(KEY_FUNCTION_NAME, function)
        .with(KEY_TUPLE, Value::Array(args))
}

/// Body of an `EVAL` request.
pub fn eval_body(expr: &str, args: Vec<Value>) -> Body {
    Body::new()
        .with(KEY_EXPR, expr)
        .with(KEY_TUPLE, Value::Array(args))
}

/// Body of a `SELECT` request.
pub fn select_body(
    space: &RequestTarget,
    index: &RequestTarget,
    key: Vec<Value>,
    params: SelectParams,
) -> Body {
    let mut body = Body::new()
        .with(KEY_KEY, Value::Array(key))
        .with(KEY_LIMIT, params.limit)
        .with(KEY_OFFSET, params.offset)
        .with(KEY_ITERATOR, params.iterator as u32);
    space.write_space(&mut body);
    index.write_index(&mut body);
    body
}

/// Body of an `INSERT` or `REPLACE` request.
pub fn tuple_body(space: &RequestTarget, tuple: Vec<Value>) -> Body {
    let mut body = Body::new().with(KEY_TUPLE, Value::Array(tuple));
    space.write_space(&mut body);
    body
}

/// Body of an `UPDATE` request.
pub fn update_body(
    space: &RequestTarget,
    index: &RequestTarget,
    key: Vec<Value>,
    ops: Vec<Value>,
) -> Body {
    let mut body = Body::new()
        .with(KEY_KEY, Value::Array(key))
        .with(KEY_TUPLE, Value::Array(ops));
    space.write_space(&mut body);
    index.write_index(&mut body);
    body
}

/// Body of an `UPSERT` request.
pub fn upsert_body(space: &RequestTarget, tuple: Vec<Value>, ops: Vec<Value>) -> Body {
    let mut body = Body::new()
        .with(KEY_TUPLE, Value::Array(tuple))
        .with(KEY_OPS, Value::Array(ops));
    space.write_space(&mut body);
    body
}

/// Body of a `DELETE` request.
pub fn delete_body(space: &RequestTarget, index: &RequestTarget, key: Vec<Value>) -> Body {
    let mut body = Body::new().with(KEY_KEY, Value::Array(key));
    space.write_space(&mut body);
    index.write_index(&mut body);
    body
}

/// Body of an `AUTH` request using the `chap-sha1` method.
pub fn auth_body(user: &str, scramble: &[u8]) -> Body {
    Body::new().with(KEY_USER_NAME, user).with(
        KEY_TUPLE,
        Value::Array(vec![Value::from("chap-sha1"), Value::from(scramble)]),
    )
}

/// Body of an `ID` request advertising a version and feature set.
pub fn id_body(version: u64, features: FeatureSet) -> Body {
    let ids: Vec<Value> = features.iter().map(|f| Value::from(f.id())).collect();
    Body::new()
        .with(KEY_VERSION, version)
        .with(KEY_FEATURES, Value::Array(ids))
}

/// Body of `WATCH`, `UNWATCH`, and `WATCH_ONCE` requests.
pub fn watch_body(key: &str) -> Body {
    Body::new().with(KEY_EVENT_KEY, key)
}

/// Body of a `BEGIN` request; a zero timeout leaves the server default.
pub fn begin_body(timeout_secs: f64) -> Body {
    let body = Body::new();
    if timeout_secs > 0.0 {
        return body.with(KEY_TIMEOUT, timeout_secs);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_error_code() {
        let header = Header::response(STATUS_ERROR_BIT | ER_NO_SUCH_SPACE, 7, 3);
        assert!(header.is_error());
        assert_eq!(header.error_code(), Some(ER_NO_SUCH_SPACE));

        let ok = Header::response(STATUS_OK, 7, 3);
        assert_eq!(ok.error_code(), None);
    }

    #[test]
    fn header_value_roundtrip_keeps_optional_fields() {
        let mut header = Header::request(RequestType::Call, SyncId(12));
        header.stream_id = Some(4);
        let decoded = Header::from_value(header.to_value()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.schema_version, None);
    }

    #[test]
    fn header_requires_type() {
        let value = Value::Map(vec![(Value::from(KEY_SYNC), Value::from(1u64))]);
        assert!(Header::from_value(value).is_err());
    }

    #[test]
    fn error_message_prefers_extended_stack() {
        let entry = Value::Map(vec![
            (Value::from(ERROR_FIELD_MESSAGE), Value::from("extended")),
            (Value::from(ERROR_FIELD_CODE), Value::from(36u32)),
        ]);
        let stack = Value::Map(vec![(Value::from(ERROR_KEY_STACK), Value::Array(vec![entry]))]);
        let body = Body::new().with(KEY_ERROR_24, "legacy").with(KEY_ERROR, stack);
        assert_eq!(body.error_message().as_deref(), Some("extended"));

        let legacy = Body::new().with(KEY_ERROR_24, "legacy");
        assert_eq!(legacy.error_message().as_deref(), Some("legacy"));
    }

    #[test]
    fn server_error_without_message_gets_placeholder() {
        let packet = Packet::new(Header::response(STATUS_ERROR_BIT | 42, 1, 1), Body::new());
        let err = packet.server_error().unwrap();
        assert_eq!(err.code, 42);
        assert_eq!(err.message, "server error 42");
    }

    #[test]
    fn select_body_by_id_layout() {
        let body = select_body(
            &RequestTarget::ById(512),
            &RequestTarget::ById(0),
            vec![Value::from(1)],
            SelectParams::default().with_limit(10),
        );
        assert_eq!(body.get_u64(KEY_SPACE_ID), Some(512));
        assert_eq!(body.get_u64(KEY_INDEX_ID), Some(0));
        assert_eq!(body.get_u64(KEY_LIMIT), Some(10));
        assert!(body.get(KEY_SPACE_NAME).is_none());
    }

    #[test]
    fn id_body_lists_feature_ids() {
        let features: FeatureSet = [Feature::Streams, Feature::Watchers].into_iter().collect();
        let body = id_body(6, features);
        assert_eq!(body.get_u64(KEY_VERSION), Some(6));
        let ids: Vec<u64> = body
            .get(KEY_FEATURES)
            .and_then(Value::as_array)
            .unwrap()
            .iter()
            .filter_map(Value::as_u64)
            .collect();
        assert_eq!(ids, vec![0, 3]);
    }

    #[test]
    fn take_data_wraps_scalars() {
        let mut body = Body::new().with(KEY_DATA, 5u32);
        assert_eq!(body.take_data(), vec![Value::from(5u32)]);
        assert!(body.take_data().is_empty());
    }
}
