//! Serializable value model for adapter-call arguments and results.
//!
//! Payloads crossing the process boundary are restricted to a closed set of
//! shapes: plain JSON primitives and containers pass through untouched,
//! while binary data, timestamps, and errors travel as tagged objects with
//! an explicit `__type` discriminant. The closed [`Value`] enum makes any
//! other payload shape unrepresentable at compile time; the one remaining
//! runtime hazard (non-finite floats) fails fast in [`Value::from_f64`].

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// A value that can cross the adapter-call boundary.
///
/// Wire representation: `Null`, `Bool`, `Number`, `String`, `Array`, and
/// `Object` serialize as plain JSON. The remaining variants serialize as
/// tagged objects:
///
/// - `Binary` as `{"__type": "Binary", "data": <base64>}`
/// - `Timestamp` as `{"__type": "Timestamp", "iso": <RFC 3339>}`
/// - `Error` as `{"__type": "Error", "name", "message", "stack"?, "code"?}`
///
/// Decoding reverses each tag to its native representation. An object whose
/// `__type` key carries an unrecognised tag is passed through as a plain
/// object.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// JSON `null`.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number. Integers are preserved exactly; non-finite floats are
    /// unrepresentable.
    Number(serde_json::Number),
    /// JSON string.
    String(String),
    /// Ordered list of values.
    Array(Vec<Self>),
    /// String-keyed map. Key order is not significant on the wire.
    Object(BTreeMap<String, Self>),
    /// Raw bytes, base64-encoded on the wire.
    Binary(Vec<u8>),
    /// Point in time, RFC 3339-encoded on the wire.
    Timestamp(OffsetDateTime),
    /// A structured error raised by an adapter.
    Error(ErrorValue),
}

impl Value {
    /// Builds a binary value from raw bytes.
    #[must_use]
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Binary(bytes.into())
    }

    /// Builds a timestamp value.
    #[must_use]
    pub const fn timestamp(instant: OffsetDateTime) -> Self {
        Self::Timestamp(instant)
    }

    /// Builds a number value from a float, rejecting NaN and infinities.
    ///
    /// Non-finite floats have no JSON representation and must fail at this
    /// boundary rather than silently coerce.
    #[must_use]
    pub fn from_f64(value: f64) -> Option<Self> {
        serde_json::Number::from_f64(value).map(Self::Number)
    }

    /// Returns `true` for [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the boolean payload, if this is a boolean.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the integer payload, if this is a number representable as `i64`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(number) => number.as_i64(),
            _ => None,
        }
    }

    /// Returns the string payload, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Returns the array payload, if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Returns the object payload, if this is an object.
    #[must_use]
    pub const fn as_object(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Object(entries) => Some(entries),
            _ => None,
        }
    }

    /// Returns the raw bytes, if this is a binary value.
    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(bytes) => Some(bytes.as_slice()),
            _ => None,
        }
    }

    /// Returns the error payload, if this is an error value.
    #[must_use]
    pub const fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(serde_json::Number::from(value))
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Number(serde_json::Number::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Self>) -> Self {
        Self::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Self>) -> Self {
        Self::Object(entries)
    }
}

impl From<OffsetDateTime> for Value {
    fn from(instant: OffsetDateTime) -> Self {
        Self::Timestamp(instant)
    }
}

impl From<ErrorValue> for Value {
    fn from(error: ErrorValue) -> Self {
        Self::Error(error)
    }
}

/// A structured error crossing the process boundary.
///
/// Carries the originating error's name and message, plus an optional stack
/// trace and machine-readable code when the raising side had them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    name: String,
    message: String,
    stack: Option<String>,
    code: Option<String>,
}

impl ErrorValue {
    /// Creates an error value with the given name and message.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            code: None,
        }
    }

    /// Attaches a stack trace.
    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attaches a machine-readable error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Returns the error name.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the error message.
    #[must_use]
    pub const fn message(&self) -> &str {
        self.message.as_str()
    }

    /// Returns the stack trace, when present.
    #[must_use]
    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    /// Returns the error code, when present.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorValue {}

#[derive(Serialize, Deserialize)]
enum BinaryTag {
    Binary,
}

#[derive(Serialize, Deserialize)]
enum TimestampTag {
    Timestamp,
}

#[derive(Serialize, Deserialize)]
enum ErrorTag {
    Error,
}

#[derive(Serialize, Deserialize)]
struct BinaryWire {
    #[serde(rename = "__type")]
    tag: BinaryTag,
    data: String,
}

#[derive(Serialize, Deserialize)]
struct TimestampWire {
    #[serde(rename = "__type")]
    tag: TimestampTag,
    iso: String,
}

#[derive(Serialize, Deserialize)]
struct ErrorWire {
    #[serde(rename = "__type")]
    tag: ErrorTag,
    name: String,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl Serialize for ErrorValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ErrorWire {
            tag: ErrorTag::Error,
            name: self.name.clone(),
            message: self.message.clone(),
            stack: self.stack.clone(),
            code: self.code.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ErrorValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = ErrorWire::deserialize(deserializer)?;
        Ok(Self {
            name: wire.name,
            message: wire.message,
            stack: wire.stack,
            code: wire.code,
        })
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(value) => serializer.serialize_bool(*value),
            Self::Number(number) => number.serialize(serializer),
            Self::String(value) => serializer.serialize_str(value),
            Self::Array(items) => items.serialize(serializer),
            Self::Object(entries) => entries.serialize(serializer),
            Self::Binary(bytes) => BinaryWire {
                tag: BinaryTag::Binary,
                data: BASE64.encode(bytes),
            }
            .serialize(serializer),
            Self::Timestamp(instant) => {
                let iso = instant
                    .format(&Rfc3339)
                    .map_err(serde::ser::Error::custom)?;
                TimestampWire {
                    tag: TimestampTag::Timestamp,
                    iso,
                }
                .serialize(serializer)
            }
            Self::Error(error) => error.serialize(serializer),
        }
    }
}

/// Intermediate decoding shape. The tagged variants are tried first so that
/// objects carrying a recognised `__type` discriminant are never mistaken
/// for plain maps; everything else falls through in declaration order.
#[derive(Deserialize)]
#[serde(untagged)]
enum ValueRepr {
    Error(ErrorValue),
    Binary(BinaryWire),
    Timestamp(TimestampWire),
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match ValueRepr::deserialize(deserializer)? {
            ValueRepr::Error(error) => Ok(Self::Error(error)),
            ValueRepr::Binary(wire) => BASE64
                .decode(wire.data.as_bytes())
                .map(Self::Binary)
                .map_err(|error| D::Error::custom(format!("invalid base64 payload: {error}"))),
            ValueRepr::Timestamp(wire) => OffsetDateTime::parse(&wire.iso, &Rfc3339)
                .map(Self::Timestamp)
                .map_err(|error| D::Error::custom(format!("invalid RFC 3339 timestamp: {error}"))),
            ValueRepr::Null => Ok(Self::Null),
            ValueRepr::Bool(value) => Ok(Self::Bool(value)),
            ValueRepr::Number(number) => Ok(Self::Number(number)),
            ValueRepr::String(value) => Ok(Self::String(value)),
            ValueRepr::Array(items) => Ok(Self::Array(items)),
            ValueRepr::Object(entries) => Ok(Self::Object(entries)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn roundtrip(value: &Value) -> Value {
        let json = serde_json::to_string(value).expect("serialize value");
        serde_json::from_str(&json).expect("deserialize value")
    }

    #[test]
    fn plain_json_values_pass_through() {
        let value = Value::Array(vec![
            Value::Null,
            Value::Bool(true),
            Value::from(42_i64),
            Value::from("hello"),
        ]);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn integers_survive_without_float_coercion() {
        let json = serde_json::to_string(&Value::from(42_i64)).expect("serialize");
        assert_eq!(json, "42");
    }

    #[test]
    fn binary_encodes_as_tagged_base64() {
        let value = Value::binary(vec![0_u8, 1, 2, 255]);
        let json = serde_json::to_string(&value).expect("serialize");
        assert!(json.contains(r#""__type":"Binary""#));
        assert!(json.contains(r#""data":"AAEC/w==""#));
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn timestamp_encodes_as_rfc3339() {
        let value = Value::timestamp(datetime!(2024-05-01 12:30:00 UTC));
        let json = serde_json::to_string(&value).expect("serialize");
        assert!(json.contains(r#""__type":"Timestamp""#));
        assert!(json.contains("2024-05-01T12:30:00Z"));
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn error_round_trips_with_optional_fields() {
        let bare = Value::Error(ErrorValue::new("Error", "boom"));
        assert_eq!(roundtrip(&bare), bare);

        let full = Value::Error(
            ErrorValue::new("TypeError", "bad input")
                .with_stack("at main")
                .with_code("E_BAD_INPUT"),
        );
        let json = serde_json::to_string(&full).expect("serialize");
        assert!(json.contains(r#""__type":"Error""#));
        assert!(json.contains(r#""code":"E_BAD_INPUT""#));
        assert_eq!(roundtrip(&full), full);
    }

    #[test]
    fn bare_error_omits_absent_fields() {
        let json =
            serde_json::to_string(&Value::Error(ErrorValue::new("Error", "x"))).expect("serialize");
        assert!(!json.contains("stack"));
        assert!(!json.contains("code"));
    }

    #[test]
    fn nested_special_values_round_trip() {
        let mut entries = BTreeMap::new();
        entries.insert("payload".to_owned(), Value::binary(b"abc".to_vec()));
        entries.insert(
            "when".to_owned(),
            Value::timestamp(datetime!(2023-01-15 08:00:00 UTC)),
        );
        entries.insert(
            "cause".to_owned(),
            Value::Error(ErrorValue::new("Error", "inner")),
        );
        let value = Value::Array(vec![Value::Object(entries)]);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn unknown_tag_passes_through_as_object() {
        let decoded: Value =
            serde_json::from_str(r#"{"__type":"Widget","data":"x"}"#).expect("deserialize");
        let object = decoded.as_object().expect("object passthrough");
        assert_eq!(
            object.get("__type").and_then(Value::as_str),
            Some("Widget")
        );
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let result: Result<Value, _> =
            serde_json::from_str(r#"{"__type":"Binary","data":"not base64!!"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn invalid_timestamp_is_rejected() {
        let result: Result<Value, _> =
            serde_json::from_str(r#"{"__type":"Timestamp","iso":"yesterday"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn non_finite_floats_fail_fast() {
        assert!(Value::from_f64(f64::NAN).is_none());
        assert!(Value::from_f64(f64::INFINITY).is_none());
        assert!(Value::from_f64(1.5).is_some());
    }
}
