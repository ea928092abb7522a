//! Host-side value type exchanged with the engine.
//!
//! [`HostValue`] covers plain data that is copied across the boundary by value
//! and handle-backed values (live host objects, host functions, pinned engine
//! values) that are passed by reference. Which path a mapping takes is decided
//! by the variant the caller picks: [`HostValue::Object`] is copied into a plain
//! engine object, [`HostValue::HostObject`] becomes a live facade.

use crate::error::{Error, Result};
use crate::runtime::facade::HostObjectRef;
use crate::runtime::function::HostFunction;
use crate::runtime::pins::{EngineRef, JsFunction};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Default maximum nesting depth for value conversion
pub const MAX_JS_DEPTH: usize = 100;
/// Default maximum size in bytes for value conversion
pub const MAX_JS_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Largest integer magnitude a double represents exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Value exchanged between host code and the engine.
///
/// `null` and `undefined` both convert to [`HostValue::Null`]; the distinction
/// is not preserved. Numbers compare by value across `Int` and `Float`, since
/// the engine has a single number type.
#[derive(Clone)]
pub enum HostValue {
    Null,
    Bool(bool),
    /// Integers beyond +/-(2^53 - 1) cross the boundary as `BigInt`.
    Int(i64),
    Float(f64),
    String(String),
    /// Binary data; becomes a `Uint8Array` in script.
    Bytes(Vec<u8>),
    Array(Vec<HostValue>),
    /// By-value mapping; becomes a plain object (insertion order kept).
    Object(IndexMap<String, HostValue>),
    /// Live host object exposed through a facade.
    HostObject(HostObjectRef),
    /// Host function callable from script.
    Function(HostFunction),
    /// Script function captured as a callable token.
    JsFunction(JsFunction),
    /// Any other pinned engine value (promises, facades of foreign objects, ...).
    Engine(EngineRef),
}

impl HostValue {
    /// Build an object from key/value pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, HostValue)>,
    {
        HostValue::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Wrap a live host object.
    pub fn host_object<T: crate::runtime::facade::HostObject>(object: Arc<T>) -> Self {
        HostValue::HostObject(object)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integral value, accepting floats without a fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HostValue::Int(i) => Some(*i),
            HostValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Int(i) => Some(*i as f64),
            HostValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            HostValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[HostValue]> {
        match self {
            HostValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, HostValue>> {
        match self {
            HostValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_js_function(&self) -> Option<&JsFunction> {
        match self {
            HostValue::JsFunction(f) => Some(f),
            _ => None,
        }
    }

    /// Member lookup on a by-value object.
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Short name of the variant, used in conversion errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Null => "null",
            HostValue::Bool(_) => "bool",
            HostValue::Int(_) => "int",
            HostValue::Float(_) => "float",
            HostValue::String(_) => "string",
            HostValue::Bytes(_) => "bytes",
            HostValue::Array(_) => "array",
            HostValue::Object(_) => "object",
            HostValue::HostObject(_) => "host object",
            HostValue::Function(_) => "host function",
            HostValue::JsFunction(_) => "function",
            HostValue::Engine(_) => "engine value",
        }
    }

    /// Whether the value is plain data that can be serialized.
    pub fn is_data(&self) -> bool {
        match self {
            HostValue::Null
            | HostValue::Bool(_)
            | HostValue::Int(_)
            | HostValue::Float(_)
            | HostValue::String(_)
            | HostValue::Bytes(_) => true,
            HostValue::Array(items) => items.iter().all(HostValue::is_data),
            HostValue::Object(map) => map.values().all(HostValue::is_data),
            _ => false,
        }
    }

    /// Convert plain data into JSON.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Human-readable rendering used for console output.
    ///
    /// Top-level strings are printed raw; nested strings are quoted.
    pub fn display_string(&self) -> String {
        match self {
            HostValue::String(s) => s.clone(),
            other => {
                let mut out = String::new();
                other.write_nested(&mut out);
                out
            }
        }
    }

    fn write_nested(&self, out: &mut String) {
        use std::fmt::Write;
        match self {
            HostValue::Null => out.push_str("null"),
            HostValue::Bool(b) => {
                let _ = write!(out, "{}", b);
            }
            HostValue::Int(i) => {
                let _ = write!(out, "{}", i);
            }
            HostValue::Float(f) => out.push_str(&format_number(*f)),
            HostValue::String(s) => {
                let _ = write!(out, "{:?}", s);
            }
            HostValue::Bytes(b) => {
                let _ = write!(out, "Uint8Array({}) {:?}", b.len(), b);
            }
            HostValue::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_nested(out);
                }
                out.push(']');
            }
            HostValue::Object(map) => {
                if map.is_empty() {
                    out.push_str("{}");
                    return;
                }
                out.push_str("{ ");
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(key);
                    out.push_str(": ");
                    value.write_nested(out);
                }
                out.push_str(" }");
            }
            HostValue::HostObject(obj) => {
                let _ = write!(out, "[{}]", obj.type_name());
            }
            HostValue::Function(f) => {
                let _ = write!(out, "[Function: {}]", f.name());
            }
            HostValue::JsFunction(_) => out.push_str("[Function]"),
            HostValue::Engine(_) => out.push_str("[object]"),
        }
    }
}

/// Format a double the way script prints numbers.
pub(crate) fn format_number(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if value == 0.0 {
        "0".to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e21 {
        format!("{}", value as i128)
    } else {
        format!("{}", value)
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Null => f.write_str("Null"),
            HostValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            HostValue::Int(i) => f.debug_tuple("Int").field(i).finish(),
            HostValue::Float(x) => f.debug_tuple("Float").field(x).finish(),
            HostValue::String(s) => f.debug_tuple("String").field(s).finish(),
            HostValue::Bytes(b) => f.debug_tuple("Bytes").field(b).finish(),
            HostValue::Array(items) => f.debug_tuple("Array").field(items).finish(),
            HostValue::Object(map) => f.debug_tuple("Object").field(map).finish(),
            HostValue::HostObject(obj) => f.debug_tuple("HostObject").field(&obj.type_name()).finish(),
            HostValue::Function(func) => f.debug_tuple("Function").field(&func.name()).finish(),
            HostValue::JsFunction(func) => f.debug_tuple("JsFunction").field(&func.id()).finish(),
            HostValue::Engine(value) => f.debug_tuple("Engine").field(&value.id()).finish(),
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        use HostValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
            (String(a), String(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            // Key order is irrelevant for equality.
            (Object(a), Object(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
            }
            (HostObject(a), HostObject(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (Function(a), Function(b)) => a.same_function(b),
            (JsFunction(a), JsFunction(b)) => a.id() == b.id(),
            (Engine(a), Engine(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        HostValue::Int(value as i64)
    }
}

impl From<u32> for HostValue {
    fn from(value: u32) -> Self {
        HostValue::Int(value as i64)
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        HostValue::Int(value)
    }
}

impl From<usize> for HostValue {
    fn from(value: usize) -> Self {
        match i64::try_from(value) {
            Ok(v) => HostValue::Int(v),
            Err(_) => HostValue::Float(value as f64),
        }
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Float(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(value: Vec<u8>) -> Self {
        HostValue::Bytes(value)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(value: Vec<HostValue>) -> Self {
        HostValue::Array(value)
    }
}

impl From<IndexMap<String, HostValue>> for HostValue {
    fn from(value: IndexMap<String, HostValue>) -> Self {
        HostValue::Object(value)
    }
}

impl From<HostFunction> for HostValue {
    fn from(value: HostFunction) -> Self {
        HostValue::Function(value)
    }
}

impl From<JsFunction> for HostValue {
    fn from(value: JsFunction) -> Self {
        HostValue::JsFunction(value)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(HostValue::Null)
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(b) => HostValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => HostValue::Int(i),
                None => HostValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => HostValue::String(s),
            serde_json::Value::Array(items) => {
                HostValue::Array(items.into_iter().map(HostValue::from).collect())
            }
            serde_json::Value::Object(map) => HostValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, HostValue::from(v)))
                    .collect(),
            ),
        }
    }
}

// Manual Serialize implementation that errors on handle-backed variants
impl Serialize for HostValue {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::Error;
        match self {
            HostValue::Null => serializer.serialize_none(),
            HostValue::Bool(b) => serializer.serialize_bool(*b),
            HostValue::Int(i) => serializer.serialize_i64(*i),
            HostValue::Float(f) => serializer.serialize_f64(*f),
            HostValue::String(s) => serializer.serialize_str(s),
            HostValue::Bytes(b) => b.serialize(serializer),
            HostValue::Array(arr) => arr.serialize(serializer),
            HostValue::Object(obj) => obj.serialize(serializer),
            other => Err(Error::custom(format!(
                "Cannot serialize {}. Handle-backed values must be used through the runtime, not serialized.",
                other.type_name()
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for HostValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct HostValueVisitor;

        impl<'de> Visitor<'de> for HostValueVisitor {
            type Value = HostValue;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a plain value (null, bool, number, string, bytes, array, or object)")
            }

            fn visit_bool<E>(self, value: bool) -> std::result::Result<Self::Value, E> {
                Ok(HostValue::Bool(value))
            }

            fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E> {
                Ok(HostValue::Int(value))
            }

            fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E> {
                if value <= i64::MAX as u64 {
                    Ok(HostValue::Int(value as i64))
                } else {
                    Ok(HostValue::Float(value as f64))
                }
            }

            fn visit_f64<E>(self, value: f64) -> std::result::Result<Self::Value, E> {
                Ok(HostValue::Float(value))
            }

            fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E> {
                Ok(HostValue::String(value.to_owned()))
            }

            fn visit_string<E>(self, value: String) -> std::result::Result<Self::Value, E> {
                Ok(HostValue::String(value))
            }

            fn visit_bytes<E>(self, value: &[u8]) -> std::result::Result<Self::Value, E> {
                Ok(HostValue::Bytes(value.to_vec()))
            }

            fn visit_byte_buf<E>(self, value: Vec<u8>) -> std::result::Result<Self::Value, E> {
                Ok(HostValue::Bytes(value))
            }

            fn visit_none<E>(self) -> std::result::Result<Self::Value, E> {
                Ok(HostValue::Null)
            }

            fn visit_unit<E>(self) -> std::result::Result<Self::Value, E> {
                Ok(HostValue::Null)
            }

            fn visit_some<D>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                HostValue::deserialize(deserializer)
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut vec = Vec::new();
                while let Some(elem) = seq.next_element()? {
                    vec.push(elem);
                }
                Ok(HostValue::Array(vec))
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut obj = IndexMap::new();
                while let Some((key, value)) = map.next_entry()? {
                    obj.insert(key, value);
                }
                Ok(HostValue::Object(obj))
            }
        }

        deserializer.deserialize_any(HostValueVisitor)
    }
}

/// Tracks depth and size limits during value conversion.
///
/// Used in both directions so a deeply nested or huge value fails with a
/// conversion error instead of exhausting the stack or the heap.
pub struct LimitTracker {
    max_depth: usize,
    max_bytes: usize,
    current_depth: usize,
    current_bytes: usize,
}

impl LimitTracker {
    /// Create a new limit tracker with the specified limits.
    pub fn new(max_depth: usize, max_bytes: usize) -> Self {
        Self {
            max_depth,
            max_bytes,
            current_depth: 0,
            current_bytes: 0,
        }
    }

    /// Enter a new depth level.
    pub fn enter(&mut self) -> Result<()> {
        self.current_depth += 1;
        if self.current_depth > self.max_depth {
            return Err(Error::conversion(format!(
                "Depth exceeded maximum limit of {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    /// Exit a depth level.
    pub fn exit(&mut self) {
        self.current_depth = self.current_depth.saturating_sub(1);
    }

    /// Add to the byte count.
    pub fn add_bytes(&mut self, bytes: usize) -> Result<()> {
        self.current_bytes = self.current_bytes.saturating_add(bytes);
        if self.current_bytes > self.max_bytes {
            return Err(Error::conversion(format!(
                "Size ({} bytes) exceeded maximum limit of {} bytes",
                self.current_bytes, self.max_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality_across_variants() {
        assert_eq!(HostValue::Int(3), HostValue::Float(3.0));
        assert_eq!(HostValue::Float(3.0), HostValue::Int(3));
        assert_ne!(HostValue::Int(3), HostValue::Float(3.5));
        assert_ne!(HostValue::Float(f64::NAN), HostValue::Float(f64::NAN));
    }

    #[test]
    fn test_object_equality_ignores_order() {
        let a = HostValue::object([("x", HostValue::Int(1)), ("y", HostValue::Bool(true))]);
        let b = HostValue::object([("y", HostValue::Bool(true)), ("x", HostValue::Int(1))]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_serialize_rejects_functions() {
        let f = HostFunction::new("noop", 0, |_| Ok(HostValue::Null));
        let value = HostValue::Array(vec![HostValue::Int(1), HostValue::Function(f)]);
        let err = serde_json::to_string(&value).unwrap_err();
        assert!(err.to_string().contains("host function"));
        assert!(!value.is_data());
    }

    #[test]
    fn test_json_round_trip() {
        let json = serde_json::json!({"a": [1, 2, {"b": true}], "c": null, "d": 1.5});
        let value = HostValue::from(json.clone());
        assert!(value.is_data());
        assert_eq!(value.to_json().unwrap(), json);

        let parsed: HostValue = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, value);
    }

    #[test]
    fn test_display_string() {
        let value = HostValue::object([
            ("name", HostValue::from("ada")),
            ("tags", HostValue::Array(vec![HostValue::from("x"), HostValue::Float(1.5)])),
        ]);
        assert_eq!(value.display_string(), r#"{ name: "ada", tags: ["x", 1.5] }"#);
        assert_eq!(HostValue::from("plain").display_string(), "plain");
        assert_eq!(HostValue::Float(f64::NEG_INFINITY).display_string(), "-Infinity");
        assert_eq!(HostValue::Float(2.0).display_string(), "2");
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(HostValue::from(None::<i64>), HostValue::Null);
        assert_eq!(HostValue::from(Some("x")), HostValue::from("x"));
    }

    #[test]
    fn test_limit_tracker_depth_exceeded() {
        let mut tracker = LimitTracker::new(3, 1000);

        assert!(tracker.enter().is_ok()); // depth 1
        assert!(tracker.enter().is_ok()); // depth 2
        assert!(tracker.enter().is_ok()); // depth 3
        assert!(matches!(tracker.enter(), Err(Error::Conversion(_)))); // depth 4
    }

    #[test]
    fn test_limit_tracker_size_exceeded() {
        let mut tracker = LimitTracker::new(10, 100);

        assert!(tracker.add_bytes(50).is_ok());
        assert!(tracker.add_bytes(40).is_ok());
        assert!(tracker.add_bytes(20).is_err()); // Total 110 - should fail
    }
}
