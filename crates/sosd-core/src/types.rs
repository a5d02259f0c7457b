//! Core data model shared by the store, registry, and wire protocol.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Globally unique identifier for pubs, fields, clients, and queries.
pub type Guid = u64;

/// Seconds since the Unix epoch, as carried in `time_*` columns.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Declared type of a field. The integer codes appear on the wire and in
/// the `val_type` / `value_type` query columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValType {
    Int,
    Long,
    Double,
    String,
    Bytes,
}

impl ValType {
    pub fn code(self) -> i32 {
        match self {
            ValType::Int => 0,
            ValType::Long => 1,
            ValType::Double => 2,
            ValType::String => 3,
            ValType::Bytes => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ValType::Int),
            1 => Some(ValType::Long),
            2 => Some(ValType::Double),
            3 => Some(ValType::String),
            4 => Some(ValType::Bytes),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValType::Int => "INT",
            ValType::Long => "LONG",
            ValType::Double => "DOUBLE",
            ValType::String => "STRING",
            ValType::Bytes => "BYTES",
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn val_type(&self) -> ValType {
        match self {
            Value::Int(_) => ValType::Int,
            Value::Long(_) => ValType::Long,
            Value::Double(_) => ValType::Double,
            Value::String(_) => ValType::String,
            Value::Bytes(_) => ValType::Bytes,
        }
    }

    /// Build a value from a wire type code and its JSON encoding.
    ///
    /// Returns `None` when the code is unknown or the JSON does not fit it.
    pub fn from_wire(type_code: i32, raw: &serde_json::Value) -> Option<Self> {
        match ValType::from_code(type_code)? {
            ValType::Int => raw
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Value::Int),
            ValType::Long => raw.as_i64().map(Value::Long),
            ValType::Double => raw.as_f64().map(Value::Double),
            ValType::String => raw.as_str().map(|s| Value::String(s.to_string())),
            ValType::Bytes => {
                let items = raw.as_array()?;
                items
                    .iter()
                    .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .map(Value::Bytes)
            }
        }
    }

    /// JSON encoding of the payload, the inverse of [`Value::from_wire`].
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Value::Int(v) => serde_json::Value::from(*v),
            Value::Long(v) => serde_json::Value::from(*v),
            Value::Double(v) => serde_json::Value::from(*v),
            Value::String(v) => serde_json::Value::from(v.as_str()),
            Value::Bytes(v) => serde_json::Value::from(v.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Double(v) => f.write_str(&format_double(*v)),
            Value::String(v) => f.write_str(v),
            Value::Bytes(v) => {
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Text form of a double: integral values keep one decimal place.
pub fn format_double(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        v.to_string()
    }
}

/// Semantic tag attached to a field.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Semantic {
    #[default]
    Default,
    TimeStart,
    TimeStop,
    TimeStamp,
    TimeSpan,
    Sample,
    Counter,
    Log,
}

impl Semantic {
    pub fn code(self) -> i64 {
        self as i64
    }
}

/// What kind of work a pub reports on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nature {
    #[default]
    Default,
    CreateInput,
    CreateOutput,
    CreateViz,
    ExecWork,
    Buffer,
    SupportExec,
    SupportFlow,
    ControlFlow,
    Sos,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    #[default]
    App,
    Os,
    Lib,
    Environment,
    SosRuntime,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Default,
    Low,
    Immediate,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    Default,
    #[serde(rename = "self")]
    SelfOnly,
    Node,
    Enclave,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retain {
    #[default]
    Default,
    Session,
    Immediate,
}

/// Publisher hints. Stored and queryable, never interpreted by the daemon.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubMeta {
    pub channel: i32,
    pub nature: Nature,
    pub layer: Layer,
    pub pri_hint: Priority,
    pub scope_hint: Scope,
    pub retain_hint: Retain,
}

/// Descriptive attributes of a pub, as announced by its client.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubInfo {
    pub title: String,
    pub process_id: i64,
    pub thread_id: i64,
    pub comm_rank: i64,
    pub node_id: String,
    pub prog_name: String,
    pub prog_ver: String,
    pub pragma: String,
    pub meta: PubMeta,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_val_type_codes_roundtrip() {
        for t in [
            ValType::Int,
            ValType::Long,
            ValType::Double,
            ValType::String,
            ValType::Bytes,
        ] {
            assert_eq!(ValType::from_code(t.code()), Some(t));
        }
        assert_eq!(ValType::from_code(5), None);
        assert_eq!(ValType::from_code(-1), None);
    }

    #[test]
    fn test_double_formatting() {
        assert_eq!(Value::Double(3.14).to_string(), "3.14");
        assert_eq!(Value::Double(1.0).to_string(), "1.0");
        assert_eq!(Value::Double(-2.0).to_string(), "-2.0");
        assert_eq!(Value::Double(0.5).to_string(), "0.5");
    }

    #[test]
    fn test_value_text_forms() {
        assert_eq!(Value::Int(-7).to_string(), "-7");
        assert_eq!(Value::Long(1 << 40).to_string(), "1099511627776");
        assert_eq!(Value::String("hi".into()).to_string(), "hi");
        assert_eq!(Value::Bytes(vec![0x0a, 0xff]).to_string(), "0aff");
    }

    #[test]
    fn test_from_wire_checks_shape() {
        let int = serde_json::json!(42);
        assert_eq!(Value::from_wire(0, &int), Some(Value::Int(42)));
        assert_eq!(Value::from_wire(1, &int), Some(Value::Long(42)));
        assert_eq!(Value::from_wire(2, &int), Some(Value::Double(42.0)));
        assert_eq!(Value::from_wire(3, &int), None);
        assert_eq!(Value::from_wire(9, &int), None);

        let too_big = serde_json::json!(i64::MAX);
        assert_eq!(Value::from_wire(0, &too_big), None);

        let bytes = serde_json::json!([1, 2, 255]);
        assert_eq!(Value::from_wire(4, &bytes), Some(Value::Bytes(vec![1, 2, 255])));
        assert_eq!(Value::from_wire(4, &serde_json::json!([256])), None);
    }

    #[test]
    fn test_wire_encoding_inverts() {
        let v = Value::String("x".into());
        assert_eq!(Value::from_wire(v.val_type().code(), &v.to_wire()), Some(v));
    }
}
