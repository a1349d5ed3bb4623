//! Values carried by events.
//!
//! Host programs publish plain scalars and batches; instruments publish derived
//! quantities, progress bars and verification flags. Everything is serializable
//! so an event stream can be dumped as JSON lines.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::collaborators::GpuReading;
use crate::probe::{LoaderDescriptor, SpanRecord};

/// Possible values an event can hold.
///
/// # Examples
///
/// ```
/// use runprobe::Value;
///
/// let rate = Value::quantity(812.5, "items/s");
/// assert_eq!(rate.as_float(), Some(812.5));
/// assert_eq!(rate.to_string(), "812.5 items/s");
///
/// let batch = Value::List(vec![Value::Batch { len: 32 }, Value::Batch { len: 32 }]);
/// assert_eq!(batch.batch_len(), Some(32));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// A flag, e.g. a verification result.
    Bool(bool),
    /// A count.
    Int(i64),
    /// A plain number, e.g. a loss.
    Float(f64),
    /// Free text.
    String(String),
    /// A measured number with units, e.g. a throughput.
    Quantity {
        /// Magnitude.
        value: f64,
        /// Units, e.g. `items/s`.
        units: String,
    },
    /// A progress-bar shaped value.
    Progress {
        /// Steps done.
        progress: u64,
        /// Steps expected.
        total: u64,
        /// Label.
        descr: String,
    },
    /// An opaque batch of `len` items.
    Batch {
        /// Items in the batch.
        len: usize,
    },
    /// Ordered values, e.g. an `(inputs, targets)` pair.
    List(Vec<Value>),
    /// Named fields.
    Record(BTreeMap<String, Value>),
    /// One edge of a probe span.
    Span(SpanRecord),
    /// Per-device GPU readings from one poll.
    Gpu(Vec<GpuReading>),
    /// A data loader announced by the host.
    Loader(LoaderDescriptor),
    /// No value.
    Null,
}

impl Value {
    /// Creates a quantity with units.
    #[must_use]
    pub fn quantity(value: f64, units: impl Into<String>) -> Self {
        Self::Quantity {
            value,
            units: units.into(),
        }
    }

    /// Returns true for `Bool`.
    #[must_use]
    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    /// Returns true for `Null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true for `Progress`.
    #[must_use]
    pub const fn is_progress(&self) -> bool {
        matches!(self, Self::Progress { .. })
    }

    /// The flag of a `Bool`.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The count of an `Int`.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view: floats, ints and quantities.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Quantity { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// The text of a `String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// The span edge of a `Span`.
    #[must_use]
    pub const fn as_span(&self) -> Option<&SpanRecord> {
        match self {
            Self::Span(v) => Some(v),
            _ => None,
        }
    }

    /// The descriptor of a `Loader`.
    #[must_use]
    pub const fn as_loader(&self) -> Option<&LoaderDescriptor> {
        match self {
            Self::Loader(v) => Some(v),
            _ => None,
        }
    }

    /// Field lookup on records.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Record(fields) => fields.get(key),
            _ => None,
        }
    }

    /// Number of items in a batch-like value.
    ///
    /// A `Batch` reports its own length. A `List` is treated as a tuple of
    /// batch tensors (inputs, targets, ...) and reports the length of its first
    /// element. Anything else is not batch-like.
    #[must_use]
    pub fn batch_len(&self) -> Option<usize> {
        match self {
            Self::Batch { len } => Some(*len),
            Self::List(items) => match items.first()? {
                Self::Batch { len } => Some(*len),
                Self::List(inner) => Some(inner.len()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Quantity { .. } => "quantity",
            Self::Progress { .. } => "progress",
            Self::Batch { .. } => "batch",
            Self::List(_) => "list",
            Self::Record(_) => "record",
            Self::Span(_) => "span",
            Self::Gpu(_) => "gpu",
            Self::Loader(_) => "loader",
            Self::Null => "null",
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::Quantity { value, units } => write!(f, "{value} {units}"),
            Self::Progress { progress, total, descr } => write!(f, "[{descr}] {progress}/{total}"),
            Self::Batch { len } => write!(f, "<batch of {len}>"),
            Self::List(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().take(10).enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() > 10 {
                    f.write_str(", ...")?;
                }
                f.write_str("]")
            }
            Self::Record(fields) => {
                f.write_str("{")?;
                for (idx, (k, v)) in fields.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Self::Span(span) => write!(f, "<span {} {:?}>", span.site, span.edge),
            Self::Gpu(devices) => write!(f, "<{} gpu readings>", devices.len()),
            Self::Loader(loader) => write!(f, "<loader {}>", loader.name),
            Self::Null => f.write_str("null"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_len_of_tuple_uses_first_element() {
        let v = Value::List(vec![Value::Batch { len: 64 }, Value::Batch { len: 1 }]);
        assert_eq!(v.batch_len(), Some(64));
    }

    #[test]
    fn test_batch_len_rejects_scalars() {
        assert_eq!(Value::Float(1.0).batch_len(), None);
        assert_eq!(Value::List(vec![]).batch_len(), None);
    }

    #[test]
    fn test_as_float_covers_quantities() {
        assert_eq!(Value::Int(3).as_float(), Some(3.0));
        assert_eq!(Value::quantity(2.5, "items/s").as_float(), Some(2.5));
        assert_eq!(Value::Bool(true).as_float(), None);
    }

    #[test]
    fn test_record_lookup() {
        let mut fields = BTreeMap::new();
        fields.insert("batch_size".to_string(), Value::Int(8));
        let v = Value::Record(fields);
        assert_eq!(v.get("batch_size"), Some(&Value::Int(8)));
        assert_eq!(v.get("missing"), None);
    }

    #[test]
    fn test_display_progress() {
        let v = Value::Progress {
            progress: 2,
            total: 10,
            descr: "train".to_string(),
        };
        assert_eq!(v.to_string(), "[train] 2/10");
    }

    #[test]
    fn test_serde_roundtrip_quantity() {
        let v = Value::quantity(10.0, "items/s");
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains("quantity"));
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
