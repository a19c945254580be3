//! Typed field values.

use std::cmp::Ordering;
use std::fmt;

use serde_json::{Map, Number, Value as Json};

use crate::error::{ModelError, ModelResult};
use crate::model::Model;
use crate::schema::FieldType;

/// A single typed value stored in a model field.
///
/// Values are validated against the declaring [`FieldType`] when a
/// [`Model`] is built, so accessors can rely on the variant matching the
/// schema.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string (also used for `ID`).
    String(String),
    /// Enumeration case name.
    Enum(String),
    /// ISO-8601 calendar date.
    Date(String),
    /// ISO-8601 date-time.
    DateTime(String),
    /// ISO-8601 time.
    Time(String),
    /// Epoch seconds.
    Timestamp(i64),
    /// Arbitrary JSON.
    Json(Json),
    /// List of values.
    List(Vec<FieldValue>),
    /// Embedded associated model.
    Model(Box<Model>),
}

impl FieldValue {
    /// Returns true for [`FieldValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "Bool",
            FieldValue::Int(_) => "Int",
            FieldValue::Double(_) => "Double",
            FieldValue::String(_) => "String",
            FieldValue::Enum(_) => "Enum",
            FieldValue::Date(_) => "Date",
            FieldValue::DateTime(_) => "DateTime",
            FieldValue::Time(_) => "Time",
            FieldValue::Timestamp(_) => "Timestamp",
            FieldValue::Json(_) => "Json",
            FieldValue::List(_) => "List",
            FieldValue::Model(_) => "Model",
        }
    }

    /// Returns the string payload of string-like variants.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s)
            | FieldValue::Enum(s)
            | FieldValue::Date(s)
            | FieldValue::DateTime(s)
            | FieldValue::Time(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload of `Int` and `Timestamp`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) | FieldValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns a numeric view of `Int`, `Timestamp` and `Double`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) | FieldValue::Timestamp(v) => Some(*v as f64),
            FieldValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the boolean payload.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the embedded model.
    pub fn as_model(&self) -> Option<&Model> {
        match self {
            FieldValue::Model(m) => Some(m),
            _ => None,
        }
    }

    /// Orders two values of compatible kinds.
    ///
    /// Numeric variants compare across `Int`/`Double`/`Timestamp`;
    /// string-like variants compare lexicographically, which is correct for
    /// ISO-8601 dates. Returns `None` for incomparable pairs, including any
    /// comparison against `Null`.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Bool(a), FieldValue::Bool(b)) => Some(a.cmp(b)),
            (FieldValue::List(a), FieldValue::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        ord => return Some(ord),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            (FieldValue::Json(a), FieldValue::Json(b)) => (a == b).then_some(Ordering::Equal),
            (FieldValue::Model(a), FieldValue::Model(b)) => {
                Some(a.identifier_string().cmp(&b.identifier_string()))
            }
            _ => {
                if let (Some(a), Some(b)) = (self.as_i64(), other.as_i64()) {
                    return Some(a.cmp(&b));
                }
                if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
                    return a.partial_cmp(&b);
                }
                match (self.as_str(), other.as_str()) {
                    (Some(a), Some(b)) => Some(a.cmp(b)),
                    _ => None,
                }
            }
        }
    }

    /// Equality used by predicates: numerics compare by value, models by
    /// identifier, `Null` equals only `Null`.
    pub fn loosely_equals(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => true,
            (FieldValue::Null, _) | (_, FieldValue::Null) => false,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }

    /// Converts to the JSON shape used on the wire and in storage.
    pub fn to_json(&self) -> Json {
        match self {
            FieldValue::Null => Json::Null,
            FieldValue::Bool(b) => Json::Bool(*b),
            FieldValue::Int(v) | FieldValue::Timestamp(v) => Json::Number((*v).into()),
            FieldValue::Double(v) => Number::from_f64(*v).map_or(Json::Null, Json::Number),
            FieldValue::String(s)
            | FieldValue::Enum(s)
            | FieldValue::Date(s)
            | FieldValue::DateTime(s)
            | FieldValue::Time(s) => Json::String(s.clone()),
            FieldValue::Json(v) => v.clone(),
            FieldValue::List(items) => Json::Array(items.iter().map(FieldValue::to_json).collect()),
            FieldValue::Model(m) => Json::Object(m.to_json_map()),
        }
    }

    /// Converts a scalar JSON value into the variant declared by `field_type`.
    ///
    /// Association types are handled by [`Model::from_json`]; passing one
    /// here is a type mismatch.
    pub fn from_json(field_type: &FieldType, json: &Json) -> ModelResult<FieldValue> {
        if json.is_null() {
            return Ok(FieldValue::Null);
        }
        let mismatch = || {
            ModelError::decoding(format!(
                "expected {}, got {}",
                field_type.graphql_name(),
                json_kind(json)
            ))
        };
        let value = match field_type {
            FieldType::Id | FieldType::String => FieldValue::String(json.as_str().ok_or_else(mismatch)?.to_owned()),
            FieldType::Enum(_) => FieldValue::Enum(json.as_str().ok_or_else(mismatch)?.to_owned()),
            FieldType::Date => FieldValue::Date(json.as_str().ok_or_else(mismatch)?.to_owned()),
            FieldType::DateTime => {
                FieldValue::DateTime(json.as_str().ok_or_else(mismatch)?.to_owned())
            }
            FieldType::Time => FieldValue::Time(json.as_str().ok_or_else(mismatch)?.to_owned()),
            FieldType::Int => FieldValue::Int(json.as_i64().ok_or_else(mismatch)?),
            FieldType::Timestamp => FieldValue::Timestamp(json.as_i64().ok_or_else(mismatch)?),
            FieldType::Double => FieldValue::Double(json.as_f64().ok_or_else(mismatch)?),
            FieldType::Bool => FieldValue::Bool(json.as_bool().ok_or_else(mismatch)?),
            FieldType::Json => match json {
                // AWSJSON travels as an encoded string.
                Json::String(s) => FieldValue::Json(serde_json::from_str(s)?),
                other => FieldValue::Json(other.clone()),
            },
            FieldType::List(inner) => {
                let items = json.as_array().ok_or_else(mismatch)?;
                FieldValue::List(
                    items
                        .iter()
                        .map(|item| FieldValue::from_json(inner, item))
                        .collect::<ModelResult<_>>()?,
                )
            }
            FieldType::Model(_) | FieldType::Collection(_) => return Err(mismatch()),
        };
        Ok(value)
    }

    /// Returns true when this value is acceptable for `field_type`.
    pub fn matches_type(&self, field_type: &FieldType) -> bool {
        match (self, field_type) {
            (FieldValue::Null, _) => true,
            (FieldValue::String(_), FieldType::Id | FieldType::String) => true,
            (FieldValue::Enum(_) | FieldValue::String(_), FieldType::Enum(_)) => true,
            (FieldValue::Date(_) | FieldValue::String(_), FieldType::Date) => true,
            (FieldValue::DateTime(_) | FieldValue::String(_), FieldType::DateTime) => true,
            (FieldValue::Time(_) | FieldValue::String(_), FieldType::Time) => true,
            (FieldValue::Int(_), FieldType::Int) => true,
            (FieldValue::Int(_) | FieldValue::Timestamp(_), FieldType::Timestamp) => true,
            (FieldValue::Double(_) | FieldValue::Int(_), FieldType::Double) => true,
            (FieldValue::Bool(_), FieldType::Bool) => true,
            (FieldValue::Json(_), FieldType::Json) => true,
            (FieldValue::List(items), FieldType::List(inner)) => {
                items.iter().all(|item| item.matches_type(inner))
            }
            (FieldValue::Model(m), FieldType::Model(name)) => m.model_name() == name,
            // Unjoined to-one references hold the parent identifier.
            (FieldValue::String(_), FieldType::Model(_)) => true,
            _ => false,
        }
    }

    /// Rewrites loosely typed input (plain strings, ints) into the canonical
    /// variant for `field_type`.
    pub fn normalize(self, field_type: &FieldType) -> FieldValue {
        match (self, field_type) {
            (FieldValue::String(s), FieldType::Enum(_)) => FieldValue::Enum(s),
            (FieldValue::String(s), FieldType::Date) => FieldValue::Date(s),
            (FieldValue::String(s), FieldType::DateTime) => FieldValue::DateTime(s),
            (FieldValue::String(s), FieldType::Time) => FieldValue::Time(s),
            (FieldValue::Int(v), FieldType::Timestamp) => FieldValue::Timestamp(v),
            (FieldValue::Int(v), FieldType::Double) => FieldValue::Double(v as f64),
            (FieldValue::List(items), FieldType::List(inner)) => {
                FieldValue::List(items.into_iter().map(|i| i.normalize(inner)).collect())
            }
            (value, _) => value,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Int(v) | FieldValue::Timestamp(v) => write!(f, "{v}"),
            FieldValue::Double(v) => write!(f, "{v}"),
            FieldValue::String(s)
            | FieldValue::Enum(s)
            | FieldValue::Date(s)
            | FieldValue::DateTime(s)
            | FieldValue::Time(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

pub(crate) fn json_kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// JSON object map used for model encodings.
pub type JsonMap = Map<String, Json>;

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Double(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<Model> for FieldValue {
    fn from(value: Model) -> Self {
        FieldValue::Model(Box::new(value))
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_cross_compare() {
        assert_eq!(FieldValue::Int(2).compare(&FieldValue::Double(2.5)), Some(Ordering::Less));
        assert_eq!(
            FieldValue::Timestamp(10).compare(&FieldValue::Int(10)),
            Some(Ordering::Equal)
        );
        assert_eq!(FieldValue::Int(1).compare(&FieldValue::String("1".into())), None);
        assert_eq!(FieldValue::Null.compare(&FieldValue::Null), None);
    }

    #[test]
    fn null_equality() {
        assert!(FieldValue::Null.loosely_equals(&FieldValue::Null));
        assert!(!FieldValue::Null.loosely_equals(&FieldValue::Int(0)));
        assert!(FieldValue::from("a").loosely_equals(&FieldValue::Enum("a".into())));
    }

    #[test]
    fn json_conversion_by_type() {
        let v = FieldValue::from_json(&FieldType::Int, &json!(42)).unwrap();
        assert_eq!(v, FieldValue::Int(42));

        let v = FieldValue::from_json(&FieldType::Json, &json!("{\"a\":1}")).unwrap();
        assert_eq!(v, FieldValue::Json(json!({"a": 1})));

        let v = FieldValue::from_json(&FieldType::List(Box::new(FieldType::String)), &json!(["a", "b"]))
            .unwrap();
        assert_eq!(v.to_json(), json!(["a", "b"]));

        assert!(FieldValue::from_json(&FieldType::Bool, &json!("yes")).is_err());
    }

    #[test]
    fn normalize_string_inputs() {
        let v = FieldValue::from("2024-01-01").normalize(&FieldType::Date);
        assert_eq!(v, FieldValue::Date("2024-01-01".into()));
        assert!(v.matches_type(&FieldType::Date));
        assert!(!FieldValue::Bool(true).matches_type(&FieldType::Int));
    }
}
