//! Conversion between serde-serializable values and DynamoDB attribute maps.
//!
//! Every record in the table is a map of attribute values. User state and
//! event types derive `Serialize`/`Deserialize`; this module bridges them to
//! `AttributeValue` maps by way of `serde_json::Value`. Attribute names come
//! from the serde field names, so `#[serde(rename = "...")]` controls the
//! stored attribute name.
//!
//! Decoding applies the number policy shared with the outbound bridge: a
//! numeric attribute becomes an `i64` if it parses as one (signs honored),
//! otherwise an `f64`, otherwise an error. `"0.0"` stays a float.

use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;
use base64::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// A DynamoDB record: attribute name to attribute value.
pub type Item = HashMap<String, AttributeValue>;

/// Errors from encoding or decoding records.
///
/// These are always structural: a value that cannot be represented as an
/// item, or an item that does not fit the expected shape. There is no lossy
/// fallback.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("value is not a map and cannot be stored as an item")]
    NotAnItem,

    #[error("failed to serialize value: {0}")]
    Serialize(String),

    #[error("failed to deserialize item: {0}")]
    Deserialize(String),

    #[error("invalid number {0:?}: not an i64 or f64")]
    InvalidNumber(String),

    #[error("unsupported attribute type for {0:?}")]
    UnsupportedAttribute(String),
}

/// Marshal a value to an attribute map.
///
/// The value must serialize to a map (a struct or a `serde_json` object);
/// anything else is a [`CodecError::NotAnItem`].
pub fn to_item<T: Serialize + ?Sized>(value: &T) -> Result<Item, CodecError> {
    let json = serde_json::to_value(value).map_err(|e| CodecError::Serialize(e.to_string()))?;
    match json {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(name, value)| (name, to_attribute(value)))
            .collect()),
        _ => Err(CodecError::NotAnItem),
    }
}

/// Unmarshal an attribute map into a value.
///
/// Attributes the target type does not declare are ignored; absent
/// attributes follow the target's serde defaults.
pub fn from_item<T: DeserializeOwned>(item: &Item) -> Result<T, CodecError> {
    let json = Value::Object(item_to_json(item)?);
    serde_json::from_value(json).map_err(|e| CodecError::Deserialize(e.to_string()))
}

/// Convert an attribute map to a JSON object, applying the number policy.
pub fn item_to_json(item: &Item) -> Result<serde_json::Map<String, Value>, CodecError> {
    item.iter()
        .map(|(name, attr)| Ok((name.clone(), from_attribute(attr)?)))
        .collect()
}

/// Convert a JSON value to an attribute value.
pub fn to_attribute(value: Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s),
        Value::Array(items) => AttributeValue::L(items.into_iter().map(to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(
            map.into_iter()
                .map(|(name, value)| (name, to_attribute(value)))
                .collect(),
        ),
    }
}

/// Convert an attribute value to a JSON value.
///
/// Binary attributes become base64 strings, binary sets lists of base64
/// strings, and string/number sets lists of strings, matching what the
/// outbound bridge publishes.
pub fn from_attribute(attr: &AttributeValue) -> Result<Value, CodecError> {
    match attr {
        AttributeValue::S(s) => Ok(Value::String(s.clone())),
        AttributeValue::N(n) => parse_number(n),
        AttributeValue::Bool(b) => Ok(Value::Bool(*b)),
        AttributeValue::Null(_) => Ok(Value::Null),
        AttributeValue::B(blob) => Ok(Value::String(BASE64_STANDARD.encode(blob.as_ref()))),
        AttributeValue::L(list) => Ok(Value::Array(
            list.iter()
                .map(from_attribute)
                .collect::<Result<Vec<_>, _>>()?,
        )),
        AttributeValue::M(map) => Ok(Value::Object(
            map.iter()
                .map(|(name, value)| Ok((name.clone(), from_attribute(value)?)))
                .collect::<Result<serde_json::Map<_, _>, CodecError>>()?,
        )),
        AttributeValue::Ss(values) => Ok(Value::Array(
            values.iter().cloned().map(Value::String).collect(),
        )),
        AttributeValue::Ns(values) => Ok(Value::Array(
            values.iter().cloned().map(Value::String).collect(),
        )),
        AttributeValue::Bs(blobs) => Ok(Value::Array(
            blobs
                .iter()
                .map(|blob| Value::String(BASE64_STANDARD.encode(blob.as_ref())))
                .collect(),
        )),
        other => Err(CodecError::UnsupportedAttribute(format!("{other:?}"))),
    }
}

/// Parse a DynamoDB decimal string, preferring i64 over f64.
fn parse_number(n: &str) -> Result<Value, CodecError> {
    if let Ok(i) = n.parse::<i64>() {
        return Ok(Value::Number(i.into()));
    }
    if let Ok(f) = n.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(f) {
            return Ok(Value::Number(number));
        }
    }
    Err(CodecError::InvalidNumber(n.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: i64,
        ratio: f64,
        enabled: bool,
        tags: Vec<String>,
        #[serde(rename = "renamedField")]
        renamed: String,
    }

    fn sample() -> Sample {
        Sample {
            name: "sample".to_string(),
            count: -42,
            ratio: 0.5,
            enabled: true,
            tags: vec!["a".to_string(), "b".to_string()],
            renamed: "value".to_string(),
        }
    }

    #[test]
    fn test_round_trip() {
        let item = to_item(&sample()).expect("marshal should succeed");
        let back: Sample = from_item(&item).expect("unmarshal should succeed");
        assert_eq!(sample(), back);
    }

    #[test]
    fn test_serde_rename_controls_attribute_name() {
        let item = to_item(&sample()).expect("marshal should succeed");
        assert!(item.contains_key("renamedField"));
        assert!(!item.contains_key("renamed"));
    }

    #[test]
    fn test_numbers_are_stored_as_decimal_strings() {
        let item = to_item(&sample()).expect("marshal should succeed");
        assert_eq!(item.get("count"), Some(&AttributeValue::N("-42".to_string())));
        assert_eq!(item.get("ratio"), Some(&AttributeValue::N("0.5".to_string())));
    }

    #[test]
    fn test_unknown_attributes_are_ignored() {
        let mut item = to_item(&sample()).expect("marshal should succeed");
        item.insert("_seq".to_string(), AttributeValue::N("3".to_string()));
        item.insert("_sk".to_string(), AttributeValue::S("STATE".to_string()));
        let back: Sample = from_item(&item).expect("unmarshal should succeed");
        assert_eq!(sample(), back);
    }

    #[test]
    fn test_top_level_scalar_is_not_an_item() {
        let err = to_item(&7).expect_err("scalar should be rejected");
        assert!(matches!(err, CodecError::NotAnItem));
    }

    #[test]
    fn test_number_policy() {
        let cases = [
            ("-1", Value::from(-1i64)),
            ("+2000", Value::from(2000i64)),
            ("-0.3", Value::from(-0.3f64)),
            ("0.0", Value::from(0.0f64)),
            ("+0.3", Value::from(0.3f64)),
        ];
        for (input, expected) in cases {
            let actual = from_attribute(&AttributeValue::N(input.to_string()))
                .unwrap_or_else(|e| panic!("{input}: {e}"));
            assert_eq!(expected, actual, "input {input:?}");
        }
    }

    #[test]
    fn test_number_policy_integer_stays_integer() {
        let value = from_attribute(&AttributeValue::N("1".to_string())).unwrap();
        assert!(value.is_i64(), "expected i64, got {value:?}");
    }

    #[test]
    fn test_number_policy_rejects_garbage() {
        let err = from_attribute(&AttributeValue::N("pi".to_string()))
            .expect_err("non-numeric should fail");
        assert!(matches!(err, CodecError::InvalidNumber(_)));
    }

    #[test]
    fn test_binary_and_sets_decode() {
        use aws_sdk_dynamodb::primitives::Blob;

        let attr = AttributeValue::B(Blob::new(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        assert_eq!(from_attribute(&attr).unwrap(), Value::String("3q2+7w==".to_string()));

        let attr = AttributeValue::Ss(vec!["A".to_string(), "B".to_string()]);
        assert_eq!(
            from_attribute(&attr).unwrap(),
            Value::Array(vec![Value::from("A"), Value::from("B")])
        );

        let attr = AttributeValue::Ns(vec!["0".to_string(), "0.5".to_string()]);
        assert_eq!(
            from_attribute(&attr).unwrap(),
            Value::Array(vec![Value::from("0"), Value::from("0.5")])
        );
    }

    #[test]
    fn test_nested_maps_and_lists() {
        let attr = AttributeValue::M(HashMap::from([(
            "inner".to_string(),
            AttributeValue::L(vec![
                AttributeValue::S("a".to_string()),
                AttributeValue::N("1".to_string()),
            ]),
        )]));
        let value = from_attribute(&attr).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "inner": ["a", 1] })
        );
    }
}
