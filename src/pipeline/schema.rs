//! Strict check of the structured-extraction response.
//!
//! A response either matches the expected shape exactly or is rejected with
//! a reason. There is no partial acceptance: a half-parsed answer would
//! reach the user as confident-looking garbage, while a rejection sends the
//! session down the OCR path where a human looks at it.

use crate::pipeline::postprocess::clean_json_response;
use crate::session::LineItem;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A field as returned by the model or entered by a reviewer, before scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCandidate {
    pub label: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

impl FieldCandidate {
    pub fn new(label: impl Into<String>, value: Option<&str>) -> Self {
        Self {
            label: label.into(),
            value: value.map(str::to_string),
            confidence: None,
        }
    }
}

/// A response that passed the schema check.
#[derive(Debug, Clone, PartialEq)]
pub struct RawExtraction {
    pub fields: Vec<FieldCandidate>,
    pub line_items: Option<Vec<LineItem>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaCheck {
    Valid(RawExtraction),
    Invalid { reason: String },
}

impl SchemaCheck {
    fn invalid(reason: impl Into<String>) -> Self {
        SchemaCheck::Invalid {
            reason: reason.into(),
        }
    }
}

/// Clean and check a raw response.
pub fn check_response(raw: &str) -> SchemaCheck {
    let text = clean_json_response(raw);
    if text.is_empty() {
        return SchemaCheck::invalid("response is empty");
    }

    let root: Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => return SchemaCheck::invalid(format!("response is not valid JSON: {e}")),
    };
    let Value::Object(root) = root else {
        return SchemaCheck::invalid("response is not a JSON object");
    };

    let fields = match root.get("fields") {
        Some(Value::Array(items)) if !items.is_empty() => items,
        Some(Value::Array(_)) => return SchemaCheck::invalid("fields array is empty"),
        Some(_) => return SchemaCheck::invalid("fields is not an array"),
        None => return SchemaCheck::invalid("fields is missing"),
    };

    let mut parsed = Vec::with_capacity(fields.len());
    for (i, entry) in fields.iter().enumerate() {
        match check_field(entry) {
            Ok(f) => parsed.push(f),
            Err(reason) => return SchemaCheck::invalid(format!("fields[{i}]: {reason}")),
        }
    }

    if parsed
        .iter()
        .all(|f| f.value.as_deref().is_none_or(|v| v.trim().is_empty()))
    {
        return SchemaCheck::invalid("no field has a value");
    }

    let line_items = match root.get("lineItems").or_else(|| root.get("line_items")) {
        None | Some(Value::Null) => None,
        Some(v) => match check_line_items(v) {
            Ok(items) => Some(items),
            Err(reason) => return SchemaCheck::invalid(reason),
        },
    };

    SchemaCheck::Valid(RawExtraction {
        fields: parsed,
        line_items,
    })
}

fn check_field(entry: &Value) -> Result<FieldCandidate, String> {
    let Value::Object(obj) = entry else {
        return Err("entry is not an object".into());
    };

    let label = match obj.get("label") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::String(_)) => return Err("label is blank".into()),
        _ => return Err("label is missing or not a string".into()),
    };

    let value = match obj.get("value") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(_) => return Err(format!("value of '{label}' is not a string, number or null")),
    };

    let confidence = match obj.get("confidence") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_f64().map(|c| c as f32),
        Some(_) => return Err(format!("confidence of '{label}' is not a number")),
    };

    Ok(FieldCandidate {
        label,
        value,
        confidence,
    })
}

fn check_line_items(v: &Value) -> Result<Vec<LineItem>, String> {
    let Value::Array(rows) = v else {
        return Err("lineItems is not an array".into());
    };
    rows.iter()
        .enumerate()
        .map(|(i, row)| match row {
            Value::Object(map) => check_row(map).map_err(|e| format!("lineItems[{i}]: {e}")),
            _ => Err(format!("lineItems[{i}] is not an object")),
        })
        .collect()
}

fn check_row(map: &Map<String, Value>) -> Result<LineItem, String> {
    map.iter()
        .map(|(k, v)| match v {
            Value::Array(_) | Value::Object(_) => Err(format!("column '{k}' is not a scalar")),
            _ => Ok((k.clone(), v.clone())),
        })
        .collect()
}
