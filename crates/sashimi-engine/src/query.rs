//! The search/mutation request envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;

/// One search or mutation request against a dataset. Also the shape of a
/// named-search definition in a dataset config, which is why every field is
/// optional or defaulted.
///
/// Both update forms are carried: the `update` mapping and the older
/// `update_field` + `update_data` pair. The mapping wins when both are
/// present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub expr: Option<String>,
    pub filter: Option<Map<String, Value>>,
    pub op: Option<String>,
    pub sort: Option<String>,
    pub reverse: bool,
    pub token: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub fields: Option<Vec<String>>,
    pub aggregate: Option<Vec<String>>,
    pub discard: bool,
    /// JSON-encoded record for insert.
    pub data: Option<String>,
    pub update: Option<Map<String, Value>>,
    pub update_field: Option<String>,
    pub update_data: Option<String>,
}

impl SearchQuery {
    /// The full filter expression: `expr` AND-joined with every desugared
    /// `filter` entry, defaulting to `"True"` when both are empty.
    pub fn expr_with_filter(&self) -> Result<String, EngineError> {
        let mut expr = self.expr.clone().unwrap_or_default();
        if let Some(filter) = &self.filter {
            for (key, value) in filter {
                let sub = filter_subexpr(key, value)?;
                if expr.is_empty() {
                    expr = sub;
                } else {
                    expr = format!("{expr} and {sub}");
                }
            }
        }
        if expr.is_empty() {
            expr = "True".to_string();
        }
        Ok(expr)
    }
}

/// Desugars one `filter` entry: a list value becomes membership, a
/// `field__lt/le/gt/ge` key becomes the comparison, anything else is
/// equality.
fn filter_subexpr(key: &str, value: &Value) -> Result<String, EngineError> {
    if value.is_array() {
        return Ok(format!("{key} in {}", literal(value)?));
    }
    match key.split_once("__") {
        Some((field, suffix)) => {
            let op = match suffix {
                "lt" => "<",
                "le" => "<=",
                "gt" => ">",
                "ge" => ">=",
                other => {
                    return Err(EngineError::bad_input(format!(
                        "unknown sub-operation {other:?}"
                    )))
                }
            };
            Ok(format!("{field} {op} {}", literal(value)?))
        }
        None => Ok(format!("{key} == {}", literal(value)?)),
    }
}

/// Renders a JSON scalar or list as expression-language source text.
fn literal(value: &Value) -> Result<String, EngineError> {
    match value {
        Value::Null => Ok("None".to_string()),
        Value::Bool(true) => Ok("True".to_string()),
        Value::Bool(false) => Ok("False".to_string()),
        // JSON text for numbers and strings is valid expression syntax.
        Value::Number(_) | Value::String(_) => Ok(value.to_string()),
        Value::Array(items) => {
            let rendered: Result<Vec<_>, _> = items.iter().map(literal).collect();
            Ok(format!("[{}]", rendered?.join(", ")))
        }
        Value::Object(_) => Err(EngineError::bad_input(
            "cannot filter on an object value",
        )),
    }
}
