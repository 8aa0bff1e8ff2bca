//! Row-level set difference used before appending tabular data.

use serde_json::Value;
use std::collections::HashSet;

/// The ordered tuple of a row's cell values, as JSON text.
///
/// Array rows use their elements and a bare scalar is a one-cell row.
/// Object rows use their values ordered by column name, and nested objects
/// are keyed the same way. Two rows are the
/// same row only when every cell matches exactly, in the same position.
pub fn row_key(row: &Value) -> String {
    let cells = match canonical(row) {
        Value::Array(cells) => cells,
        Value::Object(columns) => columns.into_iter().map(|(_, cell)| cell).collect(),
        scalar => vec![scalar],
    };
    Value::Array(cells).to_string()
}

/// Copy of `value` with every object's keys in sorted order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut columns: Vec<(&String, &Value)> = map.iter().collect();
            columns.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                columns
                    .into_iter()
                    .map(|(name, cell)| (name.clone(), canonical(cell)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        scalar => scalar.clone(),
    }
}

/// Incoming rows that do not appear in `existing`.
///
/// Order is kept and duplicates inside `incoming` are all kept; only
/// membership in `existing` removes a row.
pub fn novel_rows(incoming: &[Value], existing: &[Value]) -> Vec<Value> {
    if existing.is_empty() {
        return incoming.to_vec();
    }

    let seen: HashSet<String> = existing.iter().map(row_key).collect();
    incoming
        .iter()
        .filter(|row| !seen.contains(&row_key(row)))
        .cloned()
        .collect()
}
