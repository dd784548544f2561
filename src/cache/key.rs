use crate::error::StoreError;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Canonical form of a query: parameters sorted by name, null and empty-string values
/// dropped.
///
/// Two queries that differ only in parameter order or in unset filters normalize to
/// the same map.
pub fn normalize_query<Q: Serialize + ?Sized>(query: &Q) -> Result<BTreeMap<String, Value>, StoreError> {
    match serde_json::to_value(query)? {
        Value::Object(params) => Ok(params.into_iter().filter(|(_, v)| !is_blank(v)).collect()),
        Value::Null => Ok(BTreeMap::new()),
        other => Err(StoreError::Codec(format!("cache query must be an object, got {other}"))),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// `{namespace}:v2:{canonical json}`.
pub fn query_key<Q: Serialize + ?Sized>(namespace: &str, query: &Q) -> Result<String, StoreError> {
    let canonical: Map<String, Value> = normalize_query(query)?.into_iter().collect();
    Ok(format!("{namespace}:v2:{}", Value::Object(canonical)))
}
