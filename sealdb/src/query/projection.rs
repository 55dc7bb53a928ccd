use crate::value::{get_path, set_path, sort_order, unset_path};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// `-1` and `"desc"` mean descending; anything else is ascending.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) if n.as_f64() == Some(-1.0) => SortDirection::Desc,
            Value::String(s) if s.eq_ignore_ascii_case("desc") => SortDirection::Desc,
            _ => SortDirection::Asc,
        }
    }
}

/// Result ordering: a single field ascending, or an ordered list of fields with directions.
#[derive(Debug, Clone, PartialEq)]
pub enum SortSpec {
    Field(String),
    Fields(Vec<(String, SortDirection)>),
}

impl SortSpec {
    /// Parse `"field"` or `{"field": 1, "other": -1}`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(field) => Some(SortSpec::Field(field.clone())),
            Value::Object(map) => Some(SortSpec::Fields(
                map.iter()
                    .map(|(field, dir)| (field.clone(), SortDirection::from_value(dir)))
                    .collect(),
            )),
            _ => None,
        }
    }

    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match self {
            SortSpec::Field(field) => sort_order(get_path(a, field), get_path(b, field)),
            SortSpec::Fields(fields) => {
                for (field, direction) in fields {
                    let ord = sort_order(get_path(a, field), get_path(b, field));
                    let ord = match direction {
                        SortDirection::Asc => ord,
                        SortDirection::Desc => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            }
        }
    }
}

/// Stable sort. Rows whose values are missing or of a different kind group by kind.
pub fn apply_sort(results: &mut [Value], spec: &SortSpec) {
    results.sort_by(|a, b| spec.compare(a, b));
}

fn selects(flag: &Value) -> bool {
    match flag {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() == Some(1.0),
        _ => false,
    }
}

fn drops(flag: &Value) -> bool {
    match flag {
        Value::Bool(b) => !*b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

/// Apply an inclusion or exclusion mapping to one result row.
///
/// Any `1`/`true` entry switches the whole projection to inclusion mode, in which
/// only the selected fields are kept. `_key` is always kept in inclusion mode, even
/// when the projection does not list it. Otherwise `0`/`false` entries are removed.
/// Dotted paths address nested fields in both modes.
pub fn apply_projection(item: Map<String, Value>, projection: &Map<String, Value>) -> Map<String, Value> {
    let include_mode = projection.values().any(selects);

    if include_mode {
        let source = Value::Object(item);
        let mut result = Map::new();
        if let Some(key) = source.get("_key") {
            result.insert("_key".to_string(), key.clone());
        }
        for (field, flag) in projection {
            if !selects(flag) {
                continue;
            }
            if let Some(found) = get_path(&source, field) {
                set_path(&mut result, field, found.clone());
            }
        }
        return result;
    }

    let mut result = item;
    for (field, flag) in projection {
        if drops(flag) {
            unset_path(&mut result, field);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_inclusion_keeps_key() {
        let row = obj(json!({"_key": "u1", "name": "Ann", "age": 30, "address": {"city": "Oslo", "zip": "0150"}}));
        let projected = apply_projection(row, &obj(json!({"name": 1, "address.city": true})));
        assert_eq!(
            Value::Object(projected),
            json!({"_key": "u1", "name": "Ann", "address": {"city": "Oslo"}})
        );
    }

    #[test]
    fn test_exclusion() {
        let row = obj(json!({"_key": "u1", "name": "Ann", "secret": "x", "address": {"city": "Oslo", "zip": "0150"}}));
        let projected = apply_projection(row, &obj(json!({"secret": 0, "address.zip": false})));
        assert_eq!(
            Value::Object(projected),
            json!({"_key": "u1", "name": "Ann", "address": {"city": "Oslo"}})
        );
    }

    #[test]
    fn test_mixed_projection_is_inclusion() {
        let row = obj(json!({"_key": "u1", "a": 1, "b": 2, "c": 3}));
        let projected = apply_projection(row, &obj(json!({"a": 1, "b": 0})));
        assert_eq!(Value::Object(projected), json!({"_key": "u1", "a": 1}));
    }

    #[test]
    fn test_sort_multi_field() {
        let mut rows = vec![
            json!({"_key": "a", "team": "x", "score": 1}),
            json!({"_key": "b", "team": "y", "score": 5}),
            json!({"_key": "c", "team": "x", "score": 9}),
        ];
        let spec = SortSpec::from_value(&json!({"team": 1, "score": "desc"})).unwrap();
        apply_sort(&mut rows, &spec);
        let keys: Vec<_> = rows.iter().map(|r| r["_key"].as_str().unwrap()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_sort_mixed_kinds() {
        let mut rows = vec![
            json!({"_key": "a", "n": "text"}),
            json!({"_key": "b", "n": 1}),
            json!({"_key": "c"}),
            json!({"_key": "d", "n": {"nested": true}}),
            json!({"_key": "e", "n": [2]}),
        ];
        apply_sort(&mut rows, &SortSpec::Field("n".into()));
        let keys: Vec<_> = rows.iter().map(|r| r["_key"].as_str().unwrap()).collect();
        assert_eq!(keys, vec!["c", "b", "a", "d", "e"]);
    }
}
