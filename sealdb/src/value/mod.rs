// Value helpers shared by the query and validation engines

use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Runtime kind of a value as reported by `$type`. Absent values report `undefined`.
pub fn kind_name(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

/// Strict equality. Numbers compare by numeric value so `1` equals `1.0`;
/// lists and mappings compare structurally.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).map(|other| values_equal(v, other)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// Ordering between two values of the same comparable kind (number or string).
/// Mixed or non-comparable kinds yield `None`.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total ordering used by result sorting. Values of different kinds order by kind
/// (absent, null, boolean, number, string, then structures); within a kind
/// booleans order false < true, numbers and strings naturally, structures equal.
pub fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(Value::Array(_)) | Some(Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) if rank(a) == rank(b) => compare_values(x, y).unwrap_or(Ordering::Equal),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Text used for literal matching in free-text search. Mappings have no text form.
pub fn text_form(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some("null".to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .map(|item| text_form(item).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Object(_) => None,
    }
}

/// Compact JSON rendering used for `$search` over structured values.
pub fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Truthiness of an operand, for flags such as `$exists`.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Length in characters (strings) or elements (lists).
pub fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

/// Resolve a dotted path through nested mappings.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Set a dotted path, creating intermediate mappings as needed.
pub fn set_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let last = match parts.pop() {
        Some(last) => last,
        None => return,
    };

    let mut current = target;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry.as_object_mut() {
            Some(map) => map,
            None => return,
        };
    }
    current.insert(last.to_string(), value);
}

/// Remove a dotted path if every intermediate mapping exists.
pub fn unset_path(target: &mut Map<String, Value>, path: &str) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let last = match parts.pop() {
        Some(last) => last,
        None => return,
    };

    let mut current = target;
    for part in parts {
        current = match current.get_mut(part).and_then(Value::as_object_mut) {
            Some(map) => map,
            None => return,
        };
    }
    current.shift_remove(last);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numbers_equal_across_representations() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(!values_equal(&json!(1), &json!("1")));
        assert!(values_equal(&json!({"a": [1, 2]}), &json!({"a": [1.0, 2]})));
    }

    #[test]
    fn test_compare_requires_same_kind() {
        assert_eq!(compare_values(&json!(2), &json!(10)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("b"), &json!("a")), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!("2"), &json!(10)), None);
        assert_eq!(compare_values(&json!(true), &json!(false)), None);
    }

    #[test]
    fn test_sort_order_groups_kinds() {
        assert_eq!(sort_order(None, Some(&json!(null))), Ordering::Less);
        assert_eq!(sort_order(Some(&json!(10)), Some(&json!("a"))), Ordering::Less);
        assert_eq!(sort_order(Some(&json!(true)), Some(&json!(false))), Ordering::Greater);
        assert_eq!(sort_order(Some(&json!([1])), Some(&json!({"a": 1}))), Ordering::Equal);
    }

    #[test]
    fn test_text_form() {
        assert_eq!(text_form(&json!(["a", 1, true])).as_deref(), Some("a,1,true"));
        assert_eq!(text_form(&json!(2.5)).as_deref(), Some("2.5"));
        assert_eq!(text_form(&json!({"a": 1})), None);
    }

    #[test]
    fn test_paths() {
        let doc = json!({"a": {"b": {"c": 3}}});
        assert_eq!(get_path(&doc, "a.b.c"), Some(&json!(3)));
        assert_eq!(get_path(&doc, "a.x.c"), None);

        let mut map = Map::new();
        set_path(&mut map, "a.b", json!(1));
        set_path(&mut map, "a.c", json!(2));
        assert_eq!(Value::Object(map.clone()), json!({"a": {"b": 1, "c": 2}}));

        unset_path(&mut map, "a.b");
        unset_path(&mut map, "missing.path");
        assert_eq!(Value::Object(map), json!({"a": {"c": 2}}));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(kind_name(None), "undefined");
        assert_eq!(kind_name(Some(&json!(null))), "null");
        assert_eq!(kind_name(Some(&json!([]))), "array");
        assert_eq!(kind_name(Some(&json!({}))), "object");
    }
}
