use crate::value::{
    compact_json, compare_values, is_truthy, kind_name, length_of, values_equal,
};
use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Caller-supplied match function, invoked with `(value, key)`.
pub type Predicate = Arc<dyn Fn(&Value, &str) -> bool + Send + Sync>;

/// A condition tree evaluated against each document.
///
/// Built from JSON with `Filter::from(json!({...}))`: scalars and `null` become
/// [`Filter::Literal`], arrays become [`Filter::AnyOf`] and objects become
/// [`Filter::Fields`]. Callbacks can be spliced in anywhere with
/// [`Filter::predicate`].
#[derive(Clone)]
pub enum Filter {
    /// Strict equality with a scalar (or `null`).
    Literal(Value),
    /// Matches when any member matches.
    AnyOf(Vec<Filter>),
    /// Every entry must match. Keys are operators (`$gt`), dotted paths or field names.
    Fields(Vec<(String, Filter)>),
    Predicate(Predicate),
}

impl Filter {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Value, &str) -> bool + Send + Sync + 'static,
    {
        Filter::Predicate(Arc::new(f))
    }

    /// `{operator: operand}`
    pub fn op(operator: &str, operand: impl Into<Filter>) -> Self {
        Filter::Fields(vec![(operator.to_string(), operand.into())])
    }

    pub fn fields<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Filter)>,
    {
        Filter::Fields(entries.into_iter().map(|(k, f)| (k.into(), f)).collect())
    }

    /// The data this filter was built from, if it contains no callbacks.
    /// Operators that take data operands (`$in`, `$eq`, `$between`, ...) read it through here.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Filter::Literal(v) => Some(v.clone()),
            Filter::AnyOf(items) => items
                .iter()
                .map(Filter::to_value)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            Filter::Fields(entries) => entries
                .iter()
                .map(|(k, f)| f.to_value().map(|v| (k.clone(), v)))
                .collect::<Option<Map<_, _>>>()
                .map(Value::Object),
            Filter::Predicate(_) => None,
        }
    }

    /// Evaluate against one document. `key` is the document's key, handed to predicates.
    pub fn matches(&self, value: Option<&Value>, key: &str) -> bool {
        evaluate(self, value, key, &mut Trace::disabled())
    }
}

impl Default for Filter {
    /// The empty object condition, which matches every document.
    fn default() -> Self {
        Filter::Fields(Vec::new())
    }
}

impl From<Value> for Filter {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => Filter::AnyOf(items.into_iter().map(Filter::from).collect()),
            Value::Object(map) => {
                Filter::Fields(map.into_iter().map(|(k, v)| (k, Filter::from(v))).collect())
            }
            scalar => Filter::Literal(scalar),
        }
    }
}

impl From<&str> for Filter {
    fn from(value: &str) -> Self {
        Filter::Literal(Value::String(value.to_string()))
    }
}

impl From<String> for Filter {
    fn from(value: String) -> Self {
        Filter::Literal(Value::String(value))
    }
}

impl From<i64> for Filter {
    fn from(value: i64) -> Self {
        Filter::Literal(Value::from(value))
    }
}

impl From<f64> for Filter {
    fn from(value: f64) -> Self {
        Filter::Literal(Value::from(value))
    }
}

impl From<bool> for Filter {
    fn from(value: bool) -> Self {
        Filter::Literal(Value::Bool(value))
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Literal(v) => write!(f, "Literal({v})"),
            Filter::AnyOf(items) => f.debug_tuple("AnyOf").field(items).finish(),
            Filter::Fields(entries) => f.debug_map().entries(entries.iter().map(|(k, v)| (k, v))).finish(),
            Filter::Predicate(_) => write!(f, "Predicate(<fn>)"),
        }
    }
}

/// Operation log collected for `explain`.
pub(crate) struct Trace {
    enabled: bool,
    pub(crate) operations: Vec<String>,
}

impl Trace {
    pub(crate) fn new(enabled: bool) -> Self {
        Trace {
            enabled,
            operations: Vec::new(),
        }
    }

    pub(crate) fn disabled() -> Self {
        Trace::new(false)
    }

    pub(crate) fn record(&mut self, entry: impl FnOnce() -> String) {
        if self.enabled {
            self.operations.push(entry());
        }
    }
}

pub(crate) fn evaluate(filter: &Filter, value: Option<&Value>, key: &str, trace: &mut Trace) -> bool {
    match filter {
        Filter::Literal(expected) => value.map(|v| values_equal(v, expected)).unwrap_or(false),
        Filter::AnyOf(items) => items.iter().any(|item| evaluate(item, value, key, trace)),
        Filter::Predicate(f) => match value {
            Some(v) => call_predicate(f, v, key),
            None => false,
        },
        Filter::Fields(entries) => entries
            .iter()
            .all(|(name, condition)| evaluate_entry(name, condition, value, key, trace)),
    }
}

// A missing final field is evaluated as absent rather than as a non-match, so
// `$exists: false`, `$ne` and `$nin` select documents that lack the field.
// A missing intermediate segment is always a non-match.
fn evaluate_entry(
    name: &str,
    condition: &Filter,
    value: Option<&Value>,
    key: &str,
    trace: &mut Trace,
) -> bool {
    if name.starts_with('$') {
        return evaluate_operator(name, condition, value, key, trace);
    }

    // Walk to the mapping that holds the last segment; the last segment itself may be absent.
    let mut segments: Vec<&str> = name.split('.').collect();
    let Some(last) = segments.pop() else {
        return false;
    };
    let mut current = match value {
        Some(v) => v,
        None => return false,
    };
    for segment in segments {
        current = match current.as_object().and_then(|map| map.get(segment)) {
            Some(next) => next,
            None => return false,
        };
    }
    match current.as_object() {
        Some(map) => evaluate(condition, map.get(last), key, trace),
        None => false,
    }
}

fn evaluate_operator(
    operator: &str,
    operand: &Filter,
    value: Option<&Value>,
    key: &str,
    trace: &mut Trace,
) -> bool {
    trace.record(|| format!("Operator: {operator}"));

    match operator {
        "$and" => match operand {
            Filter::AnyOf(conditions) => conditions.iter().all(|c| evaluate(c, value, key, trace)),
            _ => false,
        },
        "$or" => match operand {
            Filter::AnyOf(conditions) => conditions.iter().any(|c| evaluate(c, value, key, trace)),
            _ => false,
        },
        "$nor" => match operand {
            Filter::AnyOf(conditions) => !conditions.iter().any(|c| evaluate(c, value, key, trace)),
            _ => false,
        },
        "$xor" => match operand {
            Filter::AnyOf(conditions) if conditions.len() == 2 => {
                let first = evaluate(&conditions[0], value, key, trace);
                let second = evaluate(&conditions[1], value, key, trace);
                first != second
            }
            _ => false,
        },
        "$not" => !evaluate(operand, value, key, trace),
        "$elemMatch" => match value {
            Some(Value::Array(items)) => items.iter().any(|item| evaluate(operand, Some(item), key, trace)),
            _ => false,
        },
        _ => match operand.to_value() {
            Some(data) => data_operator(operator, &data, value),
            None => false,
        },
    }
}

/// Operators whose operand is plain data.
fn data_operator(operator: &str, operand: &Value, value: Option<&Value>) -> bool {
    match operator {
        "$eq" => value.map(|v| values_equal(v, operand)).unwrap_or(false),
        "$ne" => value.map(|v| !values_equal(v, operand)).unwrap_or(true),
        "$gt" => ordered(value, operand, |o| o == Ordering::Greater),
        "$gte" => ordered(value, operand, |o| o != Ordering::Less),
        "$lt" => ordered(value, operand, |o| o == Ordering::Less),
        "$lte" => ordered(value, operand, |o| o != Ordering::Greater),
        "$in" => match (operand, value) {
            (Value::Array(options), Some(v)) => options.iter().any(|o| values_equal(v, o)),
            _ => false,
        },
        "$nin" => match (operand, value) {
            (Value::Array(options), Some(v)) => !options.iter().any(|o| values_equal(v, o)),
            (Value::Array(_), None) => true,
            _ => false,
        },
        "$exists" => is_truthy(operand) == value.is_some(),
        "$type" => operand.as_str() == Some(kind_name(value)),
        "$regex" => match (value, operand) {
            (Some(Value::String(s)), Value::String(pattern)) => Regex::new(pattern)
                .map(|re| re.is_match(s))
                .unwrap_or(false),
            _ => false,
        },
        "$contains" => match value {
            Some(Value::String(s)) => operand.as_str().map(|needle| s.contains(needle)).unwrap_or(false),
            Some(Value::Array(items)) => items.iter().any(|item| values_equal(item, operand)),
            _ => false,
        },
        "$startsWith" => match (value, operand) {
            (Some(Value::String(s)), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        "$endsWith" => match (value, operand) {
            (Some(Value::String(s)), Value::String(suffix)) => s.ends_with(suffix.as_str()),
            _ => false,
        },
        "$between" => match operand.as_array().map(Vec::as_slice) {
            Some([low, high]) => {
                ordered(value, low, |o| o != Ordering::Less) && ordered(value, high, |o| o != Ordering::Greater)
            }
            _ => false,
        },
        "$size" => match (value.and_then(length_of), operand.as_f64()) {
            (Some(len), Some(expected)) => len as f64 == expected,
            _ => false,
        },
        "$all" => match (value, operand) {
            (Some(Value::Array(items)), Value::Array(required)) => required
                .iter()
                .all(|r| items.iter().any(|item| values_equal(item, r))),
            _ => false,
        },
        "$fuzzy" => match (value, operand) {
            (Some(Value::String(s)), Value::String(target)) => {
                levenshtein(&s.to_lowercase(), &target.to_lowercase()) <= 2
            }
            _ => false,
        },
        "$search" => match (value, operand) {
            (Some(v), Value::String(term)) => text_search(v, term),
            _ => false,
        },
        _ => false,
    }
}

fn ordered(value: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    value
        .and_then(|v| compare_values(v, operand))
        .map(accept)
        .unwrap_or(false)
}

fn text_search(value: &Value, term: &str) -> bool {
    let term = term.to_lowercase();
    match value {
        Value::String(s) => s.to_lowercase().contains(&term),
        Value::Array(_) | Value::Object(_) => compact_json(value).to_lowercase().contains(&term),
        _ => false,
    }
}

pub(crate) fn call_predicate(f: &Predicate, value: &Value, key: &str) -> bool {
    match catch_unwind(AssertUnwindSafe(|| f(value, key))) {
        Ok(result) => result,
        Err(_) => {
            log::warn!("Query predicate panicked on key '{key}'; treating as no match");
            false
        }
    }
}

/// Edit distance over chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}
