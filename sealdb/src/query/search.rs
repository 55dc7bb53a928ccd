use crate::value::{text_form, values_equal};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// What free-text search looks for.
#[derive(Clone)]
pub enum SearchQuery {
    /// Substring of a value's text form (or the whole text form with `exact_match`).
    /// `null` only matches `null`.
    Literal(Value),
    /// Any of the literals.
    AnyOf(Vec<Value>),
    /// Every named sub-field must have the same text form as the constraint.
    Fields(Map<String, Value>),
    Predicate(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
}

impl SearchQuery {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        SearchQuery::Predicate(Arc::new(f))
    }
}

impl From<Value> for SearchQuery {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => SearchQuery::AnyOf(items),
            Value::Object(map) => SearchQuery::Fields(map),
            scalar => SearchQuery::Literal(scalar),
        }
    }
}

impl From<&str> for SearchQuery {
    fn from(value: &str) -> Self {
        SearchQuery::Literal(Value::String(value.to_string()))
    }
}

impl From<String> for SearchQuery {
    fn from(value: String) -> Self {
        SearchQuery::Literal(Value::String(value))
    }
}

impl fmt::Debug for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchQuery::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            SearchQuery::AnyOf(v) => f.debug_tuple("AnyOf").field(v).finish(),
            SearchQuery::Fields(v) => f.debug_tuple("Fields").field(v).finish(),
            SearchQuery::Predicate(_) => write!(f, "Predicate(<fn>)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub case_sensitive: bool,
    pub exact_match: bool,
    /// Maximum number of results; `0` means unbounded.
    pub limit: usize,
    /// Restrict the scan to these keys, in this order.
    pub keys: Option<Vec<String>>,
    /// Return bare values instead of hits.
    pub value_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub key: String,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SearchResult {
    Hit(SearchHit),
    Bare(Value),
}

impl SearchResult {
    pub fn value(&self) -> &Value {
        match self {
            SearchResult::Hit(hit) => &hit.value,
            SearchResult::Bare(value) => value,
        }
    }
}

struct Matcher<'q> {
    query: &'q SearchQuery,
    options: &'q SearchOptions,
}

impl Matcher<'_> {
    fn normalize(&self, text: String) -> String {
        if self.options.case_sensitive {
            text
        } else {
            text.to_lowercase()
        }
    }

    fn literal_matches(&self, haystack: &str, needle: &Value) -> bool {
        let Some(needle) = text_form(needle) else {
            return false;
        };
        let needle = self.normalize(needle);
        if self.options.exact_match {
            haystack == needle
        } else {
            haystack.contains(&needle)
        }
    }

    fn is_match(&self, value: &Value) -> bool {
        match self.query {
            SearchQuery::Predicate(f) => match catch_unwind(AssertUnwindSafe(|| f(value))) {
                Ok(matched) => matched,
                Err(_) => {
                    log::warn!("Search predicate panicked; treating as no match");
                    false
                }
            },
            SearchQuery::Literal(Value::Null) => value.is_null(),
            SearchQuery::Fields(constraints) => match value.as_object() {
                Some(map) => constraints.iter().all(|(field, expected)| {
                    map.get(field)
                        .map(|actual| same_text(actual, expected))
                        .unwrap_or(false)
                }),
                None => false,
            },
            SearchQuery::Literal(needle) => match text_form(value) {
                Some(text) => self.literal_matches(&self.normalize(text), needle),
                None => false,
            },
            SearchQuery::AnyOf(needles) => match text_form(value) {
                Some(text) => {
                    let haystack = self.normalize(text);
                    needles.iter().any(|n| self.literal_matches(&haystack, n))
                }
                None => false,
            },
        }
    }
}

fn same_text(a: &Value, b: &Value) -> bool {
    match (text_form(a), text_form(b)) {
        (Some(x), Some(y)) => x == y,
        _ => values_equal(a, b),
    }
}

/// Scan documents for values matching `query`.
///
/// A document that does not match as a whole is searched one level deeper: matching
/// list elements are returned together as one hit, and each matching mapping entry
/// becomes its own hit keyed `parent.sub`.
pub fn search(query: &SearchQuery, documents: &Map<String, Value>, options: &SearchOptions) -> Vec<SearchResult> {
    let matcher = Matcher { query, options };
    let mut results = Vec::new();
    let full = |results: &Vec<SearchResult>| options.limit > 0 && results.len() >= options.limit;

    let keys: Vec<&str> = match &options.keys {
        Some(keys) => keys.iter().map(String::as_str).collect(),
        None => documents.keys().map(String::as_str).collect(),
    };

    for key in keys {
        let Some(value) = documents.get(key) else {
            continue;
        };

        if matcher.is_match(value) {
            results.push(make_result(options, key.to_string(), value.clone(), None));
            if full(&results) {
                break;
            }
            continue;
        }

        match value {
            Value::Array(items) => {
                let matching: Vec<Value> = items.iter().filter(|item| matcher.is_match(item)).cloned().collect();
                if !matching.is_empty() {
                    results.push(make_result(options, key.to_string(), Value::Array(matching), None));
                }
            }
            Value::Object(map) => {
                for (sub_key, sub_value) in map {
                    if !matcher.is_match(sub_value) {
                        continue;
                    }
                    results.push(make_result(
                        options,
                        format!("{key}.{sub_key}"),
                        sub_value.clone(),
                        Some((value, key)),
                    ));
                    if full(&results) {
                        break;
                    }
                }
            }
            _ => {}
        }

        if full(&results) {
            break;
        }
    }

    results
}

fn make_result(options: &SearchOptions, key: String, value: Value, parent: Option<(&Value, &str)>) -> SearchResult {
    if options.value_only {
        return SearchResult::Bare(value);
    }
    SearchResult::Hit(SearchHit {
        key,
        value,
        parent: parent.map(|(p, _)| p.clone()),
        parent_key: parent.map(|(_, k)| k.to_string()),
    })
}
