mod builder;
mod filter;
mod projection;
mod search;

pub use builder::{Op, QueryBuilder};
pub use filter::{levenshtein, Filter, Predicate};
pub use projection::{apply_projection, apply_sort, SortDirection, SortSpec};
pub use search::{search, SearchHit, SearchOptions, SearchQuery, SearchResult};

use filter::{evaluate, Trace};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;

/// Options for [`QueryEngine::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Maximum number of results; `0` means unbounded.
    pub limit: usize,
    pub skip: usize,
    pub sort: Option<SortSpec>,
    pub projection: Option<Map<String, Value>>,
    /// Store the results under this key, and serve later queries with the same key from it.
    pub cache_key: Option<String>,
    pub explain: bool,
}

impl QueryOptions {
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    #[must_use]
    pub fn sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    #[must_use]
    pub fn projection(mut self, projection: Map<String, Value>) -> Self {
        self.projection = Some(projection);
        self
    }

    #[must_use]
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn explain(mut self, explain: bool) -> Self {
        self.explain = explain;
        self
    }
}

/// How a query was evaluated, returned in explain mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    pub total_keys: usize,
    pub matched_keys: usize,
    pub operations: Vec<String>,
    pub execution_time_ms: u64,
    pub result_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplainedQuery {
    pub results: Vec<Value>,
    pub plan: QueryPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryOutcome {
    Results(Vec<Value>),
    Explained(ExplainedQuery),
}

impl QueryOutcome {
    pub fn results(&self) -> &[Value] {
        match self {
            QueryOutcome::Results(results) => results,
            QueryOutcome::Explained(explained) => &explained.results,
        }
    }

    pub fn into_results(self) -> Vec<Value> {
        match self {
            QueryOutcome::Results(results) => results,
            QueryOutcome::Explained(explained) => explained.results,
        }
    }

    pub fn plan(&self) -> Option<&QueryPlan> {
        match self {
            QueryOutcome::Results(_) => None,
            QueryOutcome::Explained(explained) => Some(&explained.plan),
        }
    }
}

/// Evaluates filters over a document mapping and keeps the explicit result cache.
#[derive(Debug, Default)]
pub struct QueryEngine {
    cache: HashMap<String, Vec<Value>>,
}

impl QueryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full scan: match, build rows, project, sort, skip, limit.
    pub fn query(&mut self, filter: &Filter, documents: &Map<String, Value>, options: &QueryOptions) -> QueryOutcome {
        if !options.explain {
            if let Some(cached) = options.cache_key.as_ref().and_then(|k| self.cache.get(k)) {
                log::debug!("Query cache hit for '{}'", options.cache_key.as_deref().unwrap_or_default());
                return QueryOutcome::Results(cached.clone());
            }
        }

        let started = Instant::now();
        let mut trace = Trace::new(options.explain);
        let mut results = Vec::new();

        for (key, value) in documents {
            trace.record(|| format!("Evaluating key: {key}"));
            if !evaluate(filter, Some(value), key, &mut trace) {
                continue;
            }
            let mut row = result_row(key, value);
            if let Some(projection) = &options.projection {
                row = apply_projection(row, projection);
            }
            results.push(Value::Object(row));
        }
        let matched_keys = results.len();

        if let Some(sort) = &options.sort {
            apply_sort(&mut results, sort);
        }
        let mut results: Vec<Value> = results.into_iter().skip(options.skip).collect();
        if options.limit > 0 {
            results.truncate(options.limit);
        }

        if options.explain {
            let plan = QueryPlan {
                total_keys: documents.len(),
                matched_keys,
                operations: trace.operations,
                execution_time_ms: started.elapsed().as_millis() as u64,
                result_count: results.len(),
            };
            return QueryOutcome::Explained(ExplainedQuery { results, plan });
        }

        if let Some(cache_key) = &options.cache_key {
            self.cache.insert(cache_key.clone(), results.clone());
        }
        QueryOutcome::Results(results)
    }

    /// Translate a plain-English phrase with [`parse_natural_query`] and run it.
    pub fn natural_query(&mut self, text: &str, documents: &Map<String, Value>, options: &QueryOptions) -> QueryOutcome {
        let filter = parse_natural_query(text);
        log::debug!("Natural query '{text}' parsed as {filter:?}");
        self.query(&filter, documents, options)
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn remove_cache_entry(&mut self, cache_key: &str) -> bool {
        self.cache.remove(cache_key).is_some()
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }
}

/// `{_key, ...fields}` for mappings, `{_key, _value}` for anything else.
fn result_row(key: &str, value: &Value) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("_key".to_string(), Value::String(key.to_string()));
    match value {
        Value::Object(fields) => {
            for (field, v) in fields {
                row.insert(field.clone(), v.clone());
            }
        }
        other => {
            row.insert("_value".to_string(), other.clone());
        }
    }
    row
}

const PHRASE_PATTERNS: &[(&str, &str)] = &[
    (r"(\w+)\s+(?:greater than|>)\s+(\d+)", "$gt"),
    (r"(\w+)\s+(?:less than|<)\s+(\d+)", "$lt"),
    (r#"(\w+)\s+contains\s+"([^"]+)""#, "$contains"),
    (r#"(\w+)\s+starts with\s+"([^"]+)""#, "$startsWith"),
    (r#"(\w+)\s+ends with\s+"([^"]+)""#, "$endsWith"),
    (r"(\w+)\s+between\s+(\d+)\s+and\s+(\d+)", "$between"),
];

fn phrases() -> &'static [(Regex, &'static str)] {
    static PHRASES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PHRASES.get_or_init(|| {
        PHRASE_PATTERNS
            .iter()
            .filter_map(|(pattern, operator)| Regex::new(pattern).ok().map(|re| (re, *operator)))
            .collect()
    })
}

/// Build a filter from a lowercased phrase such as `age greater than 30 and name starts with "a"`.
///
/// Each phrase kind is recognised at most once. Clauses on the same field share one
/// operator mapping; unrecognised text contributes nothing, so an empty phrase matches everything.
pub fn parse_natural_query(text: &str) -> Filter {
    let normalized = text.trim().to_lowercase();
    let mut clauses: Map<String, Value> = Map::new();

    for (re, operator) in phrases() {
        let Some(caps) = re.captures(&normalized) else {
            continue;
        };
        let field = caps[1].to_string();
        let operand = match *operator {
            "$gt" | "$lt" => match caps[2].parse::<i64>() {
                Ok(n) => Value::from(n),
                Err(_) => continue,
            },
            "$between" => match (caps[2].parse::<i64>(), caps[3].parse::<i64>()) {
                (Ok(low), Ok(high)) => Value::from(vec![low, high]),
                _ => continue,
            },
            _ => Value::String(caps[2].to_string()),
        };

        let entry = clauses
            .entry(field)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(ops) = entry {
            ops.insert(operator.to_string(), operand);
        }
    }

    Filter::from(Value::Object(clauses))
}
