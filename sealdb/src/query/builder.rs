use super::{Filter, QueryOptions, QueryOutcome, SortDirection, SortSpec};
use crate::store::Store;
use serde_json::{Map, Value};

/// Comparison used by [`QueryBuilder::where_op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    Fuzzy,
}

impl Op {
    pub fn operator(self) -> &'static str {
        match self {
            Op::Eq => "$eq",
            Op::Ne => "$ne",
            Op::Gt => "$gt",
            Op::Gte => "$gte",
            Op::Lt => "$lt",
            Op::Lte => "$lte",
            Op::In => "$in",
            Op::Contains => "$contains",
            Op::StartsWith => "$startsWith",
            Op::EndsWith => "$endsWith",
            Op::Regex => "$regex",
            Op::Fuzzy => "$fuzzy",
        }
    }
}

/// Fluent construction of a filter plus query options, executed against a store.
///
/// Field clauses replace any earlier clause on the same field; `and`, `or` and
/// `nor` accumulate.
#[derive(Clone)]
pub struct QueryBuilder<'a> {
    store: &'a Store,
    clauses: Vec<(String, Filter)>,
    options: QueryOptions,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self {
            store,
            clauses: Vec::new(),
            options: QueryOptions::default(),
        }
    }

    /// Constrain `field` with an arbitrary condition.
    pub fn filter(mut self, field: &str, condition: impl Into<Filter>) -> Self {
        self.set(field, condition.into());
        self
    }

    pub fn where_op(self, field: &str, op: Op, value: impl Into<Value>) -> Self {
        self.operator(field, op.operator(), value.into())
    }

    pub fn and(self, conditions: Vec<Filter>) -> Self {
        self.append("$and", conditions)
    }

    pub fn or(self, conditions: Vec<Filter>) -> Self {
        self.append("$or", conditions)
    }

    pub fn nor(self, conditions: Vec<Filter>) -> Self {
        self.append("$nor", conditions)
    }

    /// Negate a condition against the whole document.
    pub fn not(mut self, condition: impl Into<Filter>) -> Self {
        self.set("$not", condition.into());
        self
    }

    pub fn exists(self, field: &str, should_exist: bool) -> Self {
        self.operator(field, "$exists", Value::Bool(should_exist))
    }

    pub fn type_of(self, field: &str, kind: &str) -> Self {
        self.operator(field, "$type", Value::String(kind.to_string()))
    }

    pub fn between(self, field: &str, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        self.operator(field, "$between", Value::Array(vec![min.into(), max.into()]))
    }

    pub fn size(self, field: &str, expected: usize) -> Self {
        self.operator(field, "$size", Value::from(expected))
    }

    pub fn elem_match(mut self, field: &str, condition: impl Into<Filter>) -> Self {
        self.set(field, Filter::op("$elemMatch", condition));
        self
    }

    pub fn all(self, field: &str, values: Vec<Value>) -> Self {
        self.operator(field, "$all", Value::Array(values))
    }

    pub fn nin(self, field: &str, values: Vec<Value>) -> Self {
        self.operator(field, "$nin", Value::Array(values))
    }

    /// Case-insensitive text search within `field`.
    pub fn text(self, field: &str, term: &str) -> Self {
        self.operator(field, "$search", Value::String(term.to_string()))
    }

    pub fn limit(mut self, count: usize) -> Self {
        self.options.limit = count;
        self
    }

    pub fn skip(mut self, count: usize) -> Self {
        self.options.skip = count;
        self
    }

    /// Add a sort key. Calls accumulate in priority order.
    pub fn sort(mut self, field: &str, direction: SortDirection) -> Self {
        let mut fields = match self.options.sort.take() {
            Some(SortSpec::Fields(fields)) => fields,
            Some(SortSpec::Field(existing)) => vec![(existing, SortDirection::Asc)],
            None => Vec::new(),
        };
        fields.retain(|(f, _)| f != field);
        fields.push((field.to_string(), direction));
        self.options.sort = Some(SortSpec::Fields(fields));
        self
    }

    pub fn project(mut self, projection: Map<String, Value>) -> Self {
        self.options.projection = Some(projection);
        self
    }

    pub fn cache(mut self, key: &str) -> Self {
        self.options.cache_key = Some(key.to_string());
        self
    }

    pub fn explain(mut self) -> Self {
        self.options.explain = true;
        self
    }

    pub fn reset(mut self) -> Self {
        self.clauses.clear();
        self.options = QueryOptions::default();
        self
    }

    pub fn build(&self) -> (Filter, QueryOptions) {
        (Filter::Fields(self.clauses.clone()), self.options.clone())
    }

    pub fn execute(&self) -> QueryOutcome {
        let (filter, options) = self.build();
        self.store.query(&filter, &options)
    }

    pub fn count(&self) -> usize {
        self.execute().results().len()
    }

    /// First result, ignoring any configured limit.
    pub fn first(&self) -> Option<Value> {
        let (filter, mut options) = self.build();
        options.limit = 1;
        self.store.query(&filter, &options).into_results().into_iter().next()
    }

    fn operator(mut self, field: &str, operator: &str, operand: Value) -> Self {
        self.set(field, Filter::op(operator, operand));
        self
    }

    fn set(&mut self, field: &str, condition: Filter) {
        match self.clauses.iter_mut().find(|(f, _)| f == field) {
            Some(entry) => entry.1 = condition,
            None => self.clauses.push((field.to_string(), condition)),
        }
    }

    fn append(mut self, operator: &str, conditions: Vec<Filter>) -> Self {
        if let Some((_, Filter::AnyOf(existing))) = self.clauses.iter_mut().find(|(f, _)| f == operator) {
            existing.extend(conditions);
            return self;
        }
        self.set(operator, Filter::AnyOf(conditions));
        self
    }
}
