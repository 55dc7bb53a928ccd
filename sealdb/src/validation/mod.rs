use crate::error::{Result, SealDbError};
use crate::schema::{FieldSpec, FieldType, Schema};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A named predicate that schemas can reference through their `validator` field.
///
/// Any closure `Fn(&Value, &str) -> bool` is a validator. Implement the trait
/// directly (or wrap a closure in [`Fallible`]) when the check itself can fail;
/// an `Err` is treated as "invalid", never propagated.
pub trait Validator: Send + Sync {
    fn check(&self, value: &Value, field_path: &str) -> std::result::Result<bool, BoxError>;
}

impl<F> Validator for F
where
    F: Fn(&Value, &str) -> bool + Send + Sync,
{
    fn check(&self, value: &Value, field_path: &str) -> std::result::Result<bool, BoxError> {
        Ok(self(value, field_path))
    }
}

/// Adapter for closures that return `Result<bool, _>`.
pub struct Fallible<F>(pub F);

impl<F> Validator for Fallible<F>
where
    F: Fn(&Value, &str) -> std::result::Result<bool, BoxError> + Send + Sync,
{
    fn check(&self, value: &Value, field_path: &str) -> std::result::Result<bool, BoxError> {
        (self.0)(value, field_path)
    }
}

/// What gets persisted for a validator: its name (the map key) and when it was registered.
/// The callback itself only ever lives in process memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorRecord {
    pub registered_at: DateTime<Utc>,
}

struct ValidatorEntry {
    record: ValidatorRecord,
    callback: Option<Arc<dyn Validator>>,
}

/// Schema registry plus named-validator registry.
#[derive(Default)]
pub struct ValidationEngine {
    schemas: IndexMap<String, Schema>,
    validators: IndexMap<String, ValidatorEntry>,
}

impl ValidationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Schemas ──────────────────────────────────────────────────────

    pub fn set_schema(&mut self, key: &str, schema: Value) -> Result<()> {
        check_name(key, "Schema key")?;
        let schema = Schema::from_value(schema)?;
        self.schemas.insert(key.to_string(), schema);
        Ok(())
    }

    /// Exact match first, then the first registered key that prefixes `key`.
    pub fn get_schema(&self, key: &str) -> Option<&Schema> {
        if let Some(schema) = self.schemas.get(key) {
            return Some(schema);
        }
        self.schemas
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, schema)| schema)
    }

    pub fn remove_schema(&mut self, key: &str) -> bool {
        self.schemas.shift_remove(key).is_some()
    }

    pub fn schemas(&self) -> &IndexMap<String, Schema> {
        &self.schemas
    }

    pub fn clear_schemas(&mut self) {
        self.schemas.clear();
    }

    // ── Validators ───────────────────────────────────────────────────

    pub fn add_validator<V>(&mut self, name: &str, validator: V) -> Result<()>
    where
        V: Validator + 'static,
    {
        check_name(name, "Validator name")?;
        self.validators.insert(
            name.to_string(),
            ValidatorEntry {
                record: ValidatorRecord {
                    registered_at: Utc::now(),
                },
                callback: Some(Arc::new(validator)),
            },
        );
        Ok(())
    }

    pub fn remove_validator(&mut self, name: &str) -> bool {
        self.validators.shift_remove(name).is_some()
    }

    pub fn validator_names(&self) -> Vec<String> {
        self.validators.keys().cloned().collect()
    }

    /// True when a callback is bound for `name` in this process.
    pub fn is_validator_bound(&self, name: &str) -> bool {
        self.validators
            .get(name)
            .map(|entry| entry.callback.is_some())
            .unwrap_or(false)
    }

    pub fn validator_count(&self) -> usize {
        self.validators.len()
    }

    pub fn clear_validators(&mut self) {
        self.validators.clear();
    }

    // ── Persistence ──────────────────────────────────────────────────

    pub fn export_validators(&self) -> IndexMap<String, ValidatorRecord> {
        self.validators
            .iter()
            .map(|(name, entry)| (name.clone(), entry.record.clone()))
            .collect()
    }

    /// Replace both registries with loaded state. Callbacks already bound in this
    /// process stay bound for names that are still present.
    pub fn import(
        &mut self,
        schemas: IndexMap<String, Schema>,
        validators: IndexMap<String, ValidatorRecord>,
    ) {
        let mut previous = std::mem::take(&mut self.validators);
        self.schemas = schemas;
        self.validators = validators
            .into_iter()
            .map(|(name, record)| {
                let callback = previous.shift_remove(&name).and_then(|entry| entry.callback);
                (name, ValidatorEntry { record, callback })
            })
            .collect();
    }

    // ── Validation ───────────────────────────────────────────────────

    /// Validate `value` against the schema resolved for `key`, applying defaults.
    /// Returns the value to store.
    pub fn validate_and_process(&self, key: &str, value: Value) -> Result<Value> {
        let schema = match self.get_schema(key) {
            Some(schema) => schema,
            None => return Ok(value),
        };

        match value {
            Value::Object(mut fields) => {
                for (field_name, spec) in schema.field_specs()? {
                    let path = format!("{key}.{field_name}");
                    let current = fields.get(&field_name).cloned();
                    if let Some(processed) = self.process_value(&path, current, &spec)? {
                        fields.insert(field_name, processed);
                    }
                }
                Ok(Value::Object(fields))
            }
            other => {
                let spec = schema.as_field_spec()?;
                Ok(self.process_value(key, Some(other), &spec)?.unwrap_or(Value::Null))
            }
        }
    }

    fn process_value(
        &self,
        path: &str,
        value: Option<Value>,
        spec: &FieldSpec,
    ) -> Result<Option<Value>> {
        let value = value.or_else(|| spec.default.clone());

        if value.as_ref().map(Value::is_null).unwrap_or(true) {
            if spec.required {
                return Err(SealDbError::validation(path, "field is required"));
            }
            return Ok(value);
        }
        let present = match &value {
            Some(v) => v,
            None => return Ok(None),
        };

        if let Some(field_type) = &spec.field_type {
            if !matches_type(present, field_type) {
                return Err(SealDbError::validation(
                    path,
                    format!("must be of type '{}'", field_type.name()),
                ));
            }
        }

        if let Some(name) = &spec.validator {
            if !self.run_validator(name, present, path)? {
                return Err(SealDbError::validation(
                    path,
                    format!("validator '{name}' rejected the value"),
                ));
            }
        }

        if let Some(min) = spec.min {
            if !meets_bound(present, |measure| measure >= min) {
                return Err(SealDbError::validation(
                    path,
                    format!("must be at least {}", format_bound(min)),
                ));
            }
        }

        if let Some(max) = spec.max {
            if !meets_bound(present, |measure| measure <= max) {
                return Err(SealDbError::validation(
                    path,
                    format!("must be at most {}", format_bound(max)),
                ));
            }
        }

        if let Some(pattern) = &spec.pattern {
            let re = regex::Regex::new(pattern).map_err(|e| {
                SealDbError::Schema(format!("Invalid pattern for '{path}': {e}"))
            })?;
            let matched = present.as_str().map(|s| re.is_match(s)).unwrap_or(false);
            if !matched {
                return Err(SealDbError::validation(
                    path,
                    "does not match required pattern",
                ));
            }
        }

        Ok(value)
    }

    fn run_validator(&self, name: &str, value: &Value, path: &str) -> Result<bool> {
        let entry = self.validators.get(name).ok_or_else(|| {
            SealDbError::validation(path, format!("validator '{name}' not found"))
        })?;
        let callback = entry.callback.as_ref().ok_or_else(|| {
            SealDbError::validation(
                path,
                format!("validator '{name}' has no callback registered in this process"),
            )
        })?;

        match panic::catch_unwind(AssertUnwindSafe(|| callback.check(value, path))) {
            Ok(Ok(valid)) => Ok(valid),
            Ok(Err(e)) => {
                log::debug!("Validator '{name}' failed on '{path}': {e}");
                Ok(false)
            }
            Err(_) => {
                log::warn!("Validator '{name}' panicked on '{path}'; treating value as invalid");
                Ok(false)
            }
        }
    }
}

fn check_name(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SealDbError::validation(name, format!("{what} must be a non-empty string")));
    }
    Ok(())
}

fn matches_type(value: &Value, field_type: &FieldType) -> bool {
    match field_type {
        FieldType::String => value.is_string(),
        FieldType::Number => value.as_f64().map(f64::is_finite).unwrap_or(false),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Array => value.is_array(),
        FieldType::Object => value.is_object(),
        FieldType::Date => value.as_str().map(parses_as_date).unwrap_or(false),
        FieldType::Other(_) => true,
    }
}

fn parses_as_date(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok()
}

/// Numbers are measured by value, strings and lists by length. Other kinds pass.
fn meets_bound(value: &Value, check: impl Fn(f64) -> bool) -> bool {
    match value {
        Value::Number(n) => n.as_f64().map(&check).unwrap_or(false),
        Value::String(s) => check(s.chars().count() as f64),
        Value::Array(items) => check(items.len() as f64),
        _ => true,
    }
}

fn format_bound(bound: f64) -> String {
    if bound.fract() == 0.0 {
        format!("{}", bound as i64)
    } else {
        bound.to_string()
    }
}
