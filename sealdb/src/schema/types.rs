use crate::error::{Result, SealDbError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A schema registered for a key or key prefix.
///
/// The same JSON object is read two ways depending on the value it guards:
/// as a single-value [`FieldSpec`] for scalars and lists, or as a mapping of
/// field name to [`FieldSpec`] when the value is a (non-list) object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema(Map<String, Value>);

impl Schema {
    /// Build a schema from a JSON value. Only objects are accepted.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Schema(map)),
            other => Err(SealDbError::Schema(format!(
                "Schema must be an object, got {}",
                crate::value::kind_name(Some(&other))
            ))),
        }
    }

    /// Interpret the whole schema as a single-value spec.
    pub fn as_field_spec(&self) -> Result<FieldSpec> {
        FieldSpec::from_value(&Value::Object(self.0.clone()))
    }

    /// Interpret the schema as an object schema: one spec per declared field.
    /// Entries that are not objects carry no constraints.
    pub fn field_specs(&self) -> Result<Vec<(String, FieldSpec)>> {
        self.0
            .iter()
            .map(|(name, raw)| {
                let spec = if raw.is_object() {
                    FieldSpec::from_value(raw).map_err(|e| {
                        SealDbError::Schema(format!("Field '{name}': {e}"))
                    })?
                } else {
                    FieldSpec::default()
                };
                Ok((name.clone(), spec))
            })
            .collect()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// Constraints applied to one value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, alias = "validatorName", skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,
}

impl FieldSpec {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| SealDbError::Schema(format!("Invalid field spec: {e}")))
    }
}

/// Field type vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Date,
    /// Unrecognised type names accept any value.
    #[serde(untagged)]
    Other(std::string::String),
}

impl FieldType {
    pub fn name(&self) -> &str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Date => "date",
            FieldType::Other(name) => name,
        }
    }
}
