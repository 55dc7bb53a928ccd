use crate::error::Result;
use super::types::Schema;
use std::path::Path;

/// Parse a schema file (YAML or JSON) into a Schema
pub fn parse_schema(path: &Path) -> Result<Schema> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a schema string into a Schema. JSON is a subset of YAML, so both are accepted.
pub fn parse_schema_str(content: &str) -> Result<Schema> {
    let value: serde_json::Value = serde_yaml::from_str(content)?;
    Schema::from_value(value)
}
