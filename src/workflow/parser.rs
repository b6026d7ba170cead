//! Workflow definition parser.
//!
//! Definitions are YAML documents; JSON is accepted as the YAML subset it is.

use std::path::Path;

use super::types::DefinitionSpec;
use crate::error::{Error, Result};

/// Parse a definition from a YAML (or JSON) string.
pub fn parse_definition(yaml: &str) -> Result<DefinitionSpec> {
    if yaml.trim().is_empty() {
        return Err(Error::Parse("Empty workflow definition".to_string()));
    }

    let spec: DefinitionSpec = serde_yaml::from_str(yaml).map_err(|e| {
        let msg = e.to_string();
        if let Some(field) = extract_missing_field(&msg) {
            Error::Parse(format!("Missing required field: {}", field))
        } else {
            Error::Parse(format!("Invalid YAML: {}", msg))
        }
    })?;
    Ok(spec)
}

/// Parse a definition from a file path.
pub fn parse_definition_file(path: &Path) -> Result<DefinitionSpec> {
    let content = std::fs::read_to_string(path)?;
    parse_definition(&content)
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}
