//! Edge validation for definitions, step specs and execution context.

use std::collections::HashSet;

use serde_json::{Map, Value};

use super::types::{DefinitionSpec, StepSpec};
use crate::error::{Error, Result};

/// Marker appended to truncated error text.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Validate a definition submitted for creation.
///
/// A definition lacking both a name and a step list is rejected. Since
/// definitions are addressed by name, a missing name is rejected on its own
/// too; step contents are checked when an execution starts.
pub fn validate_definition(spec: &DefinitionSpec) -> Result<()> {
    let name = spec.name.trim();

    if name.is_empty() && spec.steps.is_none() {
        return Err(Error::Validation(
            "Workflow definition must have a name and steps".into(),
        ));
    }

    if name.is_empty() {
        return Err(Error::Validation("Workflow name is required".into()));
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(
            "Workflow name must contain only alphanumeric characters, hyphens, and underscores"
                .into(),
        ));
    }

    Ok(())
}

/// Validate the step list captured for an execution.
///
/// Every step needs a non-empty name and target service; names must be
/// unique so step records stay unambiguous.
pub fn validate_steps(steps: &[StepSpec]) -> Result<()> {
    let mut names = HashSet::new();
    for (index, step) in steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            return Err(Error::Validation(format!(
                "Step {} is missing a name",
                index
            )));
        }
        if step.target_service.trim().is_empty() {
            return Err(Error::Validation(format!(
                "Step '{}' is missing a service",
                step.name
            )));
        }
        if !names.insert(step.name.as_str()) {
            return Err(Error::Validation(format!(
                "Duplicate step name: {}",
                step.name
            )));
        }
    }
    Ok(())
}

/// Check the serialized size of an execution context against a ceiling.
///
/// Returns the measured size. Exceeding the ceiling is not retryable: it
/// points at unbounded accumulation in the definition.
pub fn check_context_size(context: &Map<String, Value>, limit: usize) -> Result<usize> {
    let size = serde_json::to_vec(context)?.len();
    if size > limit {
        return Err(Error::ContextTooLarge { size, limit });
    }
    Ok(size)
}

/// Truncate an error message to `max_len` characters, appending a marker.
pub fn truncate_error(message: &str, max_len: usize) -> String {
    if message.chars().count() <= max_len {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(max_len).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_without_name_or_steps_rejected() {
        let err = validate_definition(&DefinitionSpec::default()).unwrap_err();
        assert!(err.to_string().contains("name and steps"));
    }

    #[test]
    fn test_definition_name_rules() {
        let mut spec = DefinitionSpec::new("weekly-audit_v2", vec![]);
        assert!(validate_definition(&spec).is_ok());

        spec.name = "bad name!".into();
        assert!(validate_definition(&spec).is_err());

        spec.name = "   ".into();
        let err = validate_definition(&spec).unwrap_err();
        assert!(err.to_string().contains("name is required"));
    }

    #[test]
    fn test_definition_with_name_but_no_steps_accepted() {
        let spec = DefinitionSpec {
            name: "bare".into(),
            ..DefinitionSpec::default()
        };
        assert!(validate_definition(&spec).is_ok());
    }

    #[test]
    fn test_steps_require_name_and_service() {
        assert!(validate_steps(&[StepSpec::new("a", "analyzer")]).is_ok());

        let err = validate_steps(&[StepSpec::new("", "analyzer")]).unwrap_err();
        assert!(err.to_string().contains("missing a name"));

        let err = validate_steps(&[StepSpec::new("a", " ")]).unwrap_err();
        assert!(err.to_string().contains("missing a service"));

        let err = validate_steps(&[StepSpec::new("a", "x"), StepSpec::new("a", "y")]).unwrap_err();
        assert!(err.to_string().contains("Duplicate step name"));
    }

    fn context_of_size(total: usize) -> Map<String, Value> {
        // {"k":"<n chars>"} serializes to n + 8 bytes
        let mut context = Map::new();
        context.insert("k".into(), json!("x".repeat(total - 8)));
        context
    }

    #[test]
    fn test_context_size_at_limit_passes() {
        let limit = 1_048_576;
        let context = context_of_size(limit);
        assert_eq!(check_context_size(&context, limit).unwrap(), limit);
    }

    #[test]
    fn test_context_size_one_over_limit_fails() {
        let limit = 1_048_576;
        let context = context_of_size(limit + 1);
        match check_context_size(&context, limit) {
            Err(Error::ContextTooLarge { size, limit: l }) => {
                assert_eq!(size, 1_048_577);
                assert_eq!(l, limit);
            }
            other => panic!("expected ContextTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_truncate_error() {
        assert_eq!(truncate_error("short", 10), "short");
        let long = "e".repeat(50);
        let truncated = truncate_error(&long, 20);
        assert!(truncated.starts_with(&"e".repeat(20)));
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        assert_eq!(truncated.chars().count(), 20 + TRUNCATION_MARKER.len());
    }
}
