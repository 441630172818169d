//! Submit-boundary config validation.
//!
//! Each test type has a small set of required fields. Validation happens
//! synchronously in `submit`, before any queue or network interaction;
//! past this boundary the payload is opaque to the engine.

use serde_json::Value;

use crate::error::EngineError;
use crate::model::TestType;

/// Validate a config payload for the given test type.
pub fn validate_config(test_type: TestType, config: &Value) -> Result<(), EngineError> {
    let obj = config
        .as_object()
        .ok_or_else(|| invalid(test_type, "config must be a JSON object"))?;

    match test_type {
        TestType::Api => {
            let endpoints = obj
                .get("endpoints")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid(test_type, "missing 'endpoints' array"))?;
            if endpoints.is_empty() {
                return Err(invalid(test_type, "'endpoints' must not be empty"));
            }
        }
        TestType::Compatibility => {
            require_url(test_type, obj)?;
            let browsers = obj
                .get("browsers")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid(test_type, "missing 'browsers' array"))?;
            if browsers.is_empty() {
                return Err(invalid(test_type, "'browsers' must not be empty"));
            }
        }
        TestType::Stress | TestType::Security | TestType::Performance | TestType::Seo => {
            require_url(test_type, obj)?;
        }
    }

    Ok(())
}

fn require_url(test_type: TestType, obj: &serde_json::Map<String, Value>) -> Result<(), EngineError> {
    match obj.get("target_url").and_then(Value::as_str) {
        Some(url) if !url.trim().is_empty() => Ok(()),
        Some(_) => Err(invalid(test_type, "'target_url' must not be empty")),
        None => Err(invalid(test_type, "missing 'target_url'")),
    }
}

fn invalid(test_type: TestType, reason: &str) -> EngineError {
    EngineError::Validation {
        test_type,
        reason: reason.to_string(),
    }
}
