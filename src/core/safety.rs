//! Input limits and enforcement for triggered runs.
//!
//! Rejects bad triggers before any run state exists:
//! - Missing or empty required fields
//! - Oversized text input
//! - Denylist patterns (to avoid accepting secrets as uploads)

use glob::Pattern;
use thiserror::Error;

use crate::config::InputSettings;
use crate::domain::{InputValue, RunInputs};
use crate::error::EngineError;

/// Limits applied to run inputs and uploads
#[derive(Debug, Clone)]
pub struct InputLimits {
    /// Fields that must be present and non-empty
    pub required: Vec<String>,

    /// Maximum total text input in bytes (default: 1MB)
    pub max_input_bytes: u64,

    /// Glob patterns to reject (files matching these won't be accepted)
    pub denylist_patterns: Vec<String>,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self::from(&InputSettings::default())
    }
}

impl From<&InputSettings> for InputLimits {
    fn from(settings: &InputSettings) -> Self {
        Self {
            required: settings.required.clone(),
            max_input_bytes: settings.max_input_bytes,
            denylist_patterns: settings.denylist_patterns.clone(),
        }
    }
}

impl InputLimits {
    /// Check if a file name or path matches any denylist pattern
    pub fn is_denylisted(&self, path: &str) -> bool {
        for pattern_str in &self.denylist_patterns {
            if let Ok(pattern) = Pattern::new(pattern_str) {
                if pattern.matches(path) {
                    return true;
                }
            }
        }
        false
    }

    /// Validate a trigger's inputs against required fields, size and denylist
    pub fn validate_inputs(&self, inputs: &RunInputs) -> Result<(), SafetyViolation> {
        if inputs.is_empty() {
            return Err(SafetyViolation::NoInputs);
        }

        for field in &self.required {
            match inputs.get(field) {
                Some(value) if !value.is_empty() => {}
                _ => {
                    return Err(SafetyViolation::MissingRequired {
                        field: field.clone(),
                    })
                }
            }
        }

        let size: u64 = inputs
            .values()
            .filter_map(InputValue::as_text)
            .map(|text| text.len() as u64)
            .sum();
        if size > self.max_input_bytes {
            return Err(SafetyViolation::MaxInputBytes {
                actual: size,
                limit: self.max_input_bytes,
            });
        }

        for file in inputs.values().flat_map(InputValue::files) {
            if self.is_denylisted(&file.original_name) {
                return Err(SafetyViolation::DenylistMatch {
                    path: file.original_name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Validate an upload's name against the denylist
    pub fn validate_upload_name(&self, name: &str) -> Result<(), SafetyViolation> {
        if name.trim().is_empty() {
            return Err(SafetyViolation::EmptyName);
        }
        if self.is_denylisted(name) {
            return Err(SafetyViolation::DenylistMatch {
                path: name.to_string(),
            });
        }
        Ok(())
    }
}

/// Safety violation errors
#[derive(Debug, Clone, Error)]
pub enum SafetyViolation {
    #[error("No input values supplied")]
    NoInputs,

    #[error("Required field '{field}' is missing or empty")]
    MissingRequired { field: String },

    #[error("Maximum input bytes exceeded: {actual} > {limit}")]
    MaxInputBytes { actual: u64, limit: u64 },

    #[error("Upload name is empty")]
    EmptyName,

    #[error("Path matches denylist pattern: {path}")]
    DenylistMatch { path: String },
}

impl From<SafetyViolation> for EngineError {
    fn from(violation: SafetyViolation) -> Self {
        EngineError::InvalidInput(violation.to_string())
    }
}
