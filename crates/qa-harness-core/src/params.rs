//! Generation parameter set.
//!
//! Only the options below are recognized. Unknown keys are rejected at
//! deserialization time (`deny_unknown_fields`) and surface as
//! [`QaError::InvalidParameter`] through [`GenerationParams::from_json`] or
//! the app crate's config loader.

use serde::{Deserialize, Serialize};

use crate::error::QaError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationParams {
    /// Model identifier passed to the generation service.
    pub model_id: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    0.5
}
fn default_max_tokens() -> u32 {
    1000
}

impl GenerationParams {
    /// Parse and validate a JSON object of parameters.
    pub fn from_json(value: serde_json::Value) -> Result<Self, QaError> {
        let params: GenerationParams = serde_json::from_value(value)
            .map_err(|e| QaError::InvalidParameter(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), QaError> {
        if self.model_id.trim().is_empty() {
            return Err(QaError::InvalidParameter("model_id must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(QaError::InvalidParameter(format!(
                "temperature must be in [0.0, 2.0], got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(QaError::InvalidParameter("max_tokens must be >= 1".into()));
        }
        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(QaError::InvalidParameter(format!(
                    "top_p must be in [0.0, 1.0], got {}",
                    top_p
                )));
            }
        }
        Ok(())
    }
}
