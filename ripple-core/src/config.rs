//! Runtime configuration.

use serde::{Deserialize, Serialize};

/// Tunables for a [`Runtime`](crate::reactive::Runtime).
///
/// All fields have working defaults; embedders usually construct one from
/// deployment config and pass it to `Runtime::with_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of effect executions in a single batch before the
    /// batch is declared cyclic and aborted.
    pub max_batch_effects: usize,

    /// Batch sizes above this are logged at warn level. Large batches are
    /// legal; this is an operational smell threshold, not a limit.
    pub warn_batch_effects: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_batch_effects: 1_000,
            warn_batch_effects: 256,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from a JSON document.
    ///
    /// Missing fields fall back to their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert!(config.max_batch_effects > 0);
        assert!(config.warn_batch_effects <= config.max_batch_effects);
    }

    #[test]
    fn from_json_fills_missing_fields() {
        let config = RuntimeConfig::from_json(r#"{"max_batch_effects": 16}"#).unwrap();
        assert_eq!(config.max_batch_effects, 16);
        assert_eq!(
            config.warn_batch_effects,
            RuntimeConfig::default().warn_batch_effects
        );
    }

    #[test]
    fn from_json_rejects_malformed_input() {
        assert!(RuntimeConfig::from_json("not json").is_err());
    }
}
