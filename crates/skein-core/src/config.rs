//! Engine configuration.
//!
//! すべてのフィールドにデフォルトがあるので、空の JSON `{}` でも起動できる。

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Backoff used for CAS retries and transport retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 5,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Owner recorded on clustered job references.
    pub node_id: String,

    /// `max` of a queue the first time it is seen.
    pub default_max_concurrency: i64,

    /// Upper bound on concurrently running async jobs.
    pub job_workers: usize,

    pub tx_retry: RetryConfig,

    /// Transport retry around the remote worker and the notifier; `None`
    /// leaves them bare.
    pub remote_retry: Option<RetryConfig>,

    /// Delete a disposable task right away when nothing depends on it.
    pub delete_on_dispose: bool,

    /// Period of the background disposal sweep; `None` disables it.
    pub cleanup_interval_ms: Option<u64>,

    pub max_transitions_per_update: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: "local".to_string(),
            default_max_concurrency: 5,
            job_workers: 16,
            tx_retry: RetryConfig::default(),
            remote_retry: None,
            delete_on_dispose: false,
            cleanup_interval_ms: None,
            max_transitions_per_update: 64,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::Validation(format!("bad engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_workers == 0 {
            return Err(EngineError::Validation("job_workers must be > 0".into()));
        }
        if self.default_max_concurrency < 0 {
            return Err(EngineError::Validation(
                "default_max_concurrency must be >= 0".into(),
            ));
        }
        if self.remote_retry.as_ref().is_some_and(|r| r.max_attempts == 0) {
            return Err(EngineError::Validation(
                "remote_retry.max_attempts must be > 0".into(),
            ));
        }
        if self.max_transitions_per_update == 0 {
            return Err(EngineError::Validation(
                "max_transitions_per_update must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn partial_json_overrides_fields() {
        let config = EngineConfig::from_json_str(
            r#"{ "node_id": "n1", "tx_retry": { "max_attempts": 9 } }"#,
        )
        .unwrap();
        assert_eq!(config.node_id, "n1");
        assert_eq!(config.tx_retry.max_attempts, 9);
        assert_eq!(config.tx_retry.base_delay_ms, 5);
    }

    #[test]
    fn remote_retry_is_off_unless_configured() {
        assert!(EngineConfig::default().remote_retry.is_none());
        let config = EngineConfig::from_json_str(r#"{ "remote_retry": { "max_attempts": 4 } }"#)
            .unwrap();
        let retry = config.remote_retry.unwrap();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.base_delay_ms, 5);

        let err = EngineConfig::from_json_str(r#"{ "remote_retry": { "max_attempts": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "job_workers": 0 }"#).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
