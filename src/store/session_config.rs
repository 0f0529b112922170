//! Per-session configuration and its explicit store field mapping.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Store hash field holding [`SessionConfig::request_interval`].
pub const REQUEST_INTERVAL_FIELD: &str = "RequestInterval";

/// Configuration a session host sets for its listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Minimum seconds between requests from one identity.
    pub request_interval: u32,
}

impl SessionConfig {
    /// Validate a config received from a client.
    pub fn validate(&self) -> Result<(), String> {
        if self.request_interval == 0 {
            return Err("requestInterval must be a positive integer".to_string());
        }
        Ok(())
    }

    /// Hash fields written to the store.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![(REQUEST_INTERVAL_FIELD, self.request_interval.to_string())]
    }

    /// Rebuild from stored hash fields. `None` when the hash is empty or a
    /// required field is missing or unparsable.
    #[must_use]
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let request_interval = fields.get(REQUEST_INTERVAL_FIELD)?.parse().ok()?;
        Some(Self { request_interval })
    }
}
