//! Split configuration
//!
//! Index-level knobs for routing pre-allocation, split granularity and the
//! hash function applied to routing keys.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::scaling::hash::HashFunction;
use crate::scaling::routing_math::{IndexRouting, MAX_ROUTING_SHARDS_LOG2_LIMIT};
use crate::{Result, SplitError};

/// Default log2 of the routing shards reserved per index (1024)
pub const DEFAULT_MAX_ROUTING_SHARDS_LOG2: u32 = 10;
/// Default minimum width of a child hash range
pub const DEFAULT_MIN_RANGE_SIZE: i32 = 1000;

/// Split configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// log2 of the routing shards reserved for a whole index
    pub max_routing_shards_log2: u32,
    /// A range is never split into pieces of this width or less
    pub min_range_size: i32,
    /// Hash function for routing keys
    pub hash_function: HashFunction,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_routing_shards_log2: DEFAULT_MAX_ROUTING_SHARDS_LOG2,
            min_range_size: DEFAULT_MIN_RANGE_SIZE,
            hash_function: HashFunction::Murmur3,
        }
    }
}

impl SplitConfig {
    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SplitConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    /// Check value bounds
    pub fn validate(&self) -> Result<()> {
        if self.max_routing_shards_log2 == 0
            || self.max_routing_shards_log2 > MAX_ROUTING_SHARDS_LOG2_LIMIT
        {
            return Err(SplitError::InvalidConfig(format!(
                "max_routing_shards_log2 must be in 1..={}, got {}",
                MAX_ROUTING_SHARDS_LOG2_LIMIT, self.max_routing_shards_log2
            )));
        }
        if self.min_range_size < 0 {
            return Err(SplitError::InvalidConfig(format!(
                "min_range_size must not be negative, got {}",
                self.min_range_size
            )));
        }
        Ok(())
    }

    /// Routing sizing for an index created with `num_seeds` shards
    pub fn index_routing(&self, num_seeds: u32) -> Result<IndexRouting> {
        self.validate()?;
        IndexRouting::new(num_seeds, self.max_routing_shards_log2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SplitConfig::default();
        assert_eq!(config.max_routing_shards_log2, 10);
        assert_eq!(config.min_range_size, 1000);
        assert_eq!(config.hash_function, HashFunction::Murmur3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SplitConfig::from_json_str(r#"{"min_range_size": 10}"#).unwrap();
        assert_eq!(config.min_range_size, 10);
        assert_eq!(config.max_routing_shards_log2, 10);

        let config = SplitConfig::from_json_str(r#"{"hash_function": "ahash"}"#).unwrap();
        assert_eq!(config.hash_function, HashFunction::AHash);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = SplitConfig::from_json_str(r#"{"max_routing_shards_log2": 0}"#).unwrap_err();
        assert!(matches!(err, SplitError::InvalidConfig(_)));

        let err = SplitConfig::from_json_str(r#"{"max_routing_shards_log2": 40}"#).unwrap_err();
        assert!(matches!(err, SplitError::InvalidConfig(_)));

        let err = SplitConfig::from_json_str(r#"{"min_range_size": -1}"#).unwrap_err();
        assert!(matches!(err, SplitError::InvalidConfig(_)));

        let err = SplitConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, SplitError::Interchange(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("split.json");
        std::fs::write(&path, r#"{"max_routing_shards_log2": 12}"#).unwrap();

        let config = SplitConfig::from_file(&path).unwrap();
        assert_eq!(config.max_routing_shards_log2, 12);
        assert_eq!(config.index_routing(4).unwrap().routing_shards(), 4096);
    }
}
