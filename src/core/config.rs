//! Mount and bridge configuration
//!
//! Both structs deserialize from TOML with every field optional:
//!
//! ```toml
//! initial_pool_size = 1000
//! maintained_pool_size = 100
//! checkpoint_interval_ms = 60000
//! data_dir = "data"
//! sync_prefixes = ["/pg_wal"]
//! corrupt_snapshot = "fail"
//! ```

use crate::error::{FsError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What to do when the log holds bytes but no readable snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptSnapshotPolicy {
    /// Refuse to mount
    #[default]
    Fail,
    /// Warn and start from an empty tree
    Reset,
}

/// Configuration of a pooled filesystem mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool size targeted by a fresh mount
    pub initial_pool_size: usize,
    /// Pool size targeted by maintenance and by recovered mounts
    pub maintained_pool_size: usize,
    /// Minimum time between automatic checkpoints
    #[serde(rename = "checkpoint_interval_ms", with = "millis")]
    pub checkpoint_interval: Duration,
    /// Directory (under the mount root) that holds backing files
    pub data_dir: String,
    /// Paths whose writes are tracked for `flush`; `None` tracks everything
    pub sync_prefixes: Option<Vec<String>>,
    pub corrupt_snapshot: CorruptSnapshotPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            initial_pool_size: 1000,
            maintained_pool_size: 100,
            checkpoint_interval: Duration::from_secs(60),
            data_dir: "data".to_string(),
            sync_prefixes: None,
            corrupt_snapshot: CorruptSnapshotPolicy::Fail,
        }
    }
}

impl PoolConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PoolConfig =
            toml::from_str(s).map_err(|e| FsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| FsError::Config(e.to_string()))
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.initial_pool_size == 0 {
            return Err(FsError::Config("initial_pool_size must be at least 1".into()));
        }
        if self.maintained_pool_size == 0 {
            return Err(FsError::Config("maintained_pool_size must be at least 1".into()));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(FsError::Config("checkpoint_interval_ms must be positive".into()));
        }
        if self.data_dir.is_empty() || self.data_dir.contains('/') || self.data_dir == "." || self.data_dir == ".." {
            return Err(FsError::Config(format!(
                "data_dir must be a single path component, got {:?}",
                self.data_dir
            )));
        }
        Ok(())
    }

    /// Whether writes to `path` are tracked for the next flush
    pub fn tracks(&self, path: &str) -> bool {
        match &self.sync_prefixes {
            None => true,
            Some(prefixes) => prefixes
                .iter()
                .any(|prefix| crate::core::path::starts_with(path, prefix)),
        }
    }

    pub fn with_initial_pool_size(mut self, size: usize) -> Self {
        self.initial_pool_size = size;
        self
    }

    pub fn with_maintained_pool_size(mut self, size: usize) -> Self {
        self.maintained_pool_size = size;
        self
    }

    /// Set both pool sizes at once
    pub fn with_pool_size(self, size: usize) -> Self {
        self.with_initial_pool_size(size).with_maintained_pool_size(size)
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<String>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Track only writes under these prefixes
    pub fn with_sync_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sync_prefixes = Some(prefixes.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_corrupt_snapshot(mut self, policy: CorruptSnapshotPolicy) -> Self {
        self.corrupt_snapshot = policy;
        self
    }
}

/// Buffer sizes of a synchronous bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub call_buffer_size: usize,
    pub response_buffer_size: usize,
    /// Sizes of the zero-copy buffers shared with the worker
    pub shared_buffers: Vec<usize>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            call_buffer_size: 8 * 1024,
            response_buffer_size: 8 * 1024,
            shared_buffers: Vec::new(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: BridgeConfig =
            toml::from_str(s).map_err(|e| FsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Buffers must fit a minimal call and response
    pub fn validate(&self) -> Result<()> {
        const MIN: usize = 256;
        if self.call_buffer_size < MIN || self.response_buffer_size < MIN {
            return Err(FsError::Config(format!(
                "call and response buffers need at least {} bytes",
                MIN
            )));
        }
        if self.call_buffer_size > i32::MAX as usize || self.response_buffer_size > i32::MAX as usize {
            return Err(FsError::Config("buffer sizes must fit the length slots".into()));
        }
        Ok(())
    }

    pub fn with_call_buffer_size(mut self, size: usize) -> Self {
        self.call_buffer_size = size;
        self
    }

    pub fn with_response_buffer_size(mut self, size: usize) -> Self {
        self.response_buffer_size = size;
        self
    }

    /// Register one more zero-copy buffer of `size` bytes
    pub fn with_shared_buffer(mut self, size: usize) -> Self {
        self.shared_buffers.push(size);
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.initial_pool_size, 1000);
        assert_eq!(config.maintained_pool_size, 100);
        assert_eq!(config.checkpoint_interval, Duration::from_secs(60));
        assert!(config.validate().is_ok());
        assert!(config.tracks("/anything"));
    }

    #[test]
    fn test_from_toml() {
        let config = PoolConfig::from_toml_str(
            r#"
            initial_pool_size = 8
            checkpoint_interval_ms = 500
            sync_prefixes = ["/pg_wal"]
            corrupt_snapshot = "reset"
            "#,
        )
        .unwrap();
        assert_eq!(config.initial_pool_size, 8);
        assert_eq!(config.maintained_pool_size, 100);
        assert_eq!(config.checkpoint_interval, Duration::from_millis(500));
        assert_eq!(config.corrupt_snapshot, CorruptSnapshotPolicy::Reset);
        assert!(config.tracks("/pg_wal/000001"));
        assert!(!config.tracks("/base/1/1259"));

        let back = PoolConfig::from_toml_str(&config.to_toml_string().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_validation() {
        assert!(PoolConfig::default().with_pool_size(0).validate().is_err());
        assert!(PoolConfig::default().with_data_dir("a/b").validate().is_err());
        assert!(PoolConfig::default()
            .with_checkpoint_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(PoolConfig::from_toml_str("initial_pool_size = \"many\"").is_err());

        assert!(BridgeConfig::default().validate().is_ok());
        assert!(BridgeConfig::default().with_call_buffer_size(16).validate().is_err());
    }
}
