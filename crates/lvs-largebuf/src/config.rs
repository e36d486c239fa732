use lvs_cache::{CacheConfig, MemoryCache};
use lvs_types::BlockSize;
use serde::{Deserialize, Serialize};

use crate::error::{LargeBufError, LargeBufResult};
use crate::shape::InlineLimit;

/// Large buffer settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LargeBufConfig {
    /// Maximum number of block ids kept inline in a reference.
    pub inline_limit: usize,
    /// When set, the inline limit is instead derived from how many bytes a
    /// serialized reference may take.
    pub max_ref_bytes: Option<usize>,
}

impl Default for LargeBufConfig {
    fn default() -> Self {
        Self {
            inline_limit: 6,
            max_ref_bytes: None,
        }
    }
}

impl LargeBufConfig {
    /// Parse a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> LargeBufResult<Self> {
        toml::from_str(s).map_err(|e| LargeBufError::Config(e.to_string()))
    }

    /// The inline limit validated against `block_size`.
    pub fn inline_limit(&self, block_size: BlockSize) -> LargeBufResult<InlineLimit> {
        match self.max_ref_bytes {
            Some(budget) => InlineLimit::from_byte_budget(budget, block_size),
            None => InlineLimit::new(self.inline_limit, block_size),
        }
    }
}

/// Combined settings for a store: the block cache and the large buffers
/// built on it.
///
/// ```toml
/// [cache]
/// block_size = 4084
///
/// [large_buf]
/// inline_limit = 6
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub cache: CacheConfig,
    pub large_buf: LargeBufConfig,
}

impl StoreConfig {
    /// Parse and validate a configuration from TOML.
    pub fn from_toml_str(s: &str) -> LargeBufResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| LargeBufError::Config(e.to_string()))?;
        config.inline_limit()?;
        Ok(config)
    }

    /// The inline limit validated against the configured block size.
    pub fn inline_limit(&self) -> LargeBufResult<InlineLimit> {
        let block_size = self.cache.block_size()?;
        self.large_buf.inline_limit(block_size)
    }

    /// Build the in-memory cache and the inline limit to use with it.
    pub fn open_memory(&self) -> LargeBufResult<(MemoryCache, InlineLimit)> {
        let limit = self.inline_limit()?;
        let cache = MemoryCache::new(self.cache.clone())?;
        Ok((cache, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = LargeBufConfig::default();
        assert_eq!(c.inline_limit, 6);
        assert_eq!(c.max_ref_bytes, None);
        let bs = BlockSize::new(4084).unwrap();
        assert_eq!(c.inline_limit(bs).unwrap().get(), 6);
    }

    #[test]
    fn byte_budget_overrides_count() {
        let c = LargeBufConfig::from_toml_str("inline_limit = 2\nmax_ref_bytes = 40\n").unwrap();
        let bs = BlockSize::new(4084).unwrap();
        assert_eq!(c.inline_limit(bs).unwrap().get(), 3);
    }

    #[test]
    fn limit_is_checked_against_block_size() {
        let c = LargeBufConfig {
            inline_limit: 5,
            max_ref_bytes: None,
        };
        let err = c.inline_limit(BlockSize::new(36).unwrap()).unwrap_err();
        assert!(matches!(err, LargeBufError::InvalidInlineLimit { limit: 5, .. }));
    }

    #[test]
    fn parse_store_config() {
        let c = StoreConfig::from_toml_str(
            "[cache]\nblock_size = 36\n\n[large_buf]\ninline_limit = 4\n",
        )
        .unwrap();
        assert_eq!(c.cache.block_size, 36);
        assert_eq!(c.large_buf.inline_limit, 4);

        let (cache, limit) = c.open_memory().unwrap();
        assert_eq!(cache.block_size().value(), 36);
        assert_eq!(limit.get(), 4);
    }

    #[test]
    fn store_config_rejects_oversized_limit() {
        let err = StoreConfig::from_toml_str("[cache]\nblock_size = 36\n").unwrap_err();
        assert!(matches!(err, LargeBufError::InvalidInlineLimit { limit: 6, .. }));
    }

    #[test]
    fn reject_malformed_toml() {
        let err = LargeBufConfig::from_toml_str("inline_limit = \"many\"").unwrap_err();
        assert!(matches!(err, LargeBufError::Config(_)));
    }
}
