use lvs_types::BlockSize;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Configuration for a [`MemoryCache`](crate::MemoryCache).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Usable bytes per block.
    pub block_size: u32,
    /// When `true`, acquiring a block that is not resident completes
    /// asynchronously from a spawned tokio task. Without a runtime the load
    /// completes inline.
    pub async_loads: bool,
    /// Upper bound on the random number of scheduler yields before an
    /// asynchronous load is delivered.
    pub max_load_yields: u32,
    /// Maximum number of live blocks. Allocation fails once it is reached.
    pub max_blocks: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 4084,
            async_loads: false,
            max_load_yields: 3,
            max_blocks: None,
        }
    }
}

impl CacheConfig {
    /// Parse a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> CacheResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| CacheError::Config(e.to_string()))?;
        config.block_size()?;
        Ok(config)
    }

    /// The validated block size.
    pub fn block_size(&self) -> CacheResult<BlockSize> {
        Ok(BlockSize::new(self.block_size)?)
    }

    /// Same configuration with deferred loads switched on.
    pub fn with_async_loads(self) -> Self {
        Self {
            async_loads: true,
            ..self
        }
    }
}
