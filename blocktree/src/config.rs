use thiserror::Error;

/// Engine configuration, enumerated per the external-interfaces contract:
/// pool sizing, tree shape, and the rebuild's prefetch bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
	pub vio_pool_size: usize,
	pub era_length: u64,
	pub root_count: u32,
	pub flat_page_count: u32,
	pub block_map_tree_height: u8,
	pub entries_per_page: u32,
	pub nonce: u64,
	pub max_simultaneous_block_map_restoration_reads: usize,
	pub cache_size_in_blocks: usize,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			vio_pool_size: 64,
			era_length: 16_384,
			root_count: 60,
			flat_page_count: 0,
			block_map_tree_height: 5,
			entries_per_page: 812,
			nonce: 0,
			max_simultaneous_block_map_restoration_reads: 256,
			cache_size_in_blocks: 1024,
		}
	}
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
	#[error("vio_pool_size must be at least 1")]
	EmptyVioPool,

	#[error("root_count must be at least 1")]
	NoRoots,

	#[error("block_map_tree_height must be at least 1")]
	ZeroHeight,

	#[error("entries_per_page must be at least 1")]
	ZeroEntriesPerPage,
}

impl Config {
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.vio_pool_size == 0 {
			return Err(ConfigError::EmptyVioPool);
		}
		if self.root_count == 0 {
			return Err(ConfigError::NoRoots);
		}
		if self.block_map_tree_height == 0 {
			return Err(ConfigError::ZeroHeight);
		}
		if self.entries_per_page == 0 {
			return Err(ConfigError::ZeroEntriesPerPage);
		}
		Ok(())
	}

	/// `pageCount = min(configured_cache_size/2, MAX_SIMULTANEOUS_RESTORATION_READS)`
	pub fn rebuild_prefetch_depth(&self) -> usize {
		(self.cache_size_in_blocks / 2).min(self.max_simultaneous_block_map_restoration_reads)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_validates() {
		assert!(Config::default().validate().is_ok());
	}

	#[test]
	fn rejects_empty_pool() {
		let cfg = Config {
			vio_pool_size: 0,
			..Config::default()
		};
		assert_eq!(cfg.validate(), Err(ConfigError::EmptyVioPool));
	}

	#[test]
	fn rebuild_prefetch_depth_is_bounded() {
		let cfg = Config {
			cache_size_in_blocks: 1000,
			max_simultaneous_block_map_restoration_reads: 100,
			..Config::default()
		};
		assert_eq!(cfg.rebuild_prefetch_depth(), 100);

		let cfg = Config {
			cache_size_in_blocks: 100,
			max_simultaneous_block_map_restoration_reads: 100,
			..Config::default()
		};
		assert_eq!(cfg.rebuild_prefetch_depth(), 50);
	}
}
