use thiserror::Error;

use crate::{config::ConfigError, loading_pages, rebuild, restore, super_block, tree, vio_pool};

/// Top-level error type for the engine, composing every subsystem's error
/// enum the way `manage::err::Error` composes `disk::Error` in the
/// page-store engine this crate started from.
#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error(transparent)]
	VioPool(#[from] vio_pool::Error),

	#[error(transparent)]
	LoadingPages(#[from] loading_pages::Error),

	#[error(transparent)]
	Tree(#[from] tree::Error),

	#[error(transparent)]
	Rebuild(#[from] rebuild::Error),

	#[error(transparent)]
	SuperBlock(#[from] super_block::Error),

	#[error(transparent)]
	Restore(#[from] restore::Error),
}

/// The out-of-space/corruption/shutdown vocabulary shared by the tree
/// zone, lookup and rebuild.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
	#[error("no space available for allocation")]
	NoSpace,

	#[error("invalid tree entry: bad mapping")]
	BadMapping,

	#[error("tree page failed validation")]
	BadPage,

	#[error("zone is shutting down")]
	ShuttingDown,

	#[error("zone has entered read-only mode")]
	ReadOnly,
}
