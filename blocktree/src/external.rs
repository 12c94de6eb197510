//! Trait interfaces for everything named "out of scope" by the purpose
//! statement: the recovery journal, the slab depot, the allocator, the
//! on-disk page format beyond what the tree traverses, and the read-only
//! notifier. Every trait here is mockable the way `manage::api`'s
//! `TransactionManager`/`PageRwManager`/`SegmentAllocManager` are mocked in
//! the page-store engine this crate grew out of.

#[cfg(test)]
use mockall::automock;

use crate::error::EngineError;

pub type Pbn = u64;
pub type SequenceNumber = u64;

pub const ZERO_BLOCK: Pbn = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
	Unmapped,
	Compressed,
	Uncompressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapEntry {
	pub pbn: Pbn,
	pub state: MappingState,
}

impl BlockMapEntry {
	pub const UNMAPPED: Self = Self {
		pbn: ZERO_BLOCK,
		state: MappingState::Unmapped,
	};

	pub fn is_mapped(&self) -> bool {
		self.state != MappingState::Unmapped
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceOperation {
	BlockMapIncrement,
	DataIncrement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
	BlockMapWriteLock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneType {
	Logical,
	Physical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageValidation {
	Valid,
	NonceMismatch,
	Bad,
}

/// In-memory indexable collection of every tree page; read-only from this
/// crate's perspective beyond the index lookups it needs to traverse.
#[cfg_attr(test, automock)]
pub trait Forest {
	/// Returns the zone-local arena index backing `(root, height, page_index)`.
	fn get_tree_page_by_index(&self, root: u32, height: u8, page_index: u64) -> usize;

	fn find_block_map_page_pbn(&self, page_number: u64) -> Pbn;
}

/// The on-disk page layout, exposed only through the operations the tree
/// traversal actually needs (byte-for-byte layout is a Non-goal).
#[cfg_attr(test, automock)]
pub trait PageFormat {
	fn validate_block_map_page(&self, buf: &[u8], nonce: u64, expected_pbn: Pbn) -> PageValidation;

	fn get_block_map_page_pbn(&self, buf: &[u8]) -> Pbn;

	fn is_block_map_page_initialized(&self, buf: &[u8]) -> bool;

	/// Returns whether the page was already initialized before this call.
	fn mark_block_map_page_initialized(&self, buf: &mut [u8], initialized: bool) -> bool;

	fn format_block_map_page(&self, buf: &mut [u8], nonce: u64, pbn: Pbn, initialized: bool);

	fn unpack_block_map_entry(&self, buf: &[u8], slot: u32) -> BlockMapEntry;

	fn update_block_map_page(&self, buf: &mut [u8], slot: u32, pbn: Pbn, state: MappingState);
}

#[cfg_attr(test, automock)]
pub trait RecoveryJournal {
	fn add_recovery_journal_entry(&self, zone: u32) -> SequenceNumber;

	fn release_recovery_journal_block_reference(&self, lock: SequenceNumber, zone_type: ZoneType, zone_number: u32);
}

#[cfg_attr(test, automock)]
pub trait SlabDepot {
	fn get_slab(&self, pbn: Pbn) -> u32;

	fn is_physical_data_block(&self, pbn: Pbn) -> bool;

	fn add_slab_journal_entry(&self, slab: u32, pbn: Pbn, operation: ReferenceOperation) -> Result<(), EngineError>;

	fn adjust_reference_count_for_rebuild(&self, slab: u32, pbn: Pbn, operation: ReferenceOperation) -> Result<(), EngineError>;
}

#[cfg_attr(test, automock)]
pub trait Allocator {
	fn allocate_data_block(&self, zone: u32, lock_type: LockType) -> Option<Pbn>;

	fn release_allocation_lock(&self, pbn: Pbn);

	fn reset_allocation(&self, pbn: Pbn);
}

#[cfg_attr(test, automock)]
pub trait ReadOnlyNotifier {
	fn enter_read_only_mode(&self, code: EngineError);
}

/// Synchronous stand-in for VIO launch + completion. A real daemon wires
/// these to async I/O and invokes the zone's continuation from the
/// completion callback; this crate treats the call as returning once the
/// I/O (or its simulated double) has completed, since the zone is
/// single-threaded and cooperative regardless.
#[cfg_attr(test, automock)]
pub trait VioLaunch {
	fn launch_read_metadata_vio(&self, pbn: Pbn, buf: &mut [u8]) -> Result<(), EngineError>;

	fn launch_write_metadata_vio(&self, pbn: Pbn, buf: &[u8], with_flush: bool) -> Result<(), EngineError>;
}

/// One zone's delta-index state, as seen by the save/restore driver. Real
/// delta-list encoding is out of scope here; this crate only drives the
/// per-zone state machine around it.
#[cfg_attr(test, automock)]
pub trait SaveableZone {
	fn start_saving(&mut self) -> Result<(), EngineError>;

	fn is_saving_done(&self) -> bool;

	/// Returns the encoded delta lists once `is_saving_done` is true.
	fn finish_saving(&mut self) -> Result<Vec<u8>, EngineError>;

	fn abort_saving(&mut self);

	/// Restores one zone's delta lists from an already-read record.
	fn restore_from(&mut self, bytes: &[u8]) -> Result<(), EngineError>;
}
