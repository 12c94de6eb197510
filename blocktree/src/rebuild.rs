//! C6 — reference-count rebuild after an unclean shutdown. Two phases:
//! first every block-map tree (interior) page's PBN charges a block-map
//! increment, then the leaf pages are swept in a bounded-parallel window to
//! charge the data mappings they hold and scrub anything inconsistent with
//! the slab depot.

use std::cmp::min;

use log::{error, info};
use thiserror::Error;

use crate::external::{BlockMapEntry, MappingState, Pbn, ReferenceOperation, SlabDepot, ZERO_BLOCK};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	#[error("PBN {0} is out of range for this depot")]
	BadPbn(Pbn),
	#[error("rebuild has not finished launching its initial leaf batch")]
	StillLaunching,
}

/// Tells the caller which page (if any) to fetch next, or that the whole
/// rebuild is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildStep {
	FetchLeaf { slot: u64, pbn: Pbn },
	Idle,
	Done,
}

pub struct RebuildState {
	max_simultaneous_reads: usize,
	leaf_pages: u64,
	entry_count: u64,
	entries_per_page: u32,
	next_leaf: u64,
	outstanding: usize,
	launching: bool,
	aborted: Option<Error>,
	logical_blocks_used: u64,
	block_map_data_blocks: u64,
	last_slot_pbn: Pbn,
	last_slot: u32,
}

impl RebuildState {
	pub fn new(cache_size_in_blocks: u64, max_simultaneous_block_map_restoration_reads: u64, leaf_pages: u64, entry_count: u64, entries_per_page: u32) -> Self {
		let window = min(cache_size_in_blocks / 2, max_simultaneous_block_map_restoration_reads);
		Self {
			max_simultaneous_reads: window.max(1) as usize,
			leaf_pages,
			entry_count,
			entries_per_page,
			next_leaf: 0,
			outstanding: 0,
			launching: false,
			aborted: None,
			logical_blocks_used: 0,
			block_map_data_blocks: 0,
			last_slot_pbn: ZERO_BLOCK,
			last_slot: 0,
		}
	}

	pub fn logical_blocks_used(&self) -> u64 {
		self.logical_blocks_used
	}

	pub fn block_map_data_blocks(&self) -> u64 {
		self.block_map_data_blocks
	}

	pub fn is_aborted(&self) -> bool {
		self.aborted.is_some()
	}

	/// `processEntry`: charges a block-map increment for one interior tree
	/// page's PBN, invoked once per tree entry found while the forest was
	/// (re)loaded ahead of this rebuild.
	pub fn charge_tree_page(&mut self, pbn: Pbn, depot: &dyn SlabDepot) -> Result<(), Error> {
		if pbn == ZERO_BLOCK || !depot.is_physical_data_block(pbn) {
			error!("PBN {} out of range", pbn);
			return Err(Error::BadPbn(pbn));
		}

		let slab = depot.get_slab(pbn);
		if let Err(code) = depot.adjust_reference_count_for_rebuild(slab, pbn, ReferenceOperation::BlockMapIncrement) {
			error!("could not adjust reference count for block map tree PBN {}: {:?}", pbn, code);
			return Err(Error::BadPbn(pbn));
		}

		self.block_map_data_blocks += 1;
		Ok(())
	}

	/// `rebuildFromLeaves`: the tree traversal is complete; compute the
	/// out-of-range last slot and open the initial fetch window. Callers
	/// must call [`Self::begin_leaf_launch`] before driving [`Self::next_step`]
	/// in a loop, then [`Self::end_leaf_launch`] once the window is full.
	pub fn begin_leaf_launch(&mut self, last_leaf_pbn: Pbn) {
		self.logical_blocks_used = 0;
		self.last_slot = (self.entry_count % self.entries_per_page as u64) as u32;
		self.last_slot_pbn = last_leaf_pbn;
		self.launching = true;
	}

	pub fn end_leaf_launch(&mut self) {
		self.launching = false;
	}

	pub fn window_size(&self) -> usize {
		self.max_simultaneous_reads
	}

	/// `fetchPage`: advances past unmapped (`ZERO_BLOCK`) slots and reports
	/// the next leaf the caller should read, or [`RebuildStep::Idle`] if the
	/// fetch window is already full, or [`RebuildStep::Done`] once every
	/// leaf has been requested.
	pub fn next_step(&mut self, find_leaf_pbn: &dyn Fn(u64) -> Pbn, depot: &dyn SlabDepot) -> RebuildStep {
		if self.outstanding >= self.max_simultaneous_reads {
			return RebuildStep::Idle;
		}
		while self.next_leaf < self.leaf_pages {
			let slot = self.next_leaf;
			self.next_leaf += 1;
			let pbn = find_leaf_pbn(slot);
			if pbn == ZERO_BLOCK {
				continue;
			}
			if !depot.is_physical_data_block(pbn) {
				self.abort(Error::BadPbn(pbn));
				continue;
			}
			self.outstanding += 1;
			return RebuildStep::FetchLeaf { slot, pbn };
		}
		RebuildStep::Done
	}

	fn abort(&mut self, code: Error) {
		if self.aborted.is_none() {
			self.aborted = Some(code);
		}
	}

	/// `pageLoaded` + `rebuildReferenceCountsFromPage`: process one fetched
	/// leaf page's entries, charging the slab depot for every valid mapping
	/// and scrubbing anything it finds inconsistent.
	pub fn complete_leaf(&mut self, pbn: Pbn, buf: &mut [u8], depot: &dyn SlabDepot, page_format: &dyn crate::external::PageFormat) -> bool {
		self.outstanding = self.outstanding.saturating_sub(1);

		if !page_format.is_block_map_page_initialized(buf) {
			return self.is_done();
		}

		let is_last_slotted_page = page_format.get_block_map_page_pbn(buf) == self.last_slot_pbn;
		if is_last_slotted_page {
			for slot in self.last_slot..self.entries_per_page {
				let entry = page_format.unpack_block_map_entry(buf, slot);
				if entry.is_mapped() {
					page_format.update_block_map_page(buf, slot, ZERO_BLOCK, MappingState::Unmapped);
				}
			}
		}

		for slot in 0..self.entries_per_page {
			let entry = page_format.unpack_block_map_entry(buf, slot);
			if !is_valid_location(&entry) {
				page_format.update_block_map_page(buf, slot, ZERO_BLOCK, MappingState::Unmapped);
				continue;
			}
			if !entry.is_mapped() {
				continue;
			}

			self.logical_blocks_used += 1;
			if entry.pbn == ZERO_BLOCK {
				continue;
			}

			if !depot.is_physical_data_block(entry.pbn) {
				page_format.update_block_map_page(buf, slot, ZERO_BLOCK, MappingState::Unmapped);
				continue;
			}

			let slab = depot.get_slab(entry.pbn);
			if let Err(code) = depot.adjust_reference_count_for_rebuild(slab, entry.pbn, ReferenceOperation::DataIncrement) {
				error!(
					"could not adjust reference count for PBN {}, slot {} mapped to PBN {}: {:?}",
					pbn, slot, entry.pbn, code
				);
				page_format.update_block_map_page(buf, slot, ZERO_BLOCK, MappingState::Unmapped);
			}
		}

		self.is_done()
	}

	pub fn handle_leaf_load_error(&mut self, code: Error) -> bool {
		self.outstanding = self.outstanding.saturating_sub(1);
		self.abort(code);
		self.is_done()
	}

	/// `finishIfDone`: true once nothing is in flight, launching has
	/// stopped, and every leaf has been fetched — at which point the block
	/// map should be flushed by the caller.
	pub fn is_done(&self) -> bool {
		!self.launching && self.outstanding == 0 && self.next_leaf >= self.leaf_pages
	}

	pub fn finish(self) -> Result<(u64, u64), Error> {
		if self.launching {
			return Err(Error::StillLaunching);
		}
		if let Some(code) = self.aborted {
			return Err(code);
		}
		info!("block map rebuild charged {} logical blocks, {} tree blocks", self.logical_blocks_used, self.block_map_data_blocks);
		Ok((self.logical_blocks_used, self.block_map_data_blocks))
	}
}

fn is_valid_location(entry: &BlockMapEntry) -> bool {
	entry.state != MappingState::Unmapped || entry.pbn == ZERO_BLOCK
}
