//! C4 — the tree zone: generation clock, flusher selection, per-page write
//! pipeline, read-only poisoning. One instance per logical zone; every
//! method here is only ever called from the single thread that owns the
//! zone (a daemon outside this crate's scope is responsible for that
//! scheduling guarantee).

use std::collections::{HashMap, VecDeque};

use crate::{
	dirty_lists::DirtyLists,
	error::EngineError,
	external::{Pbn, ReadOnlyNotifier, RecoveryJournal, ZoneType},
	generation::{attempt_increment, Generation},
	loading_pages::LoadingPageMap,
	tree::page::{PageState, TreePage},
	utils::array_map::ArrayMap,
	vio_pool::{self, VioPool},
};

use super::Error;

/// Tagged completion, matched by `TreeZone`'s own dispatch instead of a
/// function pointer — see the design note on dynamic dispatch via
/// completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
	WritePage { page_index: usize, ctx_generation: Generation },
	LoadPage { request_id: u64, pbn: Pbn },
}

/// What the caller must now do: launch an I/O, or nothing further.
pub enum ZoneEvent {
	Launch { page_index: usize, request: WriteRequest },
	LoadReady { request_id: u64, pbn: Pbn, buffer: Vec<u8> },
}

pub struct WriteRequest {
	pub page_index: usize,
	pub pbn: Pbn,
	pub buffer: Vec<u8>,
	pub with_flush: bool,
}

pub enum EnqueueOutcome {
	BecameFlusher(vio_pool::Acquire<Vec<u8>>),
	Waiting,
}

pub struct TreeZone<RO: ReadOnlyNotifier, J: RecoveryJournal> {
	zone_number: u32,
	page_size: usize,
	ro_notifier: RO,
	journal: J,

	pages: ArrayMap<TreePage>,
	generation: Generation,
	oldest_generation: Generation,
	dirty_page_counts: [u32; 256],
	flusher: Option<usize>,
	flush_waiters: VecDeque<usize>,
	active_lookups: u64,
	read_only: bool,
	draining: bool,
	suspending: bool,

	loading_pages: LoadingPageMap<u64, u64>,
	holder_waiters: HashMap<u64, Vec<u64>>,

	vio_pool: VioPool<Vec<u8>, Continuation>,
	dirty_lists: DirtyLists,
}

impl<RO: ReadOnlyNotifier, J: RecoveryJournal> TreeZone<RO, J> {
	pub fn new(
		zone_number: u32,
		page_size: usize,
		vio_pool_size: usize,
		era_length: u64,
		ro_notifier: RO,
		journal: J,
	) -> Result<Self, crate::vio_pool::Error> {
		let entries = (0..vio_pool_size).map(|_| Vec::with_capacity(page_size)).collect();
		Ok(Self {
			zone_number,
			page_size,
			ro_notifier,
			journal,
			pages: ArrayMap::new(),
			generation: 0,
			oldest_generation: 0,
			dirty_page_counts: [0; 256],
			flusher: None,
			flush_waiters: VecDeque::new(),
			active_lookups: 0,
			read_only: false,
			draining: false,
			suspending: false,
			loading_pages: LoadingPageMap::new(),
			holder_waiters: HashMap::new(),
			vio_pool: VioPool::new(entries)?,
			dirty_lists: DirtyLists::new(era_length),
		})
	}

	pub fn is_read_only(&self) -> bool {
		self.read_only
	}

	pub fn zone_number(&self) -> u32 {
		self.zone_number
	}

	/// `journal_block_map_allocation`: records the allocation and returns the
	/// recovery-journal lock the freshly mapped entry must carry.
	pub fn journal_add_entry(&self) -> crate::external::SequenceNumber {
		self.journal.add_recovery_journal_entry(self.zone_number)
	}

	pub fn generation(&self) -> Generation {
		self.generation
	}

	pub fn oldest_generation(&self) -> Generation {
		self.oldest_generation
	}

	pub fn dirty_page_count(&self, generation: Generation) -> u32 {
		self.dirty_page_counts[generation as usize]
	}

	pub fn insert_page(&mut self, index: usize, pbn: Pbn) {
		self.pages.insert(index, TreePage::new(pbn, self.page_size));
	}

	pub fn page(&self, index: usize) -> Option<&TreePage> {
		self.pages.get(index)
	}

	pub fn page_mut(&mut self, index: usize) -> Option<&mut TreePage> {
		self.pages.get_mut(index)
	}

	pub fn active_lookups(&self) -> u64 {
		self.active_lookups
	}

	pub fn begin_lookup(&mut self) {
		self.active_lookups += 1;
	}

	pub fn end_lookup(&mut self) {
		self.active_lookups = self.active_lookups.saturating_sub(1);
	}

	pub fn is_draining(&self) -> bool {
		self.draining
	}

	pub fn set_draining(&mut self, draining: bool) {
		self.draining = draining;
	}

	/// `is_tree_zone_active`: true iff lookups are outstanding, a flush
	/// window is pending, or the VIO pool is busy.
	pub fn is_active(&self) -> bool {
		self.active_lookups > 0 || !self.flush_waiters.is_empty() || self.vio_pool.is_busy()
	}

	/// `drain_zone_trees`: asserts no lookups are in flight, then forces
	/// every dirty page out regardless of era, unless the zone is already
	/// suspending.
	pub fn drain_zone_trees(&mut self) -> Vec<usize> {
		debug_assert_eq!(self.active_lookups, 0);
		if self.suspending {
			return Vec::new();
		}
		self.dirty_lists.flush()
	}

	pub fn enter_zone_read_only_mode(&mut self, code: EngineError) {
		if self.read_only {
			return;
		}
		self.read_only = true;
		self.ro_notifier.enter_read_only_mode(code);
		self.flush_waiters.clear();
	}

	/// Stamps `page_index` with `new_generation`. `decrement_old` mirrors a
	/// page being re-dirtied while already tracked at an older generation.
	pub fn set_generation(&mut self, page_index: usize, new_generation: Generation, decrement_old: bool) -> Result<(), Error> {
		let old_generation = self.pages.get(page_index).ok_or(Error::UnknownPage)?.generation;
		if decrement_old {
			self.dirty_page_counts[old_generation as usize] = self.dirty_page_counts[old_generation as usize]
				.checked_sub(1)
				.ok_or(Error::CountUnderflow)?;
		}
		self.dirty_page_counts[new_generation as usize] = self.dirty_page_counts[new_generation as usize]
			.checked_add(1)
			.ok_or(Error::CountOverflow)?;
		self.pages.get_mut(page_index).ok_or(Error::UnknownPage)?.generation = new_generation;
		Ok(())
	}

	fn release_generation(&mut self, generation: Generation) {
		if let Some(v) = self.dirty_page_counts[generation as usize].checked_sub(1) {
			self.dirty_page_counts[generation as usize] = v;
		}
		while self.oldest_generation != self.generation && self.dirty_page_counts[self.oldest_generation as usize] == 0 {
			self.oldest_generation = self.oldest_generation.wrapping_add(1);
		}
	}

	/// Dirty intake from a `DirtyLists::advance_period` batch.
	pub fn intake_expired(&mut self, expired: Vec<usize>, events: &mut Vec<ZoneEvent>) {
		for page_index in expired {
			let Some(page) = self.pages.get(page_index) else { continue };
			if matches!(page.state, PageState::WaitingFlush | PageState::AcquiringVio) {
				self.enter_zone_read_only_mode(EngineError::BadPage);
				continue;
			}
			let current_generation = self.generation;
			if self.set_generation(page_index, current_generation, false).is_err() {
				self.enter_zone_read_only_mode(EngineError::BadPage);
				continue;
			}
			if !self.pages.get(page_index).unwrap().writing {
				self.enqueue_page_ext(page_index, events);
			}
		}
	}

	/// `enqueue_page`: install as the new flusher if none is active and a
	/// generation slot is free, otherwise append to `flush_waiters`.
	pub fn enqueue_page(&mut self, page_index: usize) -> EnqueueOutcome {
		let ctx_generation = match self.pages.get(page_index) {
			Some(p) => p.generation,
			None => return EnqueueOutcome::Waiting,
		};
		if self.flusher.is_none() {
			if let Some(next) = attempt_increment(self.generation, self.oldest_generation) {
				self.generation = next;
				self.flusher = Some(page_index);
				if let Some(p) = self.pages.get_mut(page_index) {
					p.state = PageState::AcquiringVio;
				}
				return EnqueueOutcome::BecameFlusher(
					self.vio_pool.acquire(Continuation::WritePage { page_index, ctx_generation }),
				);
			}
		}
		self.flush_waiters.push_back(page_index);
		if let Some(p) = self.pages.get_mut(page_index) {
			p.state = PageState::WaitingFlush;
		}
		EnqueueOutcome::Waiting
	}

	fn enqueue_page_ext(&mut self, page_index: usize, events: &mut Vec<ZoneEvent>) {
		if let EnqueueOutcome::BecameFlusher(vio_pool::Acquire::Granted(e)) = self.enqueue_page(page_index) {
			if let Ok(request) = self.build_write_request(page_index, e, true) {
				events.push(ZoneEvent::Launch { page_index, request });
			}
		}
	}

	/// `write_page_if_not_dirtied`: acquire a VIO and write, unless the
	/// page has moved on to a newer generation since `ctx_generation`, in
	/// which case it must wait for the next flush window.
	fn write_page_if_not_dirtied(&mut self, page_index: usize, ctx_generation: Generation, events: &mut Vec<ZoneEvent>) {
		let Some(page) = self.pages.get(page_index) else { return };
		if page.generation == ctx_generation {
			let is_flusher = self.flusher == Some(page_index);
			match self.vio_pool.acquire(Continuation::WritePage { page_index, ctx_generation }) {
				vio_pool::Acquire::Granted(e) => {
					if let Ok(request) = self.build_write_request(page_index, e, is_flusher) {
						events.push(ZoneEvent::Launch { page_index, request });
					}
				}
				vio_pool::Acquire::Queued => {
					if let Some(p) = self.pages.get_mut(page_index) {
						p.state = PageState::AcquiringVio;
					}
				}
			}
		} else {
			self.enqueue_page_ext(page_index, events);
		}
	}

	fn build_write_request(&mut self, page_index: usize, mut entry: Vec<u8>, with_flush: bool) -> Result<WriteRequest, Error> {
		let page = self.pages.get_mut(page_index).ok_or(Error::UnknownPage)?;
		entry.clear();
		entry.extend_from_slice(&page.buffer);
		page.writing = true;
		page.writing_generation = page.generation;
		page.writing_recovery_lock = page.recovery_lock;
		page.recovery_lock = 0;
		page.state = PageState::Writing;
		Ok(WriteRequest {
			page_index,
			pbn: page.pbn,
			buffer: entry,
			with_flush,
		})
	}

	fn return_entry_to_pool(&mut self, entry: Vec<u8>, events: &mut Vec<ZoneEvent>) {
		if let Some((continuation, e)) = self.vio_pool.release(entry) {
			match continuation {
				Continuation::WritePage { page_index, ctx_generation } => self.dispatch_write_continuation(page_index, ctx_generation, e, events),
				Continuation::LoadPage { request_id, pbn } => events.push(ZoneEvent::LoadReady { request_id, pbn, buffer: e }),
			}
		}
	}

	fn dispatch_write_continuation(&mut self, page_index: usize, ctx_generation: Generation, entry: Vec<u8>, events: &mut Vec<ZoneEvent>) {
		let still_current = self.pages.get(page_index).map(|p| p.generation == ctx_generation).unwrap_or(false);
		if still_current {
			let is_flusher = self.flusher == Some(page_index);
			if let Ok(request) = self.build_write_request(page_index, entry, is_flusher) {
				events.push(ZoneEvent::Launch { page_index, request });
			}
		} else {
			self.return_entry_to_pool(entry, events);
			self.enqueue_page_ext(page_index, events);
		}
	}

	/// Caller reports the outcome of an I/O launched from a previous
	/// `ZoneEvent::Launch`. Implements `finish_page_write`.
	pub fn finish_page_write(&mut self, page_index: usize, entry: Vec<u8>, result: Result<(), EngineError>) -> Vec<ZoneEvent> {
		let mut events = Vec::new();

		if let Err(code) = result {
			self.return_entry_to_pool(entry, &mut events);
			self.enter_zone_read_only_mode(code);
			return events;
		}

		let Some(page) = self.pages.get(page_index) else { return events };
		let writing_generation = page.writing_generation;
		let writing_lock = page.writing_recovery_lock;
		let dirty = page.writing_generation != page.generation;

		self.journal.release_recovery_journal_block_reference(writing_lock, ZoneType::Logical, self.zone_number);
		self.release_generation(writing_generation);
		if let Some(p) = self.pages.get_mut(page_index) {
			p.writing = false;
		}

		if self.flusher == Some(page_index) {
			let waiters: Vec<usize> = self.flush_waiters.drain(..).collect();
			for w in waiters {
				self.write_page_if_not_dirtied(w, writing_generation, &mut events);
			}

			if dirty {
				if let Some(next) = attempt_increment(self.generation, self.oldest_generation) {
					self.generation = next;
					if let Ok(request) = self.build_write_request(page_index, entry, true) {
						events.push(ZoneEvent::Launch { page_index, request });
					}
					return events;
				}
			}
			self.flusher = None;
		}

		if dirty {
			self.return_entry_to_pool(entry, &mut events);
			self.enqueue_page_ext(page_index, &mut events);
		} else if self.flusher.is_none() && !self.flush_waiters.is_empty() {
			if let Some(next) = attempt_increment(self.generation, self.oldest_generation) {
				self.generation = next;
				let w = self.flush_waiters.pop_front().unwrap();
				self.flusher = Some(w);
				if let Ok(request) = self.build_write_request(w, entry, true) {
					events.push(ZoneEvent::Launch { page_index: w, request });
				}
			} else {
				self.return_entry_to_pool(entry, &mut events);
			}
		} else {
			self.return_entry_to_pool(entry, &mut events);
		}

		events
	}

	/// `write_tree_page`: dirty a page outside the normal lookup path (the
	/// rebuild's repair-in-place writes use this to route through the same
	/// generation/flush machinery rather than writing around it).
	pub fn mark_page_dirty(&mut self, page_index: usize, new_lock: u64, events: &mut Vec<ZoneEvent>) {
		let Some(page) = self.pages.get(page_index) else { return };
		let old_lock = page.recovery_lock;
		let already_writing = page.writing;
		if let Some(p) = self.pages.get_mut(page_index) {
			p.recovery_lock = new_lock;
		}
		self.dirty_lists.add(page_index, old_lock, new_lock);
		if !already_writing {
			self.enqueue_page_ext(page_index, events);
		}
	}

	/// `finish_block_map_allocation`'s dirtying step: records the parent's
	/// new recovery lock, then either bumps its generation (if it is
	/// already queued to flush under an older one and isn't the active
	/// flusher) or simply enrolls it in `dirty_lists` — never forces it
	/// onto the write pipeline immediately, unlike `mark_page_dirty`.
	pub fn enroll_allocated_parent(&mut self, page_index: usize, new_lock: u64) {
		let Some(page) = self.pages.get(page_index) else { return };
		let old_lock = page.recovery_lock;
		let waiting_to_flush = page.state == PageState::WaitingFlush;
		let is_flusher = self.flusher == Some(page_index);
		if let Some(p) = self.pages.get_mut(page_index) {
			p.recovery_lock = new_lock;
		}
		if waiting_to_flush && !is_flusher {
			let current = self.generation;
			let _ = self.set_generation(page_index, current, true);
		} else {
			self.dirty_lists.add(page_index, old_lock, new_lock);
		}
	}

	/// `attempt_page_lock`: serialize concurrent load/allocate of the same
	/// tree slot through the loading-page map.
	pub fn attempt_page_lock(&mut self, key: u64, requester: u64) -> LockOutcome {
		match self.loading_pages.put(key, requester, false) {
			None => LockOutcome::Acquired,
			Some(holder) => {
				self.holder_waiters.entry(holder).or_default().push(requester);
				LockOutcome::Waiting(holder)
			}
		}
	}

	/// `release_page_lock`: releases the lock and returns everyone who was
	/// waiting on it, for the caller to resume via `continue_*_for_waiter`.
	pub fn release_page_lock(&mut self, key: u64, requester: u64) -> Result<Vec<u64>, Error> {
		let holder = self.loading_pages.remove(key).map_err(|_| Error::NotTheHolder)?;
		if holder != requester {
			return Err(Error::NotTheHolder);
		}
		Ok(self.holder_waiters.remove(&requester).unwrap_or_default())
	}

	/// Acquire a VIO to load a page; mirrors `acquire_vio_from_pool` armed
	/// with `load_page` as the continuation.
	pub fn acquire_vio_for_load(&mut self, request_id: u64, pbn: Pbn) -> vio_pool::Acquire<Vec<u8>> {
		self.vio_pool.acquire(Continuation::LoadPage { request_id, pbn })
	}

	/// Return a load buffer to the pool once the caller is done with it.
	pub fn release_load_vio(&mut self, entry: Vec<u8>, events: &mut Vec<ZoneEvent>) {
		self.return_entry_to_pool(entry, events);
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
	Acquired,
	Waiting(u64),
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::external::{MockReadOnlyNotifier, MockRecoveryJournal};

	fn zone_with_pool(pool_size: usize) -> TreeZone<MockReadOnlyNotifier, MockRecoveryJournal> {
		let mut ro = MockReadOnlyNotifier::new();
		ro.expect_enter_read_only_mode().return_const(());
		let mut journal = MockRecoveryJournal::new();
		journal.expect_release_recovery_journal_block_reference().return_const(());
		journal.expect_add_recovery_journal_entry().return_const(0u64);
		TreeZone::new(0, 64, pool_size, 100, ro, journal).unwrap()
	}

	#[test]
	fn single_page_flush_round_trip() {
		let mut zone = zone_with_pool(4);
		zone.insert_page(0, 10);
		zone.set_generation(0, 0, false).unwrap();

		let mut events = Vec::new();
		zone.enqueue_page_ext(0, &mut events);
		assert_eq!(events.len(), 1);
		let ZoneEvent::Launch { page_index, request } = events.remove(0) else {
			panic!("expected a launch event")
		};
		assert_eq!(page_index, 0);
		assert!(request.with_flush);

		let events = zone.finish_page_write(0, request.buffer, Ok(()));
		assert!(events.is_empty());
		assert!(zone.page(0).unwrap().recovery_lock == 0);
		assert!(!zone.is_active());
	}

	#[test]
	fn pool_exhaustion_queues_waiters_and_flushes_every_page_once() {
		// S3: pool size 1, 4 pages expire simultaneously.
		let mut zone = zone_with_pool(1);
		for i in 0..4 {
			zone.insert_page(i, 100 + i as u64);
		}

		let mut events = Vec::new();
		for i in 0..4 {
			zone.intake_expired(vec![i], &mut events);
		}

		// Exactly one write is in flight; the rest are queued.
		assert_eq!(events.len(), 1);
		assert!(zone.is_active());

		let mut completed = 0;
		while let Some(ZoneEvent::Launch { page_index, request }) = events.pop() {
			completed += 1;
			let more = zone.finish_page_write(page_index, request.buffer, Ok(()));
			events.extend(more);
		}

		assert_eq!(completed, 4);
		assert!(!zone.is_active());
	}

	#[test]
	fn redirty_during_flush_reuses_entry_with_new_barrier() {
		// S2: page P is flusher; mid-write it gets re-dirtied to a newer
		// generation. On completion it should be rewritten immediately
		// with the same entry, no extra write issued for the old generation.
		let mut zone = zone_with_pool(2);
		zone.insert_page(0, 55);
		zone.set_generation(0, 0, false).unwrap();

		let mut events = Vec::new();
		zone.enqueue_page_ext(0, &mut events);
		let ZoneEvent::Launch { request, .. } = events.remove(0) else { panic!() };

		// Re-dirty P to a newer generation while its write is in flight.
		zone.set_generation(0, zone.generation().wrapping_add(1), true).unwrap();

		let events = zone.finish_page_write(0, request.buffer, Ok(()));
		assert_eq!(events.len(), 1);
		let ZoneEvent::Launch { page_index, request } = &events[0] else {
			panic!("expected an immediate rewrite")
		};
		assert_eq!(*page_index, 0);
		assert!(request.with_flush);
	}

	#[test]
	fn enroll_allocated_parent_does_not_force_immediate_flush() {
		// Allocation dirties a page but must only enroll it in dirty_lists,
		// leaving the era-window batching to advance_period.
		let mut zone = zone_with_pool(4);
		zone.insert_page(0, 10);
		zone.set_generation(0, 0, false).unwrap();

		zone.enroll_allocated_parent(0, 7);
		assert!(!zone.is_active());
		assert_eq!(zone.page(0).unwrap().recovery_lock, 7);
	}

	#[test]
	fn enroll_allocated_parent_bumps_generation_when_already_waiting() {
		let mut zone = zone_with_pool(1);
		zone.insert_page(0, 10);
		zone.insert_page(1, 20);
		zone.set_generation(0, 0, false).unwrap();
		zone.set_generation(1, 0, false).unwrap();

		let mut events = Vec::new();
		zone.enqueue_page_ext(0, &mut events); // becomes flusher
		zone.enqueue_page_ext(1, &mut events); // queued, WaitingFlush
		assert_eq!(zone.page(1).unwrap().state, PageState::WaitingFlush);

		let generation_before = zone.page(1).unwrap().generation;
		zone.enroll_allocated_parent(1, 99);
		assert_ne!(zone.page(1).unwrap().generation, generation_before);
		assert_eq!(zone.page(1).unwrap().recovery_lock, 99);
	}

	#[test]
	fn io_error_enters_read_only_mode() {
		let mut zone = zone_with_pool(1);
		zone.insert_page(0, 1);
		zone.set_generation(0, 0, false).unwrap();

		let mut events = Vec::new();
		zone.enqueue_page_ext(0, &mut events);
		let ZoneEvent::Launch { request, .. } = events.remove(0) else { panic!() };

		zone.finish_page_write(0, request.buffer, Err(EngineError::BadPage));
		assert!(zone.is_read_only());
	}
}
