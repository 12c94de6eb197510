//! In-memory tree page state. Pages are owned by the forest for the
//! block-map's lifetime; the tree zone only ever touches them by their
//! stable arena index, never by pointer — the forest's page set is modeled
//! here as `crate::utils::array_map::ArrayMap<TreePage>` indexed by that
//! value.

use crate::{external::Pbn, generation::Generation};

/// Zone-private lifecycle of a page, mirroring the states named in the
/// tree-zone design: at most one of these holds at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
	Idle,
	DirtyQueued,
	WaitingFlush,
	AcquiringVio,
	Writing,
}

#[derive(Debug, Clone)]
pub struct TreePage {
	pub pbn: Pbn,
	pub generation: Generation,
	pub writing_generation: Generation,
	pub writing_recovery_lock: u64,
	pub recovery_lock: u64,
	pub writing: bool,
	pub initialized: bool,
	pub state: PageState,
	pub buffer: Vec<u8>,
}

impl TreePage {
	pub fn new(pbn: Pbn, page_size: usize) -> Self {
		Self {
			pbn,
			generation: 0,
			writing_generation: 0,
			writing_recovery_lock: 0,
			recovery_lock: 0,
			writing: false,
			initialized: false,
			state: PageState::Idle,
			buffer: vec![0u8; page_size],
		}
	}

	/// A page with `recovery_lock == 0` is not on any dirty list.
	pub fn is_dirty(&self) -> bool {
		self.recovery_lock != 0
	}
}
