pub mod lock;
pub mod page;
pub mod zone;

use thiserror::Error;

pub use lock::{pack_key, TreeLock, TreeSlot};
pub use page::{PageState, TreePage};
pub use zone::{Continuation, EnqueueOutcome, TreeZone, WriteRequest, ZoneEvent};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	#[error("reference to an unknown tree page")]
	UnknownPage,

	#[error("dirty page count underflowed")]
	CountUnderflow,

	#[error("dirty page count overflowed")]
	CountOverflow,

	#[error("attempted to release a page lock this requester does not hold")]
	NotTheHolder,

	#[error("zone is in read-only mode")]
	ReadOnly,
}
