//! C1 — bounded pool of reusable metadata I/O buffers with a FIFO waiter
//! queue. Generic over the buffer type `B` and the waiter payload `W`; the
//! pool itself carries no opinion about what a waiter resumes into, that is
//! the tree zone's `Continuation` dispatch.

use std::collections::VecDeque;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	#[error("vio pool must have a non-zero capacity")]
	ZeroCapacity,
}

/// Outcome of `acquire`: either the entry was free and is granted
/// immediately, or the waiter has been queued internally and will be
/// dispatched by a later `release`.
pub enum Acquire<B> {
	Granted(B),
	Queued,
}

#[derive(Debug)]
pub struct VioPool<B, W> {
	capacity: usize,
	free: Vec<B>,
	waiters: VecDeque<W>,
}

impl<B, W> VioPool<B, W> {
	pub fn new(entries: Vec<B>) -> Result<Self, Error> {
		if entries.is_empty() {
			return Err(Error::ZeroCapacity);
		}
		Ok(Self {
			capacity: entries.len(),
			free: entries,
			waiters: VecDeque::new(),
		})
	}

	/// If a pool entry is free, return it immediately. Otherwise `waiter` is
	/// queued and will be handed an entry by a future `release`.
	pub fn acquire(&mut self, waiter: W) -> Acquire<B> {
		match self.free.pop() {
			Some(entry) => Acquire::Granted(entry),
			None => {
				self.waiters.push_back(waiter);
				Acquire::Queued
			}
		}
	}

	/// Return an entry to the pool. If a waiter is queued, it is handed the
	/// entry directly (never touches the free list) and returned to the
	/// caller for dispatch; otherwise the entry rejoins the free list.
	pub fn release(&mut self, entry: B) -> Option<(W, B)> {
		match self.waiters.pop_front() {
			Some(waiter) => Some((waiter, entry)),
			None => {
				self.free.push(entry);
				None
			}
		}
	}

	pub fn is_busy(&self) -> bool {
		self.free.len() < self.capacity || !self.waiters.is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn waiters_len(&self) -> usize {
		self.waiters.len()
	}
}
