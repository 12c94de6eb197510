//! C2 — era-windowed dirty page tracking. Pages are tagged by the
//! recovery-journal sequence number ("lock") that is holding them dirty;
//! sequence numbers are grouped into eras of `era_length` blocks, and an
//! era expires as a single batch once the current period advances past it.

use std::collections::{BTreeMap, HashMap};

/// A node tracked by the dirty-lists, identified by its forest arena index.
pub type Node = usize;

pub struct DirtyLists {
	era_length: u64,
	current_period: u64,
	/// period -> nodes tagged with a lock in that period's era.
	eras: BTreeMap<u64, Vec<Node>>,
	/// node -> period it currently lives in, so re-tagging can find and
	/// remove the old entry.
	node_period: HashMap<Node, u64>,
}

impl DirtyLists {
	pub fn new(era_length: u64) -> Self {
		Self {
			era_length: era_length.max(1),
			current_period: 0,
			eras: BTreeMap::new(),
			node_period: HashMap::new(),
		}
	}

	fn period_of(&self, lock: u64) -> u64 {
		lock / self.era_length
	}

	/// Insert `node` tagged with `new_lock`. If `old_lock == 0` the node is
	/// fresh; otherwise it is relocated from its previous era.
	pub fn add(&mut self, node: Node, old_lock: u64, new_lock: u64) {
		if old_lock != 0 {
			if let Some(old_period) = self.node_period.remove(&node) {
				if let Some(bucket) = self.eras.get_mut(&old_period) {
					bucket.retain(|&n| n != node);
					if bucket.is_empty() {
						self.eras.remove(&old_period);
					}
				}
			}
		}
		let period = self.period_of(new_lock);
		self.eras.entry(period).or_default().push(node);
		self.node_period.insert(node, period);
	}

	/// Notify of a new current period; every node whose era has fully
	/// passed is collected and returned in one batch.
	pub fn advance_period(&mut self, period: u64) -> Vec<Node> {
		self.current_period = period;
		self.drain_expired()
	}

	/// Expire everything immediately, regardless of era.
	pub fn flush(&mut self) -> Vec<Node> {
		let all: Vec<Node> = self.eras.values().flatten().copied().collect();
		self.eras.clear();
		self.node_period.clear();
		all
	}

	/// Reinitialize the window at mount time; does not fire an expiry
	/// batch, since nothing was tracked before mount.
	pub fn set_current_period(&mut self, period: u64) {
		self.current_period = period;
		self.eras.clear();
		self.node_period.clear();
	}

	pub fn current_period(&self) -> u64 {
		self.current_period
	}

	pub fn is_empty(&self) -> bool {
		self.eras.is_empty()
	}

	fn drain_expired(&mut self) -> Vec<Node> {
		let expired_periods: Vec<u64> = self
			.eras
			.range(..self.current_period)
			.map(|(&period, _)| period)
			.collect();

		let mut expired = Vec::new();
		for period in expired_periods {
			if let Some(nodes) = self.eras.remove(&period) {
				for node in &nodes {
					self.node_period.remove(node);
				}
				expired.extend(nodes);
			}
		}
		expired
	}
}
