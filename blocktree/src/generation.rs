//! Cyclic 8-bit generation arithmetic used by the tree-zone flush protocol.

/// A generation counter that wraps modulo 256. Pages are stamped with the
/// zone's current generation when they become dirty; a flush targets one
/// generation at a time.
pub type Generation = u8;

/// True iff `x` lies in the cyclic interval `(low, high]` modulo `modulus`,
/// i.e. walking forward from `low` we reach `x` at or before `high` without
/// passing `low` again.
pub fn in_cyclic_range(low: u8, x: u8, high: u8, modulus: u16) -> bool {
	let modulus = modulus as u32;
	let low = low as u32;
	let x = x as u32;
	let high = high as u32;

	let distance_to_x = (x + modulus - low) % modulus;
	let distance_to_high = (high + modulus - low) % modulus;
	distance_to_x > 0 && distance_to_x <= distance_to_high
}

/// `attempt_increment` succeeds unless all 256 generations are already in
/// flight (`oldest == generation + 1`).
pub fn attempt_increment(generation: Generation, oldest_generation: Generation) -> Option<Generation> {
	let next = generation.wrapping_add(1);
	if oldest_generation == next {
		return None;
	}
	Some(next)
}

/// Whether generation `a` is strictly newer than generation `b`, given the
/// zone's current window `[oldest, current]`. Both `a` and `b` must lie
/// within that window.
pub fn is_not_older(a: Generation, b: Generation, oldest: Generation, current: Generation) -> bool {
	debug_assert!(in_cyclic_range(oldest.wrapping_sub(1), a, current, 256));
	debug_assert!(in_cyclic_range(oldest.wrapping_sub(1), b, current, 256));
	in_cyclic_range(b, a, current, 256)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cyclic_range_basic() {
		assert!(in_cyclic_range(0, 1, 5, 256));
		assert!(in_cyclic_range(0, 5, 5, 256));
		assert!(!in_cyclic_range(0, 0, 5, 256));
		assert!(!in_cyclic_range(0, 6, 5, 256));
	}

	#[test]
	fn cyclic_range_wraps() {
		// low=250, high=2 wraps past 255 -> 0 -> 1 -> 2
		assert!(in_cyclic_range(250, 255, 2, 256));
		assert!(in_cyclic_range(250, 0, 2, 256));
		assert!(in_cyclic_range(250, 2, 2, 256));
		assert!(!in_cyclic_range(250, 3, 2, 256));
		assert!(!in_cyclic_range(250, 250, 2, 256));
	}

	#[test]
	fn attempt_increment_fails_at_full_window() {
		assert_eq!(attempt_increment(5, 6), None);
		assert_eq!(attempt_increment(5, 7), Some(6));
		assert_eq!(attempt_increment(255, 0), Some(0));
	}

	#[test]
	fn is_not_older_respects_window() {
		assert!(is_not_older(5, 4, 0, 10));
		assert!(!is_not_older(4, 4, 0, 10));
		assert!(!is_not_older(3, 4, 0, 10));
	}
}
