//! C8 — the incremental per-zone save/restore driver. Saving drives each
//! zone's delta index through START/CONTINUE/FINISH/ABORT so the admin
//! thread never blocks waiting for one zone while the others could be
//! making progress; restoring replays the same records back in, zone by
//! zone, until end of file.

use thiserror::Error;

use crate::external::SaveableZone;

pub const MAX_ZONES: usize = 16;
pub const DELTA_LIST_MAX_BYTE_COUNT: usize = 4096;

const GUARD_DELTA_LIST: u32 = 0xFFFF_FFFF;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
	#[error("zone count {0} exceeds the maximum of {MAX_ZONES}")]
	TooManyZones(usize),
	#[error("component is corrupt: zone {zone} did not complete")]
	CorruptComponent { zone: usize },
	#[error("delta list record of {0} bytes exceeds the scratch buffer")]
	RecordTooLarge(usize),
	#[error("zone {0} failed: {1}")]
	ZoneFailed(usize, crate::error::EngineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveState {
	NotStarted,
	Saving,
	Complete,
	Aborted,
}

/// Drives the START/CONTINUE/FINISH/ABORT commands for every zone of a
/// single save operation.
pub struct SaveDriver {
	states: Vec<SaveState>,
}

impl SaveDriver {
	pub fn new(zone_count: usize) -> Result<Self, Error> {
		if zone_count > MAX_ZONES {
			return Err(Error::TooManyZones(zone_count));
		}
		Ok(Self {
			states: vec![SaveState::NotStarted; zone_count],
		})
	}

	pub fn is_complete(&self) -> bool {
		self.states.iter().all(|s| matches!(s, SaveState::Complete | SaveState::Aborted))
	}

	/// `START`: begins saving zone `zone`. A failure to start still marks the
	/// zone complete, since there is nothing further to do for it.
	pub fn start(&mut self, zone: usize, target: &mut dyn SaveableZone) {
		match target.start_saving() {
			Ok(()) => self.states[zone] = SaveState::Saving,
			Err(_) => self.states[zone] = SaveState::Complete,
		}
	}

	/// `CONTINUE`: polls one in-progress zone; does nothing for a zone that
	/// has already finished or was never started.
	pub fn poll(&mut self, zone: usize, target: &dyn SaveableZone) {
		if self.states[zone] == SaveState::Saving && target.is_saving_done() {
			self.states[zone] = SaveState::Complete;
		}
	}

	/// `FINISH`: pulls the encoded delta lists from a zone that has
	/// finished saving and appends the guard-list terminator. Always marks
	/// the zone complete, whether or not it had anything to write.
	pub fn finish(&mut self, zone: usize, target: &mut dyn SaveableZone, out: &mut Vec<u8>) -> Result<(), Error> {
		if self.states[zone] == SaveState::Saving {
			let bytes = target.finish_saving().map_err(|e| Error::ZoneFailed(zone, e))?;
			out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
			out.extend_from_slice(&bytes);
		}
		write_guard_delta_list(out);
		self.states[zone] = SaveState::Complete;
		Ok(())
	}

	/// `ABORT`: always marks the zone complete.
	pub fn abort(&mut self, zone: usize, target: &mut dyn SaveableZone) {
		target.abort_saving();
		self.states[zone] = SaveState::Aborted;
	}
}

fn write_guard_delta_list(out: &mut Vec<u8>) {
	out.extend_from_slice(&GUARD_DELTA_LIST.to_le_bytes());
}

/// Replays every zone's delta lists from a flat buffer of
/// length-prefixed records, each zone's run of records terminated by its own
/// guard marker. A zone may own any number of records (including zero)
/// before its guard; the guard is what advances to the next zone, not the
/// record count. Aborts and returns an error on the first malformed record
/// or zone failure, and requires every zone's guard to be present.
pub fn restore_zones(buf: &[u8], zones: &mut [&mut dyn SaveableZone]) -> Result<(), Error> {
	if zones.len() > MAX_ZONES {
		return Err(Error::TooManyZones(zones.len()));
	}

	let mut cursor = 0usize;
	let mut current_zone = 0usize;

	while cursor + 4 <= buf.len() {
		if current_zone >= zones.len() {
			return Err(Error::CorruptComponent { zone: current_zone });
		}

		let marker = u32::from_le_bytes(buf[cursor..cursor + 4].try_into().unwrap());
		cursor += 4;
		if marker == GUARD_DELTA_LIST {
			current_zone += 1;
			continue;
		}

		let len = marker as usize;
		if len > DELTA_LIST_MAX_BYTE_COUNT {
			return Err(Error::RecordTooLarge(len));
		}
		if cursor + len > buf.len() {
			return Err(Error::CorruptComponent { zone: current_zone });
		}

		let record = &buf[cursor..cursor + len];
		cursor += len;

		zones[current_zone].restore_from(record).map_err(|e| Error::ZoneFailed(current_zone, e))?;
	}

	if current_zone != zones.len() {
		return Err(Error::CorruptComponent { zone: current_zone });
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::external::MockSaveableZone;

	#[test]
	fn rejects_too_many_zones() {
		assert!(SaveDriver::new(MAX_ZONES + 1).is_err());
	}

	#[test]
	fn save_round_trip_marks_all_complete() {
		let mut driver = SaveDriver::new(2).unwrap();
		let mut zone0 = MockSaveableZone::new();
		zone0.expect_start_saving().return_const(Ok(()));
		zone0.expect_is_saving_done().return_const(true);
		zone0.expect_finish_saving().return_const(Ok(vec![1, 2, 3]));

		let mut zone1 = MockSaveableZone::new();
		zone1.expect_start_saving().return_const(Ok(()));
		zone1.expect_is_saving_done().return_const(true);
		zone1.expect_finish_saving().return_const(Ok(vec![4]));

		let mut out = Vec::new();
		driver.start(0, &mut zone0);
		driver.poll(0, &zone0);
		driver.finish(0, &mut zone0, &mut out).unwrap();
		driver.start(1, &mut zone1);
		driver.poll(1, &zone1);
		driver.finish(1, &mut zone1, &mut out).unwrap();

		assert!(driver.is_complete());
		assert!(!out.is_empty());
	}

	#[test]
	fn failed_start_still_marks_complete() {
		let mut driver = SaveDriver::new(1).unwrap();
		let mut zone = MockSaveableZone::new();
		zone.expect_start_saving().return_const(Err(crate::error::EngineError::NoSpace));
		driver.start(0, &mut zone);
		assert!(driver.is_complete());
	}

	#[test]
	fn restore_replays_records_in_order() {
		let mut out = Vec::new();
		out.extend_from_slice(&3u32.to_le_bytes());
		out.extend_from_slice(&[7, 8, 9]);
		write_guard_delta_list(&mut out);

		let mut zone = MockSaveableZone::new();
		zone.expect_restore_from().withf(|b: &[u8]| b == &[7u8, 8, 9][..]).return_const(Ok(()));
		let mut zones: Vec<&mut dyn SaveableZone> = vec![&mut zone];
		restore_zones(&out, &mut zones).unwrap();
	}

	#[test]
	fn restore_replays_multiple_records_within_one_zone() {
		let mut out = Vec::new();
		out.extend_from_slice(&2u32.to_le_bytes());
		out.extend_from_slice(&[1, 2]);
		out.extend_from_slice(&3u32.to_le_bytes());
		out.extend_from_slice(&[3, 4, 5]);
		write_guard_delta_list(&mut out);
		out.extend_from_slice(&1u32.to_le_bytes());
		out.extend_from_slice(&[6]);
		write_guard_delta_list(&mut out);

		let mut zone0 = MockSaveableZone::new();
		zone0.expect_restore_from().withf(|b: &[u8]| b == &[1u8, 2][..]).return_const(Ok(()));
		zone0.expect_restore_from().withf(|b: &[u8]| b == &[3u8, 4, 5][..]).return_const(Ok(()));
		let mut zone1 = MockSaveableZone::new();
		zone1.expect_restore_from().withf(|b: &[u8]| b == &[6u8][..]).return_const(Ok(()));

		let mut zones: Vec<&mut dyn SaveableZone> = vec![&mut zone0, &mut zone1];
		restore_zones(&out, &mut zones).unwrap();
	}

	#[test]
	fn restore_accepts_empty_zone_with_only_a_guard() {
		let mut out = Vec::new();
		write_guard_delta_list(&mut out);
		write_guard_delta_list(&mut out);

		let mut zone0 = MockSaveableZone::new();
		let mut zone1 = MockSaveableZone::new();
		let mut zones: Vec<&mut dyn SaveableZone> = vec![&mut zone0, &mut zone1];
		restore_zones(&out, &mut zones).unwrap();
	}

	#[test]
	fn restore_rejects_incomplete_zone_set() {
		let out = Vec::new();
		let mut zone = MockSaveableZone::new();
		let mut zones: Vec<&mut dyn SaveableZone> = vec![&mut zone];
		let err = restore_zones(&out, &mut zones).unwrap_err();
		assert!(matches!(err, Error::CorruptComponent { .. }));
	}
}
