//! C7 — the super-block codec: a fixed header, an opaque component payload
//! (the engine's other on-disk state, encoded by collaborators this crate
//! doesn't know about), and a trailing CRC-32 over everything that came
//! before it.

use byte_view::ByteView;
use crc32fast::Hasher;
use thiserror::Error;

use crate::utils::aligned_buf::AlignedBuffer;

const MAGIC: [u8; 4] = *b"BTRE";
const MAJOR_VERSION: u16 = 1;
const MINOR_VERSION: u16 = 0;
const SECTOR_SIZE: usize = 512;
const CHECKSUM_SIZE: usize = 4;

#[derive(Debug, ByteView)]
#[repr(C)]
struct SuperBlockHeader {
	magic: [u8; 4],
	major_version: u16,
	minor_version: u16,
	component_data_size: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<SuperBlockHeader>();
const FIXED_SIZE: usize = HEADER_SIZE + CHECKSUM_SIZE;
const MAX_COMPONENT_DATA_SIZE: usize = SECTOR_SIZE - FIXED_SIZE;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	#[error("component data is {0} bytes, max is {MAX_COMPONENT_DATA_SIZE}")]
	ComponentTooLarge(usize),
	#[error("super block header magic does not match")]
	BadMagic,
	#[error("super block version {major}.{minor} is not supported")]
	UnsupportedVersion { major: u16, minor: u16 },
	#[error("encoded component size {0} exceeds the remaining buffer")]
	ContentsTooLarge(u32),
	#[error("super block checksum mismatch")]
	ChecksumMismatch,
}

pub fn fixed_super_block_size() -> usize {
	FIXED_SIZE
}

/// Encodes `component_data` (already-serialized, opaque to this crate) into
/// a full sector-sized buffer: header, payload, CRC-32.
pub fn encode_super_block(component_data: &[u8]) -> Result<AlignedBuffer, Error> {
	if component_data.len() > MAX_COMPONENT_DATA_SIZE {
		return Err(Error::ComponentTooLarge(component_data.len()));
	}

	let mut buf = AlignedBuffer::with_capacity(SuperBlockHeader::ALIGN, SECTOR_SIZE);
	{
		let header = SuperBlockHeader::from_bytes_mut(&mut buf.as_slice_mut()[..HEADER_SIZE]);
		header.magic = MAGIC;
		header.major_version = MAJOR_VERSION;
		header.minor_version = MINOR_VERSION;
		header.component_data_size = component_data.len() as u32;
	}

	let payload_end = HEADER_SIZE + component_data.len();
	buf.as_slice_mut()[HEADER_SIZE..payload_end].copy_from_slice(component_data);

	let mut hasher = Hasher::new();
	hasher.update(&buf.as_slice()[..payload_end]);
	let checksum = hasher.finalize();
	buf.as_slice_mut()[payload_end..payload_end + CHECKSUM_SIZE].copy_from_slice(&checksum.to_le_bytes());

	Ok(buf)
}

/// Decodes and validates a sector read from disk, returning the component
/// payload on success.
pub fn decode_super_block(buf: &[u8]) -> Result<Vec<u8>, Error> {
	if buf.len() < HEADER_SIZE {
		return Err(Error::ContentsTooLarge(HEADER_SIZE as u32));
	}

	let mut aligned_header = AlignedBuffer::from_bytes(&buf[..HEADER_SIZE], SuperBlockHeader::ALIGN);
	let header = SuperBlockHeader::from_bytes(aligned_header.as_slice_mut());
	if header.magic != MAGIC {
		return Err(Error::BadMagic);
	}
	if header.major_version != MAJOR_VERSION {
		return Err(Error::UnsupportedVersion {
			major: header.major_version,
			minor: header.minor_version,
		});
	}

	let component_data_size = header.component_data_size as usize;
	if component_data_size > MAX_COMPONENT_DATA_SIZE {
		return Err(Error::UnsupportedVersion {
			major: header.major_version,
			minor: header.minor_version,
		});
	}

	let payload_end = HEADER_SIZE + component_data_size;
	let checksum_end = payload_end + CHECKSUM_SIZE;
	if checksum_end > buf.len() {
		return Err(Error::UnsupportedVersion {
			major: header.major_version,
			minor: header.minor_version,
		});
	}

	let mut hasher = Hasher::new();
	hasher.update(&buf[..payload_end]);
	let checksum = hasher.finalize();

	let saved = u32::from_le_bytes(buf[payload_end..checksum_end].try_into().unwrap());
	if checksum != saved {
		return Err(Error::ChecksumMismatch);
	}

	Ok(buf[HEADER_SIZE..payload_end].to_vec())
}
