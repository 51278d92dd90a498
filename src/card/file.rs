//! Elementary file descriptors and the per-transaction content cache.

// Uses
use std::{cmp::Ordering, collections::BTreeMap};

use crate::{enum_repr_fallible, error::ParseError};

// Constants
pub const SFI_MIN: u8 = 0x01;
pub const SFI_MAX: u8 = 0x1E;
/// Counters are 3-byte big-endian values packed into the file's first record.
pub const COUNTER_SIZE: usize = 3;
const FILE_HEADER_SIZE: usize = 6;

enum_repr_fallible! {
/// The elementary file types advertised in the EF-list data object.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EfType: u8, ParseError, { |_| ParseError::NonCompliant } {
	Binary            = 0x01 => "Binary",
	Linear            = 0x02 => "Linear",
	Cyclic            = 0x04 => "Cyclic",
	SimulatedCounters = 0x08 => "Simulated Counters",
	Counters          = 0x09 => "Counters",
}
}

/// The descriptor of one elementary file, as listed by the card.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FileHeader {
	pub lid: u16,
	pub sfi: u8,
	pub ef_type: EfType,
	pub record_size: u8,
	pub records_number: u8,
}

impl TryFrom<&[u8]> for FileHeader {
	type Error = ParseError;

	/// Decodes the 6-byte value of an EF-list `C1` entry:
	/// `LID(2) SFI(1) EFT(1) RS(1) RN(1)`.
	fn try_from(raw_bytes: &[u8]) -> Result<Self, Self::Error> {
		if raw_bytes.len() != FILE_HEADER_SIZE {
			return Err(ParseError::ByteCountIncorrect {
				r#type: Ordering::Equal,
				expected: FILE_HEADER_SIZE,
				found: raw_bytes.len(),
			});
		}

		let sfi = raw_bytes[2];
		if !(SFI_MIN..=SFI_MAX).contains(&sfi) {
			return Err(ParseError::NonCompliant);
		}

		Ok(Self {
			lid: (u16::from(raw_bytes[0]) << 8) | u16::from(raw_bytes[1]),
			sfi,
			ef_type: EfType::try_from(raw_bytes[3])?,
			record_size: raw_bytes[4],
			records_number: raw_bytes[5],
		})
	}
}

/// One elementary file's known content.
///
/// Records are 1-based, matching the card's numbering. Binary files keep
/// their content in record 1, grown as offsets are touched.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ElementaryFile {
	header: Option<FileHeader>,
	records: BTreeMap<u8, Vec<u8>>,
}

impl ElementaryFile {
	pub fn header(&self) -> Option<&FileHeader> {
		self.header.as_ref()
	}

	pub fn record(&self, record_number: u8) -> Option<&[u8]> {
		self.records.get(&record_number).map(Vec::as_slice)
	}

	pub fn records(&self) -> &BTreeMap<u8, Vec<u8>> {
		&self.records
	}

	/// Reads counter `counter_number` (1-based) out of the packed first
	/// record.
	pub fn counter(&self, counter_number: u8) -> Option<u32> {
		if counter_number == 0 {
			return None;
		}
		let record = self.records.get(&1)?;
		let start = usize::from(counter_number - 1) * COUNTER_SIZE;
		let end = start + COUNTER_SIZE;
		if end > record.len() {
			return None;
		}

		let mut value = 0_u32;
		for byte in &record[start..end] {
			value = (value << 8) | u32::from(*byte);
		}

		Some(value)
	}

	fn record_mut(&mut self, record_number: u8) -> &mut Vec<u8> {
		self.records.entry(record_number).or_default()
	}
}

/// The profile's file content cache: every record, counter and binary chunk
/// the transaction has seen or written, indexed by SFI and LID.
#[derive(Clone, Debug, Default)]
pub struct FileStore {
	files: BTreeMap<u8, ElementaryFile>,
	lid_to_sfi: BTreeMap<u16, u8>,
}

impl FileStore {
	pub fn file_by_sfi(&self, sfi: u8) -> Option<&ElementaryFile> {
		self.files.get(&sfi)
	}

	pub fn file_by_lid(&self, lid: u16) -> Option<&ElementaryFile> {
		self.lid_to_sfi
			.get(&lid)
			.and_then(|sfi| self.files.get(sfi))
	}

	pub fn files(&self) -> &BTreeMap<u8, ElementaryFile> {
		&self.files
	}

	pub(crate) fn set_header(&mut self, header: FileHeader) {
		self.lid_to_sfi.insert(header.lid, header.sfi);
		self.files.entry(header.sfi).or_default().header = Some(header);
	}

	/// Replaces a record's content wholesale.
	pub(crate) fn update_record(&mut self, sfi: u8, record_number: u8, content: &[u8]) {
		*self
			.files
			.entry(sfi)
			.or_default()
			.record_mut(record_number) = content.to_vec();
	}

	/// Merges content into a record with a logical OR, which is the card's
	/// own semantic for Write Record.
	pub(crate) fn write_record(&mut self, sfi: u8, record_number: u8, content: &[u8]) {
		let record = self.files.entry(sfi).or_default().record_mut(record_number);
		if record.len() < content.len() {
			record.resize(content.len(), 0x00);
		}
		for (index, byte) in content.iter().enumerate() {
			record[index] |= byte;
		}
	}

	/// Writes content into a record starting at `offset`, growing the record
	/// as needed. Used for partial reads, binary reads and Update Binary.
	pub(crate) fn fill_record_at(&mut self, sfi: u8, record_number: u8, offset: usize, content: &[u8]) {
		let record = self.files.entry(sfi).or_default().record_mut(record_number);
		let end = offset + content.len();
		if record.len() < end {
			record.resize(end, 0x00);
		}
		record[offset..end].copy_from_slice(content);
	}

	/// Merges content into a record at `offset` with a logical OR, which is
	/// the card's own semantic for Write Binary.
	pub(crate) fn write_record_at(&mut self, sfi: u8, record_number: u8, offset: usize, content: &[u8]) {
		let record = self.files.entry(sfi).or_default().record_mut(record_number);
		let end = offset + content.len();
		if record.len() < end {
			record.resize(end, 0x00);
		}
		for (index, byte) in content.iter().enumerate() {
			record[offset + index] |= byte;
		}
	}

	/// Inserts content as the new record 1 of a cyclic file, shifting every
	/// known record up by one.
	pub(crate) fn add_cyclic_content(&mut self, sfi: u8, content: &[u8]) {
		let file = self.files.entry(sfi).or_default();
		let shifted = file
			.records
			.iter()
			.map(|(number, record)| (number + 1, record.clone()))
			.collect::<BTreeMap<_, _>>();
		file.records = shifted;
		file.records.insert(1, content.to_vec());
	}

	pub(crate) fn set_counter(&mut self, sfi: u8, counter_number: u8, value: u32) {
		if counter_number == 0 {
			return;
		}
		let start = usize::from(counter_number - 1) * COUNTER_SIZE;
		let bytes = [(value >> 16) as u8, (value >> 8) as u8, value as u8];
		self.fill_record_at(sfi, 1, start, &bytes);
	}
}
