//! Builders and parsers for the read command family: Read Records, Read
//! Record Multiple (partial reads), Read Binary and Search Record Multiple.

// Uses
use super::{Command, PreparedCommand};
use crate::{
	apdu::{build_apdu, ApduRequest, ApduResponse, CardClass},
	card::CardProfile,
	error::{Error, ParseError},
};

// Constants
const INS_READ_RECORDS: u8 = 0xB2;
const INS_READ_RECORD_MULTIPLE: u8 = 0xB3;
const INS_READ_BINARY: u8 = 0xB0;
const INS_SEARCH_RECORD_MULTIPLE: u8 = 0xA2;
/// Data object tag introducing the offset of a partial record read.
const TAG_OFFSET_DATA_OBJECT: u8 = 0x54;

/// Builds a single-record read: `P2 = (SFI << 3) | 4`, `Le = 0` to fetch the
/// whole record.
pub(crate) fn build_read_record(class: CardClass, sfi: u8, record: u8) -> PreparedCommand {
	PreparedCommand::new(
		Command::ReadRecords {
			sfi,
			first: record,
			count: 1,
			record_size: 0,
		},
		ApduRequest::new(
			build_apdu(
				class.into(),
				INS_READ_RECORDS,
				record,
				(sfi << 3) | 0x04,
				None,
				Some(0x00),
			),
			"Read Records",
		),
		false,
	)
}

/// Builds a multiple-record read starting at `first`: `P2 = (SFI << 3) | 5`,
/// `Le` sized for `count` whole records.
pub(crate) fn build_read_records(
	class: CardClass,
	sfi: u8,
	first: u8,
	count: u8,
	record_size: u8,
) -> PreparedCommand {
	PreparedCommand::new(
		Command::ReadRecords {
			sfi,
			first,
			count,
			record_size,
		},
		ApduRequest::new(
			build_apdu(
				class.into(),
				INS_READ_RECORDS,
				first,
				(sfi << 3) | 0x05,
				None,
				Some(count.wrapping_mul(record_size)),
			),
			"Read Records",
		),
		false,
	)
}

/// Builds a partial multiple-record read: `length` bytes at `offset` in each
/// of `count` records starting at `first`.
pub(crate) fn build_read_records_partially(
	class: CardClass,
	sfi: u8,
	first: u8,
	count: u8,
	offset: u8,
	length: u8,
) -> PreparedCommand {
	PreparedCommand::new(
		Command::ReadRecordsPartially {
			sfi,
			first,
			count,
			offset,
			length,
		},
		ApduRequest::new(
			build_apdu(
				class.into(),
				INS_READ_RECORD_MULTIPLE,
				first,
				(sfi << 3) | 0x05,
				Some(&[TAG_OFFSET_DATA_OBJECT, 0x02, 0x00, offset]),
				Some(count.wrapping_mul(length)),
			),
			"Read Record Multiple",
		),
		false,
	)
}

/// Builds a binary read.
///
/// While `sfi` is non-zero the offset must fit in 8 bits, because P1 carries
/// the SFI (`0x80 | sfi`); with `sfi == 0` the full 15-bit offset spreads
/// over P1/P2. Offset anchoring (the preliminary 1-byte read that selects the
/// SFI) is the transaction manager's job.
pub(crate) fn build_read_binary(
	class: CardClass,
	sfi: u8,
	offset: u16,
	length: u8,
) -> PreparedCommand {
	let (p1, p2) = if sfi > 0 {
		(0x80 | sfi, offset as u8)
	} else {
		((offset >> 8) as u8, offset as u8)
	};

	PreparedCommand::new(
		Command::ReadBinary {
			sfi,
			offset,
			length,
		},
		ApduRequest::new(
			build_apdu(class.into(), INS_READ_BINARY, p1, p2, None, Some(length)),
			"Read Binary",
		),
		false,
	)
}

/// The operands of a Search Record Multiple, as a concrete settable value.
///
/// After the drain, the matching record numbers are readable from the
/// profile's search results (and from [`CardProfile::search_results`]).
#[derive(Clone, Debug)]
pub struct SearchCommandData {
	sfi: u8,
	record_number: u8,
	offset: u8,
	search_data: Vec<u8>,
	mask: Option<Vec<u8>>,
	fetch_first_matching_result: bool,
}

impl SearchCommandData {
	pub fn new(sfi: u8, search_data: Vec<u8>) -> Self {
		Self {
			sfi,
			record_number: 1,
			offset: 0,
			search_data,
			mask: None,
			fetch_first_matching_result: false,
		}
	}

	/// The record number the search starts from (1 by default).
	pub fn set_record_number(&mut self, record_number: u8) -> &mut Self {
		self.record_number = record_number;
		self
	}

	/// The offset within each record the comparison starts at.
	pub fn set_offset(&mut self, offset: u8) -> &mut Self {
		self.offset = offset;
		self
	}

	/// A mask applied to both the record and the search data before
	/// comparison. Must be as long as the search data.
	pub fn set_mask(&mut self, mask: Vec<u8>) -> &mut Self {
		self.mask = Some(mask);
		self
	}

	/// Also fetch the content of the first matching record.
	pub fn enable_fetch_first_matching_result(&mut self) -> &mut Self {
		self.fetch_first_matching_result = true;
		self
	}

	pub fn sfi(&self) -> u8 {
		self.sfi
	}

	pub fn record_number(&self) -> u8 {
		self.record_number
	}

	pub fn offset(&self) -> u8 {
		self.offset
	}

	pub fn search_data(&self) -> &[u8] {
		self.search_data.as_slice()
	}

	pub fn mask(&self) -> Option<&[u8]> {
		self.mask.as_deref()
	}

	pub fn is_fetch_first_matching_result(&self) -> bool {
		self.fetch_first_matching_result
	}

	pub(crate) fn validate(&self, payload_capacity: usize) -> Result<(), Error> {
		if self.search_data.is_empty() || self.search_data.len() > payload_capacity {
			return Err(Error::invalid_input(format!(
				"search data length {} is out of range [1, {}]",
				self.search_data.len(),
				payload_capacity
			)));
		}
		if let Some(mask) = self.mask.as_ref() {
			if mask.len() != self.search_data.len() {
				return Err(Error::invalid_input(format!(
					"mask length {} does not match search data length {}",
					mask.len(),
					self.search_data.len()
				)));
			}
		}

		Ok(())
	}
}

/// Builds a Search Record Multiple from its settable operand value.
///
/// Data field: `offset(1) flags(1) length(1) search-data [mask]`, with flag
/// bit 0 set when the first match's content is also wanted and bit 1 set when
/// a mask follows the search data.
pub(crate) fn build_search_records(
	class: CardClass,
	data: &SearchCommandData,
) -> PreparedCommand {
	let mut data_in =
		Vec::with_capacity(3 + data.search_data.len() + data.mask.as_ref().map_or(0, Vec::len));
	data_in.push(data.offset);
	let mut flags = 0x00_u8;
	if data.fetch_first_matching_result {
		flags |= 0x01;
	}
	if data.mask.is_some() {
		flags |= 0x02;
	}
	data_in.push(flags);
	data_in.push(data.search_data.len() as u8);
	data_in.extend_from_slice(data.search_data.as_slice());
	if let Some(mask) = data.mask.as_ref() {
		data_in.extend_from_slice(mask.as_slice());
	}

	PreparedCommand::new(
		Command::SearchRecords {
			sfi: data.sfi,
			first: data.record_number,
			fetch_first_match: data.fetch_first_matching_result,
		},
		ApduRequest::new(
			build_apdu(
				class.into(),
				INS_SEARCH_RECORD_MULTIPLE,
				data.record_number,
				(data.sfi << 3) | 0x07,
				Some(data_in.as_slice()),
				Some(0x00),
			),
			"Search Record Multiple",
		),
		false,
	)
}

pub(crate) fn parse_read_records(
	sfi: u8,
	first: u8,
	count: u8,
	record_size: u8,
	response: &ApduResponse,
	profile: &mut CardProfile,
) -> Result<(), Error> {
	let data = response.data();
	if count <= 1 {
		profile.files_mut().update_record(sfi, first, data);
		return Ok(());
	}

	// Multiple mode: consecutive whole records, `record_size` bytes each
	let record_size = usize::from(record_size);
	if record_size == 0 || data.len() % record_size != 0 {
		return Err(ParseError::NonCompliant.into());
	}
	for (index, record) in data.chunks(record_size).enumerate() {
		profile
			.files_mut()
			.update_record(sfi, first + index as u8, record);
	}

	Ok(())
}

pub(crate) fn parse_read_records_partially(
	sfi: u8,
	first: u8,
	count: u8,
	offset: u8,
	length: u8,
	response: &ApduResponse,
	profile: &mut CardProfile,
) -> Result<(), Error> {
	let data = response.data();
	let length = usize::from(length);
	if length == 0 || data.len() % length != 0 || data.len() / length > usize::from(count) {
		return Err(ParseError::NonCompliant.into());
	}
	for (index, chunk) in data.chunks(length).enumerate() {
		profile
			.files_mut()
			.fill_record_at(sfi, first + index as u8, usize::from(offset), chunk);
	}

	Ok(())
}

pub(crate) fn parse_read_binary(
	sfi: u8,
	offset: u16,
	response: &ApduResponse,
	profile: &mut CardProfile,
) {
	profile
		.files_mut()
		.fill_record_at(sfi, 1, usize::from(offset), response.data());
}

/// Decodes a search response: `count(1)` then the matching record numbers,
/// then the first match's content when it was requested.
pub(crate) fn parse_search_records(
	sfi: u8,
	_first: u8,
	fetch_first_match: bool,
	response: &ApduResponse,
	profile: &mut CardProfile,
) -> Result<(), Error> {
	let data = response.data();
	if data.is_empty() {
		return Err(ParseError::NonCompliant.into());
	}
	let count = usize::from(data[0]);
	if data.len() < 1 + count {
		return Err(ParseError::NonCompliant.into());
	}
	let matches = data[1..=count].to_vec();
	if fetch_first_match && count > 0 {
		let first_match = matches[0];
		profile
			.files_mut()
			.update_record(sfi, first_match, &data[(1 + count)..]);
	}
	profile.set_search_results(matches);

	Ok(())
}
