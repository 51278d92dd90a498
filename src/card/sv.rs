//! Stored-value state: balance, transaction number and the two log records.

// Uses
use std::cmp::Ordering;

use crate::{
	error::ParseError,
	util::{byte_slice_to_i32, byte_slice_to_u16, byte_slice_to_u32},
};

// Constants
pub const SV_LOAD_LOG_SIZE: usize = 22;
pub const SV_DEBIT_LOG_SIZE: usize = 19;

/// The last reload operation, as logged by the card.
///
/// Layout: `date(2) free1(1) KVC(1) free2(1) balance(3) amount(3) time(2)
/// SAM id(4) SAM t-num(3) SV t-num(2)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SvLoadLogRecord {
	raw: Vec<u8>,
}

impl SvLoadLogRecord {
	pub fn raw_data(&self) -> &[u8] {
		self.raw.as_slice()
	}

	pub fn date(&self) -> &[u8] {
		&self.raw[0..2]
	}

	pub fn kvc(&self) -> u8 {
		self.raw[3]
	}

	pub fn free_data(&self) -> [u8; 2] {
		[self.raw[2], self.raw[4]]
	}

	pub fn balance(&self) -> i32 {
		byte_slice_to_i32(&self.raw[5..8])
	}

	pub fn amount(&self) -> i32 {
		byte_slice_to_i32(&self.raw[8..11])
	}

	pub fn time(&self) -> &[u8] {
		&self.raw[11..13]
	}

	pub fn sam_id(&self) -> u32 {
		byte_slice_to_u32(&self.raw[13..17])
	}

	pub fn sam_t_num(&self) -> u32 {
		byte_slice_to_u32(&self.raw[17..20])
	}

	pub fn sv_t_num(&self) -> u16 {
		byte_slice_to_u16(&self.raw[20..22])
	}
}

impl TryFrom<&[u8]> for SvLoadLogRecord {
	type Error = ParseError;

	fn try_from(raw_bytes: &[u8]) -> Result<Self, Self::Error> {
		if raw_bytes.len() != SV_LOAD_LOG_SIZE {
			return Err(ParseError::ByteCountIncorrect {
				r#type: Ordering::Equal,
				expected: SV_LOAD_LOG_SIZE,
				found: raw_bytes.len(),
			});
		}

		Ok(Self {
			raw: raw_bytes.to_vec(),
		})
	}
}

/// The last debit operation, as logged by the card.
///
/// Layout: `amount(2, signed) date(2) time(2) KVC(1) SAM id(4) SAM t-num(3)
/// balance(3, signed) SV t-num(2)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SvDebitLogRecord {
	raw: Vec<u8>,
}

impl SvDebitLogRecord {
	pub fn raw_data(&self) -> &[u8] {
		self.raw.as_slice()
	}

	pub fn amount(&self) -> i32 {
		byte_slice_to_i32(&self.raw[0..2])
	}

	pub fn date(&self) -> &[u8] {
		&self.raw[2..4]
	}

	pub fn time(&self) -> &[u8] {
		&self.raw[4..6]
	}

	pub fn kvc(&self) -> u8 {
		self.raw[6]
	}

	pub fn sam_id(&self) -> u32 {
		byte_slice_to_u32(&self.raw[7..11])
	}

	pub fn sam_t_num(&self) -> u32 {
		byte_slice_to_u32(&self.raw[11..14])
	}

	pub fn balance(&self) -> i32 {
		byte_slice_to_i32(&self.raw[14..17])
	}

	pub fn sv_t_num(&self) -> u16 {
		byte_slice_to_u16(&self.raw[17..19])
	}
}

impl TryFrom<&[u8]> for SvDebitLogRecord {
	type Error = ParseError;

	fn try_from(raw_bytes: &[u8]) -> Result<Self, Self::Error> {
		if raw_bytes.len() != SV_DEBIT_LOG_SIZE {
			return Err(ParseError::ByteCountIncorrect {
				r#type: Ordering::Equal,
				expected: SV_DEBIT_LOG_SIZE,
				found: raw_bytes.len(),
			});
		}

		Ok(Self {
			raw: raw_bytes.to_vec(),
		})
	}
}

/// The profile's stored-value state.
///
/// `sv_get_executed` gates every accessor: balance and logs are meaningless
/// until an SV Get has run in the current transaction.
#[derive(Clone, Debug, Default)]
pub(crate) struct SvData {
	pub balance: i32,
	pub last_t_num: u16,
	/// The card's current SV KVC, from the last SV Get header.
	pub current_kvc: u8,
	pub load_log: Option<SvLoadLogRecord>,
	pub debit_log: Option<SvDebitLogRecord>,
	pub sv_get_executed: bool,
	/// The SV Get command header, kept for the SAM security computation.
	pub sv_get_request: Vec<u8>,
	/// The full SV Get response, kept for the SAM security computation.
	pub sv_get_response: Vec<u8>,
	/// SAM identification of the last finalized SV operation, for the log
	/// rebuild.
	pub last_sam_id: u32,
	pub last_sam_t_num: u32,
}

// Unit Tests
#[cfg(test)]
mod tests {
	// Uses
	use super::{SvDebitLogRecord, SvLoadLogRecord};

	mod load_log_byte_count {
		crate::wrong_byte_count!(super::super::SvLoadLogRecord, 22);
	}

	mod debit_log_byte_count {
		crate::wrong_byte_count!(super::super::SvDebitLogRecord, 19);
	}

	// Tests
	/// Ensures every load log field reads from its documented offset.
	#[test]
	fn load_log_fields() {
		#[rustfmt::skip]
		let raw = [
			0x14, 0x7A,             // date
			0x11,                   // free1
			0xAA,                   // KVC
			0x22,                   // free2
			0x00, 0x01, 0x00,       // balance
			0x00, 0x00, 0x64,       // amount
			0x04, 0x2C,             // time
			0xA1, 0xB2, 0xC3, 0xD4, // SAM id
			0x00, 0x00, 0x05,       // SAM t-num
			0x00, 0x07,             // SV t-num
		];
		let record =
			SvLoadLogRecord::try_from(raw.as_slice()).expect("the record is well-formed");

		assert_eq!(&[0x14, 0x7A], record.date());
		assert_eq!(0xAA, record.kvc());
		assert_eq!([0x11, 0x22], record.free_data());
		assert_eq!(0x0100, record.balance());
		assert_eq!(100, record.amount());
		assert_eq!(&[0x04, 0x2C], record.time());
		assert_eq!(0xA1B2_C3D4, record.sam_id());
		assert_eq!(5, record.sam_t_num());
		assert_eq!(7, record.sv_t_num());
	}

	/// Ensures every debit log field reads from its documented offset, with
	/// two's-complement amounts.
	#[test]
	fn debit_log_fields() {
		#[rustfmt::skip]
		let raw = [
			0xFF, 0x9C,             // amount: -100
			0x14, 0x7A,             // date
			0x04, 0x2C,             // time
			0xBB,                   // KVC
			0xA1, 0xB2, 0xC3, 0xD4, // SAM id
			0x00, 0x00, 0x06,       // SAM t-num
			0x00, 0x00, 0x9C,       // balance
			0x00, 0x08,             // SV t-num
		];
		let record =
			SvDebitLogRecord::try_from(raw.as_slice()).expect("the record is well-formed");

		assert_eq!(-100, record.amount());
		assert_eq!(&[0x14, 0x7A], record.date());
		assert_eq!(&[0x04, 0x2C], record.time());
		assert_eq!(0xBB, record.kvc());
		assert_eq!(0xA1B2_C3D4, record.sam_id());
		assert_eq!(6, record.sam_t_num());
		assert_eq!(0x9C, record.balance());
		assert_eq!(8, record.sv_t_num());
	}
}
