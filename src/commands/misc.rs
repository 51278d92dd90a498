//! Builders and parsers for file selection, Get Data, Get Challenge and the
//! DF life-cycle commands.

// Uses
use super::{Command, PreparedCommand};
use crate::{
	apdu::{build_apdu, ApduRequest, ApduResponse, CardClass},
	card::{
		file::{EfType, FileHeader},
		CardProfile,
	},
	error::{Error, ParseError},
	tlv,
};

// Constants
const INS_SELECT_FILE: u8 = 0xA4;
const INS_GET_DATA: u8 = 0xCA;
const INS_GET_CHALLENGE: u8 = 0x84;
const INS_INVALIDATE: u8 = 0x04;
const INS_REHABILITATE: u8 = 0x44;
const CARD_CHALLENGE_SIZE: usize = 8;
/// Proprietary tag wrapping a file descriptor in Select File and FCP
/// responses.
const TAG_PROPRIETARY_FILE_DESCRIPTOR: &[u8] = &[0x85];
/// Outer and inner tags of the EF-list data object.
const TAG_EF_LIST: &[u8] = &[0xC0];
const TAG_EF_DESCRIPTOR: &[u8] = &[0xC1];

/// The non-LID targets of Select File.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SelectFileControl {
	FirstEf,
	NextEf,
	CurrentDf,
}

/// The data objects Get Data can fetch, with their `P1 P2` tag addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GetDataTag {
	FciForCurrentDf,
	FcpForCurrentFile,
	EfList,
	TraceabilityInformation,
}

impl GetDataTag {
	fn p1_p2(self) -> (u8, u8) {
		match self {
			Self::FciForCurrentDf => (0x00, 0x6F),
			Self::FcpForCurrentFile => (0x00, 0x62),
			Self::EfList => (0x00, 0xC0),
			Self::TraceabilityInformation => (0x01, 0x85),
		}
	}
}

/// Builds a Select File by LID: `CLA A4 09 00 02 LID_HI LID_LO 00`.
pub(crate) fn build_select_file_by_lid(class: CardClass, lid: u16) -> PreparedCommand {
	let request = ApduRequest::new(
		build_apdu(
			class.into(),
			INS_SELECT_FILE,
			0x09,
			0x00,
			Some(&[(lid >> 8) as u8, lid as u8]),
			Some(0x00),
		),
		"Select File",
	);

	PreparedCommand::new(Command::SelectFileByLid { lid }, request, false)
}

/// Builds a Select File navigation command; NEXT EF frames as
/// `CLA A4 02 02 02 00 00 00`.
pub(crate) fn build_select_file_by_control(
	class: CardClass,
	control: SelectFileControl,
) -> PreparedCommand {
	let (p1, p2) = match control {
		SelectFileControl::FirstEf => (0x02, 0x00),
		SelectFileControl::NextEf => (0x02, 0x02),
		SelectFileControl::CurrentDf => (0x09, 0x00),
	};
	let request = ApduRequest::new(
		build_apdu(
			class.into(),
			INS_SELECT_FILE,
			p1,
			p2,
			Some(&[0x00, 0x00]),
			Some(0x00),
		),
		"Select File",
	);

	PreparedCommand::new(Command::SelectFileByControl { control }, request, false)
}

pub(crate) fn build_get_data(class: CardClass, tag: GetDataTag) -> PreparedCommand {
	let (p1, p2) = tag.p1_p2();
	let request = ApduRequest::new(
		build_apdu(class.into(), INS_GET_DATA, p1, p2, None, Some(0x00)),
		"Get Data",
	);

	PreparedCommand::new(Command::GetData { tag }, request, false)
}

pub(crate) fn build_get_challenge(class: CardClass) -> PreparedCommand {
	let request = ApduRequest::new(
		build_apdu(
			class.into(),
			INS_GET_CHALLENGE,
			0x00,
			0x00,
			None,
			Some(CARD_CHALLENGE_SIZE as u8),
		),
		"Get Challenge",
	);

	PreparedCommand::new(Command::GetChallenge, request, false)
}

pub(crate) fn build_invalidate(class: CardClass) -> PreparedCommand {
	let request = ApduRequest::new(
		build_apdu(class.into(), INS_INVALIDATE, 0x00, 0x00, None, None),
		"Invalidate",
	);

	PreparedCommand::new(Command::Invalidate, request, true)
}

pub(crate) fn build_rehabilitate(class: CardClass) -> PreparedCommand {
	let request = ApduRequest::new(
		build_apdu(class.into(), INS_REHABILITATE, 0x00, 0x00, None, None),
		"Rehabilitate",
	);

	PreparedCommand::new(Command::Rehabilitate, request, true)
}

/// Folds a Select File response into the file store: the proprietary `85`
/// data object carries the same 6-byte descriptor as an EF-list entry.
pub(crate) fn parse_select_file(
	response: &ApduResponse,
	profile: &mut CardProfile,
) -> Result<(), Error> {
	let data = response.data();
	if data.is_empty() {
		return Ok(());
	}
	let nodes = tlv::parse(data)?;
	if let Some(descriptor) = tlv::find_first(nodes.as_slice(), TAG_PROPRIETARY_FILE_DESCRIPTOR) {
		let header = FileHeader::try_from(&descriptor.value[..6.min(descriptor.value.len())])?;
		profile.files_mut().set_header(header);
	}

	Ok(())
}

pub(crate) fn parse_get_challenge(
	response: &ApduResponse,
	profile: &mut CardProfile,
) -> Result<(), Error> {
	let data = response.data();
	if data.len() != CARD_CHALLENGE_SIZE {
		return Err(ParseError::ByteCountIncorrect {
			r#type: std::cmp::Ordering::Equal,
			expected: CARD_CHALLENGE_SIZE,
			found: data.len(),
		}
		.into());
	}
	profile.set_card_challenge(data.to_vec());

	Ok(())
}

pub(crate) fn parse_get_data(
	tag: GetDataTag,
	response: &ApduResponse,
	profile: &mut CardProfile,
) -> Result<(), Error> {
	match tag {
		GetDataTag::TraceabilityInformation => {
			profile.set_traceability_information(response.data().to_vec());
			Ok(())
		}
		GetDataTag::EfList => parse_ef_list(response.data(), profile),
		GetDataTag::FciForCurrentDf => {
			// The FCI was already decoded at selection; nothing to fold in
			Ok(())
		}
		GetDataTag::FcpForCurrentFile => parse_select_file(response, profile),
	}
}

/// Decodes the EF-list data object: outer tag `C0`, then one `C1 06` entry
/// per elementary file.
fn parse_ef_list(data: &[u8], profile: &mut CardProfile) -> Result<(), Error> {
	let nodes = tlv::parse(data)?;
	let list = tlv::find_first(nodes.as_slice(), TAG_EF_LIST).ok_or(ParseError::NonCompliant)?;
	let entries = tlv::parse(list.value.as_slice())?;
	if entries.is_empty() {
		return Err(ParseError::NonCompliant.into());
	}
	for entry in &entries {
		if entry.tag.as_slice() != TAG_EF_DESCRIPTOR || entry.value.len() != 6 {
			return Err(ParseError::NonCompliant.into());
		}
		// An EF type byte outside the mapping is a state refusal, not a
		// parse failure: the card listed a file this engine cannot handle
		let ef_type = EfType::try_from(entry.value[3]).map_err(|_| {
			Error::invalid_state(format!(
				"the EF list advertises an unknown elementary file type 0x{:02X}",
				entry.value[3]
			))
		})?;
		let sfi = entry.value[2];
		if !(0x01..=0x1E).contains(&sfi) {
			return Err(ParseError::NonCompliant.into());
		}
		profile.files_mut().set_header(FileHeader {
			lid: (u16::from(entry.value[0]) << 8) | u16::from(entry.value[1]),
			sfi,
			ef_type,
			record_size: entry.value[4],
			records_number: entry.value[5],
		});
	}

	Ok(())
}

// Unit Tests
#[cfg(test)]
mod tests {
	// Uses
	use super::{
		build_get_challenge,
		build_get_data,
		build_select_file_by_control,
		build_select_file_by_lid,
		parse_get_data,
		GetDataTag,
		SelectFileControl,
	};
	use crate::{
		apdu::{ApduResponse, CardClass},
		card::{file::EfType, CardProfile},
		error::Error,
	};

	// Tests
	/// Ensures the fixed Select File encodings from the interface contract.
	#[test]
	fn select_file_fixed_encodings() {
		let by_lid = build_select_file_by_lid(CardClass::Iso, 0x2010);
		assert_eq!(
			&[0x00, 0xA4, 0x09, 0x00, 0x02, 0x20, 0x10, 0x00],
			by_lid.request.bytes()
		);

		let next = build_select_file_by_control(CardClass::Iso, SelectFileControl::NextEf);
		assert_eq!(
			&[0x00, 0xA4, 0x02, 0x02, 0x02, 0x00, 0x00, 0x00],
			next.request.bytes()
		);
	}

	/// Ensures the fixed Get Data encodings: traceability and EF-list.
	#[test]
	fn get_data_fixed_encodings() {
		let traceability = build_get_data(CardClass::Iso, GetDataTag::TraceabilityInformation);
		assert_eq!(
			&[0x00, 0xCA, 0x01, 0x85, 0x00],
			traceability.request.bytes()
		);

		let ef_list = build_get_data(CardClass::Iso, GetDataTag::EfList);
		assert_eq!(&[0x00, 0xCA, 0x00, 0xC0, 0x00], ef_list.request.bytes());
	}

	/// Ensures the Get Challenge frame asks for 8 bytes.
	#[test]
	fn get_challenge_encoding() {
		let challenge = build_get_challenge(CardClass::Iso);
		assert_eq!(&[0x00, 0x84, 0x00, 0x00, 0x08], challenge.request.bytes());
	}

	/// Ensures an EF-list response populates the headers of every listed
	/// file.
	#[test]
	fn ef_list_populates_headers() {
		let mut profile = CardProfile::new();
		#[rustfmt::skip]
		let response = ApduResponse::from_data_and_status_word(
			&[
				0xC0, 0x10,
				0xC1, 0x06, 0x20, 0x10, 0x07, 0x04, 0x1D, 0x03,
				0xC1, 0x06, 0x20, 0x20, 0x08, 0x02, 0x1D, 0x01,
			],
			0x9000,
		);
		parse_get_data(GetDataTag::EfList, &response, &mut profile)
			.expect("the list is well-formed");

		let cyclic = profile
			.file_by_lid(0x2010)
			.and_then(|file| file.header().copied())
			.expect("the first file is listed");
		assert_eq!(0x07, cyclic.sfi);
		assert_eq!(EfType::Cyclic, cyclic.ef_type);

		let linear = profile
			.file_by_sfi(0x08)
			.and_then(|file| file.header().copied())
			.expect("the second file is listed");
		assert_eq!(0x2020, linear.lid);
		assert_eq!(EfType::Linear, linear.ef_type);
	}

	/// Ensures an unknown EF type byte in the list is a state error per the
	/// wire contract.
	#[test]
	fn ef_list_unknown_type_rejected() {
		let mut profile = CardProfile::new();
		let response = ApduResponse::from_data_and_status_word(
			&[0xC0, 0x08, 0xC1, 0x06, 0x20, 0x10, 0x07, 0x03, 0x1D, 0x03],
			0x9000,
		);
		assert!(matches!(
			parse_get_data(GetDataTag::EfList, &response, &mut profile),
			Err(Error::InvalidState { .. })
		));
	}
}
