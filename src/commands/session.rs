//! Builders and parsers for the secure session commands: Open, Close,
//! Cancel, Manage Secure Session and the ratification no-op.

// Uses
use super::{Command, PreparedCommand};
use crate::{
	apdu::{build_apdu, ApduRequest, ApduResponse, CardClass},
	error::{Error, ParseError},
	security::WriteAccessLevel,
};

// Constants
const INS_OPEN_SECURE_SESSION: u8 = 0x8A;
const INS_CLOSE_SECURE_SESSION: u8 = 0x8E;
const INS_MANAGE_SECURE_SESSION: u8 = 0x82;
const INS_RATIFICATION: u8 = 0xB2;
/// Session MACs are 8 bytes in both regular and extended mode.
pub(crate) const SESSION_MAC_SIZE: usize = 8;
const CHALLENGE_SIZE_REGULAR: usize = 4;
const CHALLENGE_SIZE_EXTENDED: usize = 8;

/// Builds an Open Secure Session.
///
/// P1 carries the record number of the merged read (0 when none) and the key
/// index of the requested write access level; P2 carries the read SFI and the
/// session variant.
pub(crate) fn build_open_secure_session(
	class: CardClass,
	write_access_level: WriteAccessLevel,
	sam_challenge: &[u8],
	read_sfi: u8,
	read_record: u8,
	extended: bool,
) -> PreparedCommand {
	let p1 = (read_record << 3) | u8::from(write_access_level);
	let p2 = (read_sfi << 3) | if extended { 0x02 } else { 0x01 };
	let request = ApduRequest::new(
		build_apdu(
			class.into(),
			INS_OPEN_SECURE_SESSION,
			p1,
			p2,
			Some(sam_challenge),
			Some(0x00),
		),
		"Open Secure Session",
	);

	PreparedCommand::new(
		Command::OpenSecureSession {
			write_access_level,
			read_sfi,
			read_record,
			extended,
		},
		request,
		false,
	)
}

/// Builds a Close Secure Session carrying the terminal MAC.
///
/// `ask_ratification` sets P1 so the card ratifies immediately instead of
/// waiting for a ratification command or a deselect.
pub(crate) fn build_close_secure_session(
	class: CardClass,
	terminal_mac: &[u8],
	ask_ratification: bool,
	extended: bool,
) -> PreparedCommand {
	let request = ApduRequest::new(
		build_apdu(
			class.into(),
			INS_CLOSE_SECURE_SESSION,
			if ask_ratification { 0x80 } else { 0x00 },
			0x00,
			Some(terminal_mac),
			Some(0x00),
		),
		"Close Secure Session",
	);

	PreparedCommand::new(Command::CloseSecureSession { extended }, request, false)
}

/// Builds a session abort: a Close Secure Session with no MAC.
pub(crate) fn build_cancel_secure_session(class: CardClass) -> PreparedCommand {
	let request = ApduRequest::new(
		build_apdu(
			class.into(),
			INS_CLOSE_SECURE_SESSION,
			0x00,
			0x00,
			None,
			Some(0x00),
		),
		"Cancel Secure Session",
	);

	PreparedCommand::new(Command::CancelSecureSession, request, false)
}

/// Builds a Manage Secure Session for mid-session mutual authentication
/// and/or an encryption switch. Extended mode only.
pub(crate) fn build_manage_secure_session(
	class: CardClass,
	terminal_mac: Option<&[u8]>,
	activate_encryption: bool,
	deactivate_encryption: bool,
) -> PreparedCommand {
	let mut p2 = 0x00_u8;
	if terminal_mac.is_some() {
		p2 |= 0x01;
	}
	if activate_encryption {
		p2 |= 0x02;
	}
	if deactivate_encryption {
		p2 |= 0x04;
	}
	let request = ApduRequest::new(
		build_apdu(
			class.into(),
			INS_MANAGE_SECURE_SESSION,
			0x00,
			p2,
			terminal_mac,
			Some(0x00),
		),
		"Manage Secure Session",
	);

	PreparedCommand::new(
		Command::ManageSecureSession {
			authenticate: terminal_mac.is_some(),
			activate_encryption,
			deactivate_encryption,
		},
		request,
		false,
	)
}

/// Builds the ratification no-op: a Read Record shaped frame the card only
/// has to see, not answer successfully.
pub(crate) fn build_ratification(class: CardClass) -> ApduRequest {
	ApduRequest::new(
		build_apdu(class.into(), INS_RATIFICATION, 0x00, 0x00, None, Some(0x00)),
		"Ratification",
	)
	.with_successful_status_words(vec![0x9000, 0x6B00, 0x6A83, 0x6700])
}

/// The decoded data-out of an Open Secure Session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct OpenSessionResponse {
	pub challenge: Vec<u8>,
	pub previous_session_ratified: bool,
	pub kif: u8,
	pub kvc: u8,
	/// Content of the merged read record, empty when none was merged.
	pub record_data: Vec<u8>,
	/// The raw data-out, kept for MAC initialization and pre-open
	/// comparison.
	pub raw: Vec<u8>,
}

/// Decodes an Open Secure Session data-out.
///
/// Layout: `challenge(4|8) ratified(1) KIF(1) KVC(1) length(1) record-data`,
/// the challenge being 8 bytes in extended mode.
pub(crate) fn parse_open_session_response(
	extended: bool,
	response: &ApduResponse,
) -> Result<OpenSessionResponse, Error> {
	let data = response.data();
	let challenge_size = if extended {
		CHALLENGE_SIZE_EXTENDED
	} else {
		CHALLENGE_SIZE_REGULAR
	};
	let header_size = challenge_size + 4;
	if data.len() < header_size {
		return Err(ParseError::ByteCountIncorrect {
			r#type: std::cmp::Ordering::Greater,
			expected: header_size,
			found: data.len(),
		}
		.into());
	}

	let record_length = usize::from(data[header_size - 1]);
	if data.len() != header_size + record_length {
		return Err(ParseError::NonCompliant.into());
	}

	Ok(OpenSessionResponse {
		challenge: data[..challenge_size].to_vec(),
		previous_session_ratified: data[challenge_size] == 0x00,
		kif: data[challenge_size + 1],
		kvc: data[challenge_size + 2],
		record_data: data[header_size..].to_vec(),
		raw: data.to_vec(),
	})
}

/// Decodes a Close Secure Session data-out into `(postponed_data,
/// card_mac)`: the card MAC is the trailing 8 bytes, anything before it is
/// postponed data (extended mode).
pub(crate) fn parse_close_session_response(
	response: &ApduResponse,
) -> Result<(Vec<u8>, Vec<u8>), Error> {
	let data = response.data();
	if data.len() < SESSION_MAC_SIZE {
		return Err(ParseError::ByteCountIncorrect {
			r#type: std::cmp::Ordering::Greater,
			expected: SESSION_MAC_SIZE,
			found: data.len(),
		}
		.into());
	}
	let mac_start = data.len() - SESSION_MAC_SIZE;

	Ok((data[..mac_start].to_vec(), data[mac_start..].to_vec()))
}

/// Decodes the card MAC out of a mutual-authentication Manage Secure Session
/// response.
pub(crate) fn parse_manage_session_response(response: &ApduResponse) -> Result<Vec<u8>, Error> {
	let data = response.data();
	if data.len() != SESSION_MAC_SIZE {
		return Err(ParseError::ByteCountIncorrect {
			r#type: std::cmp::Ordering::Equal,
			expected: SESSION_MAC_SIZE,
			found: data.len(),
		}
		.into());
	}

	Ok(data.to_vec())
}

// Unit Tests
#[cfg(test)]
mod tests {
	// Uses
	use super::{
		build_cancel_secure_session,
		build_close_secure_session,
		build_open_secure_session,
		parse_close_session_response,
		parse_open_session_response,
	};
	use crate::{
		apdu::{ApduResponse, CardClass},
		security::WriteAccessLevel,
	};

	// Tests
	/// Ensures the open frame carries the merged read coordinates and the
	/// key index.
	#[test]
	fn open_session_encoding() {
		let open = build_open_secure_session(
			CardClass::Iso,
			WriteAccessLevel::Debit,
			&[0x11, 0x22, 0x33, 0x44],
			0x07,
			1,
			false,
		);
		assert_eq!(
			&[0x00, 0x8A, 0x0B, 0x39, 0x04, 0x11, 0x22, 0x33, 0x44, 0x00],
			open.request.bytes()
		);
	}

	/// Ensures the open data-out decodes challenge, ratification, key info
	/// and merged record data.
	#[test]
	fn open_session_response_layout() {
		let response = ApduResponse::from_data_and_status_word(
			&[
				0xA0, 0xA1, 0xA2, 0xA3, // challenge
				0x01, // not ratified
				0x30, 0x7E, // KIF / KVC
				0x02, 0xCA, 0xFE, // merged record
			],
			0x9000,
		);
		let parsed =
			parse_open_session_response(false, &response).expect("the data-out is well-formed");

		assert_eq!(vec![0xA0, 0xA1, 0xA2, 0xA3], parsed.challenge);
		assert!(!parsed.previous_session_ratified);
		assert_eq!(0x30, parsed.kif);
		assert_eq!(0x7E, parsed.kvc);
		assert_eq!(vec![0xCA, 0xFE], parsed.record_data);
	}

	/// Ensures the close frame carries the terminal MAC, and its response
	/// splits into postponed data and card MAC.
	#[test]
	fn close_session_round_trip() {
		let close =
			build_close_secure_session(CardClass::Iso, &[0x5A; 8], true, false);
		assert_eq!(0x80, close.request.bytes()[2]);
		assert_eq!(8, close.request.bytes()[4] as usize);

		let (postponed, mac) = parse_close_session_response(
			&ApduResponse::from_data_and_status_word(&[0xD1, 0xD2, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08], 0x9000),
		)
		.expect("the data-out is well-formed");
		assert_eq!(vec![0xD1, 0xD2], postponed);
		assert_eq!(vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08], mac);
	}

	/// Ensures the cancel frame is a close with no MAC.
	#[test]
	fn cancel_session_encoding() {
		let cancel = build_cancel_secure_session(CardClass::Iso);
		assert_eq!(&[0x00, 0x8E, 0x00, 0x00, 0x00], cancel.request.bytes());
	}
}
