//! Builders for the modifying command family: Append/Update/Write Record and
//! Update/Write Binary. All of them consume session buffer.

// Uses
use super::{Command, PreparedCommand};
use crate::apdu::{build_apdu, ApduRequest, CardClass};

// Constants
const INS_APPEND_RECORD: u8 = 0xE2;
const INS_UPDATE_RECORD: u8 = 0xDC;
const INS_WRITE_RECORD: u8 = 0xD2;
const INS_UPDATE_BINARY: u8 = 0xD6;
const INS_WRITE_BINARY: u8 = 0xD0;

pub(crate) fn build_append_record(class: CardClass, sfi: u8, data: Vec<u8>) -> PreparedCommand {
	let request = ApduRequest::new(
		build_apdu(
			class.into(),
			INS_APPEND_RECORD,
			0x00,
			sfi << 3,
			Some(data.as_slice()),
			None,
		),
		"Append Record",
	);

	PreparedCommand::new(Command::AppendRecord { sfi, data }, request, true)
}

pub(crate) fn build_update_record(
	class: CardClass,
	sfi: u8,
	record: u8,
	data: Vec<u8>,
) -> PreparedCommand {
	let request = ApduRequest::new(
		build_apdu(
			class.into(),
			INS_UPDATE_RECORD,
			record,
			(sfi << 3) | 0x04,
			Some(data.as_slice()),
			None,
		),
		"Update Record",
	);

	PreparedCommand::new(Command::UpdateRecord { sfi, record, data }, request, true)
}

pub(crate) fn build_write_record(
	class: CardClass,
	sfi: u8,
	record: u8,
	data: Vec<u8>,
) -> PreparedCommand {
	let request = ApduRequest::new(
		build_apdu(
			class.into(),
			INS_WRITE_RECORD,
			record,
			(sfi << 3) | 0x04,
			Some(data.as_slice()),
			None,
		),
		"Write Record",
	);

	PreparedCommand::new(Command::WriteRecord { sfi, record, data }, request, true)
}

/// Builds one binary modification chunk. The same P1/P2 convention as Read
/// Binary applies: the SFI form only addresses the first 256 bytes.
fn build_binary_modification(
	class: CardClass,
	ins: u8,
	info: &'static str,
	sfi: u8,
	offset: u16,
	data: &[u8],
) -> ApduRequest {
	let (p1, p2) = if sfi > 0 {
		(0x80 | sfi, offset as u8)
	} else {
		((offset >> 8) as u8, offset as u8)
	};

	ApduRequest::new(build_apdu(class.into(), ins, p1, p2, Some(data), None), info)
}

pub(crate) fn build_update_binary(
	class: CardClass,
	sfi: u8,
	offset: u16,
	data: Vec<u8>,
) -> PreparedCommand {
	let request = build_binary_modification(
		class,
		INS_UPDATE_BINARY,
		"Update Binary",
		sfi,
		offset,
		data.as_slice(),
	);

	PreparedCommand::new(Command::UpdateBinary { sfi, offset, data }, request, true)
}

pub(crate) fn build_write_binary(
	class: CardClass,
	sfi: u8,
	offset: u16,
	data: Vec<u8>,
) -> PreparedCommand {
	let request = build_binary_modification(
		class,
		INS_WRITE_BINARY,
		"Write Binary",
		sfi,
		offset,
		data.as_slice(),
	);

	PreparedCommand::new(Command::WriteBinary { sfi, offset, data }, request, true)
}

// Unit Tests
#[cfg(test)]
mod tests {
	// Uses
	use super::{build_append_record, build_update_binary, build_update_record, build_write_record};
	use crate::apdu::CardClass;

	// Tests
	/// Ensures the modifying record commands frame with their data field and
	/// are flagged as session buffer consumers.
	#[test]
	fn record_modification_encodings() {
		let append = build_append_record(CardClass::Iso, 0x07, vec![0xAA, 0xBB]);
		assert_eq!(
			&[0x00, 0xE2, 0x00, 0x38, 0x02, 0xAA, 0xBB],
			append.request.bytes()
		);
		assert!(append.uses_session_buffer);

		let update = build_update_record(CardClass::Iso, 0x08, 1, vec![0xCC]);
		assert_eq!(
			&[0x00, 0xDC, 0x01, 0x44, 0x01, 0xCC],
			update.request.bytes()
		);
		assert!(update.uses_session_buffer);

		let write = build_write_record(CardClass::Legacy, 0x08, 1, vec![0x0F]);
		assert_eq!(
			&[0x94, 0xD2, 0x01, 0x44, 0x01, 0x0F],
			write.request.bytes()
		);
	}

	/// Ensures binary updates use the SFI form below offset 256.
	#[test]
	fn binary_modification_encoding() {
		let update = build_update_binary(CardClass::Iso, 0x02, 0x0010, vec![0x11, 0x22]);
		assert_eq!(
			&[0x00, 0xD6, 0x82, 0x10, 0x02, 0x11, 0x22],
			update.request.bytes()
		);

		let plain = build_update_binary(CardClass::Iso, 0x00, 0x0123, vec![0x33]);
		assert_eq!(&[0x00, 0xD6, 0x01, 0x23, 0x01, 0x33], plain.request.bytes());
	}

	/// Ensures the session buffer cost is the 6-byte overhead plus the data
	/// field.
	#[test]
	fn session_buffer_cost() {
		let update = build_update_record(CardClass::Iso, 0x08, 1, vec![0x00; 10]);
		assert_eq!(16, update.session_buffer_cost());
	}
}
