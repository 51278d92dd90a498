//! Builders and parsers for the PIN and key management commands.
//!
//! The ciphered variants are two-step: preparation frames a placeholder APDU
//! (the PIN block only exists once the card challenge is known and the SAM
//! has ciphered it), and the drain completes it through the `finalize_*`
//! functions.

// Uses
use super::{Command, PreparedCommand};
use crate::{
	apdu::{build_apdu, ApduRequest, ApduResponse, CardClass, SW_OK},
	card::CardProfile,
};

// Constants
const INS_VERIFY_PIN: u8 = 0x20;
const INS_CHANGE_PIN_OR_KEY: u8 = 0xD8;
/// P2 for a plain-text PIN change.
const P2_CHANGE_PIN_PLAIN: u8 = 0xFF;
/// P2 for a ciphered PIN change block.
const P2_CHANGE_PIN_CIPHERED: u8 = 0x04;
/// P2 for a ciphered key change block.
const P2_CHANGE_KEY: u8 = 0x90;
pub(crate) const PIN_SIZE: usize = 4;
/// Status words a PIN status check may legitimately return: success, the
/// remaining-attempt counters and the blocked state.
pub(crate) const PIN_STATUS_SUCCESS_WORDS: [u16; 5] = [SW_OK, 0x63C0, 0x63C1, 0x63C2, 0x6983];

/// Builds a Verify PIN.
///
/// With no PIN this is a plain status check. With a PIN and `ciphered` set,
/// the data field stays empty until [`finalize_verify_pin`] splices the SAM
/// block in.
pub(crate) fn build_verify_pin(
	class: CardClass,
	pin: Option<[u8; 4]>,
	ciphered: bool,
) -> PreparedCommand {
	let status_only = pin.is_none();
	let plain_block = if ciphered { None } else { pin };
	let request = ApduRequest::new(
		build_apdu(
			class.into(),
			INS_VERIFY_PIN,
			0x00,
			0x00,
			plain_block.as_ref().map(<[u8; 4]>::as_slice),
			None,
		),
		"Verify PIN",
	)
	.with_successful_status_words(if status_only {
		PIN_STATUS_SUCCESS_WORDS.to_vec()
	} else {
		vec![SW_OK]
	});

	PreparedCommand::new(
		Command::VerifyPin {
			status_only,
			pin,
			ciphered,
		},
		request,
		false,
	)
}

/// Splices the SAM-ciphered presentation block into a Verify PIN frame.
pub(crate) fn finalize_verify_pin(class: CardClass, request: &mut ApduRequest, block: &[u8]) {
	request.replace_bytes(build_apdu(
		class.into(),
		INS_VERIFY_PIN,
		0x00,
		0x00,
		Some(block),
		None,
	));
}

/// Builds a Change PIN. Plain mode frames the new PIN directly; ciphered
/// mode leaves the data field to [`finalize_change_pin`].
pub(crate) fn build_change_pin(class: CardClass, new_pin: [u8; 4], ciphered: bool) -> PreparedCommand {
	let request = if ciphered {
		ApduRequest::new(
			build_apdu(
				class.into(),
				INS_CHANGE_PIN_OR_KEY,
				0x00,
				P2_CHANGE_PIN_CIPHERED,
				None,
				None,
			),
			"Change PIN",
		)
	} else {
		ApduRequest::new(
			build_apdu(
				class.into(),
				INS_CHANGE_PIN_OR_KEY,
				0x00,
				P2_CHANGE_PIN_PLAIN,
				Some(new_pin.as_slice()),
				None,
			),
			"Change PIN",
		)
	};

	PreparedCommand::new(Command::ChangePin { new_pin, ciphered }, request, false)
}

/// Splices the SAM-ciphered modification block into a Change PIN frame.
pub(crate) fn finalize_change_pin(class: CardClass, request: &mut ApduRequest, block: &[u8]) {
	request.replace_bytes(build_apdu(
		class.into(),
		INS_CHANGE_PIN_OR_KEY,
		0x00,
		P2_CHANGE_PIN_CIPHERED,
		Some(block),
		None,
	));
}

/// Builds a Change Key; the ciphered key block is always SAM-computed and
/// spliced in by [`finalize_change_key`].
pub(crate) fn build_change_key(
	class: CardClass,
	key_index: u8,
	new_kif: u8,
	new_kvc: u8,
	issuer_kif: u8,
	issuer_kvc: u8,
) -> PreparedCommand {
	let request = ApduRequest::new(
		build_apdu(
			class.into(),
			INS_CHANGE_PIN_OR_KEY,
			key_index,
			P2_CHANGE_KEY,
			None,
			None,
		),
		"Change Key",
	);

	PreparedCommand::new(
		Command::ChangeKey {
			key_index,
			new_kif,
			new_kvc,
			issuer_kif,
			issuer_kvc,
		},
		request,
		false,
	)
}

pub(crate) fn finalize_change_key(
	class: CardClass,
	request: &mut ApduRequest,
	key_index: u8,
	ciphered_key_block: &[u8],
) {
	request.replace_bytes(build_apdu(
		class.into(),
		INS_CHANGE_PIN_OR_KEY,
		key_index,
		P2_CHANGE_KEY,
		Some(ciphered_key_block),
		None,
	));
}

/// Folds the verify/status response into the remaining-attempt counter:
/// `9000` restores the full 3 attempts, `63CX` reports X, `6983` means
/// blocked.
pub(crate) fn parse_verify_pin(response: &ApduResponse, profile: &mut CardProfile) {
	let attempts = match response.status_word() {
		SW_OK => 3,
		0x63C2 => 2,
		0x63C1 => 1,
		_ => 0,
	};
	profile.set_pin_attempts_remaining(attempts);
}

// Unit Tests
#[cfg(test)]
mod tests {
	// Uses
	use super::{
		build_change_key,
		build_change_pin,
		build_verify_pin,
		finalize_change_key,
		finalize_verify_pin,
		parse_verify_pin,
	};
	use crate::{
		apdu::{ApduResponse, CardClass},
		card::CardProfile,
	};

	// Tests
	/// Ensures the three Verify PIN forms frame correctly.
	#[test]
	fn verify_pin_encodings() {
		let status = build_verify_pin(CardClass::Iso, None, false);
		assert_eq!(&[0x00, 0x20, 0x00, 0x00], status.request.bytes());

		let plain = build_verify_pin(CardClass::Iso, Some([0x31, 0x32, 0x33, 0x34]), false);
		assert_eq!(
			&[0x00, 0x20, 0x00, 0x00, 0x04, 0x31, 0x32, 0x33, 0x34],
			plain.request.bytes()
		);

		// The ciphered form frames empty until the SAM block is known
		let mut ciphered = build_verify_pin(CardClass::Iso, Some([0x31, 0x32, 0x33, 0x34]), true);
		assert_eq!(&[0x00, 0x20, 0x00, 0x00], ciphered.request.bytes());
		finalize_verify_pin(CardClass::Iso, &mut ciphered.request, &[0xAA; 8]);
		assert_eq!(
			&[0x00, 0x20, 0x00, 0x00, 0x08, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA],
			ciphered.request.bytes()
		);
	}

	/// Ensures a status check tolerates the attempt-counter words while an
	/// actual presentation does not.
	#[test]
	fn verify_pin_success_sets() {
		let status = build_verify_pin(CardClass::Iso, None, false);
		assert!(status.request.successful_status_words().contains(&0x63C1));

		let plain = build_verify_pin(CardClass::Iso, Some([0x31, 0x32, 0x33, 0x34]), false);
		assert!(!plain.request.successful_status_words().contains(&0x63C1));
	}

	/// Ensures the attempt counter follows the status word.
	#[test]
	fn attempt_counter_follows_status_word() {
		let mut profile = CardProfile::new();
		for (status_word, attempts) in [(0x9000, 3), (0x63C2, 2), (0x63C1, 1), (0x6983, 0)] {
			parse_verify_pin(
				&ApduResponse::from_data_and_status_word(&[], status_word),
				&mut profile,
			);
			assert_eq!(
				attempts,
				profile
					.pin_attempts_remaining()
					.expect("the status has been checked")
			);
		}
	}

	/// Ensures the change commands use their dedicated P2 values.
	#[test]
	fn change_encodings() {
		let plain = build_change_pin(CardClass::Iso, [0x31, 0x32, 0x33, 0x34], false);
		assert_eq!(
			&[0x00, 0xD8, 0x00, 0xFF, 0x04, 0x31, 0x32, 0x33, 0x34],
			plain.request.bytes()
		);

		let ciphered = build_change_pin(CardClass::Iso, [0x31, 0x32, 0x33, 0x34], true);
		assert_eq!(&[0x00, 0xD8, 0x00, 0x04], ciphered.request.bytes());

		let mut key = build_change_key(CardClass::Iso, 0x01, 0x21, 0x7F, 0x30, 0x79);
		finalize_change_key(CardClass::Iso, &mut key.request, 0x01, &[0xBB; 24]);
		assert_eq!(0x01, key.request.bytes()[2]);
		assert_eq!(0x90, key.request.bytes()[3]);
		assert_eq!(24, key.request.bytes()[4] as usize);
	}
}
