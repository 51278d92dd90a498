//! Builders and parsers for the counter command family: Increase, Decrease
//! and their multiple-counter forms.

// Uses
use super::{Command, PreparedCommand};
use crate::{
	apdu::{build_apdu, ApduRequest, ApduResponse, CardClass, SW_OK},
	card::{file::COUNTER_SIZE, CardProfile},
	error::{Error, ParseError},
	util::u32_to_byte_vec,
};

// Constants
const INS_INCREASE: u8 = 0x32;
const INS_DECREASE: u8 = 0x30;
const INS_INCREASE_MULTIPLE: u8 = 0x3A;
const INS_DECREASE_MULTIPLE: u8 = 0x38;
/// The card clamps counters to 3 bytes.
pub(crate) const COUNTER_MAX_VALUE: u32 = 0x00FF_FFFF;

fn build_single(
	class: CardClass,
	ins: u8,
	info: &'static str,
	sfi: u8,
	counter: u8,
	amount: u32,
) -> ApduRequest {
	ApduRequest::new(
		build_apdu(
			class.into(),
			ins,
			counter,
			(sfi << 3) | 0x04,
			Some(u32_to_byte_vec(amount, COUNTER_SIZE).as_slice()),
			Some(COUNTER_SIZE as u8),
		),
		info,
	)
}

pub(crate) fn build_increase_counter(
	class: CardClass,
	sfi: u8,
	counter: u8,
	amount: u32,
) -> PreparedCommand {
	PreparedCommand::new(
		Command::IncreaseCounter {
			sfi,
			counter,
			amount,
		},
		build_single(class, INS_INCREASE, "Increase", sfi, counter, amount),
		true,
	)
}

pub(crate) fn build_decrease_counter(
	class: CardClass,
	sfi: u8,
	counter: u8,
	amount: u32,
) -> PreparedCommand {
	PreparedCommand::new(
		Command::DecreaseCounter {
			sfi,
			counter,
			amount,
		},
		build_single(class, INS_DECREASE, "Decrease", sfi, counter, amount),
		true,
	)
}

fn build_multiple(
	class: CardClass,
	ins: u8,
	info: &'static str,
	sfi: u8,
	counters: &[(u8, u32)],
) -> ApduRequest {
	// One `counter-number(1) amount(3)` block per counter
	let mut data = Vec::with_capacity(counters.len() * (1 + COUNTER_SIZE));
	for (counter, amount) in counters {
		data.push(*counter);
		data.extend_from_slice(u32_to_byte_vec(*amount, COUNTER_SIZE).as_slice());
	}

	ApduRequest::new(
		build_apdu(
			class.into(),
			ins,
			0x00,
			(sfi << 3) | 0x05,
			Some(data.as_slice()),
			Some((counters.len() * COUNTER_SIZE) as u8),
		),
		info,
	)
}

pub(crate) fn build_increase_counters(
	class: CardClass,
	sfi: u8,
	counters: Vec<(u8, u32)>,
) -> PreparedCommand {
	let request = build_multiple(
		class,
		INS_INCREASE_MULTIPLE,
		"Increase Multiple",
		sfi,
		counters.as_slice(),
	);

	PreparedCommand::new(Command::IncreaseCounters { sfi, counters }, request, true)
}

pub(crate) fn build_decrease_counters(
	class: CardClass,
	sfi: u8,
	counters: Vec<(u8, u32)>,
) -> PreparedCommand {
	let request = build_multiple(
		class,
		INS_DECREASE_MULTIPLE,
		"Decrease Multiple",
		sfi,
		counters.as_slice(),
	);

	PreparedCommand::new(Command::DecreaseCounters { sfi, counters }, request, true)
}

/// Decodes a single counter response: the 3-byte new value.
pub(crate) fn parse_counter_operation(
	sfi: u8,
	counter: u8,
	response: &ApduResponse,
	profile: &mut CardProfile,
) -> Result<(), Error> {
	let data = response.data();
	if data.len() != COUNTER_SIZE {
		return Err(ParseError::ByteCountIncorrect {
			r#type: std::cmp::Ordering::Equal,
			expected: COUNTER_SIZE,
			found: data.len(),
		}
		.into());
	}
	let value = (u32::from(data[0]) << 16) | (u32::from(data[1]) << 8) | u32::from(data[2]);
	profile.files_mut().set_counter(sfi, counter, value);

	Ok(())
}

/// Decodes a multiple-counter response: the 3-byte new values, in request
/// order.
pub(crate) fn parse_counters_operation(
	sfi: u8,
	counters: &[(u8, u32)],
	response: &ApduResponse,
	profile: &mut CardProfile,
) -> Result<(), Error> {
	let data = response.data();
	if data.len() != counters.len() * COUNTER_SIZE {
		return Err(ParseError::ByteCountIncorrect {
			r#type: std::cmp::Ordering::Equal,
			expected: counters.len() * COUNTER_SIZE,
			found: data.len(),
		}
		.into());
	}
	for ((counter, _), value_bytes) in counters.iter().zip(data.chunks(COUNTER_SIZE)) {
		let value = (u32::from(value_bytes[0]) << 16)
			| (u32::from(value_bytes[1]) << 8)
			| u32::from(value_bytes[2]);
		profile.files_mut().set_counter(sfi, *counter, value);
	}

	Ok(())
}

/// Predicts a counter operation's response from the cached counter value.
///
/// Fails when the counter was never read: an unknown base value cannot be
/// anticipated.
pub(crate) fn anticipated_counter_response(
	profile: &CardProfile,
	sfi: u8,
	counter: u8,
	delta: i64,
) -> Result<ApduResponse, Error> {
	let current = profile.counter(sfi, counter)?;
	let new_value = (i64::from(current) + delta).clamp(0, i64::from(COUNTER_MAX_VALUE)) as u32;

	Ok(ApduResponse::from_data_and_status_word(
		u32_to_byte_vec(new_value, COUNTER_SIZE).as_slice(),
		SW_OK,
	))
}

pub(crate) fn anticipated_counters_response(
	profile: &CardProfile,
	sfi: u8,
	counters: &[(u8, u32)],
	sign: i64,
) -> Result<ApduResponse, Error> {
	let mut data = Vec::with_capacity(counters.len() * COUNTER_SIZE);
	for (counter, amount) in counters {
		let current = profile.counter(sfi, *counter)?;
		let new_value =
			(i64::from(current) + sign * i64::from(*amount)).clamp(0, i64::from(COUNTER_MAX_VALUE)) as u32;
		data.extend_from_slice(u32_to_byte_vec(new_value, COUNTER_SIZE).as_slice());
	}

	Ok(ApduResponse::from_data_and_status_word(data.as_slice(), SW_OK))
}

// Unit Tests
#[cfg(test)]
mod tests {
	// Uses
	use super::{
		anticipated_counter_response,
		build_decrease_counter,
		build_increase_counter,
		build_increase_counters,
		parse_counter_operation,
	};
	use crate::{
		apdu::{ApduResponse, CardClass},
		card::CardProfile,
		error::Error,
	};

	// Tests
	/// Ensures the single counter frames: P1 = counter, P2 mode 4, 3-byte
	/// amount, Le 3.
	#[test]
	fn single_counter_encodings() {
		let increase = build_increase_counter(CardClass::Iso, 0x19, 2, 100);
		assert_eq!(
			&[0x00, 0x32, 0x02, 0xCC, 0x03, 0x00, 0x00, 0x64, 0x03],
			increase.request.bytes()
		);
		assert!(increase.uses_session_buffer);

		let decrease = build_decrease_counter(CardClass::Iso, 0x19, 1, 1);
		assert_eq!(
			&[0x00, 0x30, 0x01, 0xCC, 0x03, 0x00, 0x00, 0x01, 0x03],
			decrease.request.bytes()
		);
	}

	/// Ensures the multiple form packs `counter(1) amount(3)` blocks.
	#[test]
	fn multiple_counter_encoding() {
		let increase =
			build_increase_counters(CardClass::Iso, 0x19, vec![(1, 0x10), (3, 0x0203)]);
		assert_eq!(
			&[
				0x00, 0x3A, 0x00, 0xCD, 0x08, 0x01, 0x00, 0x00, 0x10, 0x03, 0x00, 0x02, 0x03,
				0x06
			],
			increase.request.bytes()
		);
	}

	/// Ensures the response's new value lands in the counter cache.
	#[test]
	fn counter_response_updates_cache() {
		let mut profile = CardProfile::new();
		parse_counter_operation(
			0x19,
			2,
			&ApduResponse::from_data_and_status_word(&[0x00, 0x01, 0x10], 0x9000),
			&mut profile,
		)
		.expect("the response is well-formed");

		assert_eq!(
			0x0110,
			profile.counter(0x19, 2).expect("the counter is now known")
		);
	}

	/// Ensures anticipation needs a previously read counter and clamps at
	/// zero.
	#[test]
	fn counter_anticipation() {
		let mut profile = CardProfile::new();
		assert!(matches!(
			anticipated_counter_response(&profile, 0x19, 1, 10),
			Err(Error::InvalidState { .. })
		));

		profile.files_mut().set_counter(0x19, 1, 5);
		let response = anticipated_counter_response(&profile, 0x19, 1, -10)
			.expect("the counter has been read");
		assert_eq!(&[0x00, 0x00, 0x00], response.data());

		let response = anticipated_counter_response(&profile, 0x19, 1, 10)
			.expect("the counter has been read");
		assert_eq!(&[0x00, 0x00, 0x0F], response.data());
	}
}
