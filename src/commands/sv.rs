//! Builders, finalizers and parsers for the stored-value command family.
//!
//! SV operations come in pairs: an SV Get fetches the balance, transaction
//! number and logs, and feeds the SAM; the following Reload/Debit/Undebit
//! carries a SAM-computed security block that can only be spliced in at
//! processing time, once the SV Get response is known. The builders here
//! therefore produce *partial* APDUs that [`complete_sv_request`] finishes
//! during the drain.

// Uses
use super::{Command, PreparedCommand};
use crate::{
	apdu::{build_apdu, ApduRequest, ApduResponse, CardClass},
	card::{
		sv::{SvDebitLogRecord, SvLoadLogRecord, SV_DEBIT_LOG_SIZE, SV_LOAD_LOG_SIZE},
		CardProfile,
	},
	crypto::SvCommandSecurityData,
	error::{Error, ParseError},
	util::{byte_slice_to_i32, byte_slice_to_u16, i32_to_byte_vec, u32_to_byte_vec},
};

// Constants
const INS_SV_GET: u8 = 0x7C;
const INS_SV_RELOAD: u8 = 0xB8;
const INS_SV_DEBIT: u8 = 0xBA;
const INS_SV_UNDEBIT: u8 = 0xBC;
/// SV operations use the proprietary stored-value class byte.
const CLA_SV: u8 = 0xFA;
const SV_GET_HEADER_SIZE: usize = 11;
/// Data-out sizes: header + load log, header + debit log, header + both.
const SV_GET_SIZE_RELOAD: usize = SV_GET_HEADER_SIZE + SV_LOAD_LOG_SIZE;
const SV_GET_SIZE_DEBIT: usize = SV_GET_HEADER_SIZE + SV_DEBIT_LOG_SIZE;
const SV_GET_SIZE_EXTENDED: usize = SV_GET_HEADER_SIZE + SV_LOAD_LOG_SIZE + SV_DEBIT_LOG_SIZE;

/// The two SV Get flavours.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SvOperation {
	Reload,
	Debit,
}

/// Whether the paired operation performs or undoes its amount.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SvAction {
	Do,
	Undo,
}

pub(crate) fn build_sv_get(
	class: CardClass,
	operation: SvOperation,
	extended: bool,
) -> PreparedCommand {
	let le = if extended {
		SV_GET_SIZE_EXTENDED
	} else {
		match operation {
			SvOperation::Reload => SV_GET_SIZE_RELOAD,
			SvOperation::Debit => SV_GET_SIZE_DEBIT,
		}
	};
	let p2 = match operation {
		SvOperation::Reload => 0x07,
		SvOperation::Debit => 0x09,
	};
	let request = ApduRequest::new(
		build_apdu(
			class.into(),
			INS_SV_GET,
			u8::from(extended),
			p2,
			None,
			Some(le as u8),
		),
		"SV Get",
	);

	PreparedCommand::new(
		Command::SvGet {
			operation,
			extended,
		},
		request,
		false,
	)
}

/// Builds the partial SV Reload frame:
/// `date(2) free1(1) KVC(1) free2(1) amount(3) time(2)`, the KVC and the SAM
/// security block being spliced in at processing time.
pub(crate) fn build_sv_reload(
	amount: i32,
	date: [u8; 2],
	time: [u8; 2],
	free: [u8; 2],
) -> PreparedCommand {
	let request = ApduRequest::new(
		build_apdu(
			CLA_SV,
			INS_SV_RELOAD,
			0x00,
			0x00,
			Some(reload_data(amount, date, time, free, 0x00).as_slice()),
			None,
		),
		"SV Reload",
	);

	PreparedCommand::new(
		Command::SvReload {
			amount,
			date,
			time,
			free,
		},
		request,
		true,
	)
}

/// Builds the partial SV Debit/Undebit frame: `amount(3) date(2) time(2)`.
pub(crate) fn build_sv_debit(
	action: SvAction,
	amount: i32,
	date: [u8; 2],
	time: [u8; 2],
) -> PreparedCommand {
	let (ins, info, command) = match action {
		SvAction::Do => (INS_SV_DEBIT, "SV Debit", Command::SvDebit { amount, date, time }),
		SvAction::Undo => (
			INS_SV_UNDEBIT,
			"SV Undebit",
			Command::SvUndebit { amount, date, time },
		),
	};
	let request = ApduRequest::new(
		build_apdu(
			CLA_SV,
			ins,
			0x00,
			0x00,
			Some(debit_data(amount, date, time).as_slice()),
			None,
		),
		info,
	);

	PreparedCommand::new(command, request, true)
}

fn reload_data(amount: i32, date: [u8; 2], time: [u8; 2], free: [u8; 2], kvc: u8) -> Vec<u8> {
	let mut data = Vec::with_capacity(10);
	data.extend_from_slice(&date);
	data.push(free[0]);
	data.push(kvc);
	data.push(free[1]);
	data.extend_from_slice(i32_to_byte_vec(amount, 3).as_slice());
	data.extend_from_slice(&time);

	data
}

fn debit_data(amount: i32, date: [u8; 2], time: [u8; 2]) -> Vec<u8> {
	let mut data = Vec::with_capacity(7);
	data.extend_from_slice(i32_to_byte_vec(amount, 3).as_slice());
	data.extend_from_slice(&date);
	data.extend_from_slice(&time);

	data
}

fn sv_instruction_and_data(command: &Command, current_kvc: u8) -> Result<(u8, Vec<u8>), Error> {
	match command {
		Command::SvReload {
			amount,
			date,
			time,
			free,
		} => Ok((
			INS_SV_RELOAD,
			reload_data(*amount, *date, *time, *free, current_kvc),
		)),
		Command::SvDebit { amount, date, time } => {
			Ok((INS_SV_DEBIT, debit_data(*amount, *date, *time)))
		}
		Command::SvUndebit { amount, date, time } => {
			Ok((INS_SV_UNDEBIT, debit_data(*amount, *date, *time)))
		}
		_ => Err(Error::invalid_state(
			"only SV operations carry a SAM security block",
		)),
	}
}

/// The SV operation frame without the SAM block, as handed to the SAM for
/// the security computation.
pub(crate) fn partial_sv_request(command: &Command, current_kvc: u8) -> Result<Vec<u8>, Error> {
	let (ins, data) = sv_instruction_and_data(command, current_kvc)?;

	Ok(build_apdu(CLA_SV, ins, 0x00, 0x00, Some(data.as_slice()), None))
}

/// Completes a partial SV operation frame with the current KVC and the
/// SAM-computed security block (`serial(4) t-num(3) MAC`).
pub(crate) fn complete_sv_request(
	command: &Command,
	request: &mut ApduRequest,
	current_kvc: u8,
	security_data: &SvCommandSecurityData,
) -> Result<(), Error> {
	let (ins, mut data) = sv_instruction_and_data(command, current_kvc)?;
	data.extend_from_slice(security_data.serial_number.as_slice());
	data.extend_from_slice(security_data.transaction_number.as_slice());
	data.extend_from_slice(security_data.terminal_sv_mac.as_slice());
	request.replace_bytes(build_apdu(CLA_SV, ins, 0x00, 0x00, Some(data.as_slice()), None));

	Ok(())
}

/// Decodes an SV Get data-out.
///
/// Header (11 bytes): `KVC(1) SV t-num(2) previous-signature(5) balance(3)`,
/// then the load log, the debit log, or both (extended mode).
pub(crate) fn parse_sv_get(
	operation: SvOperation,
	extended: bool,
	response: &ApduResponse,
	profile: &mut CardProfile,
) -> Result<(), Error> {
	let data = response.data();
	let expected = if extended {
		SV_GET_SIZE_EXTENDED
	} else {
		match operation {
			SvOperation::Reload => SV_GET_SIZE_RELOAD,
			SvOperation::Debit => SV_GET_SIZE_DEBIT,
		}
	};
	if data.len() != expected {
		return Err(ParseError::ByteCountIncorrect {
			r#type: std::cmp::Ordering::Equal,
			expected,
			found: data.len(),
		}
		.into());
	}

	let current_kvc = data[0];
	let last_t_num = byte_slice_to_u16(&data[1..3]);
	let balance = byte_slice_to_i32(&data[8..11]);

	let (load_log, debit_log) = if extended {
		(
			Some(SvLoadLogRecord::try_from(
				&data[SV_GET_HEADER_SIZE..(SV_GET_HEADER_SIZE + SV_LOAD_LOG_SIZE)],
			)?),
			Some(SvDebitLogRecord::try_from(
				&data[(SV_GET_HEADER_SIZE + SV_LOAD_LOG_SIZE)..],
			)?),
		)
	} else {
		match operation {
			SvOperation::Reload => (
				Some(SvLoadLogRecord::try_from(&data[SV_GET_HEADER_SIZE..])?),
				None,
			),
			SvOperation::Debit => (
				None,
				Some(SvDebitLogRecord::try_from(&data[SV_GET_HEADER_SIZE..])?),
			),
		}
	};

	let sv = profile.sv_data_mut();
	sv.current_kvc = current_kvc;
	sv.last_t_num = last_t_num;
	sv.balance = balance;
	if load_log.is_some() {
		sv.load_log = load_log;
	}
	if debit_log.is_some() {
		sv.debit_log = debit_log;
	}
	sv.sv_get_executed = true;
	sv.sv_get_response = response.bytes().to_vec();

	Ok(())
}

/// Folds a successful SV Reload into the profile: the balance grows by the
/// amount, the transaction number increments, and a fresh load log replaces
/// the previous one.
pub(crate) fn parse_sv_reload(
	amount: i32,
	date: [u8; 2],
	time: [u8; 2],
	free: [u8; 2],
	profile: &mut CardProfile,
) -> Result<(), Error> {
	let sv = profile.sv_data_mut();
	sv.balance += amount;
	sv.last_t_num = sv.last_t_num.wrapping_add(1);

	let mut raw = Vec::with_capacity(SV_LOAD_LOG_SIZE);
	raw.extend_from_slice(&date);
	raw.push(free[0]);
	raw.push(sv.current_kvc);
	raw.push(free[1]);
	raw.extend_from_slice(i32_to_byte_vec(sv.balance, 3).as_slice());
	raw.extend_from_slice(i32_to_byte_vec(amount, 3).as_slice());
	raw.extend_from_slice(&time);
	raw.extend_from_slice(u32_to_byte_vec(sv.last_sam_id, 4).as_slice());
	raw.extend_from_slice(u32_to_byte_vec(sv.last_sam_t_num, 3).as_slice());
	raw.extend_from_slice(u32_to_byte_vec(u32::from(sv.last_t_num), 2).as_slice());
	sv.load_log = Some(SvLoadLogRecord::try_from(raw.as_slice())?);

	Ok(())
}

/// Folds a successful SV Debit/Undebit into the profile. `signed_amount` is
/// negative for a debit and positive for an undebit.
pub(crate) fn parse_sv_debit(
	signed_amount: i32,
	date: [u8; 2],
	time: [u8; 2],
	profile: &mut CardProfile,
) -> Result<(), Error> {
	let sv = profile.sv_data_mut();
	sv.balance += signed_amount;
	sv.last_t_num = sv.last_t_num.wrapping_add(1);

	let mut raw = Vec::with_capacity(SV_DEBIT_LOG_SIZE);
	raw.extend_from_slice(i32_to_byte_vec(signed_amount, 2).as_slice());
	raw.extend_from_slice(&date);
	raw.extend_from_slice(&time);
	raw.push(sv.current_kvc);
	raw.extend_from_slice(u32_to_byte_vec(sv.last_sam_id, 4).as_slice());
	raw.extend_from_slice(u32_to_byte_vec(sv.last_sam_t_num, 3).as_slice());
	raw.extend_from_slice(i32_to_byte_vec(sv.balance, 3).as_slice());
	raw.extend_from_slice(u32_to_byte_vec(u32::from(sv.last_t_num), 2).as_slice());
	sv.debit_log = Some(SvDebitLogRecord::try_from(raw.as_slice())?);

	Ok(())
}

// Unit Tests
#[cfg(test)]
mod tests {
	// Uses
	use super::{
		build_sv_debit,
		build_sv_get,
		build_sv_reload,
		complete_sv_request,
		parse_sv_get,
		parse_sv_reload,
		partial_sv_request,
		SvAction,
		SvOperation,
	};
	use crate::{
		apdu::{ApduResponse, CardClass},
		card::CardProfile,
		crypto::SvCommandSecurityData,
	};

	fn sv_get_reload_response(kvc: u8, t_num: u16, balance: u32) -> ApduResponse {
		let mut data = vec![0x00; 11];
		data[0] = kvc;
		data[1] = (t_num >> 8) as u8;
		data[2] = t_num as u8;
		data[8] = (balance >> 16) as u8;
		data[9] = (balance >> 8) as u8;
		data[10] = balance as u8;
		// A plausible load log
		data.extend_from_slice(&[
			0x14, 0x7A, 0x11, kvc, 0x22, 0x00, 0x00, 0x64, 0x00, 0x00, 0x32, 0x04, 0x2C, 0xA1,
			0xB2, 0xC3, 0xD4, 0x00, 0x00, 0x05, 0x00, 0x07,
		]);

		ApduResponse::from_data_and_status_word(data.as_slice(), 0x9000)
	}

	// Tests
	/// Ensures the SV Get frames select the operation through P2 and size Le
	/// accordingly.
	#[test]
	fn sv_get_encoding() {
		let reload = build_sv_get(CardClass::Iso, SvOperation::Reload, false);
		assert_eq!(&[0x00, 0x7C, 0x00, 0x07, 0x21], reload.request.bytes());

		let debit = build_sv_get(CardClass::Iso, SvOperation::Debit, false);
		assert_eq!(&[0x00, 0x7C, 0x00, 0x09, 0x1E], debit.request.bytes());

		let extended = build_sv_get(CardClass::Iso, SvOperation::Debit, true);
		assert_eq!(&[0x00, 0x7C, 0x01, 0x09, 0x34], extended.request.bytes());
	}

	/// Ensures the SV Get header updates balance, transaction number, KVC
	/// and the log.
	#[test]
	fn sv_get_updates_profile() {
		let mut profile = CardProfile::new();
		parse_sv_get(
			SvOperation::Reload,
			false,
			&sv_get_reload_response(0xAA, 7, 0x0100),
			&mut profile,
		)
		.expect("the data-out is well-formed");

		assert_eq!(0x0100, profile.sv_balance().expect("SV Get has run"));
		assert_eq!(7, profile.sv_last_t_num().expect("SV Get has run"));
		assert_eq!(
			0xAA,
			profile.sv_load_log().expect("the load log is present").kvc()
		);
		assert!(profile.sv_debit_log().is_err());
	}

	/// Ensures the reload semantics: `balance += amount`, `t-num += 1`, and
	/// the rebuilt log carries the new state.
	#[test]
	fn sv_reload_updates_balance_and_log() {
		let mut profile = CardProfile::new();
		parse_sv_get(
			SvOperation::Reload,
			false,
			&sv_get_reload_response(0xAA, 7, 0x0100),
			&mut profile,
		)
		.expect("the data-out is well-formed");
		profile.sv_data_mut().last_sam_id = 0xA1B2_C3D4;
		profile.sv_data_mut().last_sam_t_num = 9;

		parse_sv_reload(100, [0x14, 0x7A], [0x04, 0x2C], [0x00, 0x00], &mut profile)
			.expect("the log rebuild is well-formed");

		assert_eq!(0x0100 + 100, profile.sv_balance().expect("SV Get has run"));
		assert_eq!(8, profile.sv_last_t_num().expect("SV Get has run"));
		let log = profile.sv_load_log().expect("the log was rebuilt");
		assert_eq!(100, log.amount());
		assert_eq!(0x0100 + 100, log.balance());
		assert_eq!(0xAA, log.kvc());
		assert_eq!(0xA1B2_C3D4, log.sam_id());
		assert_eq!(9, log.sam_t_num());
		assert_eq!(8, log.sv_t_num());
	}

	/// Ensures the SAM sees the frame without the security block, and the
	/// completed frame splices in KVC, SAM identification and MAC.
	#[test]
	fn sv_security_block_splicing() {
		let mut prepared = build_sv_reload(100, [0x14, 0x7A], [0x04, 0x2C], [0x00, 0x00]);
		let security = SvCommandSecurityData {
			serial_number: vec![0xA1, 0xB2, 0xC3, 0xD4],
			transaction_number: vec![0x00, 0x00, 0x09],
			terminal_sv_mac: vec![0x51, 0x52, 0x53, 0x54, 0x55],
			..SvCommandSecurityData::default()
		};

		let partial = partial_sv_request(&prepared.command, 0xAA)
			.expect("the command is an SV operation");
		complete_sv_request(&prepared.command, &mut prepared.request, 0xAA, &security)
			.expect("the command is an SV operation");

		#[rustfmt::skip]
		let expected_final = [
			0xFA, 0xB8, 0x00, 0x00, 0x16,
			0x14, 0x7A,             // date
			0x00, 0xAA, 0x00,       // free1 KVC free2
			0x00, 0x00, 0x64,       // amount
			0x04, 0x2C,             // time
			0xA1, 0xB2, 0xC3, 0xD4, // SAM id
			0x00, 0x00, 0x09,       // SAM t-num
			0x51, 0x52, 0x53, 0x54, 0x55, // MAC
		];
		assert_eq!(&expected_final, prepared.request.bytes());
		// The partial frame stops before the security block
		assert_eq!(0x0A, partial[4]);
		assert_eq!(&expected_final[5..15], &partial[5..]);
	}

	/// Ensures a debit builds against the undebit instruction when undone.
	#[test]
	fn sv_debit_and_undebit_instructions() {
		let debit = build_sv_debit(SvAction::Do, 100, [0x14, 0x7A], [0x04, 0x2C]);
		assert_eq!(0xBA, debit.request.bytes()[1]);

		let undebit = build_sv_debit(SvAction::Undo, 100, [0x14, 0x7A], [0x04, 0x2C]);
		assert_eq!(0xBC, undebit.request.bytes()[1]);
	}
}
