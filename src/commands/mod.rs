//! The command catalogue.
//!
//! Every card instruction the engine can emit is a [`Command`] variant
//! carrying its operands. A variant is turned into a [`PreparedCommand`]
//! (APDU bytes + success status words + session buffer accounting) by the
//! builder of its family module, at preparation time; its response is decoded
//! by [`Command::parse`], which is also where the card profile gets mutated.
//!
//! There is deliberately no trait hierarchy here: one tagged variant plus
//! per-family dispatch keeps every instruction's encode/parse pair in one
//! place.

// Modules
pub(crate) mod counter;
pub(crate) mod misc;
pub(crate) mod pin;
pub(crate) mod read;
pub(crate) mod session;
pub(crate) mod sv;
pub(crate) mod write;

// Uses
use crate::{
	apdu::{ApduRequest, ApduResponse},
	card::CardProfile,
	error::Error,
	security::WriteAccessLevel,
};

// Public Exports
pub use self::{
	misc::{GetDataTag, SelectFileControl},
	read::SearchCommandData,
	sv::{SvAction, SvOperation},
};

/// Cost in session-buffer bytes of one command, on top of its data field.
pub(crate) const SESSION_BUFFER_COMMAND_OVERHEAD: usize = 6;

/// A card instruction with its operands, as queued by the transaction
/// manager.
#[derive(Clone, Debug)]
pub(crate) enum Command {
	SelectFileByLid {
		lid: u16,
	},
	SelectFileByControl {
		control: SelectFileControl,
	},
	ReadRecords {
		sfi: u8,
		first: u8,
		count: u8,
		record_size: u8,
	},
	ReadRecordsPartially {
		sfi: u8,
		first: u8,
		count: u8,
		offset: u8,
		length: u8,
	},
	ReadBinary {
		sfi: u8,
		offset: u16,
		length: u8,
	},
	SearchRecords {
		sfi: u8,
		first: u8,
		fetch_first_match: bool,
	},
	AppendRecord {
		sfi: u8,
		data: Vec<u8>,
	},
	UpdateRecord {
		sfi: u8,
		record: u8,
		data: Vec<u8>,
	},
	WriteRecord {
		sfi: u8,
		record: u8,
		data: Vec<u8>,
	},
	UpdateBinary {
		sfi: u8,
		offset: u16,
		data: Vec<u8>,
	},
	WriteBinary {
		sfi: u8,
		offset: u16,
		data: Vec<u8>,
	},
	IncreaseCounter {
		sfi: u8,
		counter: u8,
		amount: u32,
	},
	DecreaseCounter {
		sfi: u8,
		counter: u8,
		amount: u32,
	},
	IncreaseCounters {
		sfi: u8,
		counters: Vec<(u8, u32)>,
	},
	DecreaseCounters {
		sfi: u8,
		counters: Vec<(u8, u32)>,
	},
	VerifyPin {
		status_only: bool,
		pin: Option<[u8; 4]>,
		ciphered: bool,
	},
	ChangePin {
		new_pin: [u8; 4],
		ciphered: bool,
	},
	ChangeKey {
		key_index: u8,
		new_kif: u8,
		new_kvc: u8,
		issuer_kif: u8,
		issuer_kvc: u8,
	},
	GetChallenge,
	GetData {
		tag: GetDataTag,
	},
	OpenSecureSession {
		write_access_level: WriteAccessLevel,
		read_sfi: u8,
		read_record: u8,
		extended: bool,
	},
	CloseSecureSession {
		extended: bool,
	},
	CancelSecureSession,
	ManageSecureSession {
		authenticate: bool,
		activate_encryption: bool,
		deactivate_encryption: bool,
	},
	SvGet {
		operation: SvOperation,
		extended: bool,
	},
	SvReload {
		amount: i32,
		date: [u8; 2],
		time: [u8; 2],
		free: [u8; 2],
	},
	SvDebit {
		amount: i32,
		date: [u8; 2],
		time: [u8; 2],
	},
	SvUndebit {
		amount: i32,
		date: [u8; 2],
		time: [u8; 2],
	},
	Invalidate,
	Rehabilitate,
}

impl Command {
	/// Decodes a successful response and folds it into the profile.
	///
	/// The status word has already been checked against the request's success
	/// set by the time this runs; session-level commands (open/close/manage)
	/// are decoded by the session engine instead and are no-ops here.
	pub(crate) fn parse(
		&self,
		response: &ApduResponse,
		profile: &mut CardProfile,
	) -> Result<(), Error> {
		match self {
			Self::SelectFileByLid { .. } | Self::SelectFileByControl { .. } => {
				misc::parse_select_file(response, profile)
			}
			Self::ReadRecords {
				sfi,
				first,
				count,
				record_size,
			} => read::parse_read_records(*sfi, *first, *count, *record_size, response, profile),
			Self::ReadRecordsPartially {
				sfi,
				first,
				count,
				offset,
				length,
			} => read::parse_read_records_partially(
				*sfi, *first, *count, *offset, *length, response, profile,
			),
			Self::ReadBinary { sfi, offset, .. } => {
				read::parse_read_binary(*sfi, *offset, response, profile);
				Ok(())
			}
			Self::SearchRecords {
				sfi,
				first,
				fetch_first_match,
			} => read::parse_search_records(*sfi, *first, *fetch_first_match, response, profile),
			Self::AppendRecord { sfi, data } => {
				profile.files_mut().add_cyclic_content(*sfi, data.as_slice());
				Ok(())
			}
			Self::UpdateRecord { sfi, record, data } => {
				profile
					.files_mut()
					.update_record(*sfi, *record, data.as_slice());
				Ok(())
			}
			Self::WriteRecord { sfi, record, data } => {
				profile
					.files_mut()
					.write_record(*sfi, *record, data.as_slice());
				Ok(())
			}
			Self::UpdateBinary { sfi, offset, data } => {
				profile
					.files_mut()
					.fill_record_at(*sfi, 1, usize::from(*offset), data.as_slice());
				Ok(())
			}
			Self::WriteBinary { sfi, offset, data } => {
				profile
					.files_mut()
					.write_record_at(*sfi, 1, usize::from(*offset), data.as_slice());
				Ok(())
			}
			Self::IncreaseCounter { sfi, counter, .. }
			| Self::DecreaseCounter { sfi, counter, .. } => {
				counter::parse_counter_operation(*sfi, *counter, response, profile)
			}
			Self::IncreaseCounters { sfi, counters } | Self::DecreaseCounters { sfi, counters } => {
				counter::parse_counters_operation(*sfi, counters.as_slice(), response, profile)
			}
			Self::VerifyPin { .. } => {
				pin::parse_verify_pin(response, profile);
				Ok(())
			}
			Self::ChangePin { .. } | Self::ChangeKey { .. } => Ok(()),
			Self::GetChallenge => misc::parse_get_challenge(response, profile),
			Self::GetData { tag } => misc::parse_get_data(*tag, response, profile),
			Self::OpenSecureSession { .. }
			| Self::CloseSecureSession { .. }
			| Self::CancelSecureSession
			| Self::ManageSecureSession { .. } => Ok(()),
			Self::SvGet {
				operation,
				extended,
			} => sv::parse_sv_get(*operation, *extended, response, profile),
			Self::SvReload {
				amount,
				date,
				time,
				free,
			} => sv::parse_sv_reload(*amount, *date, *time, *free, profile),
			Self::SvDebit { amount, date, time } => {
				sv::parse_sv_debit(-*amount, *date, *time, profile)
			}
			Self::SvUndebit { amount, date, time } => {
				sv::parse_sv_debit(*amount, *date, *time, profile)
			}
			Self::Invalidate => {
				profile.set_df_invalidated(true);
				Ok(())
			}
			Self::Rehabilitate => {
				profile.set_df_invalidated(false);
				Ok(())
			}
		}
	}

	/// Predicts the card's response to this command, for the digest of a
	/// close-session exchange that carries modifications.
	///
	/// Returns `None` for commands whose response cannot be known in advance;
	/// fails when the prediction needs profile state that was never fetched
	/// (a counter that was never read).
	pub(crate) fn anticipated_response(
		&self,
		profile: &CardProfile,
	) -> Result<Option<ApduResponse>, Error> {
		match self {
			Self::AppendRecord { .. }
			| Self::UpdateRecord { .. }
			| Self::WriteRecord { .. }
			| Self::UpdateBinary { .. }
			| Self::WriteBinary { .. }
			| Self::Invalidate
			| Self::Rehabilitate
			| Self::SvReload { .. }
			| Self::SvDebit { .. }
			| Self::SvUndebit { .. } => Ok(Some(ApduResponse::from_data_and_status_word(
				&[],
				crate::apdu::SW_OK,
			))),
			Self::IncreaseCounter {
				sfi,
				counter,
				amount,
			} => Ok(Some(counter::anticipated_counter_response(
				profile,
				*sfi,
				*counter,
				i64::from(*amount),
			)?)),
			Self::DecreaseCounter {
				sfi,
				counter,
				amount,
			} => Ok(Some(counter::anticipated_counter_response(
				profile,
				*sfi,
				*counter,
				-i64::from(*amount),
			)?)),
			Self::IncreaseCounters { sfi, counters } => Ok(Some(
				counter::anticipated_counters_response(profile, *sfi, counters.as_slice(), 1)?,
			)),
			Self::DecreaseCounters { sfi, counters } => Ok(Some(
				counter::anticipated_counters_response(profile, *sfi, counters.as_slice(), -1)?,
			)),
			_ => Ok(None),
		}
	}
}

/// A queued command, fully framed and ready for the wire.
#[derive(Clone, Debug)]
pub(crate) struct PreparedCommand {
	pub command: Command,
	pub request: ApduRequest,
	pub uses_session_buffer: bool,
}

impl PreparedCommand {
	pub(crate) fn new(command: Command, request: ApduRequest, uses_session_buffer: bool) -> Self {
		Self {
			command,
			request,
			uses_session_buffer,
		}
	}

	/// This command's weight against the card's session modification buffer,
	/// in bytes.
	pub(crate) fn session_buffer_cost(&self) -> usize {
		if !self.uses_session_buffer {
			return 0;
		}
		let bytes = self.request.bytes();
		// Data field length, if the APDU has one
		let data_length = if bytes.len() > 5 {
			usize::from(bytes[4])
		} else {
			0
		};

		SESSION_BUFFER_COMMAND_OVERHEAD + data_length
	}
}
