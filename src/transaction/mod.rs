//! The transaction manager: the public façade of the engine.
//!
//! `prepare_*` calls validate their arguments synchronously and enqueue typed
//! commands without any I/O; [`TransactionManager::process_commands`] then
//! drains the queue into one or more card requests, decorating everything
//! inside a secure session with MAC updates through the symmetric crypto
//! collaborator, splitting sessions that would overflow the card's
//! modification buffer, and anticipating responses where the dialog allows a
//! single round trip.

// Modules
pub mod session;

// Uses
use std::collections::VecDeque;

use log::{debug, trace};

use crate::{
	apdu::{
		status_word_message,
		ApduRequest,
		ApduResponse,
		CardRequest,
		CardResponse,
		ChannelControl,
		SW_OK,
	},
	card::{CardProfile, ProductType},
	commands::{
		counter,
		misc,
		pin,
		read,
		session as session_commands,
		sv,
		write,
		Command,
		GetDataTag,
		PreparedCommand,
		SearchCommandData,
		SelectFileControl,
		SvAction,
		SvOperation,
	},
	crypto::{SvCommandSecurityData, SymmetricCryptoService},
	error::Error,
	security::{SecuritySetting, WriteAccessLevel},
	signature::{SignatureComputationData, SignatureVerificationData},
	transport::CardTransport,
	util::{byte_slice_to_u32, to_hex_str},
};

use self::session::{SecureSession, SessionState};

// Constants
const RECORD_NUMBER_MAX: u8 = 250;
const RECORD_OFFSET_MAX: u8 = 249;
const BINARY_OFFSET_MAX: u16 = 32767;
const COUNTER_NUMBER_MAX: u8 = 83;
const COUNTER_VALUE_MAX: u32 = 16_777_215;
const SV_RELOAD_AMOUNT_MAX: i32 = 8_388_607;
const SV_DEBIT_AMOUNT_MAX: i32 = 32_767;
const CHANGE_KEY_INDEX_MAX: u8 = 3;

/// One transmitted APDU pair, kept for the transaction audit trail.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuditEntry {
	pub request: String,
	pub response: String,
}

/// The transaction manager. One per card presentation; owns the profile for
/// the duration of the transaction.
pub struct TransactionManager<'a> {
	transport: &'a mut dyn CardTransport,
	card: CardProfile,
	security: SecuritySetting,
	crypto: Option<&'a mut dyn SymmetricCryptoService>,
	queue: Vec<PreparedCommand>,
	session: SecureSession,
	audit: Vec<AuditEntry>,
	last_diversifier: Option<Vec<u8>>,
	queued_sv_operation: Option<(SvOperation, SvAction)>,
	/// Whether the SAM-side session MAC is currently accumulating.
	mac_live: bool,
}

impl<'a> TransactionManager<'a> {
	/// A manager without security: plain reads and writes only.
	pub fn new(transport: &'a mut dyn CardTransport, card: CardProfile) -> Self {
		Self {
			transport,
			card,
			security: SecuritySetting::default(),
			crypto: None,
			queue: Vec::new(),
			session: SecureSession::new(),
			audit: Vec::new(),
			last_diversifier: None,
			queued_sv_operation: None,
			mac_live: false,
		}
	}

	/// A manager able to run secure sessions through the given SAM service.
	pub fn with_security(
		transport: &'a mut dyn CardTransport,
		card: CardProfile,
		security: SecuritySetting,
		crypto: &'a mut dyn SymmetricCryptoService,
	) -> Self {
		let mut manager = Self::new(transport, card);
		manager.security = security;
		manager.crypto = Some(crypto);
		manager
	}

	/// The profile, reflecting everything parsed so far.
	pub fn card(&self) -> &CardProfile {
		&self.card
	}

	pub fn security_setting(&self) -> &SecuritySetting {
		&self.security
	}

	pub fn security_setting_mut(&mut self) -> &mut SecuritySetting {
		&mut self.security
	}

	/// The raw APDU exchanges of this transaction, in order.
	pub fn transaction_audit_data(&self) -> &[AuditEntry] {
		self.audit.as_slice()
	}

	/// Releases the profile at the end of the transaction.
	pub fn into_card(self) -> CardProfile {
		self.card
	}

	// Preparation: file selection and data fetching

	pub fn prepare_select_file(&mut self, lid: u16) -> Result<&mut Self, Error> {
		let prepared = misc::build_select_file_by_lid(self.card.card_class(), lid);
		self.queue.push(prepared);

		Ok(self)
	}

	pub fn prepare_select_file_control(
		&mut self,
		control: SelectFileControl,
	) -> Result<&mut Self, Error> {
		let prepared = misc::build_select_file_by_control(self.card.card_class(), control);
		self.queue.push(prepared);

		Ok(self)
	}

	pub fn prepare_get_data(&mut self, tag: GetDataTag) -> Result<&mut Self, Error> {
		let prepared = misc::build_get_data(self.card.card_class(), tag);
		self.queue.push(prepared);

		Ok(self)
	}

	pub fn prepare_read_record(&mut self, sfi: u8, record_number: u8) -> Result<&mut Self, Error> {
		check_sfi(sfi, false)?;
		check_record_number(record_number)?;
		let prepared = read::build_read_record(self.card.card_class(), sfi, record_number);
		self.queue.push(prepared);

		Ok(self)
	}

	/// Queues reads for records `from..=to`, split so no response outgrows
	/// the card's payload capacity.
	pub fn prepare_read_records(
		&mut self,
		sfi: u8,
		from_record: u8,
		to_record: u8,
		record_size: u8,
	) -> Result<&mut Self, Error> {
		check_sfi(sfi, false)?;
		check_record_number(from_record)?;
		check_record_number(to_record)?;
		if to_record < from_record {
			return Err(Error::invalid_input(format!(
				"record range [{}, {}] is reversed",
				from_record, to_record
			)));
		}
		if record_size == 0 {
			return Err(Error::invalid_input("record size 0 cannot be read"));
		}

		// Whole records per APDU, bounded by the payload capacity
		let per_apdu = (self.card.payload_capacity() / usize::from(record_size)).max(1) as u8;
		let mut first = from_record;
		while first <= to_record {
			let count = per_apdu.min(to_record - first + 1);
			self.queue.push(read::build_read_records(
				self.card.card_class(),
				sfi,
				first,
				count,
				record_size,
			));
			first += count;
		}

		Ok(self)
	}

	/// Queues partial reads: `nb_bytes` at `offset` in each record of
	/// `from..=to`.
	pub fn prepare_read_records_partially(
		&mut self,
		sfi: u8,
		from_record: u8,
		to_record: u8,
		offset: u8,
		nb_bytes: u8,
	) -> Result<&mut Self, Error> {
		if matches!(
			self.card.product_type(),
			ProductType::PrimeRevision1 | ProductType::PrimeRevision2
		) {
			return Err(Error::unsupported(format!(
				"partial record reads are not available on {}",
				self.card.product_type()
			)));
		}
		check_sfi(sfi, false)?;
		check_record_number(from_record)?;
		check_record_number(to_record)?;
		if to_record < from_record {
			return Err(Error::invalid_input(format!(
				"record range [{}, {}] is reversed",
				from_record, to_record
			)));
		}
		if offset > RECORD_OFFSET_MAX {
			return Err(Error::invalid_input(format!(
				"record offset {} is out of range [0, {}]",
				offset, RECORD_OFFSET_MAX
			)));
		}
		if nb_bytes == 0 {
			return Err(Error::invalid_input("a partial read of 0 bytes is meaningless"));
		}

		let per_apdu = (self.card.payload_capacity() / usize::from(nb_bytes)).max(1) as u8;
		let mut first = from_record;
		while first <= to_record {
			let count = per_apdu.min(to_record - first + 1);
			self.queue.push(read::build_read_records_partially(
				self.card.card_class(),
				sfi,
				first,
				count,
				offset,
				nb_bytes,
			));
			first += count;
		}

		Ok(self)
	}

	/// Queues a binary read of `nb_bytes` at `offset`, split into
	/// payload-capacity chunks. With an SFI and an offset above 255 a 1-byte
	/// anchoring read selects the file first, the offset field being 8 bits
	/// once the SFI is set.
	pub fn prepare_read_binary(
		&mut self,
		sfi: u8,
		offset: u16,
		nb_bytes: u16,
	) -> Result<&mut Self, Error> {
		self.check_binary_arguments(sfi, offset, nb_bytes)?;
		if nb_bytes == 0 {
			return Err(Error::invalid_input("a binary read of 0 bytes is meaningless"));
		}

		let mut sfi_to_send = sfi;
		if sfi > 0 && offset > 0xFF {
			self.queue
				.push(read::build_read_binary(self.card.card_class(), sfi, 0, 1));
			sfi_to_send = 0;
		}
		let mut chunk_offset = offset;
		let mut remaining = nb_bytes;
		while remaining > 0 {
			let length = remaining.min(self.card.payload_capacity() as u16) as u8;
			self.queue.push(read::build_read_binary(
				self.card.card_class(),
				sfi_to_send,
				chunk_offset,
				length,
			));
			// Later chunks address the now-current file directly
			sfi_to_send = 0;
			chunk_offset += u16::from(length);
			remaining -= u16::from(length);
		}

		Ok(self)
	}

	/// Queues a read of the counters file's first record, enough to cover
	/// `counter_number`.
	pub fn prepare_read_counter(
		&mut self,
		sfi: u8,
		counter_number: u8,
	) -> Result<&mut Self, Error> {
		check_counter_number(counter_number)?;
		self.prepare_read_record(sfi, 1)
	}

	/// Queues a read covering the first `count` counters of the file.
	pub fn prepare_read_counters(&mut self, sfi: u8, count: u8) -> Result<&mut Self, Error> {
		check_counter_number(count)?;
		self.prepare_read_record(sfi, 1)
	}

	pub fn prepare_search_records(
		&mut self,
		data: &SearchCommandData,
	) -> Result<&mut Self, Error> {
		check_sfi(data.sfi(), false)?;
		check_record_number(data.record_number())?;
		data.validate(self.card.payload_capacity())?;
		let prepared = read::build_search_records(self.card.card_class(), data);
		self.queue.push(prepared);

		Ok(self)
	}

	// Preparation: modifications

	pub fn prepare_append_record(&mut self, sfi: u8, data: Vec<u8>) -> Result<&mut Self, Error> {
		check_sfi(sfi, false)?;
		check_record_data(data.as_slice(), self.card.payload_capacity())?;
		let prepared = write::build_append_record(self.card.card_class(), sfi, data);
		self.queue.push(prepared);

		Ok(self)
	}

	pub fn prepare_update_record(
		&mut self,
		sfi: u8,
		record_number: u8,
		data: Vec<u8>,
	) -> Result<&mut Self, Error> {
		check_sfi(sfi, false)?;
		check_record_number(record_number)?;
		check_record_data(data.as_slice(), self.card.payload_capacity())?;
		let prepared = write::build_update_record(self.card.card_class(), sfi, record_number, data);
		self.queue.push(prepared);

		Ok(self)
	}

	pub fn prepare_write_record(
		&mut self,
		sfi: u8,
		record_number: u8,
		data: Vec<u8>,
	) -> Result<&mut Self, Error> {
		check_sfi(sfi, false)?;
		check_record_number(record_number)?;
		check_record_data(data.as_slice(), self.card.payload_capacity())?;
		let prepared = write::build_write_record(self.card.card_class(), sfi, record_number, data);
		self.queue.push(prepared);

		Ok(self)
	}

	/// Queues a binary update, chunked like a binary read, with the same
	/// anchoring rule for large offsets.
	pub fn prepare_update_binary(
		&mut self,
		sfi: u8,
		offset: u16,
		data: Vec<u8>,
	) -> Result<&mut Self, Error> {
		self.prepare_binary_modification(sfi, offset, data, false)
	}

	pub fn prepare_write_binary(
		&mut self,
		sfi: u8,
		offset: u16,
		data: Vec<u8>,
	) -> Result<&mut Self, Error> {
		self.prepare_binary_modification(sfi, offset, data, true)
	}

	fn prepare_binary_modification(
		&mut self,
		sfi: u8,
		offset: u16,
		data: Vec<u8>,
		write: bool,
	) -> Result<&mut Self, Error> {
		self.check_binary_arguments(sfi, offset, data.len() as u16)?;
		if data.is_empty() {
			return Err(Error::invalid_input("a binary modification needs data"));
		}

		let mut sfi_to_send = sfi;
		if sfi > 0 && offset > 0xFF {
			// Anchor the SFI with a 1-byte read before addressing past 255
			self.queue
				.push(read::build_read_binary(self.card.card_class(), sfi, 0, 1));
			sfi_to_send = 0;
		}
		let mut chunk_offset = offset;
		for chunk in data.chunks(self.card.payload_capacity()) {
			let prepared = if write {
				write::build_write_binary(
					self.card.card_class(),
					sfi_to_send,
					chunk_offset,
					chunk.to_vec(),
				)
			} else {
				write::build_update_binary(
					self.card.card_class(),
					sfi_to_send,
					chunk_offset,
					chunk.to_vec(),
				)
			};
			self.queue.push(prepared);
			sfi_to_send = 0;
			chunk_offset += chunk.len() as u16;
		}

		Ok(self)
	}

	pub fn prepare_increase_counter(
		&mut self,
		sfi: u8,
		counter_number: u8,
		amount: u32,
	) -> Result<&mut Self, Error> {
		check_sfi(sfi, false)?;
		check_counter_number(counter_number)?;
		check_counter_amount(amount)?;
		let prepared =
			counter::build_increase_counter(self.card.card_class(), sfi, counter_number, amount);
		self.queue.push(prepared);

		Ok(self)
	}

	pub fn prepare_decrease_counter(
		&mut self,
		sfi: u8,
		counter_number: u8,
		amount: u32,
	) -> Result<&mut Self, Error> {
		check_sfi(sfi, false)?;
		check_counter_number(counter_number)?;
		check_counter_amount(amount)?;
		let prepared =
			counter::build_decrease_counter(self.card.card_class(), sfi, counter_number, amount);
		self.queue.push(prepared);

		Ok(self)
	}

	pub fn prepare_increase_counters(
		&mut self,
		sfi: u8,
		counters: &[(u8, u32)],
	) -> Result<&mut Self, Error> {
		self.prepare_counters_operation(sfi, counters, true)
	}

	/// On products below Prime Revision 3 the multiple form expands into one
	/// single-counter command per entry.
	pub fn prepare_decrease_counters(
		&mut self,
		sfi: u8,
		counters: &[(u8, u32)],
	) -> Result<&mut Self, Error> {
		self.prepare_counters_operation(sfi, counters, false)
	}

	fn prepare_counters_operation(
		&mut self,
		sfi: u8,
		counters: &[(u8, u32)],
		increase: bool,
	) -> Result<&mut Self, Error> {
		check_sfi(sfi, false)?;
		if counters.is_empty() {
			return Err(Error::invalid_input("no counters to operate on"));
		}
		for (counter_number, amount) in counters {
			check_counter_number(*counter_number)?;
			check_counter_amount(*amount)?;
		}

		if self.card.product_type() != ProductType::PrimeRevision3 {
			// The multiple form does not exist before revision 3
			for (counter_number, amount) in counters {
				let prepared = if increase {
					counter::build_increase_counter(
						self.card.card_class(),
						sfi,
						*counter_number,
						*amount,
					)
				} else {
					counter::build_decrease_counter(
						self.card.card_class(),
						sfi,
						*counter_number,
						*amount,
					)
				};
				self.queue.push(prepared);
			}
			return Ok(self);
		}

		// Response payload bounds the group size: 3 bytes per new value
		let per_apdu = (self.card.payload_capacity() / 3).max(1);
		for group in counters.chunks(per_apdu) {
			let prepared = if increase {
				counter::build_increase_counters(self.card.card_class(), sfi, group.to_vec())
			} else {
				counter::build_decrease_counters(self.card.card_class(), sfi, group.to_vec())
			};
			self.queue.push(prepared);
		}

		Ok(self)
	}

	/// Queues whatever increase or decrease brings the counter from its
	/// last read value to `target`.
	pub fn prepare_set_counter(
		&mut self,
		sfi: u8,
		counter_number: u8,
		target: u32,
	) -> Result<&mut Self, Error> {
		check_sfi(sfi, false)?;
		check_counter_number(counter_number)?;
		check_counter_amount(target)?;
		let current = self.card.counter(sfi, counter_number)?;

		if target >= current {
			self.prepare_increase_counter(sfi, counter_number, target - current)
		} else {
			self.prepare_decrease_counter(sfi, counter_number, current - target)
		}
	}

	// Preparation: PIN and keys

	pub fn prepare_check_pin_status(&mut self) -> Result<&mut Self, Error> {
		self.check_pin_feature()?;
		let prepared = pin::build_verify_pin(self.card.card_class(), None, false);
		self.queue.push(prepared);

		Ok(self)
	}

	/// Queues a PIN presentation, in plain text when the security setting
	/// allows it, SAM-ciphered otherwise (which also queues the Get
	/// Challenge the ciphering needs).
	pub fn prepare_verify_pin(&mut self, pin: &[u8]) -> Result<&mut Self, Error> {
		self.check_pin_feature()?;
		let pin = check_pin(pin)?;

		if self.security.is_plain_pin_transmission_enabled() {
			let prepared = pin::build_verify_pin(self.card.card_class(), Some(pin), false);
			self.queue.push(prepared);
			return Ok(self);
		}

		if self.security.pin_verification_ciphering_key().is_none() {
			return Err(Error::invalid_state(
				"ciphered PIN verification needs a ciphering key in the security setting",
			));
		}
		self.queue.push(misc::build_get_challenge(self.card.card_class()));
		let prepared = pin::build_verify_pin(self.card.card_class(), Some(pin), true);
		self.queue.push(prepared);

		Ok(self)
	}

	pub fn prepare_change_pin(&mut self, new_pin: &[u8]) -> Result<&mut Self, Error> {
		self.check_pin_feature()?;
		let new_pin = check_pin(new_pin)?;
		if self.session.is_session_engaged() {
			return Err(Error::invalid_state(
				"the PIN cannot be changed inside a secure session",
			));
		}

		if self.security.is_plain_pin_transmission_enabled() {
			let prepared = pin::build_change_pin(self.card.card_class(), new_pin, false);
			self.queue.push(prepared);
			return Ok(self);
		}

		if self.security.pin_modification_ciphering_key().is_none() {
			return Err(Error::invalid_state(
				"ciphered PIN modification needs a ciphering key in the security setting",
			));
		}
		self.queue.push(misc::build_get_challenge(self.card.card_class()));
		let prepared = pin::build_change_pin(self.card.card_class(), new_pin, true);
		self.queue.push(prepared);

		Ok(self)
	}

	pub fn prepare_change_key(
		&mut self,
		key_index: u8,
		new_kif: u8,
		new_kvc: u8,
		issuer_kif: u8,
		issuer_kvc: u8,
	) -> Result<&mut Self, Error> {
		if self.crypto.is_none() {
			return Err(Error::invalid_state("changing a key needs a SAM service"));
		}
		if key_index == 0 || key_index > CHANGE_KEY_INDEX_MAX {
			return Err(Error::invalid_input(format!(
				"key index {} is out of range [1, {}]",
				key_index, CHANGE_KEY_INDEX_MAX
			)));
		}
		if self.session.is_session_engaged() {
			return Err(Error::invalid_state(
				"keys cannot be changed inside a secure session",
			));
		}

		self.queue.push(misc::build_get_challenge(self.card.card_class()));
		let prepared = pin::build_change_key(
			self.card.card_class(),
			key_index,
			new_kif,
			new_kvc,
			issuer_kif,
			issuer_kvc,
		);
		self.queue.push(prepared);

		Ok(self)
	}

	// Preparation: stored value

	pub fn prepare_sv_get(
		&mut self,
		operation: SvOperation,
		action: SvAction,
	) -> Result<&mut Self, Error> {
		self.check_sv_feature()?;
		let extended = self.card.is_extended_mode_supported();
		let prepared = sv::build_sv_get(self.card.card_class(), operation, extended);
		self.queue.push(prepared);
		self.queued_sv_operation = Some((operation, action));

		Ok(self)
	}

	pub fn prepare_sv_reload(
		&mut self,
		amount: i32,
		date: [u8; 2],
		time: [u8; 2],
		free: [u8; 2],
	) -> Result<&mut Self, Error> {
		self.check_sv_feature()?;
		if self.crypto.is_none() {
			return Err(Error::invalid_state("SV operations need a SAM service"));
		}
		if !(-SV_RELOAD_AMOUNT_MAX..=SV_RELOAD_AMOUNT_MAX).contains(&amount) {
			return Err(Error::invalid_input(format!(
				"SV reload amount {} is out of range [-{}, {}]",
				amount, SV_RELOAD_AMOUNT_MAX, SV_RELOAD_AMOUNT_MAX
			)));
		}
		let action = match self.queued_sv_operation {
			Some((SvOperation::Reload, action)) => action,
			_ => {
				return Err(Error::invalid_state(
					"an SV Get for the reload operation must precede an SV Reload",
				))
			}
		};
		let signed_amount = match action {
			SvAction::Do => amount,
			SvAction::Undo => -amount,
		};

		self.queue.push(sv::build_sv_reload(signed_amount, date, time, free));

		Ok(self)
	}

	pub fn prepare_sv_debit(
		&mut self,
		amount: i32,
		date: [u8; 2],
		time: [u8; 2],
	) -> Result<&mut Self, Error> {
		self.check_sv_feature()?;
		if self.crypto.is_none() {
			return Err(Error::invalid_state("SV operations need a SAM service"));
		}
		if !(0..=SV_DEBIT_AMOUNT_MAX).contains(&amount) {
			return Err(Error::invalid_input(format!(
				"SV debit amount {} is out of range [0, {}]",
				amount, SV_DEBIT_AMOUNT_MAX
			)));
		}
		let action = match self.queued_sv_operation {
			Some((SvOperation::Debit, action)) => action,
			_ => {
				return Err(Error::invalid_state(
					"an SV Get for the debit operation must precede an SV Debit",
				))
			}
		};

		self.queue.push(sv::build_sv_debit(action, amount, date, time));

		Ok(self)
	}

	/// Queues the SV Gets that fetch both logs: one extended Get when the
	/// card supports it, the reload/debit pair otherwise.
	pub fn prepare_sv_read_all_logs(&mut self) -> Result<&mut Self, Error> {
		self.check_sv_feature()?;
		if self.card.is_extended_mode_supported() {
			self.queue
				.push(sv::build_sv_get(self.card.card_class(), SvOperation::Debit, true));
		} else {
			self.queue
				.push(sv::build_sv_get(self.card.card_class(), SvOperation::Reload, false));
			self.queue
				.push(sv::build_sv_get(self.card.card_class(), SvOperation::Debit, false));
		}

		Ok(self)
	}

	// Preparation: DF life cycle

	pub fn prepare_invalidate(&mut self) -> Result<&mut Self, Error> {
		if self.card.is_df_invalidated() {
			return Err(Error::invalid_state("the DF is already invalidated"));
		}
		self.queue.push(misc::build_invalidate(self.card.card_class()));

		Ok(self)
	}

	pub fn prepare_rehabilitate(&mut self) -> Result<&mut Self, Error> {
		if !self.card.is_df_invalidated() {
			return Err(Error::invalid_state("the DF is not invalidated"));
		}
		self.queue.push(misc::build_rehabilitate(self.card.card_class()));

		Ok(self)
	}

	// Preparation: secure session

	pub fn prepare_open_secure_session(
		&mut self,
		write_access_level: WriteAccessLevel,
	) -> Result<&mut Self, Error> {
		if self.crypto.is_none() {
			return Err(Error::invalid_state(
				"opening a secure session needs a SAM service",
			));
		}
		let extended = self.card.is_extended_mode_supported();
		self.session.queue_open(write_access_level, extended)?;
		self.queue.push(PreparedCommand::new(
			Command::OpenSecureSession {
				write_access_level,
				read_sfi: 0,
				read_record: 0,
				extended,
			},
			// Placeholder frame; the real one needs the SAM challenge
			ApduRequest::new(Vec::new(), "Open Secure Session"),
			false,
		));

		Ok(self)
	}

	pub fn prepare_close_secure_session(&mut self) -> Result<&mut Self, Error> {
		self.session.queue_close()?;
		self.queue.push(PreparedCommand::new(
			Command::CloseSecureSession {
				extended: self.session.is_extended(),
			},
			ApduRequest::new(Vec::new(), "Close Secure Session"),
			false,
		));

		Ok(self)
	}

	/// Queues a session abort. Legal outside a session too: the abort APDU
	/// is then sent best-effort and its status ignored.
	pub fn prepare_cancel_secure_session(&mut self) -> Result<&mut Self, Error> {
		self.session.queue_cancel();
		self.queue
			.push(session_commands::build_cancel_secure_session(self.card.card_class()));

		Ok(self)
	}

	/// Queues a mid-session mutual authentication checkpoint (extended mode
	/// only).
	pub fn prepare_early_mutual_authentication(&mut self) -> Result<&mut Self, Error> {
		self.check_manage_session_allowed()?;
		self.queue.push(session_commands::build_manage_secure_session(
			self.card.card_class(),
			// Placeholder MAC; generated at drain time
			None,
			false,
			false,
		));
		// Rewrite the command so the drain knows authentication is wanted
		if let Some(last) = self.queue.last_mut() {
			last.command = Command::ManageSecureSession {
				authenticate: true,
				activate_encryption: false,
				deactivate_encryption: false,
			};
		}

		Ok(self)
	}

	pub fn prepare_activate_encryption(&mut self) -> Result<&mut Self, Error> {
		self.check_manage_session_allowed()?;
		self.queue.push(session_commands::build_manage_secure_session(
			self.card.card_class(),
			None,
			true,
			false,
		));

		Ok(self)
	}

	pub fn prepare_deactivate_encryption(&mut self) -> Result<&mut Self, Error> {
		self.check_manage_session_allowed()?;
		self.queue.push(session_commands::build_manage_secure_session(
			self.card.card_class(),
			None,
			false,
			true,
		));

		Ok(self)
	}

	/// Pre-fetches the SAM challenge so the next transaction's session open
	/// costs one less SAM exchange.
	pub fn init_crypto_context_for_next_transaction(&mut self) -> Result<&mut Self, Error> {
		let crypto = require_crypto(&mut self.crypto)?;
		crypto.pre_init_terminal_secure_session_context()?;

		Ok(self)
	}

	// Out-of-session SAM signatures

	/// Computes a standalone signature through the SAM, immediately.
	pub fn compute_signature(
		&mut self,
		data: &mut SignatureComputationData,
	) -> Result<&mut Self, Error> {
		data.validate()?;
		let diversifier = data.key_diversifier().map(<[u8]>::to_vec);
		if let Some(diversifier) = diversifier {
			self.select_diversifier_if_needed(diversifier.as_slice())?;
		}
		let crypto = require_crypto(&mut self.crypto)?;
		crypto.compute_signature(data)?;

		Ok(self)
	}

	/// Verifies a standalone signature through the SAM, immediately. A
	/// revoked SAM fails before the SAM is even consulted; a wrong signature
	/// maps to [`Error::InvalidSignature`].
	pub fn verify_signature(
		&mut self,
		data: &mut SignatureVerificationData,
	) -> Result<&mut Self, Error> {
		data.validate()?;
		if data.check_sam_revocation() {
			if let (Some(service), Some((sam_id, t_num))) = (
				self.security.sam_revocation_service(),
				data.extract_traceability_tuple(),
			) {
				if service.is_sam_revoked(sam_id, t_num) {
					return Err(Error::SamRevoked { sam_id, t_num });
				}
			}
		}
		let diversifier = data.key_diversifier().map(<[u8]>::to_vec);
		if let Some(diversifier) = diversifier {
			self.select_diversifier_if_needed(diversifier.as_slice())?;
		}
		let crypto = require_crypto(&mut self.crypto)?;
		let verified = crypto.verify_signature(data)?;
		data.fill_result(verified);
		if !verified {
			return Err(Error::InvalidSignature);
		}

		Ok(self)
	}

	// Execution

	/// Drains the queue: every prepared command is played against the card,
	/// in order, with the session machinery in between. On error the queue
	/// is cleared, the session is left aborted and the error propagates.
	pub fn process_commands(
		&mut self,
		channel_control: ChannelControl,
	) -> Result<&mut Self, Error> {
		let result = self.drain(channel_control);
		self.queue.clear();
		self.queued_sv_operation = None;
		match result {
			Ok(()) => {
				if let Some(crypto) = self.crypto.as_mut() {
					crypto.synchronize()?;
				}
				Ok(self)
			}
			Err(error) => {
				self.mac_live = false;
				self.session.on_aborted();
				Err(error)
			}
		}
	}

	fn drain(&mut self, channel_control: ChannelControl) -> Result<(), Error> {
		let mut pending: VecDeque<PreparedCommand> = std::mem::take(&mut self.queue).into();
		let mut batch: Vec<PreparedCommand> = Vec::new();

		while let Some(prepared) = pending.pop_front() {
			match prepared.command {
				Command::OpenSecureSession {
					write_access_level,
					extended,
					..
				} => {
					self.flush(&mut batch)?;
					self.run_open(write_access_level, extended, &mut pending)?;
				}
				Command::CloseSecureSession { extended } => {
					self.run_close(&mut batch, extended)?;
				}
				Command::CancelSecureSession => {
					self.flush(&mut batch)?;
					self.run_cancel(&prepared)?;
				}
				Command::ManageSecureSession {
					authenticate,
					activate_encryption,
					deactivate_encryption,
				} => {
					self.flush(&mut batch)?;
					self.run_manage_session(
						authenticate,
						activate_encryption,
						deactivate_encryption,
					)?;
				}
				Command::SvReload { .. } | Command::SvDebit { .. } | Command::SvUndebit { .. } => {
					self.flush(&mut batch)?;
					self.run_sv_operation(prepared)?;
				}
				Command::VerifyPin {
					ciphered: true,
					pin: Some(_),
					..
				}
				| Command::ChangePin { ciphered: true, .. }
				| Command::ChangeKey { .. } => {
					self.flush(&mut batch)?;
					self.run_ciphered_pin_or_key(prepared)?;
				}
				_ => {
					self.account_session_buffer(&prepared, &mut batch)?;
					let encrypting = self.session.is_encryption_active();
					batch.push(prepared);
					if encrypting {
						// Ciphered dialog is strictly one command at a time
						self.flush(&mut batch)?;
					}
				}
			}
		}
		self.flush(&mut batch)?;

		if channel_control == ChannelControl::CloseAfter {
			self.transport.transmit_card_request(
				&CardRequest {
					apdu_requests: Vec::new(),
					stop_on_unsuccessful_status_word: false,
				},
				ChannelControl::CloseAfter,
			)?;
		}

		Ok(())
	}

	/// Accounts a command against the session buffer, splitting into a new
	/// atomic session when it would overflow and the policy allows it.
	fn account_session_buffer(
		&mut self,
		prepared: &PreparedCommand,
		batch: &mut Vec<PreparedCommand>,
	) -> Result<(), Error> {
		if self.session.state() != SessionState::Open
			&& self.session.state() != SessionState::Closing
		{
			return Ok(());
		}
		if !prepared.uses_session_buffer {
			return Ok(());
		}
		let budget = self.card.modifications_buffer_size();
		let cost = if self.card.is_modifications_counter_in_bytes() {
			prepared.session_buffer_cost()
		} else {
			1
		};
		if self.session.try_consume_buffer(cost, budget) {
			return Ok(());
		}

		if !self.security.is_multiple_session_enabled() {
			return Err(Error::SessionBufferOverflow {
				required: cost,
				available: budget,
			});
		}

		// Atomic split: play out what is pending, close here, reopen at the
		// same level, keep going
		debug!("session buffer exhausted, splitting into a new atomic session");
		let write_access_level = self.session.write_access_level().ok_or_else(|| {
			Error::invalid_state("the session has no write access level to split with")
		})?;
		let extended = self.session.is_extended();
		let was_closing = self.session.state() == SessionState::Closing;
		self.flush(batch)?;
		self.close_session_now(false)?;
		self.session.queue_open(write_access_level, extended)?;
		self.open_session_now(write_access_level, extended, None)?;
		if was_closing {
			self.session.queue_close()?;
		}
		if !self.session.try_consume_buffer(cost, budget) {
			return Err(Error::SessionBufferOverflow {
				required: cost,
				available: budget,
			});
		}

		Ok(())
	}

	fn run_open(
		&mut self,
		write_access_level: WriteAccessLevel,
		extended: bool,
		pending: &mut VecDeque<PreparedCommand>,
	) -> Result<(), Error> {
		// Pre-open anticipation, when the selection recorded a matching
		// context
		if let Some(context) = self.card.pre_open_context().cloned() {
			if context.write_access_level == write_access_level {
				return self.run_pre_opened(write_access_level, extended, context.data_out, pending);
			}
		}

		// Read-on-open: promote the first queued single-record read into the
		// open frame
		let mut merged_read: Option<(u8, u8)> = None;
		if !self.security.is_read_on_session_opening_disabled() {
			if let Some(next) = pending.front() {
				if let Command::ReadRecords {
					sfi,
					first,
					count: 1,
					..
				} = next.command
				{
					merged_read = Some((sfi, first));
					pending.pop_front();
				}
			}
		}

		self.open_session_now(write_access_level, extended, merged_read)
	}

	/// The regular open: SAM challenge, transmit, authorize, MAC init.
	fn open_session_now(
		&mut self,
		write_access_level: WriteAccessLevel,
		extended: bool,
		merged_read: Option<(u8, u8)>,
	) -> Result<(), Error> {
		let crypto = require_crypto(&mut self.crypto)?;
		let sam_challenge = crypto.init_terminal_secure_session_context()?;
		let (read_sfi, read_record) = merged_read.unwrap_or((0, 0));
		let open = session_commands::build_open_secure_session(
			self.card.card_class(),
			write_access_level,
			sam_challenge.as_slice(),
			read_sfi,
			read_record,
			extended,
		);

		let response = self.transmit_single(&open.request)?;
		if response.status_word() != SW_OK {
			return Err(Error::UnexpectedCommandStatus {
				command: open.request.info(),
				status_word: response.status_word(),
			});
		}
		let parsed = session_commands::parse_open_session_response(extended, &response)?;
		if !self.security.is_session_key_authorized(parsed.kif, parsed.kvc) {
			return Err(Error::UnauthorizedKey {
				kif: parsed.kif,
				kvc: parsed.kvc,
			});
		}

		let crypto = require_crypto(&mut self.crypto)?;
		crypto.init_terminal_session_mac(parsed.raw.as_slice(), parsed.kif, parsed.kvc)?;
		self.mac_live = true;
		// The open data-out doubles as a card challenge for in-session
		// ciphered PIN operations
		self.card.set_card_challenge(parsed.challenge.clone());
		if let Some((sfi, record)) = merged_read {
			self.card
				.files_mut()
				.update_record(sfi, record, parsed.record_data.as_slice());
		}
		self.card.set_df_ratified(parsed.previous_session_ratified);
		self.session.on_opened();
		debug!(
			"secure session open at {} level (KIF 0x{:02X}, KVC 0x{:02X})",
			write_access_level, parsed.kif, parsed.kvc
		);

		Ok(())
	}

	/// The pre-opened path: the MAC is initialized from the recorded
	/// data-out before any transmission, and when the whole session is
	/// predictable it collapses into a single round trip.
	fn run_pre_opened(
		&mut self,
		write_access_level: WriteAccessLevel,
		extended: bool,
		predicted_data_out: Vec<u8>,
		pending: &mut VecDeque<PreparedCommand>,
	) -> Result<(), Error> {
		self.card.clear_pre_open_context();

		let predicted_response =
			ApduResponse::from_data_and_status_word(predicted_data_out.as_slice(), SW_OK);
		let parsed = session_commands::parse_open_session_response(extended, &predicted_response)?;
		if !self.security.is_session_key_authorized(parsed.kif, parsed.kvc) {
			return Err(Error::UnauthorizedKey {
				kif: parsed.kif,
				kvc: parsed.kvc,
			});
		}

		let crypto = require_crypto(&mut self.crypto)?;
		let sam_challenge = crypto.init_terminal_secure_session_context()?;
		crypto.init_terminal_session_mac(predicted_data_out.as_slice(), parsed.kif, parsed.kvc)?;
		self.mac_live = true;
		self.card.set_card_challenge(parsed.challenge.clone());
		let open = session_commands::build_open_secure_session(
			self.card.card_class(),
			write_access_level,
			sam_challenge.as_slice(),
			0,
			0,
			extended,
		);

		// Single-shot: when every command up to the close is predictable,
		// the whole session fits one card request
		let mut anticipated: Vec<(PreparedCommand, ApduResponse)> = Vec::new();
		let mut close_found = false;
		for entry in pending.iter() {
			match &entry.command {
				Command::CloseSecureSession { .. } => {
					close_found = true;
					break;
				}
				Command::ReadRecords {
					sfi,
					first,
					count: 1,
					..
				} => {
					let cached = self
						.card
						.file_by_sfi(*sfi)
						.and_then(|file| file.record(*first))
						.map(<[u8]>::to_vec);
					match cached {
						Some(content) => anticipated.push((
							entry.clone(),
							ApduResponse::from_data_and_status_word(content.as_slice(), SW_OK),
						)),
						None => break,
					}
				}
				_ => match entry.command.anticipated_response(&self.card)? {
					Some(response) => anticipated.push((entry.clone(), response)),
					None => break,
				},
			}
		}

		if !close_found {
			// Partially predictable: still save the SAM exchange, then fall
			// back to the sequential flow
			anticipated.clear();
			let response = self.transmit_single(&open.request)?;
			if response.status_word() != SW_OK {
				return Err(Error::UnexpectedCommandStatus {
					command: open.request.info(),
					status_word: response.status_word(),
				});
			}
			if response.data() != predicted_data_out.as_slice() {
				return Err(Error::UnexpectedCommandStatus {
					command: "Open Secure Session (anticipated)",
					status_word: response.status_word(),
				});
			}
			self.card.set_df_ratified(parsed.previous_session_ratified);
			self.session.on_opened();
			debug!("pre-opened session confirmed at {} level", write_access_level);
			return Ok(());
		}

		// Digest the predicted dialog and finalize the MAC up front
		let crypto = require_crypto(&mut self.crypto)?;
		for (entry, response) in &anticipated {
			crypto.update_terminal_session_mac(entry.request.bytes())?;
			crypto.update_terminal_session_mac(response.data())?;
		}
		let terminal_mac = crypto.finalize_terminal_session_mac()?;
		let close = session_commands::build_close_secure_session(
			self.card.card_class(),
			terminal_mac.as_slice(),
			self.transport.is_contactless(),
			extended,
		);

		let mut requests = Vec::with_capacity(anticipated.len() + 2);
		requests.push(open.request.clone());
		for (entry, _) in &anticipated {
			requests.push(entry.request.clone());
		}
		requests.push(close.request.clone());
		let responses = self.transmit(requests.as_slice())?;
		if responses.len() != anticipated.len() + 2 {
			return Err(Error::Transport {
				reason: "the reader truncated the session exchange".to_owned(),
			});
		}

		// The card must have answered exactly as predicted
		if responses[0].status_word() != SW_OK {
			return Err(Error::UnexpectedCommandStatus {
				command: open.request.info(),
				status_word: responses[0].status_word(),
			});
		}
		if responses[0].data() != predicted_data_out.as_slice() {
			return Err(Error::UnexpectedCommandStatus {
				command: "Open Secure Session (anticipated)",
				status_word: responses[0].status_word(),
			});
		}
		self.card.set_df_ratified(parsed.previous_session_ratified);
		self.session.on_opened();
		for (index, (entry, predicted)) in anticipated.iter().enumerate() {
			let actual = &responses[index + 1];
			if !entry
				.request
				.successful_status_words()
				.contains(&actual.status_word())
			{
				return Err(Error::UnexpectedCommandStatus {
					command: entry.request.info(),
					status_word: actual.status_word(),
				});
			}
			if actual.bytes() != predicted.bytes() {
				return Err(Error::UnexpectedCommandStatus {
					command: entry.request.info(),
					status_word: actual.status_word(),
				});
			}
			entry.command.parse(actual, &mut self.card)?;
		}

		let close_response = &responses[anticipated.len() + 1];
		if close_response.status_word() != SW_OK {
			return Err(Error::UnexpectedCommandStatus {
				command: close.request.info(),
				status_word: close_response.status_word(),
			});
		}
		let (_postponed, card_mac) =
			session_commands::parse_close_session_response(close_response)?;
		let crypto = require_crypto(&mut self.crypto)?;
		if !crypto.is_card_session_mac_valid(card_mac.as_slice())? {
			return Err(Error::InvalidCardMac);
		}
		self.mac_live = false;
		self.session.on_closed();
		debug!("pre-opened session ran in a single round trip");

		// The session commands and the close are consumed
		for _ in 0..=anticipated.len() {
			pending.pop_front();
		}

		Ok(())
	}

	fn run_close(&mut self, batch: &mut Vec<PreparedCommand>, extended: bool) -> Result<(), Error> {
		if !self.mac_live {
			return Err(Error::invalid_state("no secure session is open to close"));
		}

		// Merged close: when every pending command's response is
		// predictable, the modifications and the close share one request
		let mut anticipated: Vec<ApduResponse> = Vec::with_capacity(batch.len());
		let mut all_predictable = !self.session.is_encryption_active();
		if all_predictable {
			for entry in batch.iter() {
				match entry.command.anticipated_response(&self.card)? {
					Some(response) => anticipated.push(response),
					None => {
						all_predictable = false;
						break;
					}
				}
			}
		}

		if all_predictable && !batch.is_empty() {
			let crypto = require_crypto(&mut self.crypto)?;
			for (entry, response) in batch.iter().zip(anticipated.iter()) {
				crypto.update_terminal_session_mac(entry.request.bytes())?;
				crypto.update_terminal_session_mac(response.data())?;
			}
			let terminal_mac = crypto.finalize_terminal_session_mac()?;
			let close = session_commands::build_close_secure_session(
				self.card.card_class(),
				terminal_mac.as_slice(),
				self.transport.is_contactless(),
				extended,
			);

			let mut requests: Vec<ApduRequest> =
				batch.iter().map(|entry| entry.request.clone()).collect();
			requests.push(close.request.clone());
			let responses = self.transmit(requests.as_slice())?;
			if responses.len() != batch.len() + 1 {
				return Err(Error::Transport {
					reason: "the reader truncated the closing exchange".to_owned(),
				});
			}
			for ((entry, predicted), actual) in
				batch.iter().zip(anticipated.iter()).zip(responses.iter())
			{
				if !entry
					.request
					.successful_status_words()
					.contains(&actual.status_word())
				{
					return Err(Error::UnexpectedCommandStatus {
						command: entry.request.info(),
						status_word: actual.status_word(),
					});
				}
				if actual.bytes() != predicted.bytes() {
					return Err(Error::UnexpectedCommandStatus {
						command: entry.request.info(),
						status_word: actual.status_word(),
					});
				}
				entry.command.parse(actual, &mut self.card)?;
			}
			batch.clear();
			let close_response = &responses[responses.len() - 1];
			return self.finish_close(&close, close_response);
		}

		// Sequential close: flush whatever is pending, then close alone
		self.flush(batch)?;
		let crypto = require_crypto(&mut self.crypto)?;
		let terminal_mac = crypto.finalize_terminal_session_mac()?;
		let close = session_commands::build_close_secure_session(
			self.card.card_class(),
			terminal_mac.as_slice(),
			self.transport.is_contactless(),
			extended,
		);
		let close_response = self.transmit_single(&close.request)?;
		self.finish_close(&close, &close_response)
	}

	fn finish_close(
		&mut self,
		close: &PreparedCommand,
		response: &ApduResponse,
	) -> Result<(), Error> {
		if response.status_word() != SW_OK {
			return Err(Error::UnexpectedCommandStatus {
				command: close.request.info(),
				status_word: response.status_word(),
			});
		}
		let (_postponed, card_mac) = session_commands::parse_close_session_response(response)?;
		let crypto = require_crypto(&mut self.crypto)?;
		if !crypto.is_card_session_mac_valid(card_mac.as_slice())? {
			return Err(Error::InvalidCardMac);
		}
		self.mac_live = false;
		self.session.on_closed();
		debug!("secure session closed, card MAC verified");

		// Contactless readers that cannot ratify on deselect get an explicit
		// ratification frame, status ignored
		if self.transport.is_contactless() && !self.card.is_ratification_on_deselect_available() {
			let ratification = session_commands::build_ratification(self.card.card_class());
			let _ = self.transmit_single(&ratification)?;
		}

		Ok(())
	}

	fn run_cancel(&mut self, prepared: &PreparedCommand) -> Result<(), Error> {
		// Best effort: the status word is deliberately ignored
		let _ = self.transmit_single(&prepared.request)?;
		self.mac_live = false;
		self.session.on_cancelled();
		debug!("secure session cancelled");

		Ok(())
	}

	fn run_manage_session(
		&mut self,
		authenticate: bool,
		activate_encryption: bool,
		deactivate_encryption: bool,
	) -> Result<(), Error> {
		if !self.mac_live {
			return Err(Error::invalid_state(
				"the session management commands need an open session",
			));
		}

		let terminal_mac = if authenticate {
			let crypto = require_crypto(&mut self.crypto)?;
			Some(crypto.generate_terminal_session_mac()?)
		} else {
			None
		};
		let manage = session_commands::build_manage_secure_session(
			self.card.card_class(),
			terminal_mac.as_deref(),
			activate_encryption,
			deactivate_encryption,
		);

		let response = self.transmit_single(&manage.request)?;
		if response.status_word() != SW_OK {
			return Err(Error::UnexpectedCommandStatus {
				command: manage.request.info(),
				status_word: response.status_word(),
			});
		}
		if authenticate {
			let card_mac = session_commands::parse_manage_session_response(&response)?;
			let crypto = require_crypto(&mut self.crypto)?;
			if !crypto.is_card_session_mac_valid(card_mac.as_slice())? {
				return Err(Error::InvalidCardMac);
			}
			debug!("mid-session mutual authentication succeeded");
		}
		if activate_encryption {
			let crypto = require_crypto(&mut self.crypto)?;
			crypto.activate_encryption()?;
			self.session.set_encryption_active(true);
		}
		if deactivate_encryption {
			let crypto = require_crypto(&mut self.crypto)?;
			crypto.deactivate_encryption()?;
			self.session.set_encryption_active(false);
		}

		Ok(())
	}

	fn run_sv_operation(&mut self, mut prepared: PreparedCommand) -> Result<(), Error> {
		if !self.card.sv_data().sv_get_executed {
			return Err(Error::invalid_state(
				"no SV Get has been executed in this transaction",
			));
		}
		self.account_session_buffer(&prepared, &mut Vec::new())?;

		let serial = self.card.application_serial_number().to_vec();
		self.select_diversifier_if_needed(serial.as_slice())?;

		let current_kvc = self.card.sv_data().current_kvc;
		let mut security_data = SvCommandSecurityData {
			sv_get_request: self.card.sv_data().sv_get_request.clone(),
			sv_get_response: self.card.sv_data().sv_get_response.clone(),
			sv_command_partial_request: sv::partial_sv_request(&prepared.command, current_kvc)?,
			..SvCommandSecurityData::default()
		};
		let crypto = require_crypto(&mut self.crypto)?;
		crypto.compute_sv_command_security_data(&mut security_data)?;
		sv::complete_sv_request(
			&prepared.command,
			&mut prepared.request,
			current_kvc,
			&security_data,
		)?;
		self.card.sv_data_mut().last_sam_id =
			byte_slice_to_u32(security_data.serial_number.as_slice());
		self.card.sv_data_mut().last_sam_t_num =
			byte_slice_to_u32(security_data.transaction_number.as_slice());

		let response = self.transmit_single(&prepared.request)?;
		if self.mac_live {
			let encrypting = self.session.is_encryption_active();
			let crypto = require_crypto(&mut self.crypto)?;
			crypto.update_terminal_session_mac(prepared.request.bytes())?;
			crypto.update_terminal_session_mac(if encrypting {
				response.bytes()
			} else {
				response.data()
			})?;
		}
		if response.status_word() != SW_OK {
			return Err(Error::UnexpectedCommandStatus {
				command: prepared.request.info(),
				status_word: response.status_word(),
			});
		}
		prepared.command.parse(&response, &mut self.card)?;

		// Out of session, the card proves itself with an SV MAC
		if !self.mac_live && !response.data().is_empty() {
			let crypto = require_crypto(&mut self.crypto)?;
			if !crypto.is_card_sv_mac_valid(response.data())? {
				return Err(Error::InvalidCardMac);
			}
		}

		Ok(())
	}

	fn run_ciphered_pin_or_key(&mut self, mut prepared: PreparedCommand) -> Result<(), Error> {
		let challenge = self
			.card
			.card_challenge()
			.map(<[u8]>::to_vec)
			.ok_or_else(|| {
				Error::invalid_state("no card challenge is available for PIN/key ciphering")
			})?;
		let serial = self.card.application_serial_number().to_vec();
		self.select_diversifier_if_needed(serial.as_slice())?;
		let class = self.card.card_class();

		match prepared.command {
			Command::VerifyPin {
				pin: Some(pin),
				ciphered: true,
				..
			} => {
				let (kif, kvc) = self
					.security
					.pin_verification_ciphering_key()
					.ok_or_else(|| {
						Error::invalid_state("no PIN verification ciphering key is configured")
					})?;
				let crypto = require_crypto(&mut self.crypto)?;
				let block = crypto.cipher_pin_for_presentation(
					challenge.as_slice(),
					pin.as_slice(),
					kif,
					kvc,
				)?;
				pin::finalize_verify_pin(class, &mut prepared.request, block.as_slice());
			}
			Command::ChangePin {
				new_pin,
				ciphered: true,
			} => {
				let (kif, kvc) = self
					.security
					.pin_modification_ciphering_key()
					.ok_or_else(|| {
						Error::invalid_state("no PIN modification ciphering key is configured")
					})?;
				let crypto = require_crypto(&mut self.crypto)?;
				let block = crypto.cipher_pin_for_modification(
					challenge.as_slice(),
					&[0x00; pin::PIN_SIZE],
					new_pin.as_slice(),
					kif,
					kvc,
				)?;
				pin::finalize_change_pin(class, &mut prepared.request, block.as_slice());
			}
			Command::ChangeKey {
				key_index,
				new_kif,
				new_kvc,
				issuer_kif,
				issuer_kvc,
			} => {
				let crypto = require_crypto(&mut self.crypto)?;
				let block = crypto.generate_ciphered_card_key(
					challenge.as_slice(),
					issuer_kif,
					issuer_kvc,
					new_kif,
					new_kvc,
				)?;
				pin::finalize_change_key(class, &mut prepared.request, key_index, block.as_slice());
			}
			_ => {
				return Err(Error::invalid_state(
					"only ciphered PIN/key commands take this path",
				))
			}
		}

		let response = self.transmit_single(&prepared.request)?;
		if !prepared
			.request
			.successful_status_words()
			.contains(&response.status_word())
		{
			return Err(Error::UnexpectedCommandStatus {
				command: prepared.request.info(),
				status_word: response.status_word(),
			});
		}
		prepared.command.parse(&response, &mut self.card)
	}

	/// Transmits and parses the pending batch. Inside a session every pair
	/// feeds the running MAC; with encryption on, commands travel one at a
	/// time through the SAM transform.
	fn flush(&mut self, batch: &mut Vec<PreparedCommand>) -> Result<(), Error> {
		if batch.is_empty() {
			return Ok(());
		}

		let encrypting = self.mac_live && self.session.is_encryption_active();
		let mut requests: Vec<ApduRequest> =
			batch.iter().map(|entry| entry.request.clone()).collect();
		if encrypting {
			// The digest update doubles as the cipher: send its output
			let crypto = require_crypto(&mut self.crypto)?;
			for request in &mut requests {
				let ciphered = crypto.update_terminal_session_mac(request.bytes())?;
				request.replace_bytes(ciphered);
			}
		}

		let responses = self.transmit(requests.as_slice())?;
		let mut decoded: Vec<ApduResponse> = Vec::with_capacity(responses.len());
		for response in responses {
			if encrypting {
				let crypto = require_crypto(&mut self.crypto)?;
				decoded.push(ApduResponse::new(
					crypto.update_terminal_session_mac(response.bytes())?,
				));
			} else {
				decoded.push(response);
			}
		}

		for (index, entry) in batch.iter().enumerate() {
			let response = decoded.get(index).ok_or(Error::UnexpectedCommandStatus {
				command: entry.request.info(),
				status_word: decoded
					.last()
					.map_or(0x0000, ApduResponse::status_word),
			})?;

			if self.mac_live && !encrypting {
				let crypto = require_crypto(&mut self.crypto)?;
				crypto.update_terminal_session_mac(entry.request.bytes())?;
				crypto.update_terminal_session_mac(response.data())?;
			}

			if !entry
				.request
				.successful_status_words()
				.contains(&response.status_word())
			{
				debug!(
					"{} refused with 0x{:04X} ({})",
					entry.request.info(),
					response.status_word(),
					status_word_message(response.status_word())
				);
				return Err(Error::UnexpectedCommandStatus {
					command: entry.request.info(),
					status_word: response.status_word(),
				});
			}
			if let Command::SvGet { .. } = entry.command {
				self.card.sv_data_mut().sv_get_request = entry.request.bytes().to_vec();
			}
			entry.command.parse(response, &mut self.card)?;
		}
		batch.clear();

		Ok(())
	}

	fn transmit(&mut self, requests: &[ApduRequest]) -> Result<Vec<ApduResponse>, Error> {
		let card_request = CardRequest {
			apdu_requests: requests.to_vec(),
			stop_on_unsuccessful_status_word: true,
		};
		for request in requests {
			trace!("transmitting APDU: {}", to_hex_str(request.bytes()));
		}
		let card_response: CardResponse = self
			.transport
			.transmit_card_request(&card_request, ChannelControl::KeepOpen)?;
		for (request, response) in requests.iter().zip(card_response.apdu_responses.iter()) {
			trace!("received APDU response: {}", to_hex_str(response.bytes()));
			self.audit.push(AuditEntry {
				request: to_hex_str(request.bytes()),
				response: to_hex_str(response.bytes()),
			});
		}

		Ok(card_response.apdu_responses)
	}

	fn transmit_single(&mut self, request: &ApduRequest) -> Result<ApduResponse, Error> {
		let responses = self.transmit(std::slice::from_ref(request))?;
		responses.into_iter().next().ok_or_else(|| Error::Transport {
			reason: "the reader returned no response".to_owned(),
		})
	}

	/// Finalizes the current session's MAC and closes it, mid-drain. Used by
	/// the atomic split.
	fn close_session_now(&mut self, ask_ratification: bool) -> Result<(), Error> {
		let crypto = require_crypto(&mut self.crypto)?;
		let terminal_mac = crypto.finalize_terminal_session_mac()?;
		let close = session_commands::build_close_secure_session(
			self.card.card_class(),
			terminal_mac.as_slice(),
			ask_ratification,
			self.session.is_extended(),
		);
		let response = self.transmit_single(&close.request)?;
		self.finish_close(&close, &response)
	}

	fn select_diversifier_if_needed(&mut self, diversifier: &[u8]) -> Result<(), Error> {
		if self.last_diversifier.as_deref() == Some(diversifier) {
			return Ok(());
		}
		let crypto = require_crypto(&mut self.crypto)?;
		crypto.select_diversifier(diversifier)?;
		self.last_diversifier = Some(diversifier.to_vec());

		Ok(())
	}

	// Argument checks needing the profile

	fn check_binary_arguments(&self, sfi: u8, offset: u16, _nb_bytes: u16) -> Result<(), Error> {
		if matches!(
			self.card.product_type(),
			ProductType::PrimeRevision1 | ProductType::PrimeRevision2
		) {
			return Err(Error::unsupported(format!(
				"binary operations are not available on {}",
				self.card.product_type()
			)));
		}
		check_sfi(sfi, true)?;
		if offset > BINARY_OFFSET_MAX {
			return Err(Error::invalid_input(format!(
				"binary offset {} is out of range [0, {}]",
				offset, BINARY_OFFSET_MAX
			)));
		}

		Ok(())
	}

	fn check_pin_feature(&self) -> Result<(), Error> {
		if !self.card.is_pin_feature_available() {
			return Err(Error::unsupported("this card has no PIN feature"));
		}

		Ok(())
	}

	fn check_sv_feature(&self) -> Result<(), Error> {
		if !self.card.is_sv_feature_available() {
			return Err(Error::unsupported("this card has no stored value application"));
		}

		Ok(())
	}

	fn check_manage_session_allowed(&self) -> Result<(), Error> {
		if !self.session.is_session_engaged() {
			return Err(Error::invalid_state(
				"the session management commands need an open session",
			));
		}
		if !self.card.is_extended_mode_supported() {
			return Err(Error::unsupported(
				"session management commands need extended mode",
			));
		}

		Ok(())
	}
}

fn require_crypto<'s, 'a>(
	crypto: &'s mut Option<&'a mut dyn SymmetricCryptoService>,
) -> Result<&'s mut dyn SymmetricCryptoService, Error>
where
	'a: 's,
{
	match crypto {
		Some(service) => Ok(&mut **service),
		None => Err(Error::invalid_state(
			"no symmetric crypto service is configured",
		)),
	}
}

// Free argument checks

fn check_sfi(sfi: u8, allow_current: bool) -> Result<(), Error> {
	let minimum = u8::from(!allow_current);
	if sfi < minimum || sfi > 0x1E {
		return Err(Error::invalid_input(format!(
			"SFI 0x{:02X} is out of range [0x{:02X}, 0x1E]",
			sfi, minimum
		)));
	}

	Ok(())
}

fn check_record_number(record_number: u8) -> Result<(), Error> {
	if record_number == 0 || record_number > RECORD_NUMBER_MAX {
		return Err(Error::invalid_input(format!(
			"record number {} is out of range [1, {}]",
			record_number, RECORD_NUMBER_MAX
		)));
	}

	Ok(())
}

fn check_counter_number(counter_number: u8) -> Result<(), Error> {
	if counter_number > COUNTER_NUMBER_MAX {
		return Err(Error::invalid_input(format!(
			"counter number {} is out of range [0, {}]",
			counter_number, COUNTER_NUMBER_MAX
		)));
	}

	Ok(())
}

fn check_counter_amount(amount: u32) -> Result<(), Error> {
	if amount > COUNTER_VALUE_MAX {
		return Err(Error::invalid_input(format!(
			"counter amount {} is out of range [0, {}]",
			amount, COUNTER_VALUE_MAX
		)));
	}

	Ok(())
}

fn check_record_data(data: &[u8], payload_capacity: usize) -> Result<(), Error> {
	if data.is_empty() || data.len() > payload_capacity {
		return Err(Error::invalid_input(format!(
			"record data length {} is out of range [1, {}]",
			data.len(),
			payload_capacity
		)));
	}

	Ok(())
}

fn check_pin(pin: &[u8]) -> Result<[u8; pin::PIN_SIZE], Error> {
	pin.try_into().map_err(|_| {
		Error::invalid_input(format!(
			"PIN length {} does not match the required {}",
			pin.len(),
			pin::PIN_SIZE
		))
	})
}
