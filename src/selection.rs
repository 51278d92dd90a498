//! The selection pipeline: from a SELECT APPLICATION response (or raw
//! power-on data) to an initialized [`CardProfile`].

// Uses
use log::debug;
use regex::Regex;

use crate::{
	apdu::{
		build_apdu,
		ApduRequest,
		ApduResponse,
		CardRequest,
		ChannelControl,
		SW_DF_INVALIDATED,
		SW_OK,
	},
	card::{CardProfile, PreOpenContext, ProductType, StartupInfo},
	commands,
	error::Error,
	security::WriteAccessLevel,
	tlv,
	transport::CardTransport,
	util::{parse_hex_str, to_hex_str},
};

// Constants
const INS_SELECT_APPLICATION: u8 = 0xA4;
const AID_MIN_SIZE: usize = 5;
const AID_MAX_SIZE: usize = 16;
const POWER_ON_DATA_SIZE: usize = 20;
/// FCI data object tags: DF name, application serial number, startup info.
const TAG_DF_NAME: &[u8] = &[0x84];
const TAG_SERIAL_NUMBER: &[u8] = &[0xC7];
const TAG_STARTUP_INFO: &[u8] = &[0x53];
/// Valid range of the session modification byte on Prime Revision 3.
const SESSION_MODIFICATION_RANGE: std::ops::RangeInclusive<u8> = 0x06..=0x37;

/// Which matching application a SELECT targets when several share the AID
/// prefix.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileOccurrence {
	First,
	Next,
}

/// The application filter of a selection: AID, power-on data pattern and the
/// status words the SELECT may return.
#[derive(Clone, Debug)]
pub struct CardSelector {
	aid: Option<Vec<u8>>,
	file_occurrence: FileOccurrence,
	power_on_data_regex: Option<Regex>,
	successful_status_words: Vec<u16>,
}

impl Default for CardSelector {
	fn default() -> Self {
		Self {
			aid: None,
			file_occurrence: FileOccurrence::First,
			power_on_data_regex: None,
			successful_status_words: vec![SW_OK],
		}
	}
}

impl CardSelector {
	pub fn new() -> Self {
		Self::default()
	}

	/// Filters by DF name (AID), 5 to 16 bytes.
	pub fn filter_by_df_name(&mut self, aid: Vec<u8>) -> Result<&mut Self, Error> {
		if !(AID_MIN_SIZE..=AID_MAX_SIZE).contains(&aid.len()) {
			return Err(Error::invalid_input(format!(
				"AID length {} is out of range [{}, {}]",
				aid.len(),
				AID_MIN_SIZE,
				AID_MAX_SIZE
			)));
		}
		self.aid = Some(aid);

		Ok(self)
	}

	/// Filters by DF name given as a hex string.
	pub fn filter_by_df_name_hex(&mut self, aid_hex: &str) -> Result<&mut Self, Error> {
		let aid = parse_hex_str(aid_hex)
			.map_err(|_| Error::invalid_input(format!("AID '{}' is not valid hex", aid_hex)))?;
		self.filter_by_df_name(aid)
	}

	/// Filters by a regular expression over the power-on data hex string.
	pub fn filter_by_power_on_data(&mut self, pattern: &str) -> Result<&mut Self, Error> {
		let regex = Regex::new(pattern).map_err(|error| {
			Error::invalid_input(format!(
				"power-on data pattern '{}' does not compile: {}",
				pattern, error
			))
		})?;
		self.power_on_data_regex = Some(regex);

		Ok(self)
	}

	pub fn set_file_occurrence(&mut self, file_occurrence: FileOccurrence) -> &mut Self {
		self.file_occurrence = file_occurrence;
		self
	}

	/// Extends the set of status words accepted from the SELECT APPLICATION.
	pub fn add_successful_status_word(&mut self, status_word: u32) -> Result<&mut Self, Error> {
		if status_word > 0xFFFF {
			return Err(Error::invalid_input(format!(
				"status word 0x{:X} is out of range [0, 0xFFFF]",
				status_word
			)));
		}
		self.successful_status_words.push(status_word as u16);

		Ok(self)
	}

	/// Accepts an invalidated DF at selection by adding `6283` to the
	/// success set.
	pub fn accept_invalidated_card(&mut self) -> &mut Self {
		self.successful_status_words.push(SW_DF_INVALIDATED);
		self
	}

	pub fn aid(&self) -> Option<&[u8]> {
		self.aid.as_deref()
	}

	pub(crate) fn matches_power_on_data(&self, power_on_data: &str) -> bool {
		self.power_on_data_regex
			.as_ref()
			.map_or(true, |regex| regex.is_match(power_on_data))
	}

	/// Builds the SELECT APPLICATION frame, when an AID filter is present.
	pub(crate) fn build_select_application(&self) -> Option<ApduRequest> {
		let aid = self.aid.as_deref()?;
		let p2 = match self.file_occurrence {
			FileOccurrence::First => 0x00,
			FileOccurrence::Next => 0x02,
		};

		Some(
			ApduRequest::new(
				build_apdu(0x00, INS_SELECT_APPLICATION, 0x04, p2, Some(aid), Some(0x00)),
				"Select Application",
			)
			.with_successful_status_words(self.successful_status_words.clone()),
		)
	}
}

/// Initializes a profile from raw power-on data, for revision 1 cards that
/// carry no application FCI.
///
/// The ATR must be exactly 20 bytes with the historical markers in place;
/// bytes 12 to 15 carry the serial number tail.
pub fn initialize_with_power_on_data(power_on_data: &str) -> Result<CardProfile, Error> {
	let bytes = parse_hex_str(power_on_data).map_err(|_| {
		Error::invalid_input(format!("power-on data '{}' is not valid hex", power_on_data))
	})?;
	if bytes.len() != POWER_ON_DATA_SIZE {
		return Err(Error::invalid_input(format!(
			"power-on data length {} does not match the expected {}",
			bytes.len(),
			POWER_ON_DATA_SIZE
		)));
	}
	// Fixed shape markers: initial character, the historical `5A` block and
	// the trailing status bytes
	if bytes[0] != 0x3B || bytes[4] != 0x80 || bytes[5] != 0x5A || bytes[16] != 0x82
		|| bytes[17] != 0x90 || bytes[18] != 0x00
	{
		return Err(Error::invalid_input(
			"power-on data does not match the revision 1 ATR shape",
		));
	}

	let mut serial_tail = [0x00; 4];
	serial_tail.copy_from_slice(&bytes[12..16]);
	// Revision 1 advertises no startup info; synthesize one from the ATR's
	// historical bytes
	let startup_info = StartupInfo::try_from(
		[
			0x00, bytes[6], bytes[7], bytes[8], bytes[9], bytes[10], bytes[11],
		]
		.as_slice(),
	)
	.map_err(Error::from)?;

	let mut profile = CardProfile::new();
	profile.init_from_atr(to_hex_str(bytes.as_slice()), serial_tail, startup_info);
	debug!("selected by power-on data: {}", profile.identification_summary());

	Ok(profile)
}

/// Initializes a profile from the FCI returned by SELECT APPLICATION.
///
/// The recognized data objects (`84` DF name, `C7` serial number, `53`
/// startup info) may sit at any depth and in any order inside the `6F`/`A5`
/// envelope. An empty FCI is not an error: it yields an unknown product.
pub fn initialize_with_fci(response: &ApduResponse) -> Result<CardProfile, Error> {
	let status_word = response.status_word();
	let is_df_invalidated = status_word == SW_DF_INVALIDATED;
	if status_word != SW_OK && !is_df_invalidated {
		return Err(Error::invalid_input(format!(
			"status word 0x{:04X} cannot carry an application FCI",
			status_word
		)));
	}

	let mut profile = CardProfile::new();
	profile.set_df_invalidated(is_df_invalidated);
	if response.data().is_empty() {
		return Ok(profile);
	}

	let nodes = tlv::parse(response.data())?;
	let df_name = tlv::find_first(nodes.as_slice(), TAG_DF_NAME);
	let serial = tlv::find_first(nodes.as_slice(), TAG_SERIAL_NUMBER);
	let startup = tlv::find_first(nodes.as_slice(), TAG_STARTUP_INFO);

	let (df_name, serial, startup) = match (df_name, serial, startup) {
		(Some(df_name), Some(serial), Some(startup)) => (df_name, serial, startup),
		// A card with none of the proprietary objects is simply not a
		// Calypso product
		(None, None, None) => return Ok(profile),
		_ => return Err(crate::error::ParseError::NonCompliant.into()),
	};

	if !(AID_MIN_SIZE..=AID_MAX_SIZE).contains(&df_name.value.len()) {
		return Err(Error::invalid_input(format!(
			"DF name length {} is out of range [{}, {}]",
			df_name.value.len(),
			AID_MIN_SIZE,
			AID_MAX_SIZE
		)));
	}
	let serial_number: [u8; 8] = serial.value.as_slice().try_into().map_err(|_| {
		Error::invalid_input(format!(
			"application serial number length {} does not match the expected 8",
			serial.value.len()
		))
	})?;
	let startup_info = StartupInfo::try_from(startup.value.as_slice()).map_err(|_| {
		Error::invalid_input(format!(
			"startup info length {} is below the minimum 7",
			startup.value.len()
		))
	})?;

	let application_subtype = startup_info.application_subtype();
	if application_subtype == 0x00 || application_subtype == 0xFF {
		return Err(Error::invalid_input(format!(
			"application subtype 0x{:02X} is out of range [0x01, 0xFE]",
			application_subtype
		)));
	}
	let product_type = ProductType::from_application_type(startup_info.application_type())?;
	if product_type == ProductType::PrimeRevision3
		&& !SESSION_MODIFICATION_RANGE.contains(&startup_info.session_modification())
	{
		return Err(Error::invalid_input(format!(
			"session modification byte 0x{:02X} is out of range [0x06, 0x37]",
			startup_info.session_modification()
		)));
	}

	profile.init_from_fci(
		product_type,
		df_name.value.clone(),
		serial_number,
		startup_info,
		is_df_invalidated,
	);
	debug!("selected by FCI: {}", profile.identification_summary());

	Ok(profile)
}

/// A full selection scenario: filter, optional anticipation reads and the
/// pre-open producer half of the pre-open optimization.
#[derive(Clone, Debug, Default)]
pub struct CardSelectionExtension {
	selector: CardSelector,
	pre_open_write_access_level: Option<WriteAccessLevel>,
	prepared_reads: Vec<(u8, u8)>,
}

impl CardSelectionExtension {
	pub fn new(selector: CardSelector) -> Self {
		Self {
			selector,
			pre_open_write_access_level: None,
			prepared_reads: Vec::with_capacity(0),
		}
	}

	/// Requests a pre-open of a secure session at the given write access
	/// level: the Open Secure Session data-out is recorded in the profile so
	/// the transaction manager can anticipate the real open later.
	pub fn prepare_pre_open_secure_session(
		&mut self,
		write_access_level: WriteAccessLevel,
	) -> &mut Self {
		self.pre_open_write_access_level = Some(write_access_level);
		self
	}

	/// Queues a record read to run right after the SELECT, seeding the
	/// profile's content cache (and thereby the read anticipation).
	pub fn prepare_read_record(&mut self, sfi: u8, record_number: u8) -> Result<&mut Self, Error> {
		if sfi > 0x1E {
			return Err(Error::invalid_input(format!(
				"SFI 0x{:02X} is out of range [0x00, 0x1E]",
				sfi
			)));
		}
		if record_number == 0 {
			return Err(Error::invalid_input("record number 0 is out of range [1, 250]"));
		}
		self.prepared_reads.push((sfi, record_number));

		Ok(self)
	}

	/// Runs the selection against the reader and returns the initialized
	/// profile.
	pub fn process(&self, transport: &mut dyn CardTransport) -> Result<CardProfile, Error> {
		let power_on_data = transport.power_on_data();
		if let Some(power_on_data) = power_on_data.as_deref() {
			if !self.selector.matches_power_on_data(power_on_data) {
				return Err(Error::invalid_state(
					"the card's power-on data does not match the selection filter",
				));
			}
		}

		let select_request = match self.selector.build_select_application() {
			Some(request) => request,
			None => {
				// No AID filter: the profile can only come from power-on data
				let power_on_data = power_on_data.ok_or_else(|| {
					Error::invalid_state(
						"selection needs an AID filter or a reader exposing power-on data",
					)
				})?;
				return initialize_with_power_on_data(power_on_data.as_str());
			}
		};

		let card_response = transport.transmit_card_request(
			&CardRequest {
				apdu_requests: vec![select_request.clone()],
				stop_on_unsuccessful_status_word: true,
			},
			ChannelControl::KeepOpen,
		)?;
		let select_response = card_response
			.apdu_responses
			.first()
			.ok_or_else(|| Error::Transport {
				reason: "the reader returned no response to the SELECT".to_owned(),
			})?;
		if !select_request
			.successful_status_words()
			.contains(&select_response.status_word())
		{
			return Err(Error::UnexpectedCommandStatus {
				command: "Select Application",
				status_word: select_response.status_word(),
			});
		}

		let mut profile = initialize_with_fci(select_response)?;

		// Anticipation reads
		for (sfi, record_number) in &self.prepared_reads {
			let prepared =
				commands::read::build_read_record(profile.card_class(), *sfi, *record_number);
			let response = transmit_single(transport, &prepared.request)?;
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
			prepared.command.parse(&response, &mut profile)?;
		}

		// Pre-open: run a throwaway session open to record its data-out. The
		// frame must match the one the transaction manager will send, so the
		// extended variant follows the card's capability.
		if let Some(write_access_level) = self.pre_open_write_access_level {
			let extended = profile.is_extended_mode_supported();
			let challenge = if extended { vec![0x00; 8] } else { vec![0x00; 4] };
			let open = commands::session::build_open_secure_session(
				profile.card_class(),
				write_access_level,
				challenge.as_slice(),
				0,
				0,
				extended,
			);
			let response = transmit_single(transport, &open.request)?;
			if response.status_word() != SW_OK {
				return Err(Error::UnexpectedCommandStatus {
					command: open.request.info(),
					status_word: response.status_word(),
				});
			}
			profile.set_pre_open_context(PreOpenContext {
				write_access_level,
				data_out: response.data().to_vec(),
			});
			// Drop the throwaway session; its status is irrelevant
			let cancel = commands::session::build_cancel_secure_session(profile.card_class());
			let _ = transmit_single(transport, &cancel.request)?;
			debug!(
				"pre-open recorded for {} access",
				write_access_level
			);
		}

		Ok(profile)
	}
}

fn transmit_single(
	transport: &mut dyn CardTransport,
	request: &ApduRequest,
) -> Result<ApduResponse, Error> {
	let response = transport.transmit_card_request(
		&CardRequest {
			apdu_requests: vec![request.clone()],
			stop_on_unsuccessful_status_word: false,
		},
		ChannelControl::KeepOpen,
	)?;

	response
		.apdu_responses
		.into_iter()
		.next()
		.ok_or_else(|| Error::Transport {
			reason: "the reader returned no response".to_owned(),
		})
}
