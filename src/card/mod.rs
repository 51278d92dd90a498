//! The typed card profile: everything the engine knows about the card in
//! front of it.
//!
//! A profile is created by the selection pipeline and then mutated
//! exclusively by command parsers for the duration of one transaction. It is
//! torn down with the transaction; nothing here survives to the next card
//! presentation.

// Modules
pub mod file;
pub mod sv;

// Uses
use std::{
	cmp::Ordering,
	fmt::{Display, Formatter, Result as FmtResult},
};

use crate::{
	apdu::CardClass,
	error::{Error, ParseError},
	security::WriteAccessLevel,
	util::to_hex_str,
};

use self::{
	file::{ElementaryFile, FileStore},
	sv::{SvData, SvDebitLogRecord, SvLoadLogRecord},
};

// Constants
pub const APPLICATION_SERIAL_NUMBER_SIZE: usize = 8;
pub const STARTUP_INFO_MIN_SIZE: usize = 7;
/// Default APDU payload capacity for ISO-class products.
pub const PAYLOAD_CAPACITY_ISO: usize = 250;
/// Reduced payload capacity for the legacy-class revisions.
pub const PAYLOAD_CAPACITY_LEGACY: usize = 128;
/// Fixed atomic budget for revisions whose modification counter counts
/// commands rather than bytes.
const LEGACY_MODIFICATIONS_COMMAND_BUDGET: usize = 3;

/// The card product family, derived from the startup info's application type
/// byte (or forced by the ATR shape for revision 1).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProductType {
	Unknown,
	PrimeRevision1,
	PrimeRevision2,
	PrimeRevision3,
	Light,
	Basic,
}

impl ProductType {
	/// Maps an application type byte to its product family.
	///
	/// `0x00` is reserved and rejected; `0xFF` explicitly means unknown.
	pub fn from_application_type(application_type: u8) -> Result<Self, Error> {
		match application_type {
			0x00 => Err(Error::invalid_input(
				"application type 0x00 is reserved and cannot identify a product",
			)),
			0x01..=0x1F => Ok(Self::PrimeRevision2),
			0x20..=0x89 | 0xA0..=0xFE => Ok(Self::PrimeRevision3),
			0x90..=0x97 => Ok(Self::Light),
			0x8A..=0x8F | 0x98..=0x9F => Ok(Self::Basic),
			0xFF => Ok(Self::Unknown),
		}
	}

	/// The APDU class byte family this product understands.
	pub fn card_class(self) -> CardClass {
		match self {
			Self::PrimeRevision1 | Self::PrimeRevision2 => CardClass::Legacy,
			Self::Unknown | Self::PrimeRevision3 | Self::Light | Self::Basic => CardClass::Iso,
		}
	}
}

impl Display for ProductType {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.write_str(match self {
			Self::Unknown => "Unknown",
			Self::PrimeRevision1 => "Prime Revision 1",
			Self::PrimeRevision2 => "Prime Revision 2",
			Self::PrimeRevision3 => "Prime Revision 3",
			Self::Light => "Light",
			Self::Basic => "Basic",
		})
	}
}

/// The raw startup info block from the FCI's `53` data object.
///
/// Layout: `session-modification(1) platform(1) application-type(1)
/// application-subtype(1) software-issuer(1) software-version(1)
/// software-revision(1)`, possibly followed by product-specific extra bytes
/// which are preserved verbatim.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StartupInfo {
	raw: Vec<u8>,
}

impl StartupInfo {
	pub fn raw(&self) -> &[u8] {
		self.raw.as_slice()
	}

	pub fn session_modification(&self) -> u8 {
		self.raw[0]
	}

	pub fn platform(&self) -> u8 {
		self.raw[1]
	}

	pub fn application_type(&self) -> u8 {
		self.raw[2]
	}

	pub fn application_subtype(&self) -> u8 {
		self.raw[3]
	}

	pub fn software_issuer(&self) -> u8 {
		self.raw[4]
	}

	pub fn software_version(&self) -> u8 {
		self.raw[5]
	}

	pub fn software_revision(&self) -> u8 {
		self.raw[6]
	}
}

impl TryFrom<&[u8]> for StartupInfo {
	type Error = ParseError;

	fn try_from(raw_bytes: &[u8]) -> Result<Self, Self::Error> {
		if raw_bytes.len() < STARTUP_INFO_MIN_SIZE {
			return Err(ParseError::ByteCountIncorrect {
				r#type: Ordering::Greater,
				expected: STARTUP_INFO_MIN_SIZE,
				found: raw_bytes.len(),
			});
		}

		Ok(Self {
			raw: raw_bytes.to_vec(),
		})
	}
}

/// The anticipation bundle produced by a selection extension's pre-open and
/// consumed by the transaction manager at the real session open.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PreOpenContext {
	pub write_access_level: WriteAccessLevel,
	/// The Open Secure Session data-out recorded at selection time.
	pub data_out: Vec<u8>,
}

/// The immutable-after-initialization card descriptor plus its mutable
/// content cache.
#[derive(Clone, Debug, Default)]
pub struct CardProfile {
	product_type: Option<ProductType>,
	power_on_data: Option<String>,
	df_name: Vec<u8>,
	application_serial_number: [u8; APPLICATION_SERIAL_NUMBER_SIZE],
	startup_info: Option<StartupInfo>,
	is_df_invalidated: bool,
	is_hce: bool,
	pin_feature_available: bool,
	sv_feature_available: bool,
	ratification_on_deselect_available: bool,
	extended_mode_supported: bool,
	pki_mode_supported: bool,
	payload_capacity: usize,
	files: FileStore,
	sv: SvData,
	pre_open: Option<PreOpenContext>,
	card_challenge: Option<Vec<u8>>,
	traceability_information: Option<Vec<u8>>,
	pin_attempts_remaining: Option<u8>,
	is_df_ratified: Option<bool>,
	search_results: Vec<u8>,
}

impl CardProfile {
	pub(crate) fn new() -> Self {
		Self {
			payload_capacity: PAYLOAD_CAPACITY_ISO,
			ratification_on_deselect_available: true,
			..Self::default()
		}
	}

	// Identification

	pub fn product_type(&self) -> ProductType {
		self.product_type.unwrap_or(ProductType::Unknown)
	}

	pub fn card_class(&self) -> CardClass {
		self.product_type().card_class()
	}

	pub fn power_on_data(&self) -> Option<&str> {
		self.power_on_data.as_deref()
	}

	pub fn df_name(&self) -> &[u8] {
		self.df_name.as_slice()
	}

	/// The application serial number: the last 8 bytes of the card's full
	/// serial.
	pub fn application_serial_number(&self) -> &[u8; APPLICATION_SERIAL_NUMBER_SIZE] {
		&self.application_serial_number
	}

	pub fn startup_info(&self) -> Option<&StartupInfo> {
		self.startup_info.as_ref()
	}

	/// The raw startup info bytes, extra product-specific bytes included.
	pub fn startup_info_raw(&self) -> Option<&[u8]> {
		self.startup_info.as_ref().map(StartupInfo::raw)
	}

	pub fn is_df_invalidated(&self) -> bool {
		self.is_df_invalidated
	}

	/// Whether the "card" is a host card emulation, flagged by the high bit
	/// of the serial's first byte.
	pub fn is_hce(&self) -> bool {
		self.is_hce
	}

	// Capabilities

	pub fn is_pin_feature_available(&self) -> bool {
		self.pin_feature_available
	}

	pub fn is_sv_feature_available(&self) -> bool {
		self.sv_feature_available
	}

	pub fn is_ratification_on_deselect_available(&self) -> bool {
		self.ratification_on_deselect_available
	}

	pub fn is_extended_mode_supported(&self) -> bool {
		self.extended_mode_supported
	}

	pub fn is_pki_mode_supported(&self) -> bool {
		self.pki_mode_supported
	}

	pub fn payload_capacity(&self) -> usize {
		self.payload_capacity
	}

	/// Whether the session modification budget counts bytes (Prime Revision
	/// 3) or whole commands (earlier revisions).
	pub fn is_modifications_counter_in_bytes(&self) -> bool {
		matches!(
			self.product_type(),
			ProductType::PrimeRevision3 | ProductType::Unknown
		)
	}

	/// The session modification budget: bytes or commands depending on
	/// [`Self::is_modifications_counter_in_bytes`].
	pub fn modifications_buffer_size(&self) -> usize {
		if !self.is_modifications_counter_in_bytes() {
			return LEGACY_MODIFICATIONS_COMMAND_BUDGET;
		}
		match self.startup_info.as_ref() {
			Some(startup_info) => {
				// Quarter-power-of-two progression anchored at 215 bytes for
				// indicator 0x06
				const BASE: [usize; 4] = [215, 256, 304, 362];
				let indicator = startup_info.session_modification();
				if !(0x06..=0x37).contains(&indicator) {
					return BASE[0];
				}
				let step = usize::from(indicator - 0x06);
				BASE[step % 4] << (step / 4)
			}
			None => 215,
		}
	}

	// Files

	pub fn file_by_sfi(&self, sfi: u8) -> Option<&ElementaryFile> {
		self.files.file_by_sfi(sfi)
	}

	pub fn file_by_lid(&self, lid: u16) -> Option<&ElementaryFile> {
		self.files.file_by_lid(lid)
	}

	pub fn files(&self) -> &FileStore {
		&self.files
	}

	/// Reads a previously fetched counter value.
	pub fn counter(&self, sfi: u8, counter_number: u8) -> Result<u32, Error> {
		self.files
			.file_by_sfi(sfi)
			.and_then(|file| file.counter(counter_number))
			.ok_or_else(|| {
				Error::invalid_state(format!(
					"counter {} of SFI 0x{:02X} has not been read in this transaction",
					counter_number, sfi
				))
			})
	}

	/// The record numbers matched by the last Search Record Multiple.
	pub fn search_results(&self) -> &[u8] {
		self.search_results.as_slice()
	}

	// Stored value

	/// The SV balance. Fails until an SV Get has run in this transaction.
	pub fn sv_balance(&self) -> Result<i32, Error> {
		self.check_sv_get_executed()?;
		Ok(self.sv.balance)
	}

	/// The card's SV transaction number at the last SV Get.
	pub fn sv_last_t_num(&self) -> Result<u16, Error> {
		self.check_sv_get_executed()?;
		Ok(self.sv.last_t_num)
	}

	pub fn sv_load_log(&self) -> Result<&SvLoadLogRecord, Error> {
		self.check_sv_get_executed()?;
		self.sv
			.load_log
			.as_ref()
			.ok_or_else(|| Error::invalid_state("no SV load log is available"))
	}

	pub fn sv_debit_log(&self) -> Result<&SvDebitLogRecord, Error> {
		self.check_sv_get_executed()?;
		self.sv
			.debit_log
			.as_ref()
			.ok_or_else(|| Error::invalid_state("no SV debit log is available"))
	}

	fn check_sv_get_executed(&self) -> Result<(), Error> {
		if !self.sv.sv_get_executed {
			return Err(Error::invalid_state(
				"no SV Get has been executed in this transaction",
			));
		}

		Ok(())
	}

	// Miscellaneous card state

	pub fn pre_open_context(&self) -> Option<&PreOpenContext> {
		self.pre_open.as_ref()
	}

	pub fn traceability_information(&self) -> Option<&[u8]> {
		self.traceability_information.as_deref()
	}

	/// PIN attempts left after the last Verify PIN or status check.
	pub fn pin_attempts_remaining(&self) -> Result<u8, Error> {
		self.pin_attempts_remaining.ok_or_else(|| {
			Error::invalid_state("the PIN status has not been checked in this transaction")
		})
	}

	/// Whether the previous secure session was ratified, as reported by the
	/// last session open.
	pub fn is_df_ratified(&self) -> Result<bool, Error> {
		self.is_df_ratified.ok_or_else(|| {
			Error::invalid_state("no secure session has been opened in this transaction")
		})
	}

	pub(crate) fn card_challenge(&self) -> Option<&[u8]> {
		self.card_challenge.as_deref()
	}

	// Mutators, reserved to the selection pipeline and the command parsers

	pub(crate) fn init_from_atr(
		&mut self,
		power_on_data: String,
		serial_tail: [u8; 4],
		startup_info: StartupInfo,
	) {
		self.product_type = Some(ProductType::PrimeRevision1);
		self.power_on_data = Some(power_on_data);
		let mut serial = [0x00; APPLICATION_SERIAL_NUMBER_SIZE];
		serial[4..].copy_from_slice(&serial_tail);
		self.application_serial_number = serial;
		self.startup_info = Some(startup_info);
		self.is_df_invalidated = false;
		self.is_hce = false;
		// Revision 1 capabilities are fixed by the product, not advertised
		self.pin_feature_available = false;
		self.sv_feature_available = false;
		self.extended_mode_supported = false;
		self.pki_mode_supported = false;
		self.ratification_on_deselect_available = true;
		self.payload_capacity = PAYLOAD_CAPACITY_LEGACY;
	}

	pub(crate) fn init_from_fci(
		&mut self,
		product_type: ProductType,
		df_name: Vec<u8>,
		serial_number: [u8; APPLICATION_SERIAL_NUMBER_SIZE],
		startup_info: StartupInfo,
		is_df_invalidated: bool,
	) {
		let application_type = startup_info.application_type();
		self.product_type = Some(product_type);
		self.df_name = df_name;
		self.is_hce = serial_number[0] & 0x80 > 0;
		self.application_serial_number = serial_number;
		self.is_df_invalidated = is_df_invalidated;
		// Capability bits of the application type byte
		self.pin_feature_available = application_type & 0x01 > 0;
		self.sv_feature_available = application_type & 0x02 > 0;
		self.ratification_on_deselect_available = application_type & 0x04 == 0;
		self.extended_mode_supported =
			application_type & 0x08 > 0 && product_type == ProductType::PrimeRevision3;
		self.pki_mode_supported = application_type & 0x10 > 0;
		self.payload_capacity = match product_type.card_class() {
			CardClass::Iso => PAYLOAD_CAPACITY_ISO,
			CardClass::Legacy => PAYLOAD_CAPACITY_LEGACY,
		};
		self.startup_info = Some(startup_info);
	}

	pub(crate) fn set_df_invalidated(&mut self, invalidated: bool) {
		self.is_df_invalidated = invalidated;
	}

	pub(crate) fn files_mut(&mut self) -> &mut FileStore {
		&mut self.files
	}

	pub(crate) fn sv_data(&self) -> &SvData {
		&self.sv
	}

	pub(crate) fn sv_data_mut(&mut self) -> &mut SvData {
		&mut self.sv
	}

	pub(crate) fn set_pre_open_context(&mut self, context: PreOpenContext) {
		self.pre_open = Some(context);
	}

	pub(crate) fn clear_pre_open_context(&mut self) {
		self.pre_open = None;
	}

	pub(crate) fn set_card_challenge(&mut self, challenge: Vec<u8>) {
		self.card_challenge = Some(challenge);
	}

	pub(crate) fn set_traceability_information(&mut self, information: Vec<u8>) {
		self.traceability_information = Some(information);
	}

	pub(crate) fn set_pin_attempts_remaining(&mut self, attempts: u8) {
		self.pin_attempts_remaining = Some(attempts);
	}

	pub(crate) fn set_df_ratified(&mut self, ratified: bool) {
		self.is_df_ratified = Some(ratified);
	}

	pub(crate) fn set_search_results(&mut self, results: Vec<u8>) {
		self.search_results = results;
	}

	/// Dumps the profile identification for log output.
	pub fn identification_summary(&self) -> String {
		format!(
			"{} [DF {}] [serial {}]",
			self.product_type(),
			to_hex_str(self.df_name.as_slice()),
			to_hex_str(&self.application_serial_number)
		)
	}
}

// Unit Tests
#[cfg(test)]
mod tests {
	// Uses
	use std::cmp::Ordering;

	use super::{CardProfile, ProductType, StartupInfo};
	use crate::error::{Error, ParseError};

	// Tests
	/// Ensures the application type byte table is honoured over its whole
	/// range.
	#[test]
	fn product_type_table() {
		assert!(matches!(
			ProductType::from_application_type(0x00),
			Err(Error::InvalidInput { .. })
		));
		for application_type in 0x01..=0xFE_u8 {
			let expected = match application_type {
				0x01..=0x1F => ProductType::PrimeRevision2,
				0x20..=0x89 | 0xA0..=0xFE => ProductType::PrimeRevision3,
				0x90..=0x97 => ProductType::Light,
				_ => ProductType::Basic,
			};
			assert_eq!(
				expected,
				ProductType::from_application_type(application_type)
					.expect("all non-zero values map to a product"),
				"application type 0x{:02X}",
				application_type
			);
		}
		assert_eq!(
			ProductType::Unknown,
			ProductType::from_application_type(0xFF).expect("0xFF maps to unknown")
		);
	}

	/// Ensures startup info accessors read their documented offsets, and
	/// short blocks are rejected.
	#[test]
	fn startup_info_layout() {
		let startup_info =
			StartupInfo::try_from([0x0A, 0x3C, 0x2F, 0x05, 0x01, 0x02, 0x03, 0x99].as_slice())
				.expect("the block is long enough");

		assert_eq!(0x0A, startup_info.session_modification());
		assert_eq!(0x3C, startup_info.platform());
		assert_eq!(0x2F, startup_info.application_type());
		assert_eq!(0x05, startup_info.application_subtype());
		assert_eq!(0x01, startup_info.software_issuer());
		assert_eq!(0x02, startup_info.software_version());
		assert_eq!(0x03, startup_info.software_revision());
		assert_eq!(8, startup_info.raw().len());

		assert_eq!(
			Err(ParseError::ByteCountIncorrect {
				r#type: Ordering::Greater,
				expected: 7,
				found: 6,
			}),
			StartupInfo::try_from([0x0A, 0x3C, 0x2F, 0x05, 0x01, 0x02].as_slice())
		);
	}

	/// Ensures the modification buffer follows the quarter-power-of-two
	/// progression.
	#[test]
	fn modification_buffer_progression() {
		let mut profile = CardProfile::new();
		for (indicator, expected) in [
			(0x06_u8, 215_usize),
			(0x07, 256),
			(0x08, 304),
			(0x09, 362),
			(0x0A, 430),
			(0x0B, 512),
			(0x0D, 724),
			(0x11, 1448),
		] {
			profile.init_from_fci(
				ProductType::PrimeRevision3,
				vec![0x31, 0x54, 0x49, 0x43, 0x2E],
				[0x00, 0x00, 0x00, 0x00, 0x11, 0x22, 0x33, 0x44],
				StartupInfo::try_from(
					[indicator, 0x3C, 0x20, 0x05, 0x01, 0x02, 0x03].as_slice(),
				)
				.expect("the block is long enough"),
				false,
			);
			assert_eq!(
				expected,
				profile.modifications_buffer_size(),
				"indicator 0x{:02X}",
				indicator
			);
		}
	}

	/// Ensures capability flags derive from the application type bits.
	#[test]
	fn capability_flags() {
		let mut profile = CardProfile::new();
		// Bits: PIN + extended mode (0b0000_1001 -> within Rev3 range 0x29)
		profile.init_from_fci(
			ProductType::PrimeRevision3,
			vec![0x31, 0x54, 0x49, 0x43, 0x2E],
			[0x00, 0x00, 0x00, 0x00, 0x11, 0x22, 0x33, 0x44],
			StartupInfo::try_from([0x08, 0x3C, 0x29, 0x05, 0x01, 0x02, 0x03].as_slice())
				.expect("the block is long enough"),
			false,
		);

		assert!(profile.is_pin_feature_available());
		assert!(!profile.is_sv_feature_available());
		assert!(profile.is_ratification_on_deselect_available());
		assert!(profile.is_extended_mode_supported());
		assert!(!profile.is_pki_mode_supported());
		assert!(!profile.is_hce());
	}

	/// Ensures the HCE flag follows the serial's first byte high bit.
	#[test]
	fn hce_flag() {
		let mut profile = CardProfile::new();
		profile.init_from_fci(
			ProductType::PrimeRevision3,
			vec![0x31, 0x54, 0x49, 0x43, 0x2E],
			[0x80, 0x00, 0x00, 0x00, 0x11, 0x22, 0x33, 0x44],
			StartupInfo::try_from([0x08, 0x3C, 0x20, 0x05, 0x01, 0x02, 0x03].as_slice())
				.expect("the block is long enough"),
			false,
		);

		assert!(profile.is_hce());
	}

	/// Ensures SV accessors fail until an SV Get has run.
	#[test]
	fn sv_accessors_gated_on_sv_get() {
		let profile = CardProfile::new();
		assert!(matches!(profile.sv_balance(), Err(Error::InvalidState { .. })));
		assert!(matches!(
			profile.sv_load_log(),
			Err(Error::InvalidState { .. })
		));
	}

	/// Ensures unread counters are a state error, not a zero.
	#[test]
	fn unread_counter_is_a_state_error() {
		let profile = CardProfile::new();
		assert!(matches!(
			profile.counter(0x19, 1),
			Err(Error::InvalidState { .. })
		));
	}
}
