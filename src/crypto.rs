//! Capability traits for the cryptographic collaborators.
//!
//! The engine computes no cryptography itself. Symmetric operations (session
//! MACs, PIN blocks, key ciphering, stored-value signatures) are delegated to
//! a SAM behind [`SymmetricCryptoService`]; certificate validation is
//! delegated to a PKI implementation behind [`AsymmetricCryptoService`]. Both
//! are injected at manager construction and never spawned by the engine.

// Uses
use std::collections::BTreeMap;

use crate::{
	error::Error,
	signature::{SignatureComputationData, SignatureVerificationData},
};

// Constants
/// Size of the references keying the asymmetric public-key store.
pub const PUBLIC_KEY_REFERENCE_SIZE: usize = 29;

/// Input/output value for the SAM side of a stored-value operation.
///
/// The engine fills the request fields; the SAM service fills the outputs,
/// which the engine then splices into the SV Reload/Debit/Undebit APDU.
#[derive(Clone, Debug, Default)]
pub struct SvCommandSecurityData {
	/// The SV Get command header as sent to the card.
	pub sv_get_request: Vec<u8>,
	/// The full SV Get response, status word included.
	pub sv_get_response: Vec<u8>,
	/// The SV operation APDU with its security bytes still blank.
	pub sv_command_partial_request: Vec<u8>,
	// Outputs
	/// The SAM serial number (4 bytes).
	pub serial_number: Vec<u8>,
	/// The SAM transaction number (3 bytes).
	pub transaction_number: Vec<u8>,
	/// The terminal SV MAC (5 bytes in regular mode, 10 in extended mode).
	pub terminal_sv_mac: Vec<u8>,
}

/// The SAM collaborator.
///
/// The running session MAC accumulator lives behind this trait; the engine
/// only decides *when* each call happens. All methods are suspension points
/// of the cooperative transaction (there is no internal concurrency).
pub trait SymmetricCryptoService {
	/// Pre-fetches a SAM challenge so a later session open costs one less SAM
	/// exchange.
	fn pre_init_terminal_secure_session_context(&mut self) -> Result<(), Error>;

	/// Starts a session context and returns the SAM challenge to embed in the
	/// Open Secure Session APDU.
	fn init_terminal_secure_session_context(&mut self) -> Result<Vec<u8>, Error>;

	/// Initializes the running session MAC from the Open Secure Session
	/// response data and the session key identifiers.
	fn init_terminal_session_mac(
		&mut self,
		open_session_data_out: &[u8],
		kif: u8,
		kvc: u8,
	) -> Result<(), Error>;

	/// Feeds one APDU (command or response) to the running MAC.
	///
	/// Returns the byte sequence to actually put on the wire (or to parse):
	/// the input itself while encryption is off, the transformed
	/// (ciphered/deciphered) sequence while encryption is on.
	fn update_terminal_session_mac(&mut self, apdu_bytes: &[u8]) -> Result<Vec<u8>, Error>;

	fn activate_encryption(&mut self) -> Result<(), Error>;

	fn deactivate_encryption(&mut self) -> Result<(), Error>;

	/// Produces an intermediate terminal MAC for mid-session mutual
	/// authentication. The session stays open.
	fn generate_terminal_session_mac(&mut self) -> Result<Vec<u8>, Error>;

	/// Closes the MAC computation and returns the terminal MAC to embed in
	/// the Close Secure Session APDU.
	fn finalize_terminal_session_mac(&mut self) -> Result<Vec<u8>, Error>;

	/// Verifies the MAC returned by the card at session close (or at a
	/// mutual-authentication checkpoint).
	fn is_card_session_mac_valid(&mut self, card_session_mac: &[u8]) -> Result<bool, Error>;

	/// Loads a key diversifier for the subsequent operations. The engine
	/// emits this at most once per diversifier change.
	fn select_diversifier(&mut self, key_diversifier: &[u8]) -> Result<(), Error>;

	/// Ciphers a PIN presentation block for encrypted PIN verification.
	fn cipher_pin_for_presentation(
		&mut self,
		card_challenge: &[u8],
		pin: &[u8],
		kif: u8,
		kvc: u8,
	) -> Result<Vec<u8>, Error>;

	/// Ciphers a PIN change block.
	fn cipher_pin_for_modification(
		&mut self,
		card_challenge: &[u8],
		current_pin: &[u8],
		new_pin: &[u8],
		kif: u8,
		kvc: u8,
	) -> Result<Vec<u8>, Error>;

	/// Ciphers a card key for the Change Key command.
	fn generate_ciphered_card_key(
		&mut self,
		card_challenge: &[u8],
		issuer_kif: u8,
		issuer_kvc: u8,
		new_kif: u8,
		new_kvc: u8,
	) -> Result<Vec<u8>, Error>;

	/// Computes the security bytes of an SV Reload/Debit/Undebit command.
	fn compute_sv_command_security_data(
		&mut self,
		data: &mut SvCommandSecurityData,
	) -> Result<(), Error>;

	/// Verifies the SV MAC returned by the card after an SV operation.
	fn is_card_sv_mac_valid(&mut self, card_sv_mac: &[u8]) -> Result<bool, Error>;

	/// Computes a standalone signature, out of session.
	fn compute_signature(&mut self, data: &mut SignatureComputationData) -> Result<(), Error>;

	/// Verifies a standalone signature, out of session. Returns the raw
	/// verdict; mapping a refusal to an error is the engine's job.
	fn verify_signature(&mut self, data: &SignatureVerificationData) -> Result<bool, Error>;

	/// Flushes any buffered SAM state. Called once per `process_commands`, at
	/// the end.
	fn synchronize(&mut self) -> Result<(), Error>;
}

/// The SAM revocation lookup, consulted before signature verification when
/// the caller asked for it.
pub trait SamRevocationService {
	fn is_sam_revoked(&self, sam_id: u32, t_num: u32) -> bool;
}

/// A CA certificate already decoded by its registered parser.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CaCertificate {
	pub public_key_reference: [u8; PUBLIC_KEY_REFERENCE_SIZE],
	pub issuer_public_key_reference: [u8; PUBLIC_KEY_REFERENCE_SIZE],
	pub raw: Vec<u8>,
}

/// A card certificate already decoded by its registered parser.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CardCertificate {
	pub issuer_public_key_reference: [u8; PUBLIC_KEY_REFERENCE_SIZE],
	pub card_serial_number: Vec<u8>,
	pub raw: Vec<u8>,
}

/// Decodes one CA certificate byte format, selected by its type byte.
pub trait CaCertificateParser {
	fn certificate_type(&self) -> u8;
	fn parse(&self, bytes: &[u8]) -> Result<CaCertificate, Error>;
}

/// Decodes one card certificate byte format, selected by its type byte.
pub trait CardCertificateParser {
	fn certificate_type(&self) -> u8;
	fn parse(&self, bytes: &[u8]) -> Result<CardCertificate, Error>;
}

/// The PKI collaborator: validates PCA/CA/card certificates against a
/// public-key store keyed by public-key reference.
pub trait AsymmetricCryptoService {
	fn validate_ca_certificate(&mut self, certificate: &CaCertificate) -> Result<(), Error>;

	fn validate_card_certificate(
		&mut self,
		certificate: &CardCertificate,
		card_serial_number: &[u8],
	) -> Result<(), Error>;
}

/// The certificate parser store.
///
/// One parser per certificate type byte, for each of the two formats.
/// Registering a type twice is a state error, not a silent replacement.
#[derive(Default)]
pub struct CertificateParserRegistry {
	ca_parsers: BTreeMap<u8, Box<dyn CaCertificateParser>>,
	card_parsers: BTreeMap<u8, Box<dyn CardCertificateParser>>,
}

impl CertificateParserRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_ca_certificate_parser(
		&mut self,
		parser: Box<dyn CaCertificateParser>,
	) -> Result<(), Error> {
		let certificate_type = parser.certificate_type();
		if self.ca_parsers.contains_key(&certificate_type) {
			return Err(Error::invalid_state(format!(
				"a CA certificate parser is already registered for type 0x{:02X}",
				certificate_type
			)));
		}
		self.ca_parsers.insert(certificate_type, parser);

		Ok(())
	}

	pub fn register_card_certificate_parser(
		&mut self,
		parser: Box<dyn CardCertificateParser>,
	) -> Result<(), Error> {
		let certificate_type = parser.certificate_type();
		if self.card_parsers.contains_key(&certificate_type) {
			return Err(Error::invalid_state(format!(
				"a card certificate parser is already registered for type 0x{:02X}",
				certificate_type
			)));
		}
		self.card_parsers.insert(certificate_type, parser);

		Ok(())
	}

	/// Decodes a CA certificate using the parser registered for its type
	/// byte (the first byte of the raw certificate).
	pub fn parse_ca_certificate(&self, bytes: &[u8]) -> Result<CaCertificate, Error> {
		let certificate_type = bytes.first().ok_or_else(|| Error::InvalidCertificate {
			reason: "empty CA certificate".to_owned(),
		})?;
		self.ca_parsers
			.get(certificate_type)
			.ok_or_else(|| Error::InvalidCertificate {
				reason: format!(
					"no CA certificate parser registered for type 0x{:02X}",
					certificate_type
				),
			})?
			.parse(bytes)
	}

	/// Decodes a card certificate using the parser registered for its type
	/// byte.
	pub fn parse_card_certificate(&self, bytes: &[u8]) -> Result<CardCertificate, Error> {
		let certificate_type = bytes.first().ok_or_else(|| Error::InvalidCertificate {
			reason: "empty card certificate".to_owned(),
		})?;
		self.card_parsers
			.get(certificate_type)
			.ok_or_else(|| Error::InvalidCertificate {
				reason: format!(
					"no card certificate parser registered for type 0x{:02X}",
					certificate_type
				),
			})?
			.parse(bytes)
	}
}
