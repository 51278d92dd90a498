//! Data values for SAM-mediated signature computation and verification.
//!
//! These are concrete values with setter methods rather than traits: the
//! engine validates them itself and fills the output fields in place once the
//! SAM has answered.

// Uses
use derivative::Derivative;

use crate::error::Error;

// Constants
/// Longest message a SAM can sign in one pass.
pub const MAX_MESSAGE_SIZE: usize = 208;
/// Longest message once SAM traceability information has to fit in too.
pub const MAX_MESSAGE_SIZE_WITH_TRACEABILITY: usize = 206;
pub const MIN_SIGNATURE_SIZE: usize = 1;
pub const MAX_SIGNATURE_SIZE: usize = 8;
pub const DEFAULT_SIGNATURE_SIZE: usize = 8;
const MIN_KEY_DIVERSIFIER_SIZE: usize = 1;
const MAX_KEY_DIVERSIFIER_SIZE: usize = 8;

/// Where and how the SAM embeds its traceability information in the signed
/// message.
///
/// The embedded data is the SAM serial number - its low 3 bytes in partial
/// mode (24 bits), all 4 in full mode (32 bits) - optionally followed by the
/// 3-byte SAM transaction counter when the message leaves room for it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SamTraceabilityMode {
	pub offset_bits: usize,
	pub partial_serial_number: bool,
}

impl SamTraceabilityMode {
	/// The number of bits of SAM information written at the offset.
	pub fn info_bits(&self) -> usize {
		if self.partial_serial_number {
			24
		} else {
			32
		}
	}
}

/// Input/output value for a SAM signature computation.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SignatureComputationData {
	message: Vec<u8>,
	kif: u8,
	kvc: u8,
	signature_size: usize,
	#[derivative(Debug = "ignore")]
	key_diversifier: Option<Vec<u8>>,
	traceability: Option<SamTraceabilityMode>,
	// Outputs
	signature: Option<Vec<u8>>,
	signed_message: Option<Vec<u8>>,
}

impl SignatureComputationData {
	pub fn new(message: Vec<u8>, kif: u8, kvc: u8) -> Self {
		Self {
			message,
			kif,
			kvc,
			signature_size: DEFAULT_SIGNATURE_SIZE,
			key_diversifier: None,
			traceability: None,
			signature: None,
			signed_message: None,
		}
	}

	pub fn set_signature_size(&mut self, size: usize) -> &mut Self {
		self.signature_size = size;
		self
	}

	pub fn set_key_diversifier(&mut self, diversifier: Vec<u8>) -> &mut Self {
		self.key_diversifier = Some(diversifier);
		self
	}

	pub fn set_traceability(&mut self, traceability: SamTraceabilityMode) -> &mut Self {
		self.traceability = Some(traceability);
		self
	}

	pub fn message(&self) -> &[u8] {
		self.message.as_slice()
	}

	pub fn kif(&self) -> u8 {
		self.kif
	}

	pub fn kvc(&self) -> u8 {
		self.kvc
	}

	pub fn signature_size(&self) -> usize {
		self.signature_size
	}

	pub fn key_diversifier(&self) -> Option<&[u8]> {
		self.key_diversifier.as_deref()
	}

	pub fn traceability(&self) -> Option<SamTraceabilityMode> {
		self.traceability
	}

	/// The computed signature. Fails until the computation has been processed.
	pub fn signature(&self) -> Result<&[u8], Error> {
		self.signature
			.as_deref()
			.ok_or_else(|| Error::invalid_state("the signature has not been computed yet"))
	}

	/// The message as actually signed, traceability information included.
	/// Fails until the computation has been processed.
	pub fn signed_message(&self) -> Result<&[u8], Error> {
		self.signed_message
			.as_deref()
			.ok_or_else(|| Error::invalid_state("the signature has not been computed yet"))
	}

	pub fn fill_results(&mut self, signature: Vec<u8>, signed_message: Vec<u8>) {
		self.signature = Some(signature);
		self.signed_message = Some(signed_message);
	}

	pub(crate) fn validate(&self) -> Result<(), Error> {
		validate_message(self.message.as_slice(), self.traceability.as_ref())?;
		if !(MIN_SIGNATURE_SIZE..=MAX_SIGNATURE_SIZE).contains(&self.signature_size) {
			return Err(Error::invalid_input(format!(
				"signature size {} is out of range [{}, {}]",
				self.signature_size, MIN_SIGNATURE_SIZE, MAX_SIGNATURE_SIZE
			)));
		}
		validate_key_diversifier(self.key_diversifier.as_deref())?;

		Ok(())
	}
}

/// Input/output value for a SAM signature verification.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SignatureVerificationData {
	message: Vec<u8>,
	signature: Vec<u8>,
	kif: u8,
	kvc: u8,
	#[derivative(Debug = "ignore")]
	key_diversifier: Option<Vec<u8>>,
	traceability: Option<SamTraceabilityMode>,
	check_sam_revocation: bool,
	// Output
	verified: Option<bool>,
}

impl SignatureVerificationData {
	pub fn new(message: Vec<u8>, signature: Vec<u8>, kif: u8, kvc: u8) -> Self {
		Self {
			message,
			signature,
			kif,
			kvc,
			key_diversifier: None,
			traceability: None,
			check_sam_revocation: false,
			verified: None,
		}
	}

	pub fn set_key_diversifier(&mut self, diversifier: Vec<u8>) -> &mut Self {
		self.key_diversifier = Some(diversifier);
		self
	}

	/// Declares where the SAM traceability information sits in the message,
	/// and whether the SAM revocation status must be checked before
	/// verification.
	pub fn set_traceability(
		&mut self,
		traceability: SamTraceabilityMode,
		check_sam_revocation: bool,
	) -> &mut Self {
		self.traceability = Some(traceability);
		self.check_sam_revocation = check_sam_revocation;
		self
	}

	pub fn message(&self) -> &[u8] {
		self.message.as_slice()
	}

	pub fn signature(&self) -> &[u8] {
		self.signature.as_slice()
	}

	pub fn kif(&self) -> u8 {
		self.kif
	}

	pub fn kvc(&self) -> u8 {
		self.kvc
	}

	pub fn key_diversifier(&self) -> Option<&[u8]> {
		self.key_diversifier.as_deref()
	}

	pub fn traceability(&self) -> Option<SamTraceabilityMode> {
		self.traceability
	}

	pub fn check_sam_revocation(&self) -> bool {
		self.check_sam_revocation
	}

	/// The verification outcome. Fails until the verification has been
	/// processed.
	pub fn is_verified(&self) -> Result<bool, Error> {
		self.verified
			.ok_or_else(|| Error::invalid_state("the signature has not been verified yet"))
	}

	pub fn fill_result(&mut self, verified: bool) {
		self.verified = Some(verified);
	}

	/// Extracts the `(sam_id, t_num)` tuple embedded at the traceability
	/// offset, for the revocation check.
	pub(crate) fn extract_traceability_tuple(&self) -> Option<(u32, u32)> {
		let traceability = self.traceability.as_ref()?;
		let serial_bytes = traceability.info_bits() / 8;
		let offset_bytes = traceability.offset_bits / 8;

		let serial_end = offset_bytes + serial_bytes;
		if serial_end > self.message.len() {
			return None;
		}
		let mut sam_id = 0_u32;
		for byte in &self.message[offset_bytes..serial_end] {
			sam_id = (sam_id << 8) | u32::from(*byte);
		}

		// The 3-byte transaction counter follows the serial when the message
		// leaves room for it
		let mut t_num = 0_u32;
		if serial_end + 3 <= self.message.len() {
			for byte in &self.message[serial_end..(serial_end + 3)] {
				t_num = (t_num << 8) | u32::from(*byte);
			}
		}

		Some((sam_id, t_num))
	}

	pub(crate) fn validate(&self) -> Result<(), Error> {
		validate_message(self.message.as_slice(), self.traceability.as_ref())?;
		if !(MIN_SIGNATURE_SIZE..=MAX_SIGNATURE_SIZE).contains(&self.signature.len()) {
			return Err(Error::invalid_input(format!(
				"signature length {} is out of range [{}, {}]",
				self.signature.len(),
				MIN_SIGNATURE_SIZE,
				MAX_SIGNATURE_SIZE
			)));
		}
		validate_key_diversifier(self.key_diversifier.as_deref())?;

		Ok(())
	}
}

fn validate_message(
	message: &[u8],
	traceability: Option<&SamTraceabilityMode>,
) -> Result<(), Error> {
	let max_size = if traceability.is_some() {
		MAX_MESSAGE_SIZE_WITH_TRACEABILITY
	} else {
		MAX_MESSAGE_SIZE
	};
	if message.is_empty() || message.len() > max_size {
		return Err(Error::invalid_input(format!(
			"message length {} is out of range [1, {}]",
			message.len(),
			max_size
		)));
	}
	if let Some(traceability) = traceability {
		// Closed constraint: the SAM information must fit inside the message
		if traceability.offset_bits + traceability.info_bits() > message.len() * 8 {
			return Err(Error::invalid_input(format!(
				"traceability offset {} leaves no room for {} bits of SAM information",
				traceability.offset_bits,
				traceability.info_bits()
			)));
		}
	}

	Ok(())
}

fn validate_key_diversifier(key_diversifier: Option<&[u8]>) -> Result<(), Error> {
	if let Some(diversifier) = key_diversifier {
		if !(MIN_KEY_DIVERSIFIER_SIZE..=MAX_KEY_DIVERSIFIER_SIZE).contains(&diversifier.len()) {
			return Err(Error::invalid_input(format!(
				"key diversifier length {} is out of range [{}, {}]",
				diversifier.len(),
				MIN_KEY_DIVERSIFIER_SIZE,
				MAX_KEY_DIVERSIFIER_SIZE
			)));
		}
	}

	Ok(())
}
