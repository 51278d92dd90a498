//! The error types for the engine.

// Uses
use std::{
	cmp::Ordering,
	error::Error as StdError,
	fmt::{Display, Formatter, Result as FmtResult},
};

/// An error encountered while decoding raw bytes coming back from the card.
///
/// This is deliberately small - it carries the shape mismatch, not the
/// interpretation. The engine wraps it in [`Error::Parse`] before it reaches
/// the caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
	/// The wrong number of bytes was provided.
	///
	/// `r#type` carries the comparison the length was expected to satisfy:
	/// [`Ordering::Equal`] for exact sizes, [`Ordering::Greater`] for
	/// minimums.
	ByteCountIncorrect {
		r#type: Ordering,
		expected: usize,
		found: usize,
	},
	/// The data does not comply with the expected TLV or record layout.
	NonCompliant,
	/// The data is compliant but uses a feature the engine doesn't support.
	Unsupported,
	/// A string could not be read as a number of the expected radix.
	InvalidNumber,
}

impl Display for ParseError {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		match self {
			Self::ByteCountIncorrect {
				r#type,
				expected,
				found,
			} => match r#type {
				Ordering::Equal => write!(
					f,
					"the wrong number of bytes was provided - expected: {}, found: {}",
					expected, found
				),
				Ordering::Greater => write!(
					f,
					"too few bytes were provided - expected at least: {}, found: {}",
					expected, found
				),
				Ordering::Less => write!(
					f,
					"too many bytes were provided - expected at most: {}, found: {}",
					expected, found
				),
			},
			Self::NonCompliant => write!(f, "the data does not comply with the expected layout"),
			Self::Unsupported => write!(f, "the data uses an unsupported feature"),
			Self::InvalidNumber => write!(f, "the value is not a valid number, or is too large"),
		}
	}
}

impl StdError for ParseError {}

/// The error type returned by every fallible operation of the engine.
///
/// The kinds mirror the failure surface of a card transaction: argument
/// validation, state machine misuse, card-side refusals and collaborator
/// failures each get their own variant so callers can react without string
/// matching.
#[derive(Debug)]
pub enum Error {
	/// An argument was out of range, malformed or of the wrong variant type.
	InvalidInput { reason: String },
	/// The operation requires a state the engine doesn't currently hold.
	InvalidState { reason: String },
	/// The operation is not applicable to this product type or crypto mode.
	Unsupported { reason: String },
	/// A response couldn't be decoded.
	Parse(ParseError),
	/// An APDU returned a status word outside its success set, or an
	/// anticipated response didn't match the card's actual response.
	UnexpectedCommandStatus {
		command: &'static str,
		status_word: u16,
	},
	/// The card's session MAC failed verification at session close.
	InvalidCardMac,
	/// A standalone signature verification failed.
	InvalidSignature,
	/// The revocation service reported the SAM as revoked.
	SamRevoked { sam_id: u32, t_num: u32 },
	/// The card's session key is not in the authorized set.
	UnauthorizedKey { kif: u8, kvc: u8 },
	/// The queued modifications exceed the card's session buffer and multiple
	/// session mode is disabled.
	SessionBufferOverflow { required: usize, available: usize },
	/// A CA or card certificate was rejected.
	InvalidCertificate { reason: String },
	/// The reader communication is broken or timed out.
	Transport { reason: String },
}

impl Display for Error {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		match self {
			Self::InvalidInput { reason } => write!(f, "invalid input: {}", reason),
			Self::InvalidState { reason } => write!(f, "invalid state: {}", reason),
			Self::Unsupported { reason } => write!(f, "unsupported operation: {}", reason),
			Self::Parse(parse_error) => write!(f, "parse error: {}", parse_error),
			Self::UnexpectedCommandStatus {
				command,
				status_word,
			} => write!(
				f,
				"unexpected status word 0x{:04X} in response to {}",
				status_word, command
			),
			Self::InvalidCardMac => write!(f, "the card session MAC failed verification"),
			Self::InvalidSignature => write!(f, "the signature failed verification"),
			Self::SamRevoked { sam_id, t_num } => write!(
				f,
				"the SAM 0x{:08X} is revoked (transaction number {})",
				sam_id, t_num
			),
			Self::UnauthorizedKey { kif, kvc } => write!(
				f,
				"the session key KIF 0x{:02X} / KVC 0x{:02X} is not authorized",
				kif, kvc
			),
			Self::SessionBufferOverflow {
				required,
				available,
			} => write!(
				f,
				"the session buffer would overflow - required: {}, available: {}",
				required, available
			),
			Self::InvalidCertificate { reason } => write!(f, "invalid certificate: {}", reason),
			Self::Transport { reason } => write!(f, "transport failure: {}", reason),
		}
	}
}

impl StdError for Error {
	fn source(&self) -> Option<&(dyn StdError + 'static)> {
		match self {
			Self::Parse(parse_error) => Some(parse_error),
			_ => None,
		}
	}
}

impl From<ParseError> for Error {
	fn from(parse_error: ParseError) -> Self {
		Self::Parse(parse_error)
	}
}

impl Error {
	pub(crate) fn invalid_input(reason: impl Into<String>) -> Self {
		Self::InvalidInput {
			reason: reason.into(),
		}
	}

	pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
		Self::InvalidState {
			reason: reason.into(),
		}
	}

	pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
		Self::Unsupported {
			reason: reason.into(),
		}
	}
}
