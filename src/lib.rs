//! A transaction engine for Calypso smart cards.
//!
//! The engine turns prepared high-level operations (select, read/write
//! records and binaries, counters, PIN, stored value, secure sessions) into a
//! correctly ordered APDU dialog, maintaining the session MAC through a SAM
//! collaborator and mirroring everything the card said into a typed
//! [`card::CardProfile`].
//!
//! Physical readers and cryptography stay outside: they are consumed through
//! the [`transport::CardTransport`] and [`crypto`] capability traits.

// Linting Rules
#![warn(
	clippy::complexity,
	clippy::correctness,
	clippy::pedantic,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::clone_on_ref_ptr,
	clippy::dbg_macro,
	clippy::decimal_literal_representation,
	clippy::exit,
	clippy::filetype_is_file,
	clippy::if_then_some_else_none,
	clippy::non_ascii_literal,
	clippy::self_named_module_files,
	clippy::str_to_string,
	clippy::undocumented_unsafe_blocks,
	clippy::wildcard_enum_match_arm
)]
#![allow(
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_sign_loss,
	clippy::doc_markdown,
	clippy::identity_op,
	clippy::module_name_repetitions,
	clippy::similar_names,
	clippy::struct_excessive_bools,
	clippy::too_many_lines,
	clippy::unnecessary_wraps
)]

// Modules
pub mod apdu;
pub mod card;
mod commands;
pub mod crypto;
pub mod error;
mod macros;
pub mod security;
pub mod selection;
pub mod signature;
mod testing_macros;
pub mod tlv;
pub mod transaction;
pub mod transport;
pub mod util;

// Public Exports
pub use self::commands::{GetDataTag, SearchCommandData, SelectFileControl, SvAction, SvOperation};
