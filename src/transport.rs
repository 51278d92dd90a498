//! The reader/transport capability trait.
//!
//! The engine never opens or owns a reader - it borrows one for the duration
//! of each transmit call. Everything physical (protocol negotiation, timeouts,
//! retries) lives behind this seam.

// Uses
use crate::{
	apdu::{CardRequest, CardResponse, ChannelControl},
	error::Error,
};

/// A card reader able to play an ordered list of APDUs against the card
/// currently in its field.
pub trait CardTransport {
	/// Transmits every APDU of the request in order and returns the
	/// responses, also in order.
	///
	/// When `stop_on_unsuccessful_status_word` is set on the request, the
	/// transport stops at the first response whose status word falls outside
	/// its request's success set; the returned list is then shorter than the
	/// request list. `channel_control` states what to do with the physical
	/// channel once the exchange is over.
	fn transmit_card_request(
		&mut self,
		card_request: &CardRequest,
		channel_control: ChannelControl,
	) -> Result<CardResponse, Error>;

	/// Whether the underlying reader talks to the card over a contactless
	/// interface. Drives the ratification strategy at session close.
	fn is_contactless(&self) -> bool;

	/// The card's power-on data (ATR) as an uppercase hex string, when the
	/// reader exposes it. Selection falls back to it for cards that carry no
	/// application FCI.
	fn power_on_data(&self) -> Option<String> {
		None
	}
}
