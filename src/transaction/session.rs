//! The secure-session state machine.
//!
//! The bookkeeping half of the session: which state the dialog is in, which
//! write access level it was opened for, whether encryption is on, and how
//! much of the card's modification buffer the queued commands have consumed.
//! The MAC itself lives in the symmetric crypto collaborator; the transaction
//! manager drives both in lockstep.

// Uses
use crate::{error::Error, security::WriteAccessLevel};

/// The session dialog states.
///
/// `QueuedOpen` and `Closing` cover the window between a `prepare_*` call and
/// the drain that actually plays it out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
	Idle,
	QueuedOpen,
	Open,
	Closing,
	Cancelled,
	Aborted,
}

/// The session bookkeeping value owned by the transaction manager.
#[derive(Debug)]
pub(crate) struct SecureSession {
	state: SessionState,
	write_access_level: Option<WriteAccessLevel>,
	extended: bool,
	encryption_active: bool,
	/// Session buffer consumed so far, in bytes or commands depending on the
	/// product.
	buffer_used: usize,
}

impl SecureSession {
	pub(crate) fn new() -> Self {
		Self {
			state: SessionState::Idle,
			write_access_level: None,
			extended: false,
			encryption_active: false,
			buffer_used: 0,
		}
	}

	pub(crate) fn state(&self) -> SessionState {
		self.state
	}

	pub(crate) fn write_access_level(&self) -> Option<WriteAccessLevel> {
		self.write_access_level
	}

	pub(crate) fn is_extended(&self) -> bool {
		self.extended
	}

	pub(crate) fn is_encryption_active(&self) -> bool {
		self.encryption_active
	}

	/// Whether a session is queued or running, i.e. whether session-scoped
	/// prepares are legal.
	pub(crate) fn is_session_engaged(&self) -> bool {
		matches!(self.state, SessionState::QueuedOpen | SessionState::Open)
	}

	// Prepare-time transitions

	/// `Idle -> QueuedOpen`. Opening twice is a state error.
	pub(crate) fn queue_open(
		&mut self,
		write_access_level: WriteAccessLevel,
		extended: bool,
	) -> Result<(), Error> {
		if self.is_session_engaged() || self.state == SessionState::Closing {
			return Err(Error::invalid_state(
				"a secure session is already open or queued",
			));
		}
		self.state = SessionState::QueuedOpen;
		self.write_access_level = Some(write_access_level);
		self.extended = extended;
		self.encryption_active = false;
		self.buffer_used = 0;

		Ok(())
	}

	/// `QueuedOpen | Open -> Closing`.
	pub(crate) fn queue_close(&mut self) -> Result<(), Error> {
		if !self.is_session_engaged() {
			return Err(Error::invalid_state("no secure session is open"));
		}
		self.state = SessionState::Closing;

		Ok(())
	}

	/// `any -> Cancelled`. Cancelling outside a session is legal:
	/// the abort APDU is then best-effort.
	pub(crate) fn queue_cancel(&mut self) {
		self.state = SessionState::Cancelled;
	}

	// Drain-time transitions

	/// The drain has played the Open Secure Session.
	pub(crate) fn on_opened(&mut self) {
		if self.state == SessionState::QueuedOpen {
			self.state = SessionState::Open;
		}
		self.buffer_used = 0;
	}

	/// The drain has validated the card MAC and the session is over.
	pub(crate) fn on_closed(&mut self) {
		self.state = SessionState::Idle;
		self.write_access_level = None;
		self.encryption_active = false;
		self.buffer_used = 0;
	}

	/// The drain has played the abort APDU (or given up on it).
	pub(crate) fn on_cancelled(&mut self) {
		self.state = SessionState::Idle;
		self.write_access_level = None;
		self.encryption_active = false;
		self.buffer_used = 0;
	}

	/// An error aborted the drain mid-session.
	pub(crate) fn on_aborted(&mut self) {
		self.state = SessionState::Aborted;
		self.encryption_active = false;
	}

	pub(crate) fn set_encryption_active(&mut self, active: bool) {
		self.encryption_active = active;
	}

	/// Accounts one modifying command against the session buffer. Returns
	/// `false` when the command does not fit and an atomic split (or an
	/// overflow error) is due.
	pub(crate) fn try_consume_buffer(&mut self, cost: usize, budget: usize) -> bool {
		if self.buffer_used + cost > budget {
			return false;
		}
		self.buffer_used += cost;

		true
	}
}
