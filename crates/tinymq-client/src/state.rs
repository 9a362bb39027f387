//! Per-message progress state.
//!
//! Every in-flight exchange tracks where it stands in three independent
//! dimensions: reading bytes off the wire, writing bytes onto it, and
//! waiting for the correlated acknowledgment. Keeping the axes independent
//! is what lets one connection write one exchange while a different thread
//! reads another.

use crate::error::{ClientError, Result};

/// Progress states of one direction of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum MsgState {
    /// Fresh exchange, nothing consumed or produced.
    #[default]
    Begin,
    /// Fixed header not yet fully buffered.
    Wait,
    /// v5 authentication challenge/response in progress.
    Auth,
    /// Fixed and variable header complete.
    Header,
    /// Consuming or producing the payload.
    Payload,
    /// Payload continuation across further calls.
    Payload2,
    /// Response correlated; exchange complete.
    Ack,
}

/// Independent read/write/ack progress plus busy flags for one message
/// object.
///
/// Busy flags guard re-entrant use: a second `start_read` before
/// `finish_read` fails rather than corrupting buffer positions. A call the
/// transport could not satisfy leaves the recorded state untouched, so the
/// owner resumes where it stopped.
#[derive(Debug, Default)]
pub struct MsgStatus {
    pub read: MsgState,
    pub write: MsgState,
    pub ack: MsgState,
    read_active: bool,
    write_active: bool,
}

impl MsgStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the read side. Fails if another caller is mid-read.
    pub fn start_read(&mut self) -> Result<()> {
        if self.read_active {
            return Err(ClientError::Busy("message read already in progress"));
        }
        self.read_active = true;
        Ok(())
    }

    pub fn finish_read(&mut self) {
        self.read_active = false;
    }

    /// Claim the write side. Fails if another caller is mid-write.
    pub fn start_write(&mut self) -> Result<()> {
        if self.write_active {
            return Err(ClientError::Busy("message write already in progress"));
        }
        self.write_active = true;
        Ok(())
    }

    pub fn finish_write(&mut self) {
        self.write_active = false;
    }

    /// Advance read progress. Progress is monotonic within one exchange.
    pub fn advance_read(&mut self, next: MsgState) {
        debug_assert!(next >= self.read, "read state must not move backwards");
        self.read = next;
    }

    /// Advance write progress.
    pub fn advance_write(&mut self, next: MsgState) {
        debug_assert!(next >= self.write, "write state must not move backwards");
        self.write = next;
    }

    /// Advance ack progress.
    pub fn advance_ack(&mut self, next: MsgState) {
        debug_assert!(next >= self.ack, "ack state must not move backwards");
        self.ack = next;
    }

    /// Whether a read is partway through a packet.
    pub fn read_in_progress(&self) -> bool {
        self.read != MsgState::Begin
    }

    /// Return every axis to `Begin` for a fresh exchange. Only valid at
    /// exchange completion or on explicit caller reset.
    pub fn reset(&mut self) {
        self.read = MsgState::Begin;
        self.write = MsgState::Begin;
        self.ack = MsgState::Begin;
        self.read_active = false;
        self.write_active = false;
    }
}
