//! Per-connection session state machine.
//!
//! A connection starts with no bus attached and moves between the protocol
//! modes via dedicated switch frames. The switch frames are exact byte
//! matches — single spaces, lowercase — anything else is handled (or
//! rejected) by the current mode's command handler.

use std::fmt;

/// The mode a connection is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, greeted, no bus attached yet.
    NoBus,
    /// Raw frame relay: every bus frame goes to the client verbatim.
    Raw,
    /// Broadcast-manager style cyclic transmission and filtered receive.
    Bcm,
    /// ISO-TP (ISO 15765-2) segmented transfer.
    Isotp,
    /// Daemon control commands (statistics, liveness).
    Control,
    /// Session is ending; the connection loop exits.
    Shutdown,
}

impl SessionState {
    /// Short lowercase name used in logs and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::NoBus => "nobus",
            SessionState::Raw => "raw",
            SessionState::Bcm => "bcm",
            SessionState::Isotp => "isotp",
            SessionState::Control => "control",
            SessionState::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of offering a frame to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The frame was a switch into a different mode.
    Entered(SessionState),
    /// The frame named the mode the session is already in; accepted
    /// silently, no re-entry.
    Stayed,
    /// Not a mode-switch frame; the current mode's handler owns it.
    NotASwitch,
}

/// Maps an exact mode-switch frame to its target state.
///
/// Returns `None` for everything that is not one of the four switch frames.
pub fn mode_switch(frame: &[u8]) -> Option<SessionState> {
    match frame {
        b"< rawmode >" => Some(SessionState::Raw),
        b"< bcmmode >" => Some(SessionState::Bcm),
        b"< isotpmode >" => Some(SessionState::Isotp),
        b"< controlmode >" => Some(SessionState::Control),
        _ => None,
    }
}

/// Applies a frame to the current state.
///
/// Only an actual change yields [`Transition::Entered`]; switching to the
/// mode already active is a silent no-op so handlers are never re-entered.
pub fn apply(current: SessionState, frame: &[u8]) -> Transition {
    match mode_switch(frame) {
        Some(target) if target == current => Transition::Stayed,
        Some(target) => Transition::Entered(target),
        None => Transition::NotASwitch,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
