//! Application layer: the per-client session state machine and the per-mode
//! command handlers.

pub mod modes;
pub mod session;
