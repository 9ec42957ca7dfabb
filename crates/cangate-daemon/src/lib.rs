//! cangate daemon library: client session handling on top of the network,
//! bus and configuration infrastructure.
//!
//! The binary entry point lives in `main.rs`; everything else is organized
//! into `application` (session state machine and per-mode command handlers)
//! and `infrastructure` (listeners, CAN transports, beacon, statistics,
//! configuration).

pub mod application;
pub mod infrastructure;
