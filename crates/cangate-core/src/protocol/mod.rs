//! Protocol module: frame assembly, tokenizing, and session state.

pub mod assembler;
pub mod session;
pub mod token;

pub use assembler::{Frame, FrameAssembler, FrameError, MAX_FRAME_BUFFER};
pub use session::{SessionState, Transition};
