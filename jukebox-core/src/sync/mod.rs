//! Sync Engine
//!
//! Wire types, framing and the state that host and peers keep consistent.

pub mod codec;
mod protocol;
mod state;

pub use codec::{decode_line, encode, read_frame};
pub use protocol::*;
pub use state::*;
