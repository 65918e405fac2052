// iproto-common - Wire vocabulary and frame codec for the binary protocol
//
// This crate has no I/O: it only turns bytes into packets and back.

pub mod codec;
pub mod error;
pub mod protocol;
pub mod target;
pub mod types;

// Re-export for convenience
pub use codec::*;
pub use error::*;
pub use protocol::*;
pub use target::*;
pub use types::*;
