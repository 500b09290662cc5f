//! tunnelmux-core: shared protocol library for the tunnelmux edge and gateway.
//!
//! Provides the tunnel [`Message`] model, the length-prefixed framing codec,
//! and the common error type.

pub mod codec;
pub mod error;
pub mod message;

// Re-export commonly used items at crate root.
pub use codec::{frame_decode, frame_encode, read_frame, write_frame, MAX_FRAME_LEN};
pub use error::{TunnelError, TunnelResult};
pub use message::{Message, MessageClass, MessageType};
