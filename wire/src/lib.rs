//! Length-prefixed message framing for msgsock.
//!
//! This crate delimits discrete messages within a continuous byte stream
//! using a fixed-size length prefix, and reassembles them from arbitrarily
//! sized read chunks.
//!
//! ## Wire format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32-le length        | payload byte count         |
//! +----------------------+----------------------------+
//! | payload              | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```
//!
//! Frames repeat back to back; there is no magic number and no version byte.
//!
//! ## Pieces
//!
//! - [`FramingBuffer`]: growable reassembly buffer owned by a socket's read
//!   loop. Stream chunks go in, complete messages come out in wire order.
//! - [`encode_frame`]: produce the `[length][payload]` bytes for one message.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod error;
pub mod frame;

pub use buffer::{FramingBuffer, DEFAULT_BUFFER_SIZE};
pub use error::WireError;
pub use frame::{declared_len, encode_frame, HEADER_SIZE};
