//! # cmdpipe-resp
//!
//! RESP wire framing for cmdpipe: a zero-copy request parser, reply
//! values that encode themselves, and an incremental reply reader.
//!
//! ```ignore
//! use cmdpipe_resp::{parse_next, Reply};
//!
//! let mut out = Vec::new();
//! while let Some(frame) = parse_next(&buf[pos..])? {
//!     pos += frame.consumed;
//!     Reply::pong().append_to(&mut out);
//! }
//! ```

pub mod error;
pub mod parse;
pub mod reply;
pub mod reader;

pub use error::ProtocolError;
pub use parse::{parse_next, Frame};
pub use reply::{
    append_array, append_bulk, append_command, append_error, append_int, append_null,
    append_ok, append_simple, Reply,
};
pub use reader::ReplyReader;
