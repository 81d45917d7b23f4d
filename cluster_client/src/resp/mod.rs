//! The RESP (REdis Serialization Protocol) v2/v3 wire codec.
//!
//! A resumable buffer-and-cursor decoder, so a node connection can feed
//! it from non-blocking or partial socket reads instead of blocking on
//! a full frame.

pub mod decoder;
pub mod encoder;
pub mod token;

pub use decoder::{DecodeOutcome, Decoder, ParseError};
pub use encoder::{encode_command, encode_pipeline};
pub use token::Token;
