//! Shared wire types for quill inter-process and peer messaging.
//!
//! This crate defines the protocol messages exchanged between the editor,
//! the controller, and the network layer, plus the line-oriented key/value
//! codec they all share. Every message is a single self-delimited line;
//! structured values (diff lists, vector clocks, site lists) travel as
//! JSON inside individual fields.

#![warn(missing_docs)]

pub mod codec;
pub mod paths;
pub mod types;

pub use codec::{FIELD_SEP, KEY_SEP, ProtoError, escape_text, unescape_text};
pub use types::*;
