//! # board-protocol
//!
//! Wire protocol definitions for the Board realtime message board.
//!
//! This crate defines what travels between browsers and the server:
//!
//! - [`Message`] - A persisted board message, as served by the history endpoint
//! - [`ClientFrame`] - Events sent by clients over the live channel
//! - [`ServerEvent`] - Events fanned out by the server to every live client
//!
//! Frames are JSON text by default. Clients that ask for it can use the
//! binary MessagePack encoding instead, see [`codec`].
//!
//! ## Example
//!
//! ```rust
//! use board_protocol::{codec, ClientFrame};
//!
//! let frame = codec::from_json::<ClientFrame>(r#"{"event":"send_message","data":{"text":"hi"}}"#).unwrap();
//! assert_eq!(frame, ClientFrame::send_message("hi"));
//! ```

pub mod codec;
pub mod frames;
pub mod message;

pub use codec::{ProtocolError, WireFormat};
pub use frames::{ClientFrame, DeletedMessage, SendMessage, ServerEvent};
pub use message::{Message, MessageId};
