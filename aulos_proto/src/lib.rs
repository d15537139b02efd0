#![no_std]
//! The binary message protocol spoken between media clients and servers.
//!
//! Every exchange, on the control channel (a byte stream) and on the audio
//! channel (datagrams) alike, is a [`Message`]: a fixed 12 byte header
//! followed by a tree of TLVs (tag-length-value nodes).
//!
//! ## Message kinds
//!
//! A message's [`MessageType`] is a base value combined with a class bit:
//!
//! - **Requests** carry a correlation id chosen by the sender.
//! - **Responses** carry the id of the request they answer, see
//!   [`Message::create_response`].
//! - **Indications** are unsolicited notifications, such as audio data or
//!   status updates.
//!
//! ## TLVs
//!
//! TLV payloads are integers, strings, binary blobs, or containers of further
//! TLVs. The [`Tag`] of a node determines how it is decoded, which lets the
//! decoder skip tags it doesn't know (see [`codec`]) so the protocol can be
//! extended without breaking older peers.
//!
//! The [`media`] module provides typed views of the structured containers
//! (tracks, albums, playlists...) and [`session`] the protocol enumerations and
//! version handshake.
//!
//! All types implement `serde`'s `Serialize` and `Deserialize`, for the user to
//! conveniently plug into other `serde` backends.

extern crate alloc;

pub mod codec;
pub mod media;
pub mod message;
pub mod session;
pub mod tlv;

pub use codec::DecodeError;
pub use message::{Class, HEADER_LEN, Header, Message, MessageType};
pub use tlv::{Tag, Tlv, TlvList, Value};
