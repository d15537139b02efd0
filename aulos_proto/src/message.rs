//! Messages: a fixed header followed by a list of TLVs.
//!
//! ```text
//! +-----------+-----------+-----------------+-------------------+
//! | type: u32 |  id: u32  | total_len: u32  | TLVs ...          |
//! +-----------+-----------+-----------------+-------------------+
//! ```
//!
//! All header fields are big-endian and `total_len` includes the header itself.

use crate::{
    codec::{self, Cursor, DecodeError},
    tlv::{Tag, Tlv, TlvList},
};
use alloc::vec::Vec;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Size of the message header.
pub const HEADER_LEN: usize = 12;

/// On-wire value of an unset correlation id.
pub const ID_UNSET: u32 = u32::MAX;

pub const REQ_BIT: u32 = 0;
pub const RSP_BIT: u32 = 0x8000_0000;
pub const IND_BIT: u32 = 0x4000_0000;

/// The three kinds of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Class {
    Request,
    Response,
    Indication,
}

macro_rules! message_types {
    ($($base:literal => { $($variant:ident = $bit:ident),+ $(,)? })*) => {
        impl MessageType {
            $($(
                pub const $variant: Self = Self($base | $bit);
            )+)*

            /// Returns the protocol name of this message type, if known.
            pub const fn name(self) -> Option<&'static str> {
                Some(match self {
                    $($(Self::$variant => stringify!($variant),)+)*
                    _ => return None,
                })
            }
        }
    };
}

/// A message type: a base value plus a [`RSP_BIT`] or [`IND_BIT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(pub u32);

message_types! {
    0x101 => { HELLO_REQ = REQ_BIT, HELLO_RSP = RSP_BIT }

    0x201 => { GET_PLAYLISTS_REQ = REQ_BIT, GET_PLAYLISTS_RSP = RSP_BIT }
    0x202 => { GET_TRACKS_REQ = REQ_BIT, GET_TRACKS_RSP = RSP_BIT }
    0x203 => { GET_IMAGE_REQ = REQ_BIT, GET_IMAGE_RSP = RSP_BIT }
    0x204 => { GENERIC_SEARCH_REQ = REQ_BIT, GENERIC_SEARCH_RSP = RSP_BIT }
    0x205 => { GET_ALBUM_REQ = REQ_BIT, GET_ALBUM_RSP = RSP_BIT }

    0x302 => { PLAY_REQ = REQ_BIT, PLAY_RSP = RSP_BIT }
    0x303 => { PLAY_CONTROL_REQ = REQ_BIT, PLAY_CONTROL_RSP = RSP_BIT }
    0x304 => { SET_VOLUME_REQ = REQ_BIT, SET_VOLUME_RSP = RSP_BIT }

    0x401 => { GET_STATUS_REQ = REQ_BIT, GET_STATUS_RSP = RSP_BIT, STATUS_IND = IND_BIT }

    0x1001 => { CREATE_AUDIO_ENDPOINT_REQ = REQ_BIT, CREATE_AUDIO_ENDPOINT_RSP = RSP_BIT }
    0x1002 => { DELETE_AUDIO_ENDPOINT_REQ = REQ_BIT, DELETE_AUDIO_ENDPOINT_RSP = RSP_BIT }
    0x1003 => { GET_AUDIO_ENDPOINTS_REQ = REQ_BIT, GET_AUDIO_ENDPOINTS_RSP = RSP_BIT }
    0x1004 => { AUDIO_ENDPOINTS_UPDATED_IND = IND_BIT }
    0x1021 => { ADD_AUDIO_ENDPOINTS_REQ = REQ_BIT, ADD_AUDIO_ENDPOINTS_RSP = RSP_BIT }
    0x1022 => { REM_AUDIO_ENDPOINTS_REQ = REQ_BIT, REM_AUDIO_ENDPOINTS_RSP = RSP_BIT }
    0x1024 => {
        GET_CURRENT_AUDIO_ENDPOINTS_REQ = REQ_BIT,
        GET_CURRENT_AUDIO_ENDPOINTS_RSP = RSP_BIT,
    }

    // audio data, sent over UDP
    0x1011 => { AUDIO_DATA_IND = IND_BIT }
    // clock synchronisation probes, sent over the audio socket
    0x1012 => { AUDIO_SYNC_REQ = REQ_BIT, AUDIO_SYNC_RSP = RSP_BIT }
}

impl MessageType {
    #[inline(always)]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The type with its class bits cleared.
    #[inline(always)]
    pub const fn base(self) -> u32 {
        self.0 & !(RSP_BIT | IND_BIT)
    }

    #[inline(always)]
    pub const fn class(self) -> Class {
        if self.0 & RSP_BIT != 0 {
            Class::Response
        } else if self.0 & IND_BIT != 0 {
            Class::Indication
        } else {
            Class::Request
        }
    }

    #[inline(always)]
    pub const fn is_request(self) -> bool {
        matches!(self.class(), Class::Request)
    }

    #[inline(always)]
    pub const fn is_response(self) -> bool {
        matches!(self.class(), Class::Response)
    }

    #[inline(always)]
    pub const fn is_indication(self) -> bool {
        matches!(self.class(), Class::Indication)
    }

    /// The response type matching this request type. `None` if `self` isn't a request.
    #[inline(always)]
    pub const fn response(self) -> Option<Self> {
        if self.is_request() {
            Some(Self(self.0 | RSP_BIT))
        } else {
            None
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

/// A decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    pub ty: MessageType,
    /// Raw correlation id, [`ID_UNSET`] if unset.
    pub id: u32,
    /// Total message length, header included.
    pub len: u32,
}

impl Header {
    #[inline(always)]
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Self {
        let mut cur = Cursor::new(bytes);
        // can't fail, the array holds exactly three u32s
        let mut next = || cur.read_u32().unwrap_or_default();
        Self {
            ty: MessageType(next()),
            id: next(),
            len: next(),
        }
    }

    /// Parses the header at the start of `bytes`, if there are enough of them.
    #[inline(always)]
    pub fn peek(bytes: &[u8]) -> Option<Self> {
        bytes.first_chunk().map(Self::parse)
    }

    #[inline(always)]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0; HEADER_LEN];
        out[0..4].copy_from_slice(&self.ty.get().to_be_bytes());
        out[4..8].copy_from_slice(&self.id.to_be_bytes());
        out[8..12].copy_from_slice(&self.len.to_be_bytes());
        out
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    ty: MessageType,
    id: Option<u32>,
    tlvs: Vec<Tlv>,
    #[serde(skip)]
    had_unknown_tlv: bool,
}

impl Message {
    /// Creates an empty message with no correlation id.
    #[inline(always)]
    pub const fn new(ty: MessageType) -> Self {
        Self {
            ty,
            id: None,
            tlvs: Vec::new(),
            had_unknown_tlv: false,
        }
    }

    #[inline(always)]
    pub fn with_id(mut self, id: u32) -> Self {
        self.set_id(Some(id));
        self
    }

    /// Appends a top-level TLV, builder style.
    #[inline(always)]
    pub fn with(mut self, tlv: Tlv) -> Self {
        self.tlvs.push(tlv);
        self
    }

    #[inline(always)]
    pub const fn ty(&self) -> MessageType {
        self.ty
    }

    #[inline(always)]
    pub const fn id(&self) -> Option<u32> {
        self.id
    }

    /// Sets the correlation id. [`ID_UNSET`] is treated as `None`.
    #[inline(always)]
    pub fn set_id(&mut self, id: Option<u32>) {
        self.id = id.filter(|&id| id != ID_UNSET);
    }

    #[inline(always)]
    pub fn tlvs(&self) -> &[Tlv] {
        &self.tlvs
    }

    #[inline(always)]
    pub fn tlvs_mut(&mut self) -> &mut Vec<Tlv> {
        &mut self.tlvs
    }

    #[inline(always)]
    pub fn into_tlvs(self) -> Vec<Tlv> {
        self.tlvs
    }

    #[inline(always)]
    pub fn push(&mut self, tlv: Tlv) {
        self.tlvs.push(tlv);
    }

    /// Shorthand for `self.tlvs().find(tag)`.
    #[inline(always)]
    pub fn get(&self, tag: Tag) -> Option<&Tlv> {
        self.tlvs.find(tag)
    }

    /// Whether unknown TLVs were skipped when this message was decoded.
    #[inline(always)]
    pub const fn had_unknown_tlv(&self) -> bool {
        self.had_unknown_tlv
    }

    /// Creates an empty response to this message, carrying the same id.
    ///
    /// Returns `None` if this message isn't a request.
    #[inline(always)]
    pub fn create_response(&self) -> Option<Self> {
        self.ty.response().map(|ty| Self {
            id: self.id,
            ..Self::new(ty)
        })
    }

    #[inline(always)]
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + codec::encoded_len(&self.tlvs)
    }

    /// Appends this message's encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&[0; HEADER_LEN]);
        codec::encode(&self.tlvs, out);

        let header = Header {
            ty: self.ty,
            id: self.id.unwrap_or(ID_UNSET),
            // messages are capped far below 4 GiB by the framer
            len: (out.len() - start) as u32,
        };
        out[start..start + HEADER_LEN].copy_from_slice(&header.to_bytes());
    }

    #[inline(always)]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Decodes a complete message. `bytes` must hold exactly one message.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let header = Header::peek(bytes).ok_or(DecodeError::Truncated {
            offset: 0,
            needed: HEADER_LEN,
            available: bytes.len(),
        })?;

        if u64::from(header.len) != bytes.len() as u64 {
            return Err(DecodeError::LengthMismatch {
                declared: header.len,
                actual: bytes.len(),
            });
        }

        let decoded = codec::decode(&bytes[HEADER_LEN..])?;

        let mut msg = Self::new(header.ty);
        msg.set_id(Some(header.id));
        msg.tlvs = decoded.tlvs;
        msg.had_unknown_tlv = decoded.had_unknown;

        Ok(msg)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ty)?;
        if let Some(id) = self.id {
            write!(f, " #{id}")?;
        }
        write!(f, " ({} tlvs)", self.tlvs.len())
    }
}
