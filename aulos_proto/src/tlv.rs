//! The tag-length-value tree carried as the payload of every message.
//!
//! A [`Tlv`] is either a leaf (integer, string or binary blob) or a container
//! holding an ordered list of children. The [`Tag`] of a node alone decides how
//! its payload is interpreted on the wire, see [`Tag::kind`].

use alloc::{string::String, vec::Vec};
use core::fmt;
use serde::{Deserialize, Serialize};

/// A 32-bit TLV tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub u32);

/// How the payload of a known tag is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Container,
    Integer,
    String,
    Binary,
}

impl Tag {
    /// The implicit container holding a message's top-level TLVs.
    ///
    /// It is never written on the wire: only its children are.
    pub const ROOT: Self = Self(0);

    // Containers
    pub const FOLDER: Self = Self(0x1);
    pub const PLAYLIST: Self = Self(0x2);
    pub const TRACK: Self = Self(0x3);
    pub const IMAGE: Self = Self(0x8);
    pub const ALBUM: Self = Self(0x9);
    pub const ARTIST: Self = Self(0xa);
    pub const CLIENT: Self = Self(0x21);

    // Track
    pub const TRACK_DURATION: Self = Self(0x304);
    pub const TRACK_INDEX: Self = Self(0x307);

    // Search
    pub const SEARCH_QUERY: Self = Self(0x401);

    // Status
    pub const STATE: Self = Self(0x501);
    pub const PROGRESS: Self = Self(0x502);

    // Playback control
    pub const PLAY_MODE: Self = Self(0x601);
    pub const VOLUME: Self = Self(0x602);
    pub const PLAY_OPERATION: Self = Self(0x603);
    pub const PLAY_MODE_SHUFFLE: Self = Self(0x604);
    pub const PLAY_MODE_REPEAT: Self = Self(0x605);

    // Generic data items
    pub const LINK: Self = Self(0x701);
    pub const NAME: Self = Self(0x702);
    pub const IP_ADDRESS: Self = Self(0x703);
    pub const PORT: Self = Self(0x704);

    // Image
    pub const IMAGE_FORMAT: Self = Self(0x801);
    pub const IMAGE_DATA: Self = Self(0x802);

    // Album metadata
    pub const ALBUM_RELEASE_YEAR: Self = Self(0x901);
    pub const ALBUM_REVIEW: Self = Self(0x902);
    pub const IS_AVAILABLE: Self = Self(0x903);

    // Session
    pub const LOGIN_USERNAME: Self = Self(0x1001);
    pub const LOGIN_PASSWORD: Self = Self(0x1002);
    pub const PROTOCOL_VERSION_MAJOR: Self = Self(0x1003);
    pub const PROTOCOL_VERSION_MINOR: Self = Self(0x1004);

    // Error handling
    pub const FAILURE: Self = Self(0x1101);

    // Audio data
    pub const AUDIO_DATA: Self = Self(0x2001);
    pub const AUDIO_CHANNELS: Self = Self(0x2002);
    pub const AUDIO_RATE: Self = Self(0x2003);
    pub const AUDIO_NOF_SAMPLES: Self = Self(0x2004);
    pub const AUDIO_TIMESTAMP: Self = Self(0x2005);
    pub const AUDIO_BUFFERED_SAMPLES: Self = Self(0x2006);
    pub const AUDIO_IV: Self = Self(0x2007);

    // Audio endpoints
    pub const AUDIO_EP_PROTOCOL: Self = Self(0x2102);

    // Clock synchronisation
    pub const CLIENT_CLOCK: Self = Self(0x2201);
    pub const SERVER_CLOCK: Self = Self(0x2202);

    /// Returns the raw tag value.
    #[inline(always)]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns how a TLV carrying this tag is decoded, or `None` for tags this
    /// implementation doesn't know about (which are skipped by the decoder).
    pub const fn kind(self) -> Option<Kind> {
        Some(match self {
            Self::FOLDER
            | Self::PLAYLIST
            | Self::TRACK
            | Self::IMAGE
            | Self::ALBUM
            | Self::ARTIST
            | Self::CLIENT => Kind::Container,

            Self::SEARCH_QUERY
            | Self::LINK
            | Self::NAME
            | Self::LOGIN_USERNAME
            | Self::LOGIN_PASSWORD
            | Self::IP_ADDRESS
            | Self::ALBUM_REVIEW => Kind::String,

            Self::STATE
            | Self::PROGRESS
            | Self::PLAY_MODE
            | Self::PLAY_OPERATION
            | Self::PLAY_MODE_SHUFFLE
            | Self::PLAY_MODE_REPEAT
            | Self::VOLUME
            | Self::PROTOCOL_VERSION_MAJOR
            | Self::PROTOCOL_VERSION_MINOR
            | Self::FAILURE
            | Self::TRACK_INDEX
            | Self::TRACK_DURATION
            | Self::AUDIO_CHANNELS
            | Self::AUDIO_RATE
            | Self::AUDIO_NOF_SAMPLES
            | Self::AUDIO_BUFFERED_SAMPLES
            | Self::AUDIO_TIMESTAMP
            | Self::CLIENT_CLOCK
            | Self::SERVER_CLOCK
            | Self::PORT
            | Self::AUDIO_EP_PROTOCOL
            | Self::ALBUM_RELEASE_YEAR
            | Self::IS_AVAILABLE
            | Self::IMAGE_FORMAT => Kind::Integer,

            Self::AUDIO_DATA | Self::IMAGE_DATA | Self::AUDIO_IV => Kind::Binary,

            _ => return None,
        })
    }

    /// Containers describing a single media object, which may carry at most
    /// one [`LINK`](Self::LINK).
    #[inline(always)]
    pub const fn has_unique_link(self) -> bool {
        matches!(
            self,
            Self::TRACK | Self::ALBUM | Self::ARTIST | Self::FOLDER | Self::PLAYLIST
        )
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// The payload of a TLV node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Integer(u32),
    /// Logically NUL-terminated. Anything after an interior NUL is lost on the wire.
    String(String),
    Binary(Vec<u8>),
    Container(Vec<Tlv>),
}

/// A single node of a TLV tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tlv {
    pub tag: Tag,
    pub value: Value,
}

impl Tlv {
    #[inline(always)]
    pub const fn new(tag: Tag, value: Value) -> Self {
        Self { tag, value }
    }

    #[inline(always)]
    pub const fn integer(tag: Tag, val: u32) -> Self {
        Self::new(tag, Value::Integer(val))
    }

    #[inline(always)]
    pub fn string(tag: Tag, val: impl Into<String>) -> Self {
        Self::new(tag, Value::String(val.into()))
    }

    #[inline(always)]
    pub fn binary(tag: Tag, val: impl Into<Vec<u8>>) -> Self {
        Self::new(tag, Value::Binary(val.into()))
    }

    #[inline(always)]
    pub fn container(tag: Tag, children: impl IntoIterator<Item = Tlv>) -> Self {
        Self::new(tag, Value::Container(children.into_iter().collect()))
    }

    #[inline(always)]
    pub const fn as_int(&self) -> Option<u32> {
        match self.value {
            Value::Integer(v) => Some(v),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.value {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Returns this node's children. Leaves have none.
    #[inline(always)]
    pub fn children(&self) -> &[Tlv] {
        match &self.value {
            Value::Container(c) => c,
            _ => &[],
        }
    }

    /// Returns a mutable handle to this node's children, if it is a container.
    #[inline(always)]
    pub fn children_mut(&mut self) -> Option<&mut Vec<Tlv>> {
        match &mut self.value {
            Value::Container(c) => Some(c),
            _ => None,
        }
    }

    /// Returns `true` if every node's value matches what its tag decodes to.
    ///
    /// Only well-formed trees survive an encode/decode round trip unchanged:
    /// unknown tags are skipped on decode and a mismatched leaf is
    /// reinterpreted according to its tag.
    pub fn is_well_formed(&self) -> bool {
        match (self.tag.kind(), &self.value) {
            (Some(Kind::Integer), Value::Integer(_)) | (Some(Kind::Binary), Value::Binary(_)) => {
                true
            }
            (Some(Kind::String), Value::String(s)) => !s.as_bytes().contains(&0),
            (Some(Kind::Container), Value::Container(c)) => {
                let links = c.iter().filter(|t| t.tag == Tag::LINK).count();
                (!self.tag.has_unique_link() || links <= 1) && c.iter().all(Self::is_well_formed)
            }
            _ => false,
        }
    }
}

/// Lookup helpers over a list of sibling TLVs.
///
/// Implemented for `[Tlv]` so both a message's top-level TLVs and a container's
/// [`children`](Tlv::children) can be searched the same way.
pub trait TlvList {
    /// Returns the first TLV with the given tag.
    fn find(&self, tag: Tag) -> Option<&Tlv>;

    /// Returns every TLV with the given tag, in encoded order.
    fn find_all(&self, tag: Tag) -> impl Iterator<Item = &Tlv>;

    #[inline(always)]
    fn int(&self, tag: Tag) -> Option<u32> {
        self.find(tag).and_then(Tlv::as_int)
    }

    #[inline(always)]
    fn str(&self, tag: Tag) -> Option<&str> {
        self.find(tag).and_then(Tlv::as_str)
    }

    #[inline(always)]
    fn bytes(&self, tag: Tag) -> Option<&[u8]> {
        self.find(tag).and_then(Tlv::as_bytes)
    }
}

impl TlvList for [Tlv] {
    #[inline(always)]
    fn find(&self, tag: Tag) -> Option<&Tlv> {
        self.iter().find(|t| t.tag == tag)
    }

    #[inline(always)]
    fn find_all(&self, tag: Tag) -> impl Iterator<Item = &Tlv> {
        self.iter().filter(move |t| t.tag == tag)
    }
}
