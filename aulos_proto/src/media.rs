//! Typed views of the media containers exchanged in metadata messages.
//!
//! Conversion from TLVs is tolerant: missing children fall back to defaults,
//! unexpected ones are ignored. Conversion to TLVs is lossless, so
//! `Track::from_tlv(&track.to_tlv())` gives back `track`.

use crate::{
    message::Message,
    session::ImageFormat,
    tlv::{Tag, Tlv, TlvList},
};
use alloc::{string::String, vec::Vec};
use serde::{Deserialize, Serialize};

#[inline(always)]
fn string_of(children: &[Tlv], tag: Tag) -> String {
    children.str(tag).map(String::from).unwrap_or_default()
}

/// Common `NAME` + `LINK` pair of most media objects.
#[inline(always)]
fn named(tag: Tag, name: &str, link: &str) -> Tlv {
    Tlv::container(
        tag,
        [Tlv::string(Tag::LINK, link), Tlv::string(Tag::NAME, name)],
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub name: String,
    pub link: String,
}

impl Artist {
    pub fn from_tlv(tlv: &Tlv) -> Self {
        let c = tlv.children();
        Self {
            name: string_of(c, Tag::NAME),
            link: string_of(c, Tag::LINK),
        }
    }

    pub fn to_tlv(&self) -> Tlv {
        named(Tag::ARTIST, &self.name, &self.link)
    }
}

/// An album, as referenced from a track or returned by `GET_ALBUM`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub name: String,
    pub link: String,
    pub release_year: Option<u32>,
    pub review: Option<String>,
    pub is_available: Option<bool>,
    pub artist: Option<Artist>,
    pub tracks: Vec<Track>,
}

impl Album {
    pub fn from_tlv(tlv: &Tlv) -> Self {
        let c = tlv.children();
        Self {
            name: string_of(c, Tag::NAME),
            link: string_of(c, Tag::LINK),
            release_year: c.int(Tag::ALBUM_RELEASE_YEAR),
            review: c.str(Tag::ALBUM_REVIEW).map(String::from),
            is_available: c.int(Tag::IS_AVAILABLE).map(|v| v != 0),
            artist: c.find(Tag::ARTIST).map(Artist::from_tlv),
            tracks: c.find_all(Tag::TRACK).map(Track::from_tlv).collect(),
        }
    }

    pub fn to_tlv(&self) -> Tlv {
        let mut tlv = named(Tag::ALBUM, &self.name, &self.link);

        if let Some(children) = tlv.children_mut() {
            children.extend(
                self.release_year
                    .map(|y| Tlv::integer(Tag::ALBUM_RELEASE_YEAR, y)),
            );
            children.extend(self.review.as_deref().map(|r| Tlv::string(Tag::ALBUM_REVIEW, r)));
            children.extend(
                self.is_available
                    .map(|a| Tlv::integer(Tag::IS_AVAILABLE, a.into())),
            );
            children.extend(self.artist.as_ref().map(Artist::to_tlv));
            children.extend(self.tracks.iter().map(Track::to_tlv));
        }

        tlv
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    pub link: String,
    pub artists: Vec<Artist>,
    /// Only the name and link of the album are carried inside a track.
    pub album: Option<Artist>,
    pub duration_ms: u32,
    /// Position inside the playlist the track was fetched from.
    pub index: Option<u32>,
}

impl Track {
    pub fn from_tlv(tlv: &Tlv) -> Self {
        let c = tlv.children();
        Self {
            name: string_of(c, Tag::NAME),
            link: string_of(c, Tag::LINK),
            artists: c.find_all(Tag::ARTIST).map(Artist::from_tlv).collect(),
            album: c.find(Tag::ALBUM).map(Artist::from_tlv),
            duration_ms: c.int(Tag::TRACK_DURATION).unwrap_or(0),
            index: c.int(Tag::TRACK_INDEX),
        }
    }

    pub fn to_tlv(&self) -> Tlv {
        let mut tlv = named(Tag::TRACK, &self.name, &self.link);

        if let Some(children) = tlv.children_mut() {
            children.extend(self.artists.iter().map(Artist::to_tlv));
            children.extend(
                self.album
                    .as_ref()
                    .map(|a| named(Tag::ALBUM, &a.name, &a.link)),
            );
            children.push(Tlv::integer(Tag::TRACK_DURATION, self.duration_ms));
            children.extend(self.index.map(|i| Tlv::integer(Tag::TRACK_INDEX, i)));
        }

        tlv
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub name: String,
    pub link: String,
    pub tracks: Vec<Track>,
}

impl Playlist {
    pub fn from_tlv(tlv: &Tlv) -> Self {
        let c = tlv.children();
        Self {
            name: string_of(c, Tag::NAME),
            link: string_of(c, Tag::LINK),
            tracks: c.find_all(Tag::TRACK).map(Track::from_tlv).collect(),
        }
    }

    pub fn to_tlv(&self) -> Tlv {
        let mut tlv = named(Tag::PLAYLIST, &self.name, &self.link);
        if let Some(children) = tlv.children_mut() {
            children.extend(self.tracks.iter().map(Track::to_tlv));
        }
        tlv
    }
}

/// An entry of a [`Folder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FolderItem {
    Folder(Folder),
    Playlist(Playlist),
}

/// A tree of playlists, as returned by `GET_PLAYLISTS`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub name: String,
    pub items: Vec<FolderItem>,
}

impl Folder {
    pub fn from_tlv(tlv: &Tlv) -> Self {
        let c = tlv.children();
        Self {
            name: string_of(c, Tag::NAME),
            items: c
                .iter()
                .filter_map(|child| match child.tag {
                    Tag::FOLDER => Some(FolderItem::Folder(Self::from_tlv(child))),
                    Tag::PLAYLIST => Some(FolderItem::Playlist(Playlist::from_tlv(child))),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn to_tlv(&self) -> Tlv {
        Tlv::container(
            Tag::FOLDER,
            core::iter::once(Tlv::string(Tag::NAME, self.name.as_str())).chain(
                self.items.iter().map(|item| match item {
                    FolderItem::Folder(f) => f.to_tlv(),
                    FolderItem::Playlist(p) => p.to_tlv(),
                }),
            ),
        )
    }

    /// Depth-first search for a playlist by link.
    pub fn find_playlist(&self, link: &str) -> Option<&Playlist> {
        self.items.iter().find_map(|item| match item {
            FolderItem::Folder(f) => f.find_playlist(link),
            FolderItem::Playlist(p) => (p.link == link).then_some(p),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub format: ImageFormat,
    pub data: Vec<u8>,
}

impl Image {
    pub fn from_tlv(tlv: &Tlv) -> Self {
        let c = tlv.children();
        Self {
            format: c
                .int(Tag::IMAGE_FORMAT)
                .and_then(|f| ImageFormat::try_from(f).ok())
                .unwrap_or(ImageFormat::Unknown),
            data: c.bytes(Tag::IMAGE_DATA).map(Vec::from).unwrap_or_default(),
        }
    }

    pub fn to_tlv(&self) -> Tlv {
        Tlv::container(
            Tag::IMAGE,
            [
                Tlv::integer(Tag::IMAGE_FORMAT, self.format.into()),
                Tlv::binary(Tag::IMAGE_DATA, self.data.as_slice()),
            ],
        )
    }
}

/// Every top-level track of a message, in encoded order.
///
/// This is how `GET_TRACKS` and `GENERIC_SEARCH` responses carry their results.
pub fn tracks(msg: &Message) -> Vec<Track> {
    msg.tlvs().find_all(Tag::TRACK).map(Track::from_tlv).collect()
}
