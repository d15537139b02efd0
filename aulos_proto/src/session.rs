//! Protocol-level enumerations and the `HELLO` version handshake.

use crate::{
    message::{Message, MessageType},
    tlv::{Tag, Tlv, TlvList},
};
use serde::{Deserialize, Serialize};

/// Increased when a change isn't backwards compatible.
pub const PROTOCOL_VERSION_MAJOR: u32 = 1;
/// Increased when messages or TLVs are added.
pub const PROTOCOL_VERSION_MINOR: u32 = 0;

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $val:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $val),+
        }

        impl TryFrom<u32> for $name {
            type Error = u32;

            #[inline(always)]
            fn try_from(v: u32) -> Result<Self, u32> {
                match v {
                    $($val => Ok(Self::$variant),)+
                    other => Err(other),
                }
            }
        }

        impl From<$name> for u32 {
            #[inline(always)]
            fn from(v: $name) -> u32 {
                v as u32
            }
        }
    };
}

wire_enum! {
    /// Carried in a `FAILURE` TLV of a response.
    FailureCause {
        General = 0x01,
        BadLogin = 0x11,
        ProtocolMismatch = 0x12,
        UnknownRequest = 0x21,
        MissingTlv = 0x22,
    }
}

wire_enum! {
    /// Carried in a `STATE` TLV.
    PlaybackState {
        Idle = 0,
        Playing = 1,
        Paused = 2,
    }
}

wire_enum! {
    /// Carried in a `PLAY_OPERATION` TLV.
    PlayOperation {
        Pause = 0,
        Resume = 1,
        Next = 2,
        Prev = 3,
    }
}

wire_enum! {
    /// Carried in an `IMAGE_FORMAT` TLV.
    ImageFormat {
        Unknown = 0,
        Jpeg = 1,
    }
}

/// Returns the failure cause carried by a response, if any.
///
/// Unknown causes are reported as [`FailureCause::General`].
#[inline(always)]
pub fn failure(msg: &Message) -> Option<FailureCause> {
    msg.tlvs()
        .int(Tag::FAILURE)
        .map(|v| FailureCause::try_from(v).unwrap_or(FailureCause::General))
}

/// Builds a `HELLO` request announcing this side's protocol version.
pub fn hello_request(username: &str, password: &str) -> Message {
    Message::new(MessageType::HELLO_REQ)
        .with(Tlv::integer(Tag::PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MAJOR))
        .with(Tlv::integer(Tag::PROTOCOL_VERSION_MINOR, PROTOCOL_VERSION_MINOR))
        .with(Tlv::string(Tag::LOGIN_USERNAME, username))
        .with(Tlv::string(Tag::LOGIN_PASSWORD, password))
}

/// The protocol version a peer announced in its `HELLO` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerVersion {
    pub major: u32,
    pub minor: u32,
}

/// Checks the protocol version of a `HELLO` request.
///
/// Peers differing only in their minor version are compatible, though some
/// functionality may be missing on one side.
pub fn check_hello(req: &Message) -> Result<PeerVersion, FailureCause> {
    let tlvs = req.tlvs();

    let (Some(major), Some(minor)) = (
        tlvs.int(Tag::PROTOCOL_VERSION_MAJOR),
        tlvs.int(Tag::PROTOCOL_VERSION_MINOR),
    ) else {
        return Err(FailureCause::MissingTlv);
    };

    if major != PROTOCOL_VERSION_MAJOR {
        return Err(FailureCause::ProtocolMismatch);
    }

    Ok(PeerVersion { major, minor })
}

/// Answers a `HELLO` request: an empty response on success, one carrying a
/// `FAILURE` TLV otherwise. Returns `None` if `req` isn't a request.
pub fn answer_hello(req: &Message) -> Option<Message> {
    let rsp = req.create_response()?;

    Some(match check_hello(req) {
        Ok(_) => rsp,
        Err(cause) => rsp.with(Tlv::integer(Tag::FAILURE, cause.into())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_handshake() {
        let req = hello_request("miles", "kind of blue").with_id(1);
        assert_eq!(check_hello(&req), Ok(PeerVersion { major: 1, minor: 0 }));

        let rsp = answer_hello(&req).unwrap();
        assert_eq!(rsp.ty(), MessageType::HELLO_RSP);
        assert_eq!(rsp.id(), Some(1));
        assert_eq!(failure(&rsp), None);
    }

    #[test]
    fn hello_failures() {
        let missing = Message::new(MessageType::HELLO_REQ)
            .with(Tlv::integer(Tag::PROTOCOL_VERSION_MAJOR, 1));
        assert_eq!(
            failure(&answer_hello(&missing).unwrap()),
            Some(FailureCause::MissingTlv)
        );

        let future = Message::new(MessageType::HELLO_REQ)
            .with(Tlv::integer(Tag::PROTOCOL_VERSION_MAJOR, 2))
            .with(Tlv::integer(Tag::PROTOCOL_VERSION_MINOR, 0));
        assert_eq!(check_hello(&future), Err(FailureCause::ProtocolMismatch));
    }

    #[test]
    fn enum_conversions() {
        assert_eq!(FailureCause::try_from(0x22), Ok(FailureCause::MissingTlv));
        assert_eq!(PlayOperation::try_from(9), Err(9));
        assert_eq!(u32::from(PlaybackState::Paused), 2);
        assert_eq!(ImageFormat::try_from(1), Ok(ImageFormat::Jpeg));

        let rsp = Message::new(MessageType::PLAY_RSP).with(Tlv::integer(Tag::FAILURE, 0x99));
        assert_eq!(failure(&rsp), Some(FailureCause::General));
    }
}
