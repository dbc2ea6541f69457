use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// The closed set of wire message ids.
///
/// Discriminants are part of the wire format and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum MsgId {
    // User traffic
    SessionEstablished = 1,
    UserMessage = 2,
    PeerHello = 3,
    /// Reserved; the one-friend-at-a-time flow uses [`MsgId::ShareFriend`].
    ShareContacts = 4,

    // Peer-to-peer delivery signaling
    AckMessageDelivered = 5,
    NackMessageNotDelivered = 6,

    // Client-relay identification handshake
    SchnorrCommit = 7,
    SchnorrChallenge = 8,
    SchnorrResponse = 9,

    // Client-relay API
    PeerLogin = 10,
    PeerLogout = 11,
    AddFriend = 12,
    RemoveFriend = 13,
    RequestLogoutNotif = 14,
    ActiveFriends = 15,
    ReplenishOneTimeKeysReq = 16,
    ReplenishOneTimeKeysResp = 17,
    GetOneTimeKeyReq = 18,
    GetOneTimeKeyResp = 19,
    AddBlacklist = 20,
    RemoveBlacklist = 21,
    ShareFriend = 22,
}

impl From<MsgId> for u16 {
    fn from(id: MsgId) -> Self {
        id as u16
    }
}

impl TryFrom<u16> for MsgId {
    type Error = ProtoError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::SessionEstablished,
            2 => Self::UserMessage,
            3 => Self::PeerHello,
            4 => Self::ShareContacts,
            5 => Self::AckMessageDelivered,
            6 => Self::NackMessageNotDelivered,
            7 => Self::SchnorrCommit,
            8 => Self::SchnorrChallenge,
            9 => Self::SchnorrResponse,
            10 => Self::PeerLogin,
            11 => Self::PeerLogout,
            12 => Self::AddFriend,
            13 => Self::RemoveFriend,
            14 => Self::RequestLogoutNotif,
            15 => Self::ActiveFriends,
            16 => Self::ReplenishOneTimeKeysReq,
            17 => Self::ReplenishOneTimeKeysResp,
            18 => Self::GetOneTimeKeyReq,
            19 => Self::GetOneTimeKeyResp,
            20 => Self::AddBlacklist,
            21 => Self::RemoveBlacklist,
            22 => Self::ShareFriend,
            other => return Err(ProtoError::UnknownMsgId(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminants_round_trip() {
        for raw in 1..=22u16 {
            let id = MsgId::try_from(raw).expect("closed set covers 1..=22");
            assert_eq!(u16::from(id), raw);
        }
    }

    #[test]
    fn unknown_id_is_rejected() {
        assert!(MsgId::try_from(0).is_err());
        assert!(MsgId::try_from(23).is_err());
        assert!(MsgId::try_from(u16::MAX).is_err());
    }
}
