use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumString};

/// Identifier of a call participant. Ordered lexicographically, which is what the
/// glare tie-break relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// Browser clients send numeric ids.
impl<'de> Deserialize<'de> for ParticipantId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Self(s),
            Raw::Signed(n) => Self(n.to_string()),
            Raw::Unsigned(n) => Self(n.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum SignalType {
    Ready,
    Offer,
    Answer,
    Candidate,
    Bye,
}

/// Network path descriptor carried by a `candidate` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self { candidate: candidate.into(), sdp_mid: None, sdp_mline_index: None }
    }
}

/// One relay frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Ready {
        id: ParticipantId,
    },
    Offer {
        id: ParticipantId,
        sdp: String,
    },
    Answer {
        id: ParticipantId,
        sdp: String,
    },
    Candidate {
        id: ParticipantId,
        candidate: String,
        #[serde(rename = "sdpMid", default)]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", default)]
        sdp_mline_index: Option<u16>,
    },
    Bye {
        id: ParticipantId,
    },
}

impl SignalMessage {
    pub fn candidate(id: ParticipantId, candidate: IceCandidate) -> Self {
        Self::Candidate {
            id,
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
        }
    }

    pub fn sender(&self) -> &ParticipantId {
        match self {
            Self::Ready { id }
            | Self::Offer { id, .. }
            | Self::Answer { id, .. }
            | Self::Candidate { id, .. }
            | Self::Bye { id } => id,
        }
    }

    pub fn signal_type(&self) -> SignalType {
        match self {
            Self::Ready { .. } => SignalType::Ready,
            Self::Offer { .. } => SignalType::Offer,
            Self::Answer { .. } => SignalType::Answer,
            Self::Candidate { .. } => SignalType::Candidate,
            Self::Bye { .. } => SignalType::Bye,
        }
    }

    pub fn ice_candidate(&self) -> Option<IceCandidate> {
        match self {
            Self::Candidate { candidate, sdp_mid, sdp_mline_index, .. } => Some(IceCandidate {
                candidate: candidate.clone(),
                sdp_mid: sdp_mid.clone(),
                sdp_mline_index: *sdp_mline_index,
            }),
            _ => None,
        }
    }
}
