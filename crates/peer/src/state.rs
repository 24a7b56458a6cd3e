use strum::{AsRefStr, Display};

/// Lifecycle of one session inside the negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum NegotiationState {
    Idle,
    Readying,
    Offering,
    Answering,
    Negotiating,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Unset,
    Offerer,
    Answerer,
}

/// What the outside world sees of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Hangup,
    RemoteBye,
    Failed(String),
}
