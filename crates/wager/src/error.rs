use crate::net::protocol::{EnvelopeError, MessageKind};
use crate::net::transport::TransportError;
use crate::session::model::{PhaseKind, Role};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("{kind} is not valid during {phase}")]
    UnexpectedMessage { kind: MessageKind, phase: PhaseKind },
    #[error("{kind} may not come from the {role}")]
    WrongRole { kind: MessageKind, role: Role },
    #[error("cannot {command} during {phase}")]
    InvalidCommand {
        command: &'static str,
        phase: PhaseKind,
    },
    #[error("only the {required} may {command}")]
    NotPermitted {
        command: &'static str,
        required: Role,
    },
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: PhaseKind, to: PhaseKind },
    #[error("invalid stake proposal: {0}")]
    InvalidStake(String),
    #[error("envelope addressed to session {0}")]
    SessionMismatch(String),
    #[error("dispute window closed")]
    DisputeWindowClosed,
    #[error("session is final")]
    Finalized,
    #[error("session has shut down")]
    SessionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchmakingError {
    #[error("already queued")]
    AlreadyQueued,
    #[error("already in session {0}")]
    AlreadyInSession(String),
    #[error("a match is waiting for a response")]
    MatchPending,
    #[error("no match is pending")]
    NoPendingMatch,
    #[error("invalid stake for {0} mode")]
    InvalidStake(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Matchmaking(#[from] MatchmakingError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("client has shut down")]
    Closed,
}
