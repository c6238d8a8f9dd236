//! Session status transitions.
//!
//! A session moves `waiting -> voting -> revealed -> voting (next round) -> revealed -> ...` and
//! never ends through a status; it is deleted when its host leaves. Everything here is pure so
//! the store can apply the result inside a single transaction.

use crate::model::SessionStatus;

/// Something a participant asks a session to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Start,
    Reveal,
    NextRound,
    Vote,
}

impl SessionAction {
    /// Host-only actions. Voting is open to every member.
    pub fn requires_host(self) -> bool {
        !matches!(self, Self::Vote)
    }
}

/// Status and round after an accepted action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub status: SessionStatus,
    pub round: i32,
}

/// Why an action was rejected. The messages are shown to clients as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Voting has already started")]
    AlreadyStarted,
    #[error("No active voting to reveal")]
    NothingToReveal,
    #[error("Cards must be revealed before starting next round")]
    NotRevealed,
    #[error("Voting is not currently active")]
    VotingNotActive,
}

/// Checks `action` against the current status and returns where the session ends up.
pub fn transition(
    status: SessionStatus,
    round: i32,
    action: SessionAction,
) -> Result<Transition, TransitionError> {
    use crate::model::SessionStatus::*;

    match (action, status) {
        (SessionAction::Start, Waiting) => Ok(Transition {
            status: Voting,
            round,
        }),
        (SessionAction::Start, _) => Err(TransitionError::AlreadyStarted),

        (SessionAction::Reveal, Voting) => Ok(Transition {
            status: Revealed,
            round,
        }),
        (SessionAction::Reveal, _) => Err(TransitionError::NothingToReveal),

        (SessionAction::NextRound, Revealed) => Ok(Transition {
            status: Voting,
            round: round + 1,
        }),
        (SessionAction::NextRound, _) => Err(TransitionError::NotRevealed),

        (SessionAction::Vote, Voting) => Ok(Transition {
            status: Voting,
            round,
        }),
        (SessionAction::Vote, _) => Err(TransitionError::VotingNotActive),
    }
}
