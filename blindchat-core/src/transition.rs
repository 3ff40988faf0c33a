//! The status state machine.
//!
//! `transition` is the single source of truth for which status changes are
//! legal. Every status change driven by an event goes through it first, both
//! in the session controller and in the compound storage operations
//! (`begin_search`, `try_couple`, `end_pairing`, `check_pairing`, `delete`),
//! so an illegal change is rejected before anything is mutated. The raw
//! `set_status` write is reserved for those callers and for tests.
//!
//! ```text
//!   Idle ──SearchRequested──▶ InSearch ──Matched──▶ Coupled
//!    ▲                        │    ▲                 │   │
//!    │                        └────┘                 │   │
//!    │                    SearchRequested            │   │
//!    ├───────────────ExitRequested───────────────────┘   │
//!    │                                          PartnerExited
//!    └──Acknowledged── PartnerLeft ◀─────────────────────┘
//! ```
//!
//! Deletion (permanent disconnect) is not a status: it removes the record.

use std::fmt;

use thiserror::Error;

use crate::status::UserStatus;

/// Things that can happen to a single user's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusEvent {
    /// The user asked to be paired.
    SearchRequested,
    /// Matchmaking paired the user with someone.
    Matched,
    /// The user ended their chat.
    ExitRequested,
    /// The user's partner ended the chat.
    PartnerExited,
    /// The user took note of their partner leaving (new search or exit).
    Acknowledged,
}

impl StatusEvent {
    pub const ALL: [StatusEvent; 5] = [
        StatusEvent::SearchRequested,
        StatusEvent::Matched,
        StatusEvent::ExitRequested,
        StatusEvent::PartnerExited,
        StatusEvent::Acknowledged,
    ];
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SearchRequested => "search_requested",
            Self::Matched => "matched",
            Self::ExitRequested => "exit_requested",
            Self::PartnerExited => "partner_exited",
            Self::Acknowledged => "acknowledged",
        };
        f.write_str(name)
    }
}

/// A status change outside the legal set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal transition: {event} while {from}")]
pub struct IllegalTransition {
    pub from: UserStatus,
    pub event: StatusEvent,
}

/// Compute the status that follows `event` in status `from`.
pub fn transition(from: UserStatus, event: StatusEvent) -> Result<UserStatus, IllegalTransition> {
    use StatusEvent::*;
    use UserStatus::*;

    match (from, event) {
        (Idle, SearchRequested) => Ok(InSearch),
        // Duplicate search: stays put, the caller tells the user.
        (InSearch, SearchRequested) => Ok(InSearch),
        (InSearch, Matched) => Ok(Coupled),
        (Coupled, ExitRequested) => Ok(Idle),
        (Coupled, PartnerExited) => Ok(PartnerLeft),
        (PartnerLeft, Acknowledged) => Ok(Idle),

        (Idle, Matched | ExitRequested | PartnerExited | Acknowledged)
        | (InSearch, ExitRequested | PartnerExited | Acknowledged)
        | (Coupled, SearchRequested | Matched | Acknowledged)
        | (PartnerLeft, SearchRequested | Matched | ExitRequested | PartnerExited) => {
            Err(IllegalTransition { from, event })
        }
    }
}

/// Apply a sequence of events, stopping at the first illegal one.
pub fn transition_all(
    from: UserStatus,
    events: impl IntoIterator<Item = StatusEvent>,
) -> Result<UserStatus, IllegalTransition> {
    events
        .into_iter()
        .try_fold(from, |status, event| transition(status, event))
}
