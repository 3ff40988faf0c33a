//! User status.
//!
//! A closed enumeration: an invalid status cannot be constructed, only
//! rejected while decoding persisted text.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Where a user currently is in the pairing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UserStatus {
    /// Known to the service, not searching and not in a chat.
    #[default]
    Idle,
    /// Waiting to be matched with another searching user.
    InSearch,
    /// Paired with exactly one partner.
    Coupled,
    /// The partner ended the chat; cleared on the user's next search or exit.
    PartnerLeft,
}

impl UserStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [UserStatus; 4] = [
        UserStatus::Idle,
        UserStatus::InSearch,
        UserStatus::Coupled,
        UserStatus::PartnerLeft,
    ];

    /// The persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InSearch => "in_search",
            Self::Coupled => "coupled",
            Self::PartnerLeft => "partner_left",
        }
    }

    /// Whether a user in this status must hold a partner pointer.
    pub fn requires_partner(&self) -> bool {
        matches!(self, Self::Coupled)
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted status string outside the defined set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid user status {0:?}")]
pub struct InvalidStatus(pub String);

impl FromStr for UserStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "in_search" => Ok(Self::InSearch),
            "coupled" => Ok(Self::Coupled),
            "partner_left" => Ok(Self::PartnerLeft),
            other => Err(InvalidStatus(other.to_string())),
        }
    }
}
