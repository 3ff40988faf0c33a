//! Informational replies sent by the service itself.
//!
//! Every user-facing outcome, including every failure, degrades to one of
//! these. None of them reveal anything about the partner.

use std::fmt;

/// Prefix carried by every notice, so users can tell them apart from relayed
/// messages.
pub const NOTICE_PREFIX: &str = "🤖";

/// A system notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Welcome,
    Searching,
    AlreadySearching,
    AlreadyInChat,
    Paired,
    /// A message was sent while not in a chat.
    NotInChat,
    /// An exit was requested while not in a chat.
    ExitWithoutChat,
    /// A message was sent while still searching.
    NotDeliveredStillSearching,
    EndingChat,
    YouLeft,
    PartnerLeft,
    UnknownCommand,
    AdminStats {
        active_users: u64,
        /// Active pairs; each pair counts once.
        paired_users: u64,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Welcome => write!(
                f,
                "{NOTICE_PREFIX} Welcome to this ChatBot!\nType /chat to start searching for a partner"
            ),
            Self::Searching => write!(f, "{NOTICE_PREFIX} Searching for a partner..."),
            Self::AlreadySearching => write!(f, "{NOTICE_PREFIX} You are already in search!"),
            Self::AlreadyInChat => write!(
                f,
                "{NOTICE_PREFIX} You are already in a chat, type /exit to leave it or /newchat to change partner."
            ),
            Self::Paired => write!(f, "{NOTICE_PREFIX} You have been paired with an user"),
            Self::NotInChat => write!(
                f,
                "{NOTICE_PREFIX} You are not in a chat, type /chat to start searching for a partner."
            ),
            Self::ExitWithoutChat => write!(f, "{NOTICE_PREFIX} You are not in a chat!"),
            Self::NotDeliveredStillSearching => write!(
                f,
                "{NOTICE_PREFIX} Message not delivered, you are still in search!"
            ),
            Self::EndingChat => write!(f, "{NOTICE_PREFIX} Ending chat..."),
            Self::YouLeft => write!(f, "{NOTICE_PREFIX} You have left the chat."),
            Self::PartnerLeft => write!(
                f,
                "{NOTICE_PREFIX} Your partner has left the chat, type /chat to start searching for a new partner."
            ),
            Self::UnknownCommand => write!(
                f,
                "{NOTICE_PREFIX} Unknown command. Available: /chat, /exit, /newchat"
            ),
            Self::AdminStats {
                active_users,
                paired_users,
            } => write!(
                f,
                "{NOTICE_PREFIX} Admin panel\nNumber of active users: {active_users}\nNumber of paired users: {paired_users}"
            ),
        }
    }
}

impl Notice {
    /// Whether a piece of text looks like one of our notices.
    pub fn is_notice_text(text: &str) -> bool {
        text.starts_with(NOTICE_PREFIX)
    }
}
