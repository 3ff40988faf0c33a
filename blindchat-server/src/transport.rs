//! Transport contract consumed by the session controller.
//!
//! The transport delivers notices and relayed copies; it knows nothing
//! about pairings. Inbound traffic arrives as `InboundEvent`s.

use async_trait::async_trait;
use blindchat_core::{AccountId, ForwardInstruction, MessageRef, ReplyTo};
use thiserror::Error;

use crate::command::ChatCommand;

/// A delivery failure reported by the transport.
#[derive(Debug, Error)]
#[error("delivery to {to} failed: {message}")]
pub struct TransportError {
    pub to: AccountId,
    pub message: String,
}

impl TransportError {
    pub fn new(to: AccountId, message: impl Into<String>) -> Self {
        Self {
            to,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a service notice to a user.
    async fn send_system_message(&self, to: AccountId, text: &str) -> Result<(), TransportError>;

    /// Deliver an anonymized copy of a message.
    ///
    /// Returns the id the copy received in the recipient's chat.
    async fn forward(&self, instruction: &ForwardInstruction) -> Result<MessageRef, TransportError>;
}

/// Membership of a user in their private chat with the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Member,
    /// The user blocked the service.
    Banned,
    Other,
}

/// Events delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// First contact (or a repeated `/start`).
    Start { user: AccountId },
    /// A text or attachment message that may be relayed.
    Message {
        user: AccountId,
        message: MessageRef,
        reply_to: Option<ReplyTo>,
    },
    Command {
        user: AccountId,
        /// The command message itself.
        message: MessageRef,
        command: ChatCommand,
    },
    MembershipChanged {
        user: AccountId,
        old: Membership,
        new: Membership,
    },
}

impl InboundEvent {
    pub fn user(&self) -> AccountId {
        match self {
            Self::Start { user }
            | Self::Message { user, .. }
            | Self::Command { user, .. }
            | Self::MembershipChanged { user, .. } => *user,
        }
    }

    /// Only a member blocking the service counts as a permanent disconnect.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::MembershipChanged {
                old: Membership::Member,
                new: Membership::Banned,
                ..
            }
        )
    }
}
