//! Telegram adapter using teloxide long polling.
//!
//! Only private chats are served. Messages become `InboundEvent`s for the
//! session controller; copies go out with `copy_message`, which strips the
//! sender, and with content protection on.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use blindchat_core::{AccountId, ForwardInstruction, MessageRef, Notice, ReplyAuthor, ReplyTo};
use teloxide::prelude::*;
use teloxide::types::{ChatMemberKind, ChatMemberUpdated, MessageId, MessageKind, ReplyParameters};
use tracing::{debug, error, info, warn};

use crate::command::{parse_message, ChatCommand, ParseResult};
use crate::session::{SessionController, SessionError};
use crate::transport::{InboundEvent, Membership, Transport, TransportError};

// ============================================================================
// Outbound
// ============================================================================

/// `Transport` backed by the Telegram Bot API.
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send_system_message(&self, to: AccountId, text: &str) -> Result<(), TransportError> {
        self.bot
            .send_message(UserId(to.0), text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::new(to, e.to_string()))
    }

    async fn forward(&self, instruction: &ForwardInstruction) -> Result<MessageRef, TransportError> {
        let mut request = self
            .bot
            .copy_message(
                UserId(instruction.to.0),
                UserId(instruction.source.0),
                MessageId(instruction.message.0),
            )
            .protect_content(instruction.protect_content);

        // The target may be gone from the recipient's chat; deliver anyway.
        if let Some(target) = instruction.reply_to {
            request = request.reply_parameters(ReplyParameters {
                allow_sending_without_reply: Some(true),
                ..ReplyParameters::new(MessageId(target.0))
            });
        }

        let copy = request
            .await
            .map_err(|e| TransportError::new(instruction.to, e.to_string()))?;
        Ok(MessageRef(copy.0))
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Who the bot is, needed to read commands and reply authors.
#[derive(Debug, Clone)]
struct BotIdentity {
    id: UserId,
    username: Option<String>,
}

/// Attribute the author of a replied-to message.
///
/// Messages the bot sent are relayed copies unless they carry the notice
/// prefix.
fn classify_author(author: Option<UserId>, text: Option<&str>, bot_id: UserId) -> ReplyAuthor {
    match author {
        Some(id) if id == bot_id => {
            if text.is_some_and(Notice::is_notice_text) {
                ReplyAuthor::Unknown
            } else {
                ReplyAuthor::Relay
            }
        }
        Some(id) => ReplyAuthor::Account(AccountId(id.0)),
        None => ReplyAuthor::Unknown,
    }
}

/// Build the event for a private message.
fn message_event(
    user: AccountId,
    message: MessageRef,
    text: Option<&str>,
    reply_to: Option<ReplyTo>,
    bot_username: Option<&str>,
) -> InboundEvent {
    let parsed = text
        .map(|t| parse_message(t, bot_username))
        .unwrap_or(ParseResult::NotCommand);

    match parsed {
        ParseResult::Command(ChatCommand::Start) => InboundEvent::Start { user },
        ParseResult::Command(command) => InboundEvent::Command {
            user,
            message,
            command,
        },
        ParseResult::NotCommand => InboundEvent::Message {
            user,
            message,
            reply_to,
        },
    }
}

fn inbound_from_message(msg: &Message, identity: &BotIdentity) -> Option<InboundEvent> {
    if !msg.chat.is_private() {
        debug!("Ignoring message from non-private chat {}", msg.chat.id);
        return None;
    }
    // Service messages cannot be copied.
    if !matches!(msg.kind, MessageKind::Common(_)) {
        return None;
    }
    let sender = msg.from.as_ref()?;
    if sender.is_bot {
        return None;
    }

    let reply_to = msg.reply_to_message().map(|replied| ReplyTo {
        message: MessageRef(replied.id.0),
        author: classify_author(replied.from.as_ref().map(|u| u.id), replied.text(), identity.id),
    });

    Some(message_event(
        AccountId(sender.id.0),
        MessageRef(msg.id.0),
        msg.text(),
        reply_to,
        identity.username.as_deref(),
    ))
}

fn membership(kind: &ChatMemberKind) -> Membership {
    if kind.is_banned() {
        Membership::Banned
    } else if kind.is_member() {
        Membership::Member
    } else {
        Membership::Other
    }
}

fn inbound_from_member_update(update: &ChatMemberUpdated) -> Option<InboundEvent> {
    if !update.chat.is_private() {
        return None;
    }
    Some(InboundEvent::MembershipChanged {
        user: AccountId(update.from.id.0),
        old: membership(&update.old_chat_member.kind),
        new: membership(&update.new_chat_member.kind),
    })
}

async fn dispatch_event(controller: &SessionController, event: InboundEvent) {
    let user = event.user();
    match controller.handle(event).await {
        Ok(()) => {}
        Err(SessionError::Transport(e)) => {
            warn!("Failed to relay message from user {}: {}", user, e);
        }
        Err(e) => {
            error!("Failed to handle event from user {}: {}", user, e);
        }
    }
}

/// Serve updates until the process is interrupted.
pub async fn run(bot: Bot, controller: Arc<SessionController>) -> Result<()> {
    let me = bot
        .get_me()
        .await
        .context("Failed to fetch bot identity from Telegram")?;
    let identity = Arc::new(BotIdentity {
        id: me.user.id,
        username: me.user.username.clone(),
    });
    info!(
        "Serving Telegram updates as @{}",
        identity.username.as_deref().unwrap_or("<unnamed>")
    );

    let message_handler = Update::filter_message().endpoint({
        let controller = controller.clone();
        let identity = identity.clone();
        move |msg: Message| {
            let controller = controller.clone();
            let identity = identity.clone();
            async move {
                if let Some(event) = inbound_from_message(&msg, &identity) {
                    dispatch_event(&controller, event).await;
                }
                respond(())
            }
        }
    });

    let member_handler = Update::filter_my_chat_member().endpoint({
        let controller = controller.clone();
        move |update: ChatMemberUpdated| {
            let controller = controller.clone();
            async move {
                if let Some(event) = inbound_from_member_update(&update) {
                    dispatch_event(&controller, event).await;
                }
                respond(())
            }
        }
    });

    let handler = dptree::entry()
        .branch(message_handler)
        .branch(member_handler);

    Dispatcher::builder(bot, handler)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Telegram dispatcher stopped");
    Ok(())
}
