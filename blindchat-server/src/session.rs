//! Session controller: routes inbound events through the repository,
//! matchmaking and relay, and answers with notices.
//!
//! Search, exit, exit-then-search and disconnect hold `pairing_lock` for
//! their whole read-decide-write sequence. Relaying a message does not take
//! the lock: its only write is the repository's atomic `check_pairing`.
//! State is always written before the related notices go out, and a failed
//! notice never rolls anything back.

use std::sync::Arc;

use blindchat_core::{
    transition, AccountId, IllegalTransition, MessageRef, Notice, ReplyTo, StatusEvent,
    UserStatus,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::command::ChatCommand;
use crate::matchmaking::couple;
use crate::relay::{self, resolve_partner, RelayOutcome};
use crate::repository::{CreateOutcome, RepositoryError, UserRepository};
use crate::transport::{InboundEvent, Transport, TransportError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("relay failed: {0}")]
    Transport(#[from] TransportError),
}

/// Result of a search request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    Paired(AccountId),
    /// Searching, nobody compatible yet.
    Waiting,
    AlreadySearching,
    AlreadyInChat,
}

/// Result of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Delivered; the id of the copy in the partner's chat.
    Relayed(MessageRef),
    NotInChat,
    StillSearching,
}

pub struct SessionController {
    repo: Arc<dyn UserRepository>,
    transport: Arc<dyn Transport>,
    admin_id: Option<AccountId>,
    pairing_lock: Mutex<()>,
}

impl SessionController {
    pub fn new(
        repo: Arc<dyn UserRepository>,
        transport: Arc<dyn Transport>,
        admin_id: Option<AccountId>,
    ) -> Self {
        Self {
            repo,
            transport,
            admin_id,
            pairing_lock: Mutex::new(()),
        }
    }

    /// Drop every session left over from a previous run.
    pub async fn recover(&self) -> Result<u64, SessionError> {
        let _guard = self.pairing_lock.lock().await;
        let reset = self.repo.reset_sessions().await?;
        info!("Reset {} stale session(s) on startup", reset);
        Ok(reset)
    }

    /// Dispatch one inbound event.
    pub async fn handle(&self, event: InboundEvent) -> Result<(), SessionError> {
        if event.is_disconnect() {
            return self.disconnect(event.user()).await;
        }

        match event {
            InboundEvent::Start { user } => {
                self.start(user).await?;
            }
            InboundEvent::Message {
                user,
                message,
                reply_to,
            } => {
                self.message(user, message, reply_to).await?;
            }
            InboundEvent::Command {
                user,
                message,
                command,
            } => self.command(user, message, command).await?,
            InboundEvent::MembershipChanged { user, old, new } => {
                debug!(
                    "Ignoring membership change {:?} -> {:?} for user {}",
                    old, new, user
                );
            }
        }
        Ok(())
    }

    async fn command(
        &self,
        user: AccountId,
        message: MessageRef,
        command: ChatCommand,
    ) -> Result<(), SessionError> {
        match command {
            ChatCommand::Start => {
                self.start(user).await?;
            }
            ChatCommand::Chat => {
                self.search(user, message).await?;
            }
            ChatCommand::Exit => {
                self.exit(user).await?;
            }
            ChatCommand::NewChat => {
                self.exit_then_search(user, message).await?;
            }
            ChatCommand::Stats => {
                self.stats(user).await?;
            }
            ChatCommand::Unknown(name) => {
                debug!("Unknown command /{} from user {}", name, user);
                self.ensure_user(user).await?;
                self.notify(user, Notice::UnknownCommand).await;
            }
        }
        Ok(())
    }

    /// Register the user if needed and send the welcome notice.
    pub async fn start(&self, user: AccountId) -> Result<CreateOutcome, SessionError> {
        let outcome = self.ensure_user(user).await?;
        self.notify(user, Notice::Welcome).await;
        Ok(outcome)
    }

    /// Look for a partner. `at` is the id of the request in the user's chat;
    /// replies to anything older are not threaded into the new chat.
    pub async fn search(
        &self,
        user: AccountId,
        at: MessageRef,
    ) -> Result<SearchOutcome, SessionError> {
        let _guard = self.pairing_lock.lock().await;
        self.search_locked(user, at).await
    }

    async fn search_locked(
        &self,
        user: AccountId,
        at: MessageRef,
    ) -> Result<SearchOutcome, SessionError> {
        self.ensure_user(user).await?;

        match self.repo.get_status(user).await? {
            UserStatus::InSearch => {
                self.notify(user, Notice::AlreadySearching).await;
                return Ok(SearchOutcome::AlreadySearching);
            }
            UserStatus::Coupled => {
                if resolve_partner(self.repo.as_ref(), user).await?.is_some() {
                    self.notify(user, Notice::AlreadyInChat).await;
                    return Ok(SearchOutcome::AlreadyInChat);
                }
                // Healed back to idle, search as usual.
            }
            UserStatus::PartnerLeft => {
                let idle = transition(UserStatus::PartnerLeft, StatusEvent::Acknowledged)?;
                self.repo.set_status(user, idle).await?;
            }
            UserStatus::Idle => {}
        }

        self.repo.begin_search(user, at).await?;
        info!("User {} started a search", user);
        self.notify(user, Notice::Searching).await;

        match couple(self.repo.as_ref(), user).await? {
            Some(partner) => {
                self.notify(user, Notice::Paired).await;
                self.notify(partner, Notice::Paired).await;
                Ok(SearchOutcome::Paired(partner))
            }
            None => {
                info!("User {} not paired yet, nobody else is searching", user);
                Ok(SearchOutcome::Waiting)
            }
        }
    }

    /// Relay a message to the sender's partner, or explain why not.
    pub async fn message(
        &self,
        user: AccountId,
        message: MessageRef,
        reply_to: Option<ReplyTo>,
    ) -> Result<MessageOutcome, SessionError> {
        self.ensure_user(user).await?;

        match relay::relay(self.repo.as_ref(), user, message, reply_to).await? {
            RelayOutcome::Forward(instruction) => {
                let copy = self.transport.forward(&instruction).await?;
                debug!(
                    "Relayed message {} from user {} to user {} as {}",
                    message, user, instruction.to, copy
                );
                Ok(MessageOutcome::Relayed(copy))
            }
            RelayOutcome::Rejected(notice) => {
                self.notify(user, notice).await;
                Ok(match notice {
                    Notice::NotDeliveredStillSearching => MessageOutcome::StillSearching,
                    _ => MessageOutcome::NotInChat,
                })
            }
        }
    }

    /// Leave the current chat. Returns whether there was one to leave.
    pub async fn exit(&self, user: AccountId) -> Result<bool, SessionError> {
        let _guard = self.pairing_lock.lock().await;
        self.ensure_user(user).await?;
        self.exit_locked(user).await
    }

    async fn exit_locked(&self, user: AccountId) -> Result<bool, SessionError> {
        let partner = match self.repo.get_status(user).await? {
            UserStatus::Coupled => resolve_partner(self.repo.as_ref(), user).await?,
            _ => None,
        };
        if partner.is_none() {
            self.notify(user, Notice::ExitWithoutChat).await;
            return Ok(false);
        }

        let Some(partner) = self.repo.end_pairing(user).await? else {
            self.notify(user, Notice::ExitWithoutChat).await;
            return Ok(false);
        };
        info!("User {} left the chat with user {}", user, partner);

        self.notify(user, Notice::EndingChat).await;
        self.notify(partner, Notice::PartnerLeft).await;
        self.notify(user, Notice::YouLeft).await;
        Ok(true)
    }

    /// Leave the current chat (if any) and search for a new partner.
    pub async fn exit_then_search(
        &self,
        user: AccountId,
        at: MessageRef,
    ) -> Result<SearchOutcome, SessionError> {
        let _guard = self.pairing_lock.lock().await;
        self.ensure_user(user).await?;

        match self.repo.get_status(user).await? {
            UserStatus::InSearch => {
                self.notify(user, Notice::AlreadySearching).await;
                return Ok(SearchOutcome::AlreadySearching);
            }
            UserStatus::Coupled => {
                self.exit_locked(user).await?;
            }
            UserStatus::Idle | UserStatus::PartnerLeft => {}
        }

        self.search_locked(user, at).await
    }

    /// The user left for good: release their partner and forget them.
    pub async fn disconnect(&self, user: AccountId) -> Result<(), SessionError> {
        let _guard = self.pairing_lock.lock().await;

        let Some(record) = self.repo.get(user).await? else {
            debug!("Disconnect from unknown user {}", user);
            return Ok(());
        };

        let abandoned = match record.partner {
            Some(partner) if record.status == UserStatus::Coupled => self
                .repo
                .get_partner(partner)
                .await?
                .filter(|back| *back == user)
                .map(|_| partner),
            _ => None,
        };

        self.repo.delete(user).await?;
        match abandoned {
            Some(partner) => {
                info!(
                    "User {} disconnected, user {} lost their partner",
                    user, partner
                );
                self.notify(partner, Notice::PartnerLeft).await;
            }
            None => info!("User {} disconnected while {}", user, record.status),
        }
        Ok(())
    }

    /// Usage counts, only for the configured admin.
    pub async fn stats(&self, user: AccountId) -> Result<Option<(u64, u64)>, SessionError> {
        self.ensure_user(user).await?;

        if self.admin_id != Some(user) {
            warn!("Unauthorized stats request from user {}", user);
            return Ok(None);
        }

        let active_users = self.repo.count_total().await?;
        let paired_users = self.repo.count_paired().await?;
        self.notify(
            user,
            Notice::AdminStats {
                active_users,
                paired_users,
            },
        )
        .await;
        Ok(Some((active_users, paired_users)))
    }

    async fn ensure_user(&self, user: AccountId) -> Result<CreateOutcome, SessionError> {
        let outcome = self.repo.create(user).await?;
        if outcome == CreateOutcome::Created {
            info!("Registered new user {}", user);
        }
        Ok(outcome)
    }

    async fn notify(&self, to: AccountId, notice: Notice) {
        if let Err(e) = self
            .transport
            .send_system_message(to, &notice.to_string())
            .await
        {
            warn!("Failed to deliver {:?} notice to user {}: {}", notice, to, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use blindchat_core::ReplyAuthor;

    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::transport::test_utils::{Delivery, RecordingTransport};
    use crate::transport::Membership;

    const A: AccountId = AccountId(1);
    const B: AccountId = AccountId(2);
    const C: AccountId = AccountId(3);
    const ADMIN: AccountId = AccountId(42);
    const AT: MessageRef = MessageRef(1);

    struct Harness {
        controller: SessionController,
        repo: Arc<InMemoryRepository>,
        transport: Arc<RecordingTransport>,
    }

    fn harness() -> Harness {
        let repo = Arc::new(InMemoryRepository::new());
        let transport = Arc::new(RecordingTransport::new());
        let controller = SessionController::new(repo.clone(), transport.clone(), Some(ADMIN));
        Harness {
            controller,
            repo,
            transport,
        }
    }

    fn texts(notices: &[Notice]) -> Vec<String> {
        notices.iter().map(Notice::to_string).collect()
    }

    async fn paired(h: &Harness) {
        h.controller.search(A, AT).await.unwrap();
        h.controller.search(B, AT).await.unwrap();
        h.transport.clear();
    }

    #[tokio::test]
    async fn test_search_alone_waits() {
        let h = harness();

        assert_eq!(h.controller.search(A, AT).await.unwrap(), SearchOutcome::Waiting);
        assert_eq!(h.repo.get_status(A).await.unwrap(), UserStatus::InSearch);
        assert_eq!(h.repo.get_partner(A).await.unwrap(), None);
        assert_eq!(h.transport.notices_to(A), texts(&[Notice::Searching]));
        assert_eq!(h.transport.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_second_searcher_pairs_with_first() {
        let h = harness();
        h.controller.search(A, AT).await.unwrap();

        assert_eq!(
            h.controller.search(B, AT).await.unwrap(),
            SearchOutcome::Paired(A)
        );
        assert_eq!(h.repo.get_status(A).await.unwrap(), UserStatus::Coupled);
        assert_eq!(h.repo.get_status(B).await.unwrap(), UserStatus::Coupled);
        assert_eq!(h.repo.get_partner(A).await.unwrap(), Some(B));
        assert_eq!(h.repo.get_partner(B).await.unwrap(), Some(A));
        assert_eq!(
            h.transport.notices_to(A),
            texts(&[Notice::Searching, Notice::Paired])
        );
        assert_eq!(
            h.transport.notices_to(B),
            texts(&[Notice::Searching, Notice::Paired])
        );
    }

    #[tokio::test]
    async fn test_repeated_search_is_rejected() {
        let h = harness();
        h.controller.search(A, AT).await.unwrap();
        h.transport.clear();

        assert_eq!(
            h.controller.search(A, AT).await.unwrap(),
            SearchOutcome::AlreadySearching
        );
        assert_eq!(h.transport.notices_to(A), texts(&[Notice::AlreadySearching]));

        paired(&h).await;
        assert_eq!(
            h.controller.search(A, AT).await.unwrap(),
            SearchOutcome::AlreadyInChat
        );
        assert_eq!(h.transport.notices_to(A), texts(&[Notice::AlreadyInChat]));
        assert_eq!(h.repo.get_partner(A).await.unwrap(), Some(B));
    }

    #[tokio::test]
    async fn test_exit_ends_chat_for_both() {
        let h = harness();
        paired(&h).await;

        assert!(h.controller.exit(A).await.unwrap());

        let a = h.repo.get(A).await.unwrap().unwrap();
        let b = h.repo.get(B).await.unwrap().unwrap();
        assert_eq!((a.status, a.partner), (UserStatus::Idle, None));
        assert_eq!((b.status, b.partner), (UserStatus::PartnerLeft, None));
        assert_eq!(
            h.transport.notices_to(A),
            texts(&[Notice::EndingChat, Notice::YouLeft])
        );
        assert_eq!(h.transport.notices_to(B), texts(&[Notice::PartnerLeft]));
    }

    #[tokio::test]
    async fn test_exit_without_chat_is_noop() {
        let h = harness();

        assert!(!h.controller.exit(A).await.unwrap());
        assert_eq!(h.repo.get_status(A).await.unwrap(), UserStatus::Idle);
        assert_eq!(h.transport.notices_to(A), texts(&[Notice::ExitWithoutChat]));

        h.controller.search(A, AT).await.unwrap();
        assert!(!h.controller.exit(A).await.unwrap());
        assert_eq!(h.repo.get_status(A).await.unwrap(), UserStatus::InSearch);
    }

    #[tokio::test]
    async fn test_partner_left_searches_in_one_step() {
        let h = harness();
        paired(&h).await;
        h.controller.exit(A).await.unwrap();

        assert_eq!(h.controller.search(B, AT).await.unwrap(), SearchOutcome::Waiting);
        assert_eq!(h.repo.get_status(B).await.unwrap(), UserStatus::InSearch);

        assert_eq!(
            h.controller.search(C, AT).await.unwrap(),
            SearchOutcome::Paired(B)
        );
    }

    #[tokio::test]
    async fn test_disconnect_while_coupled() {
        let h = harness();
        paired(&h).await;

        h.controller.disconnect(A).await.unwrap();

        assert_eq!(h.repo.get(A).await.unwrap(), None);
        let b = h.repo.get(B).await.unwrap().unwrap();
        assert_eq!((b.status, b.partner), (UserStatus::PartnerLeft, None));
        assert_eq!(h.transport.notices_to(B), texts(&[Notice::PartnerLeft]));
        assert!(h.transport.notices_to(A).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_while_searching_is_silent() {
        let h = harness();
        h.controller.search(A, AT).await.unwrap();
        h.transport.clear();

        h.controller.disconnect(A).await.unwrap();
        h.controller.disconnect(A).await.unwrap();

        assert_eq!(h.repo.get(A).await.unwrap(), None);
        assert!(h.transport.deliveries().is_empty());
        assert_eq!(h.repo.next_waiting(B).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_membership_events() {
        let h = harness();
        paired(&h).await;

        h.controller
            .handle(InboundEvent::MembershipChanged {
                user: A,
                old: Membership::Banned,
                new: Membership::Member,
            })
            .await
            .unwrap();
        assert_eq!(h.repo.get_status(A).await.unwrap(), UserStatus::Coupled);

        h.controller
            .handle(InboundEvent::MembershipChanged {
                user: A,
                old: Membership::Member,
                new: Membership::Banned,
            })
            .await
            .unwrap();
        assert_eq!(h.repo.get(A).await.unwrap(), None);
        assert_eq!(h.repo.get_status(B).await.unwrap(), UserStatus::PartnerLeft);
    }

    #[tokio::test]
    async fn test_message_routing_by_status() {
        let h = harness();

        assert_eq!(
            h.controller.message(A, MessageRef(1), None).await.unwrap(),
            MessageOutcome::NotInChat
        );
        h.controller.search(A, AT).await.unwrap();
        assert_eq!(
            h.controller.message(A, MessageRef(2), None).await.unwrap(),
            MessageOutcome::StillSearching
        );
        assert_eq!(
            h.transport.notices_to(A),
            texts(&[
                Notice::NotInChat,
                Notice::Searching,
                Notice::NotDeliveredStillSearching
            ])
        );

        h.controller.search(B, AT).await.unwrap();
        h.transport.clear();
        assert_eq!(
            h.controller.message(A, MessageRef(3), None).await.unwrap(),
            MessageOutcome::Relayed(MessageRef(4))
        );
        assert_eq!(
            h.transport.deliveries(),
            vec![Delivery::Copy {
                to: B,
                copy: MessageRef(4),
                reply_to: None,
                protected: true,
            }]
        );
        assert_eq!(h.transport.original_of(B, MessageRef(4)), Some((A, MessageRef(3))));
    }

    #[tokio::test]
    async fn test_reply_threads_land_on_the_right_copy() {
        let h = harness();
        paired(&h).await;

        for m in [1, 10, 500] {
            // A sends m, B sees it as m + 1.
            let copy = match h.controller.message(A, MessageRef(m), None).await.unwrap() {
                MessageOutcome::Relayed(copy) => copy,
                other => panic!("expected relay, got {other:?}"),
            };

            // B answers the copy: the reply lands on A's original.
            let reply = ReplyTo {
                message: copy,
                author: ReplyAuthor::Relay,
            };
            h.controller
                .message(B, MessageRef(copy.0 + 1), Some(reply))
                .await
                .unwrap();
            let (_, target) = *h.transport.copies_to(A).last().unwrap();
            assert_eq!(target, Some(MessageRef(m)));

            // A follows up on their own original: it lands on B's copy.
            let own = ReplyTo {
                message: MessageRef(m),
                author: ReplyAuthor::Account(A),
            };
            h.controller
                .message(A, MessageRef(m + 3), Some(own))
                .await
                .unwrap();
            let (_, target) = *h.transport.copies_to(B).last().unwrap();
            assert_eq!(target, Some(copy));
        }

        // A reply to a notice carries no thread.
        let notice = ReplyTo {
            message: MessageRef(7),
            author: ReplyAuthor::Unknown,
        };
        h.controller
            .message(A, MessageRef(900), Some(notice))
            .await
            .unwrap();
        assert_eq!(h.transport.copies_to(B).last().unwrap().1, None);
    }

    #[tokio::test]
    async fn test_reply_to_former_partners_copy_is_not_threaded() {
        let h = harness();
        paired(&h).await;

        // A's message shows up in B's chat as 11, then A leaves.
        assert_eq!(
            h.controller.message(A, MessageRef(10), None).await.unwrap(),
            MessageOutcome::Relayed(MessageRef(11))
        );
        h.controller.exit(A).await.unwrap();

        assert_eq!(
            h.controller.search(B, MessageRef(20)).await.unwrap(),
            SearchOutcome::Waiting
        );
        assert_eq!(
            h.controller.search(C, AT).await.unwrap(),
            SearchOutcome::Paired(B)
        );

        // B answers A's old copy: C must not get a thread into their own chat.
        let old_copy = ReplyTo {
            message: MessageRef(11),
            author: ReplyAuthor::Relay,
        };
        h.controller
            .message(B, MessageRef(30), Some(old_copy))
            .await
            .unwrap();
        assert_eq!(
            h.transport.copies_to(C).last().copied(),
            Some((MessageRef(31), None))
        );

        // Copies from the current chat still thread.
        assert_eq!(
            h.controller.message(C, MessageRef(40), None).await.unwrap(),
            MessageOutcome::Relayed(MessageRef(41))
        );
        let new_copy = ReplyTo {
            message: MessageRef(41),
            author: ReplyAuthor::Relay,
        };
        h.controller
            .message(B, MessageRef(42), Some(new_copy))
            .await
            .unwrap();
        assert_eq!(
            h.transport.copies_to(C).last().copied(),
            Some((MessageRef(43), Some(MessageRef(40))))
        );
    }

    #[tokio::test]
    async fn test_message_from_abandoned_user_keeps_their_status() {
        let h = harness();
        paired(&h).await;
        h.controller.exit(B).await.unwrap();
        h.controller.search(B, MessageRef(5)).await.unwrap();
        h.controller.search(C, AT).await.unwrap();
        h.transport.clear();

        assert_eq!(
            h.controller.message(A, MessageRef(7), None).await.unwrap(),
            MessageOutcome::NotInChat
        );
        assert_eq!(h.repo.get_status(A).await.unwrap(), UserStatus::PartnerLeft);
        assert_eq!(h.repo.get_partner(B).await.unwrap(), Some(C));
        assert_eq!(h.repo.get_partner(C).await.unwrap(), Some(B));
        assert_eq!(h.transport.notices_to(A), texts(&[Notice::NotInChat]));
        assert!(h.transport.notices_to(B).is_empty());
    }

    #[tokio::test]
    async fn test_newchat_switches_partner() {
        let h = harness();
        paired(&h).await;
        h.controller.search(C, AT).await.unwrap();

        assert_eq!(
            h.controller.exit_then_search(A, AT).await.unwrap(),
            SearchOutcome::Paired(C)
        );
        assert_eq!(h.repo.get_partner(A).await.unwrap(), Some(C));
        assert_eq!(h.repo.get_status(B).await.unwrap(), UserStatus::PartnerLeft);
        assert_eq!(h.repo.get_partner(B).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_newchat_while_searching() {
        let h = harness();
        h.controller.search(A, AT).await.unwrap();
        h.transport.clear();

        assert_eq!(
            h.controller.exit_then_search(A, AT).await.unwrap(),
            SearchOutcome::AlreadySearching
        );
        assert_eq!(h.transport.notices_to(A), texts(&[Notice::AlreadySearching]));
        assert_eq!(h.repo.get_status(A).await.unwrap(), UserStatus::InSearch);
    }

    #[tokio::test]
    async fn test_newchat_from_idle_just_searches() {
        let h = harness();

        assert_eq!(
            h.controller.exit_then_search(A, AT).await.unwrap(),
            SearchOutcome::Waiting
        );
        assert_eq!(h.transport.notices_to(A), texts(&[Notice::Searching]));
    }

    #[tokio::test]
    async fn test_stats_only_for_admin() {
        let h = harness();
        paired(&h).await;
        h.controller.search(C, AT).await.unwrap();
        h.transport.clear();

        assert_eq!(h.controller.stats(A).await.unwrap(), None);
        assert!(h.transport.deliveries().is_empty());

        assert_eq!(h.controller.stats(ADMIN).await.unwrap(), Some((4, 1)));
        assert_eq!(
            h.transport.notices_to(ADMIN),
            texts(&[Notice::AdminStats {
                active_users: 4,
                paired_users: 1
            }])
        );
    }

    #[tokio::test]
    async fn test_stats_disabled_without_admin() {
        let repo = Arc::new(InMemoryRepository::new());
        let transport = Arc::new(RecordingTransport::new());
        let controller = SessionController::new(repo, transport.clone(), None);

        assert_eq!(controller.stats(ADMIN).await.unwrap(), None);
        assert!(transport.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_unknown_command() {
        let h = harness();

        assert_eq!(h.controller.start(A).await.unwrap(), CreateOutcome::Created);
        assert_eq!(
            h.controller.start(A).await.unwrap(),
            CreateOutcome::AlreadyExists
        );
        h.controller
            .handle(InboundEvent::Command {
                user: A,
                message: MessageRef(2),
                command: ChatCommand::Unknown("help".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(
            h.transport.notices_to(A),
            texts(&[Notice::Welcome, Notice::Welcome, Notice::UnknownCommand])
        );
        assert_eq!(h.repo.count_total().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_partner_does_not_block_exit() {
        let h = harness();
        paired(&h).await;
        h.transport.make_unreachable(B);

        assert!(h.controller.exit(A).await.unwrap());
        assert_eq!(h.repo.get_status(B).await.unwrap(), UserStatus::PartnerLeft);
        assert!(h.transport.notices_to(B).is_empty());
    }

    #[tokio::test]
    async fn test_failed_relay_is_reported() {
        let h = harness();
        paired(&h).await;
        h.transport.make_unreachable(B);

        assert!(matches!(
            h.controller.message(A, MessageRef(1), None).await,
            Err(SessionError::Transport(_))
        ));
        assert_eq!(h.repo.get_partner(A).await.unwrap(), Some(B));
    }

    #[tokio::test]
    async fn test_recover_clears_sessions() {
        let h = harness();
        paired(&h).await;
        h.controller.search(C, AT).await.unwrap();

        assert_eq!(h.controller.recover().await.unwrap(), 3);
        for id in [A, B, C] {
            let record = h.repo.get(id).await.unwrap().unwrap();
            assert_eq!((record.status, record.partner), (UserStatus::Idle, None));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_searches_never_share_a_partner() {
        let h = Arc::new(harness());

        let mut handles = Vec::new();
        for id in 1..=16 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.controller.search(AccountId(id), AT).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Every search runs under the pairing lock, so all sixteen pair up.
        assert_eq!(h.repo.count_paired().await.unwrap(), 8);
        for id in 1..=16 {
            let partner = h.repo.get_partner(AccountId(id)).await.unwrap().unwrap();
            assert_eq!(
                h.repo.get_partner(partner).await.unwrap(),
                Some(AccountId(id))
            );
        }
    }
}
