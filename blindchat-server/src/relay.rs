//! Relay: decide where an inbound message goes.
//!
//! Only a coupled user with a resolvable partner gets a forward
//! instruction. Everyone else gets the notice matching their status. The
//! reply-thread arithmetic lives in `blindchat_core::relay`.

use blindchat_core::{
    forward_instruction, AccountId, ActivePairing, ForwardInstruction, MessageRef, Notice,
    ReplyTo, UserStatus,
};
use tracing::warn;

use crate::repository::{PairingCheck, RepositoryError, UserRepository};

/// What to do with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Forward(ForwardInstruction),
    Rejected(Notice),
}

/// Resolve `id`'s active pairing, healing an inconsistent one on the way.
///
/// The check and the repair are a single repository operation, so a
/// concurrent exit or match cannot be overwritten by a stale read.
pub async fn resolve_partner(
    repo: &dyn UserRepository,
    id: AccountId,
) -> Result<Option<ActivePairing>, RepositoryError> {
    match repo.check_pairing(id).await? {
        PairingCheck::Active(pairing) => Ok(Some(pairing)),
        PairingCheck::Unpaired => Ok(None),
        PairingCheck::Repaired(record) => {
            warn!(
                "Inconsistent pairing for user {} (status {}, partner {:?}), cleared it",
                id, record.status, record.partner
            );
            Ok(None)
        }
    }
}

/// The notice for a message that cannot be relayed.
pub fn rejection_notice(status: Option<UserStatus>) -> Notice {
    match status {
        Some(UserStatus::InSearch) => Notice::NotDeliveredStillSearching,
        Some(UserStatus::Idle | UserStatus::Coupled | UserStatus::PartnerLeft) | None => {
            Notice::NotInChat
        }
    }
}

/// Decide what happens to `message` sent by `sender`.
///
/// Never mutates status except to heal an inconsistent pairing.
pub async fn relay(
    repo: &dyn UserRepository,
    sender: AccountId,
    message: MessageRef,
    reply_to: Option<ReplyTo>,
) -> Result<RelayOutcome, RepositoryError> {
    if let Some(pairing) = resolve_partner(repo, sender).await? {
        return Ok(RelayOutcome::Forward(forward_instruction(
            sender, &pairing, message, reply_to,
        )));
    }

    let status = repo.get(sender).await?.map(|r| r.status);
    Ok(RelayOutcome::Rejected(rejection_notice(status)))
}
