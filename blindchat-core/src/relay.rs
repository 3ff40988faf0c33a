//! Reply-thread remapping across the relay boundary.
//!
//! Every original message is delivered to the partner as exactly one new
//! copy, and the copy's id on the receiving side sits one position after
//! the original's id. A reply therefore has to be shifted to land on the
//! matching message in the other chat:
//! - replying to one's own message `m`: the partner's copy is `m + 1`
//! - replying to the partner's copy `c`: the partner's original is `c - 1`
//!
//! Only messages exchanged within the current pairing have a counterpart in
//! the partner's chat. Telegram shows the service as the author of every
//! copy, so a copy from a former partner looks just like one from the
//! current partner. Each pairing therefore carries `since`: the id, in the
//! sender's chat, of the search request that led to it. Anything older
//! belongs to an earlier pairing and is never threaded.

use crate::account::{AccountId, MessageRef};

/// Who authored the message being replied to, as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyAuthor {
    /// A message authored by this account.
    Account(AccountId),
    /// A relayed copy delivered by the service.
    Relay,
    /// A system notice or anything else that cannot be attributed.
    Unknown,
}

/// A reply reference on an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTo {
    pub message: MessageRef,
    pub author: ReplyAuthor,
}

/// Origin of a replied-to message relative to the current pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOrigin {
    /// The sender's own earlier message.
    OwnMessage,
    /// A message the current partner sent (received as a relayed copy).
    PartnerMessage,
    /// A notice, a message from a former partner, or something unknown.
    Unattributed,
}

/// One side of a live pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivePairing {
    pub partner: AccountId,
    /// First message id in this user's chat that can belong to the pairing.
    /// Unknown for pairings made without a recorded search request.
    pub since: Option<MessageRef>,
}

impl ActivePairing {
    pub fn new(partner: AccountId, since: Option<MessageRef>) -> Self {
        Self { partner, since }
    }

    /// Whether `message` was in the chat before this pairing began.
    pub fn predates(&self, message: MessageRef) -> bool {
        self.since.is_some_and(|since| message < since)
    }
}

/// Classify a reply against the current pairing.
pub fn classify_reply(sender: AccountId, pairing: &ActivePairing, reply: &ReplyTo) -> ReplyOrigin {
    if pairing.predates(reply.message) {
        return ReplyOrigin::Unattributed;
    }
    match reply.author {
        ReplyAuthor::Account(id) if id == sender => ReplyOrigin::OwnMessage,
        ReplyAuthor::Account(id) if id == pairing.partner => ReplyOrigin::PartnerMessage,
        ReplyAuthor::Relay => ReplyOrigin::PartnerMessage,
        ReplyAuthor::Account(_) | ReplyAuthor::Unknown => ReplyOrigin::Unattributed,
    }
}

/// The id, in the partner's chat, that a reply to `message` should thread onto.
///
/// Returns `None` when there is nothing safe to thread onto.
pub fn thread_target(origin: ReplyOrigin, message: MessageRef) -> Option<MessageRef> {
    let shifted = match origin {
        ReplyOrigin::OwnMessage => message.0.checked_add(1),
        ReplyOrigin::PartnerMessage => message.0.checked_sub(1),
        ReplyOrigin::Unattributed => None,
    }?;
    (shifted >= 1).then_some(MessageRef(shifted))
}

/// Instruction to deliver an anonymized copy of a message to the partner.
///
/// `source` is only used by the transport to locate the original; the
/// delivered copy carries no sender identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardInstruction {
    pub source: AccountId,
    pub to: AccountId,
    pub message: MessageRef,
    /// Ask the transport to prevent the copy from being forwarded or saved.
    pub protect_content: bool,
    pub reply_to: Option<MessageRef>,
}

/// Build the forward instruction for a message from `sender` to its partner.
pub fn forward_instruction(
    sender: AccountId,
    pairing: &ActivePairing,
    message: MessageRef,
    reply_to: Option<ReplyTo>,
) -> ForwardInstruction {
    let reply_to = reply_to.and_then(|reply| {
        thread_target(classify_reply(sender, pairing, &reply), reply.message)
    });

    ForwardInstruction {
        source: sender,
        to: pairing.partner,
        message,
        protect_content: true,
        reply_to,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALICE: AccountId = AccountId(1);
    const BOB: AccountId = AccountId(2);
    const CAROL: AccountId = AccountId(3);

    /// Alice's pairing with Bob, which began at message 3 in her chat.
    const WITH_BOB: ActivePairing = ActivePairing {
        partner: BOB,
        since: Some(MessageRef(3)),
    };

    fn reply(message: i32, author: ReplyAuthor) -> Option<ReplyTo> {
        Some(ReplyTo {
            message: MessageRef(message),
            author,
        })
    }

    #[test]
    fn test_plain_message_has_no_thread() {
        let instruction = forward_instruction(ALICE, &WITH_BOB, MessageRef(10), None);
        assert_eq!(instruction.to, BOB);
        assert_eq!(instruction.source, ALICE);
        assert_eq!(instruction.message, MessageRef(10));
        assert!(instruction.protect_content);
        assert_eq!(instruction.reply_to, None);
    }

    #[test]
    fn test_reply_to_own_message_shifts_forward() {
        let instruction =
            forward_instruction(ALICE, &WITH_BOB, MessageRef(12), reply(10, ReplyAuthor::Account(ALICE)));
        assert_eq!(instruction.reply_to, Some(MessageRef(11)));
    }

    #[test]
    fn test_reply_to_partner_message_shifts_back() {
        let instruction =
            forward_instruction(ALICE, &WITH_BOB, MessageRef(12), reply(11, ReplyAuthor::Account(BOB)));
        assert_eq!(instruction.reply_to, Some(MessageRef(10)));

        let instruction = forward_instruction(ALICE, &WITH_BOB, MessageRef(12), reply(11, ReplyAuthor::Relay));
        assert_eq!(instruction.reply_to, Some(MessageRef(10)));
    }

    #[test]
    fn test_reply_to_former_partner_is_dropped() {
        let instruction =
            forward_instruction(ALICE, &WITH_BOB, MessageRef(12), reply(5, ReplyAuthor::Account(CAROL)));
        assert_eq!(instruction.reply_to, None);
    }

    #[test]
    fn test_reply_to_copy_from_before_the_pairing_is_dropped() {
        // Bob used to chat with Alice; her copy landed as 11 in his chat.
        // He then searched again at 20 and got paired with Carol.
        let with_carol = ActivePairing::new(CAROL, Some(MessageRef(20)));

        let instruction =
            forward_instruction(BOB, &with_carol, MessageRef(40), reply(11, ReplyAuthor::Relay));
        assert_eq!(instruction.to, CAROL);
        assert_eq!(instruction.reply_to, None);

        // His own messages from that chat have no copy at Carol's either.
        let instruction =
            forward_instruction(BOB, &with_carol, MessageRef(41), reply(12, ReplyAuthor::Account(BOB)));
        assert_eq!(instruction.reply_to, None);

        // Copies from Carol arrive after the search request and still thread.
        let instruction =
            forward_instruction(BOB, &with_carol, MessageRef(42), reply(31, ReplyAuthor::Relay));
        assert_eq!(instruction.reply_to, Some(MessageRef(30)));
    }

    #[test]
    fn test_unknown_start_threads_everything() {
        let pairing = ActivePairing::new(BOB, None);
        assert!(!pairing.predates(MessageRef(1)));
        let instruction =
            forward_instruction(ALICE, &pairing, MessageRef(4), reply(2, ReplyAuthor::Relay));
        assert_eq!(instruction.reply_to, Some(MessageRef(1)));
    }

    #[test]
    fn test_reply_to_notice_is_dropped() {
        let instruction = forward_instruction(ALICE, &WITH_BOB, MessageRef(12), reply(5, ReplyAuthor::Unknown));
        assert_eq!(instruction.reply_to, None);
    }

    #[test]
    fn test_offsets_never_leave_valid_range() {
        assert_eq!(thread_target(ReplyOrigin::OwnMessage, MessageRef(i32::MAX)), None);
        assert_eq!(thread_target(ReplyOrigin::PartnerMessage, MessageRef(1)), None);
        assert_eq!(thread_target(ReplyOrigin::PartnerMessage, MessageRef(i32::MIN)), None);
        assert_eq!(thread_target(ReplyOrigin::PartnerMessage, MessageRef(2)), Some(MessageRef(1)));
    }

    proptest! {
        /// Property: a reply to a copy threads back onto the original.
        ///
        /// Alice sends `m`, Bob sees it as `m + 1`, Bob's reply to that copy
        /// must reach Alice threaded onto `m`.
        #[test]
        fn reply_to_copy_returns_to_original(m in 1i32..i32::MAX - 1) {
            let copy_in_bobs_chat = thread_target(ReplyOrigin::OwnMessage, MessageRef(m));
            prop_assert_eq!(copy_in_bobs_chat, Some(MessageRef(m + 1)));

            let with_alice = ActivePairing::new(ALICE, Some(MessageRef(1)));
            let back = forward_instruction(
                BOB,
                &with_alice,
                MessageRef(m + 2),
                reply(m + 1, ReplyAuthor::Relay),
            );
            prop_assert_eq!(back.reply_to, Some(MessageRef(m)));
        }

        /// Property: a thread target always points at a positive id.
        #[test]
        fn targets_are_positive(m in any::<i32>(), own in any::<bool>()) {
            let origin = if own { ReplyOrigin::OwnMessage } else { ReplyOrigin::PartnerMessage };
            if let Some(target) = thread_target(origin, MessageRef(m)) {
                prop_assert!(target.0 >= 1);
            }
        }
    }
}
