//! Repository abstraction for user records.
//!
//! This module defines the `UserRepository` trait, the only shared mutable
//! resource of the service. Implementations provide the storage backend
//! (in-memory, SQLite). Compound operations (`try_couple`, `end_pairing`,
//! `delete`) must be atomic within a backend so that no identity is ever
//! the partner of two others at once.

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use blindchat_core::{AccountId, ActivePairing, IllegalTransition, MessageRef, UserStatus};
use thiserror::Error;

/// A stored user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRecord {
    pub id: AccountId,
    pub status: UserStatus,
    pub partner: Option<AccountId>,
}

impl UserRecord {
    pub fn new(id: AccountId) -> Self {
        Self {
            id,
            status: UserStatus::Idle,
            partner: None,
        }
    }
}

/// Result of `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Result of `try_couple`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoupleOutcome {
    /// Both users are now paired with each other and coupled.
    Paired,
    /// The requester is missing, not searching, or already paired.
    RequesterUnavailable,
    /// The candidate is missing, not searching, already paired, or the requester.
    CandidateUnavailable,
}

/// Result of `check_pairing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingCheck {
    /// Coupled with a partner that points back.
    Active(ActivePairing),
    /// Not coupled and no partner pointer (or unknown user).
    Unpaired,
    /// The pairing was inconsistent and has been cleared. Holds the record
    /// as it was before the repair.
    Repaired(UserRecord),
}

/// Errors returned by repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("user {0} not found")]
    NotFound(AccountId),

    #[error("user {0} is already paired")]
    AlreadyPaired(AccountId),

    #[error("user {0} cannot be paired with themselves")]
    SelfPairing(AccountId),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("storage failure during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("corrupt {what} in storage")]
    Corruption { what: String },
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption { what: what.into() }
    }
}

/// Storage contract for user records.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert a new idle user. Existing users are left untouched.
    async fn create(&self, id: AccountId) -> Result<CreateOutcome, RepositoryError>;

    /// Get a user's full record, returning None if not found.
    async fn get(&self, id: AccountId) -> Result<Option<UserRecord>, RepositoryError>;

    /// Get a user's status.
    ///
    /// Fails with `RepositoryError::NotFound` for unknown users.
    async fn get_status(&self, id: AccountId) -> Result<UserStatus, RepositoryError>;

    /// Overwrite a user's status.
    ///
    /// Entering `InSearch` puts the user at the back of the waiting queue;
    /// leaving it removes them from the queue. Pairing pointers are not touched.
    async fn set_status(&self, id: AccountId, status: UserStatus) -> Result<(), RepositoryError>;

    /// Start a search: apply `SearchRequested` to the current status and
    /// record `since`, the id of the request in the user's chat, as the
    /// start of whatever pairing this search produces.
    ///
    /// Fails with `RepositoryError::NotFound` for unknown users and with
    /// `RepositoryError::IllegalTransition` unless the user is idle or
    /// already searching.
    async fn begin_search(&self, id: AccountId, since: MessageRef) -> Result<(), RepositoryError>;

    /// Check `id`'s pairing and, in the same atomic step, repair it if it
    /// is inconsistent.
    ///
    /// A pairing is consistent when both sides are coupled and point at each
    /// other. Repair clears `id`'s pointer, releases a partner that still
    /// points back (a coupled one becomes `PartnerLeft`), and ends a coupled
    /// `id` through `ExitRequested`.
    async fn check_pairing(&self, id: AccountId) -> Result<PairingCheck, RepositoryError>;

    /// Get a user's partner pointer. Unknown users have no partner.
    async fn get_partner(&self, id: AccountId) -> Result<Option<AccountId>, RepositoryError>;

    /// Point `a` and `b` at each other. Statuses are not touched.
    async fn set_pairing(&self, a: AccountId, b: AccountId) -> Result<(), RepositoryError>;

    /// Clear `id`'s partner pointer and the partner's pointer back to `id`.
    ///
    /// Returns the former partner, if any.
    async fn clear_pairing(&self, id: AccountId) -> Result<Option<AccountId>, RepositoryError>;

    /// Remove a user permanently.
    ///
    /// If the user held a partner that points back, that partner becomes
    /// `PartnerLeft` with no partner. No-op for unknown users.
    async fn delete(&self, id: AccountId) -> Result<Option<UserRecord>, RepositoryError>;

    /// Number of known users.
    async fn count_total(&self) -> Result<u64, RepositoryError>;

    /// Number of active pairs, each pair counted once.
    async fn count_paired(&self) -> Result<u64, RepositoryError>;

    /// The searching user who started searching earliest, other than `exclude`.
    async fn next_waiting(&self, exclude: AccountId) -> Result<Option<AccountId>, RepositoryError>;

    /// Atomically pair two searching, unpaired users and mark both coupled.
    ///
    /// Nothing is mutated unless the outcome is `Paired`.
    async fn try_couple(
        &self,
        requester: AccountId,
        candidate: AccountId,
    ) -> Result<CoupleOutcome, RepositoryError>;

    /// Atomically end `leaver`'s chat: `leaver` becomes idle, the partner
    /// becomes `PartnerLeft`, and both pointers are cleared.
    ///
    /// Returns the former partner, or None (and mutates nothing) if
    /// `leaver` is not coupled.
    async fn end_pairing(&self, leaver: AccountId) -> Result<Option<AccountId>, RepositoryError>;

    /// Reset every user to idle and drop every pairing.
    ///
    /// Run at process start: sessions cannot outlive the transport context.
    /// Returns the number of records that changed.
    async fn reset_sessions(&self) -> Result<u64, RepositoryError>;
}
