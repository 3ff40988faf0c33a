//! In-memory implementation of `UserRepository`.
//!
//! All state is held in memory and lost on restart. A single lock guards the
//! records and the waiting queue, so every operation, compound or not, is
//! one critical section.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use blindchat_core::{transition, AccountId, ActivePairing, MessageRef, StatusEvent, UserStatus};
use tokio::sync::RwLock;

use super::{
    CoupleOutcome, CreateOutcome, PairingCheck, RepositoryError, UserRecord, UserRepository,
};

#[derive(Debug, Clone, Copy)]
struct Entry {
    status: UserStatus,
    partner: Option<AccountId>,
    /// Position in the waiting queue while searching.
    search_seq: Option<u64>,
    /// Where the current (or next) pairing starts in this user's chat.
    thread_floor: Option<MessageRef>,
}

impl Entry {
    fn idle() -> Self {
        Self {
            status: UserStatus::Idle,
            partner: None,
            search_seq: None,
            thread_floor: None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<AccountId, Entry>,
    /// Searching users keyed by the order they started searching.
    waiting: BTreeMap<u64, AccountId>,
    next_seq: u64,
}

impl Inner {
    /// Write a status, keeping the waiting queue in step.
    fn write_status(&mut self, id: AccountId, status: UserStatus) {
        let Some(entry) = self.users.get_mut(&id) else {
            return;
        };

        match (entry.status, status) {
            (UserStatus::InSearch, UserStatus::InSearch) => {}
            (_, UserStatus::InSearch) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                entry.search_seq = Some(seq);
                self.waiting.insert(seq, id);
            }
            _ => {
                if let Some(seq) = entry.search_seq.take() {
                    self.waiting.remove(&seq);
                }
            }
        }
        entry.status = status;
    }

    fn is_available(&self, id: AccountId) -> bool {
        self.users
            .get(&id)
            .is_some_and(|e| e.status == UserStatus::InSearch && e.partner.is_none())
    }

    /// Whether `id` is recorded as `other`'s partner.
    fn points_to(&self, other: AccountId, id: AccountId) -> bool {
        self.users
            .get(&other)
            .is_some_and(|e| e.partner == Some(id))
    }

    /// Mark `partner` as abandoned by `leaver`, if it still points back.
    fn abandon(&mut self, partner: AccountId, leaver: AccountId) -> Result<(), RepositoryError> {
        if !self.points_to(partner, leaver) {
            return Ok(());
        }
        let status = self.users[&partner].status;
        let next = if status == UserStatus::Coupled {
            transition(status, StatusEvent::PartnerExited)?
        } else {
            status
        };
        if let Some(entry) = self.users.get_mut(&partner) {
            entry.partner = None;
        }
        self.write_status(partner, next);
        Ok(())
    }
}

/// In-memory user repository.
pub struct InMemoryRepository {
    inner: RwLock<Inner>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserRepository for InMemoryRepository {
    async fn create(&self, id: AccountId) -> Result<CreateOutcome, RepositoryError> {
        use std::collections::hash_map::Entry as MapEntry;

        let mut inner = self.inner.write().await;
        match inner.users.entry(id) {
            MapEntry::Occupied(_) => Ok(CreateOutcome::AlreadyExists),
            MapEntry::Vacant(slot) => {
                slot.insert(Entry::idle());
                Ok(CreateOutcome::Created)
            }
        }
    }

    async fn get(&self, id: AccountId) -> Result<Option<UserRecord>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.users.get(&id).map(|e| UserRecord {
            id,
            status: e.status,
            partner: e.partner,
        }))
    }

    async fn get_status(&self, id: AccountId) -> Result<UserStatus, RepositoryError> {
        let inner = self.inner.read().await;
        inner
            .users
            .get(&id)
            .map(|e| e.status)
            .ok_or(RepositoryError::NotFound(id))
    }

    async fn set_status(&self, id: AccountId, status: UserStatus) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        if !inner.users.contains_key(&id) {
            return Err(RepositoryError::NotFound(id));
        }
        inner.write_status(id, status);
        Ok(())
    }

    async fn begin_search(&self, id: AccountId, since: MessageRef) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        let status = inner
            .users
            .get(&id)
            .map(|e| e.status)
            .ok_or(RepositoryError::NotFound(id))?;

        let next = transition(status, StatusEvent::SearchRequested)?;
        inner.write_status(id, next);
        if let Some(entry) = inner.users.get_mut(&id) {
            entry.thread_floor = Some(since);
        }
        Ok(())
    }

    async fn check_pairing(&self, id: AccountId) -> Result<PairingCheck, RepositoryError> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.users.get(&id).copied() else {
            return Ok(PairingCheck::Unpaired);
        };

        match entry.partner {
            Some(partner)
                if entry.status == UserStatus::Coupled
                    && inner.users.get(&partner).is_some_and(|p| {
                        p.status == UserStatus::Coupled && p.partner == Some(id)
                    }) =>
            {
                return Ok(PairingCheck::Active(ActivePairing::new(
                    partner,
                    entry.thread_floor,
                )));
            }
            None if entry.status != UserStatus::Coupled => return Ok(PairingCheck::Unpaired),
            _ => {}
        }

        if let Some(partner) = entry.partner {
            inner.abandon(partner, id)?;
        }
        if let Some(e) = inner.users.get_mut(&id) {
            e.partner = None;
        }
        if entry.status == UserStatus::Coupled {
            let idle = transition(entry.status, StatusEvent::ExitRequested)?;
            inner.write_status(id, idle);
        }

        Ok(PairingCheck::Repaired(UserRecord {
            id,
            status: entry.status,
            partner: entry.partner,
        }))
    }

    async fn get_partner(&self, id: AccountId) -> Result<Option<AccountId>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.users.get(&id).and_then(|e| e.partner))
    }

    async fn set_pairing(&self, a: AccountId, b: AccountId) -> Result<(), RepositoryError> {
        if a == b {
            return Err(RepositoryError::SelfPairing(a));
        }

        let mut inner = self.inner.write().await;
        for (id, other) in [(a, b), (b, a)] {
            let entry = inner.users.get(&id).ok_or(RepositoryError::NotFound(id))?;
            if entry.partner.is_some_and(|p| p != other) {
                return Err(RepositoryError::AlreadyPaired(id));
            }
        }
        for (id, other) in [(a, b), (b, a)] {
            if let Some(entry) = inner.users.get_mut(&id) {
                entry.partner = Some(other);
            }
        }
        Ok(())
    }

    async fn clear_pairing(&self, id: AccountId) -> Result<Option<AccountId>, RepositoryError> {
        let mut inner = self.inner.write().await;
        let Some(partner) = inner.users.get_mut(&id).and_then(|e| e.partner.take()) else {
            return Ok(None);
        };
        if inner.points_to(partner, id) {
            if let Some(entry) = inner.users.get_mut(&partner) {
                entry.partner = None;
            }
        }
        Ok(Some(partner))
    }

    async fn delete(&self, id: AccountId) -> Result<Option<UserRecord>, RepositoryError> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.users.get(&id).copied() else {
            return Ok(None);
        };

        if let Some(partner) = entry.partner {
            inner.abandon(partner, id)?;
        }
        inner.write_status(id, UserStatus::Idle);
        inner.users.remove(&id);

        Ok(Some(UserRecord {
            id,
            status: entry.status,
            partner: entry.partner,
        }))
    }

    async fn count_total(&self) -> Result<u64, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.users.len() as u64)
    }

    async fn count_paired(&self) -> Result<u64, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .iter()
            .filter(|(id, e)| {
                e.status == UserStatus::Coupled && e.partner.is_some_and(|p| **id < p)
            })
            .count() as u64)
    }

    async fn next_waiting(&self, exclude: AccountId) -> Result<Option<AccountId>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.waiting.values().copied().find(|id| *id != exclude))
    }

    async fn try_couple(
        &self,
        requester: AccountId,
        candidate: AccountId,
    ) -> Result<CoupleOutcome, RepositoryError> {
        let mut inner = self.inner.write().await;

        if !inner.is_available(requester) {
            return Ok(CoupleOutcome::RequesterUnavailable);
        }
        if candidate == requester || !inner.is_available(candidate) {
            return Ok(CoupleOutcome::CandidateUnavailable);
        }

        let coupled = transition(UserStatus::InSearch, StatusEvent::Matched)?;
        for (id, other) in [(requester, candidate), (candidate, requester)] {
            if let Some(entry) = inner.users.get_mut(&id) {
                entry.partner = Some(other);
            }
            inner.write_status(id, coupled);
        }
        Ok(CoupleOutcome::Paired)
    }

    async fn end_pairing(&self, leaver: AccountId) -> Result<Option<AccountId>, RepositoryError> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.users.get(&leaver).copied() else {
            return Ok(None);
        };
        if entry.status != UserStatus::Coupled {
            return Ok(None);
        }

        let idle = transition(entry.status, StatusEvent::ExitRequested)?;
        if let Some(partner) = entry.partner {
            inner.abandon(partner, leaver)?;
        }
        if let Some(e) = inner.users.get_mut(&leaver) {
            e.partner = None;
        }
        inner.write_status(leaver, idle);

        Ok(entry.partner)
    }

    async fn reset_sessions(&self) -> Result<u64, RepositoryError> {
        let mut inner = self.inner.write().await;
        let mut changed = 0;
        for entry in inner.users.values_mut() {
            if entry.status != UserStatus::Idle || entry.partner.is_some() {
                changed += 1;
            }
            *entry = Entry::idle();
        }
        inner.waiting.clear();
        Ok(changed)
    }
}
