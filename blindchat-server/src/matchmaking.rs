//! Matchmaking: couple a searching user with the longest-waiting other one.
//!
//! Candidates are taken in FIFO order of search start. Each attempt is a
//! compare-and-swap in the repository (`try_couple`), so two concurrent
//! requesters can never both take the same candidate. Losing a race on a
//! candidate moves on to the next one, up to `MAX_COUPLE_ATTEMPTS`.

use blindchat_core::AccountId;
use tracing::{debug, info};

use crate::repository::{CoupleOutcome, RepositoryError, UserRepository};

/// Upper bound on candidates tried per call.
pub const MAX_COUPLE_ATTEMPTS: usize = 8;

/// Try to pair `requester` (who must already be searching).
///
/// Returns the new partner, or None if nobody compatible is waiting. On None
/// nothing was mutated: the requester stays searching and can be picked by a
/// later caller.
pub async fn couple(
    repo: &dyn UserRepository,
    requester: AccountId,
) -> Result<Option<AccountId>, RepositoryError> {
    for attempt in 1..=MAX_COUPLE_ATTEMPTS {
        let Some(candidate) = repo.next_waiting(requester).await? else {
            return Ok(None);
        };

        match repo.try_couple(requester, candidate).await? {
            CoupleOutcome::Paired => {
                info!("Paired user {} with user {}", requester, candidate);
                return Ok(Some(candidate));
            }
            CoupleOutcome::RequesterUnavailable => {
                debug!("User {} is no longer available for pairing", requester);
                return Ok(None);
            }
            CoupleOutcome::CandidateUnavailable => {
                debug!(
                    "Candidate {} for user {} was taken (attempt {})",
                    candidate, requester, attempt
                );
            }
        }
    }

    Ok(None)
}
