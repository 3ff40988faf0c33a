//! Domain rules for anonymous one-to-one chat pairing.
//!
//! This crate is pure: it knows nothing about storage or transports.
//! - **Identities**: who is talking (`AccountId`, `MessageRef`)
//! - **Status**: where a user is in the pairing lifecycle (`UserStatus`)
//! - **Transition**: the legal status changes, `(UserStatus, StatusEvent) -> UserStatus`
//! - **Relay**: how a reply thread survives the relay boundary
//! - **Notice**: the fixed set of informational replies

pub mod account;
pub mod notice;
pub mod relay;
pub mod status;
pub mod transition;

pub use account::*;
pub use notice::*;
pub use relay::*;
pub use status::*;
pub use transition::*;
