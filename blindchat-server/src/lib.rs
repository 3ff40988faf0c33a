pub mod command;
pub mod config;
pub mod matchmaking;
pub mod relay;
pub mod repository;
pub mod session;
pub mod telegram;
pub mod transport;

pub use repository::{InMemoryRepository, SqliteRepository, UserRepository};
pub use session::{SessionController, SessionError};
pub use transport::{InboundEvent, Transport, TransportError};
