pub mod database;
pub mod repository;
pub mod schema;

pub use database::{Database, StorageError};
pub use repository::{
    FederatedSessionRepository, GatewayRepository, MessageRepository, SessionRepository,
};
