mod chat_ws;
mod error;
mod federated_ws;
mod routes;
mod server;

pub use error::{ApiError, Result};
pub use server::{run_server, AppState};
