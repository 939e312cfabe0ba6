pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod invite;
pub mod manager;
pub mod media;
pub mod signaling;
pub mod state;
pub mod types;

mod session;

pub use auth::{AuthGuard, Identity};
pub use config::CallConfig;
pub use error::CallError;
pub use manager::CallManager;
pub use state::{CallInfo, CallState};
pub use types::SessionId;
