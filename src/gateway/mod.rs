//! Gateway server implementation

pub mod auth;
mod router;
mod server;
pub mod trace;

pub use auth::Authenticator;
pub use router::{AppState, create_router};
pub use server::Gateway;
