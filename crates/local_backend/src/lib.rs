//! The server binary's library: application state, the axum router for
//! the HTTP surface, and the remote write/read handlers.

pub mod api;
pub mod router;
pub mod snappy;
pub mod state;

pub use router::router;
pub use state::LocalAppState;
