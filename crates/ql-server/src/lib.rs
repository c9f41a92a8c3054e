//! # QuickLaunch Server
//!
//! The HTTP RPC surface over the supervisor: app CRUD, port brokering,
//! lifecycle start/stop, installs, schedules, diagnostics, and the icon
//! endpoint. Handlers are stateless over the supervisor components;
//! config-document mutations are serialized by a single async lock.

pub mod api;
pub mod server;
pub mod types;

pub use api::{create_router, AppState};
pub use server::serve;
