//! Store access with actor pattern
//!
//! StoreManager owns the lease and entity components and processes commands
//! via channels, so every request from the socket, the recovery loop and the
//! CLI goes through one place.

mod manager;
mod messages;

pub use manager::StoreManager;
pub use messages::{ServiceError, ServiceResponse, StoreCommand};
