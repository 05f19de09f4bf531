//! leased - lease store daemon
//!
//! Hosts a [`leasestore`] backend behind a single actor, runs the periodic
//! recovery loop, and serves workers over a Unix Domain Socket.
//!
//! # Modules
//!
//! - [`service`] - StoreManager actor owning the lease and entity components
//! - [`scanner`] - periodic recovery of expired leases
//! - [`ipc`] - JSON-over-newline socket protocol, listener and client
//! - [`daemon`] - startup, signal handling and shutdown
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod daemon;
pub mod ipc;
pub mod scanner;
pub mod service;

pub use config::Config;
pub use ipc::{ClientError, LeaseClient};
pub use service::{ServiceError, StoreManager};
