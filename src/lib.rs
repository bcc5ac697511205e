//! Proxytrail - Recording HTTP Forward Proxy
//!
//! An HTTP/1.1 forward proxy that records every plain-HTTP transaction it
//! forwards.
//!
//! ## Features
//!
//! - Absolute-form HTTP forwarding over fresh origin connections
//! - Request and response snapshots stored as JSON in SQLite
//! - Opaque CONNECT tunneling; tunnel traffic is never recorded
//! - Connect, request and tunnel timeouts with graceful shutdown

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod proxy;
pub mod repository;

pub use config::Config;
pub use database::Database;
pub use error::{Result, TrailError};
