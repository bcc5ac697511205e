//! Proxy engine
//!
//! This module provides:
//! - Request dispatch by method
//! - Plain-HTTP forwarding with transaction recording
//! - CONNECT tunnels relayed as opaque byte streams
//! - Metadata capture for recorded transactions
//! - Cancellation scopes shared by forwards and tunnels

pub mod extract;
pub mod forward;
pub mod handler;
pub mod scope;
pub mod server;
pub mod tunnel;


pub use forward::{HttpForwarder, ProxyBody};
pub use handler::ProxyHandler;
pub use scope::OperationScope;
pub use server::ProxyServer;
pub use tunnel::TunnelHandler;
