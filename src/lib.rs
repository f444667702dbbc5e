//! Botgate - a multi-tenant front door for chat-bot gateways
//!
//! Every bot (tenant) gets its own gateway process, started lazily when the
//! first request for it arrives:
//! - The tenant registry (SQLite) records which bots exist
//! - A per-tenant supervisor finds, launches and health-checks the gateway,
//!   collapsing concurrent startups into one
//! - The proxy forwards HTTP and WebSocket traffic under `/bot/<id>/...`,
//!   injecting the tenant's gateway token
//! - A small JSON API manages bots, static files serve the chat UI

pub mod api;
pub mod assets;
pub mod config;
pub mod error;
pub mod forward;
pub mod launcher;
pub mod locator;
pub mod pool;
pub mod proxy;
pub mod readiness;
pub mod registry;
pub mod sandbox;
pub mod supervisor;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
