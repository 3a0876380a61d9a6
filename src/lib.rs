#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! bastion-relay library: the building blocks of the relay host.
//!
//! - `guacd` — Guacamole wire codec, guacd handshake and tunnel
//! - `sessions` — live session registry and observer fan-out
//! - `gateway` — SSH jump-host client and local port forwarders
//! - `terminal` — raw SSH shell transport
//! - `relay` — the per-connection relay loop
//! - `store` — session metadata, asset catalog and recorder collaborators
//! - `auth` — API key authentication middleware
//! - `config` — configuration loading
//! - `routes` — REST API route handlers
//! - `ws` — WebSocket upgrade handlers

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod guacd;
pub mod relay;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod store;
pub mod terminal;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use gateway::GatewayManager;
pub use sessions::Registry;
pub use state::AppState;
