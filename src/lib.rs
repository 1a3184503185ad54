#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]

//! vmi-gateway library: device channel tunnels for virtual machine instances.
//!
//! - `model` — instance records, channel kinds and requests
//! - `store` — instance locator over the cluster API or an in-memory store
//! - `channel` — per-kind channel validation and dial parameters
//! - `agent` — node dialer speaking to the per-node agent
//! - `ws` — WebSocket ↔ byte stream adapter with keepalive
//! - `relay` — bidirectional copy with close-both-on-first-exit
//! - `metrics` — active session gauges with RAII release
//! - `streamer` — the generic tunnel pipeline
//! - `routes` — HTTP surface (health, sessions, subresources)
//! - `auth` — optional API key middleware
//! - `client` — client library bridging caller streams to a tunnel
//! - `config` — configuration loading

pub mod agent;
pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod relay;
pub mod routes;
pub mod state;
pub mod store;
pub mod streamer;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::TunnelError;
pub use metrics::ActiveSessions;
pub use state::AppState;
pub use streamer::Streamer;
