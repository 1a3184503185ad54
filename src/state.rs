//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::metrics::ActiveSessions;
use crate::streamer::Streamer;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// The tunnel pipeline shared by every channel route.
    pub streamer: Arc<Streamer>,
    /// Active session gauges, also reachable through the streamer.
    pub sessions: ActiveSessions,
    /// Cancelled on server shutdown; every session token is a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, streamer: Streamer) -> Self {
        let sessions = streamer.sessions().clone();
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            streamer: Arc::new(streamer),
            sessions,
            shutdown: CancellationToken::new(),
        }
    }
}
