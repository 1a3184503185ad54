//! Per-instance channel subresources.
//!
//! | Path suffix | Query              | Channel        |
//! |-------------|--------------------|----------------|
//! | `/vsock`    | `port`, `tls?`     | VSOCK          |
//! | `/console`  | none               | serial console |
//! | `/vnc`      | none               | VNC display    |
//!
//! The whole pipeline up to an opened device stream runs before the upgrade
//! is accepted, so lookup, validation and dial failures reach the client as
//! a status code with a `Status` body. After the upgrade the connection
//! carries raw binary frames.

use std::collections::HashMap;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    response::{IntoResponse, Response},
};
use tracing::{field, info_span, warn, Instrument};

use crate::channel;
use crate::error::TunnelError;
use crate::model::{ChannelKind, ChannelRequest};
use crate::state::AppState;

/// Subprotocol offered for raw byte tunnels.
pub const PLAIN_PROTOCOL: &str = "plain.kubevirt.io";

type InstancePath = Path<(String, String)>;
type RawQuery = Query<HashMap<String, String>>;

/// `GET …/virtualmachineinstances/{name}/vsock?port=<u32>&tls=<bool>`
pub async fn vsock(
    State(state): State<AppState>,
    Path((namespace, name)): InstancePath,
    Query(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    open(state, ChannelKind::Vsock, &namespace, &name, &query, ws).await
}

/// `GET …/virtualmachineinstances/{name}/console`
pub async fn console(
    State(state): State<AppState>,
    Path((namespace, name)): InstancePath,
    Query(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    open(state, ChannelKind::Console, &namespace, &name, &query, ws).await
}

/// `GET …/virtualmachineinstances/{name}/vnc`
pub async fn vnc(
    State(state): State<AppState>,
    Path((namespace, name)): InstancePath,
    Query(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    open(state, ChannelKind::Vnc, &namespace, &name, &query, ws).await
}

async fn open(
    state: AppState,
    kind: ChannelKind,
    namespace: &str,
    name: &str,
    query: &HashMap<String, String>,
    ws: WebSocketUpgrade,
) -> Response {
    let params = match channel::parse_params(query) {
        Ok(params) => params,
        Err(rejection) => return TunnelError::from(rejection).into_response(),
    };
    let request = ChannelRequest::new(namespace, name, kind, params);
    let span = info_span!(
        "tunnel",
        %kind,
        instance = %request.instance,
        session = field::Empty,
    );

    let session = match state
        .streamer
        .prepare(channel::for_kind(kind), request)
        .instrument(span.clone())
        .await
    {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };
    span.record("session", field::display(session.id));

    let streamer = state.streamer.clone();
    let cancel = state.shutdown.child_token();
    ws.protocols([PLAIN_PROTOCOL])
        .on_failed_upgrade(|e| warn!("WebSocket upgrade failed: {e}"))
        .on_upgrade(move |socket| {
            async move {
                // Outcome is logged by the streamer.
                let _ = streamer.stream(session, socket, cancel).await;
            }
            .instrument(span)
        })
}
