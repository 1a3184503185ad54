//! Errors surfaced to tunnel clients before the connection is upgraded.
//!
//! Every variant maps to one HTTP status and renders as a Kubernetes `Status`
//! object, the shape cluster API clients already know how to decode:
//!
//! | Variant    | Status | Meaning                                         |
//! |------------|--------|-------------------------------------------------|
//! | `NotFound` | 404    | instance does not exist (or was deleted)        |
//! | `Rejected` | 400    | channel not attached, bad parameter, not running|
//! | `Store`    | 500    | cluster state could not be read                 |
//! | `Dial`     | 502    | node agent or device unreachable                |

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::agent::DialError;
use crate::model::InstanceRef;
use crate::store::StoreError;

/// Machine-distinguishable reason for a rejected channel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    NotAttached,
    InvalidParameter,
    NotRunning,
}

impl RejectionKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotAttached => "ChannelNotAttached",
            Self::InvalidParameter => "InvalidParameter",
            Self::NotRunning => "InstanceNotRunning",
        }
    }
}

/// A client-caused refusal. The message is shown to the client verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Rejection {
    pub kind: RejectionKind,
    pub message: String,
}

impl Rejection {
    pub fn not_attached(message: impl Into<String>) -> Self {
        Self {
            kind: RejectionKind::NotAttached,
            message: message.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self {
            kind: RejectionKind::InvalidParameter,
            message: message.into(),
        }
    }

    pub fn not_running(message: impl Into<String>) -> Self {
        Self {
            kind: RejectionKind::NotRunning,
            message: message.into(),
        }
    }
}

/// Failure to establish a tunnel session.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("virtualmachineinstance.kubevirt.io \"{}\" not found", .0.name)]
    NotFound(InstanceRef),
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("failed to fetch virtualmachineinstance {instance}: {source}")]
    Store {
        instance: InstanceRef,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Dial(#[from] DialError),
}

impl TunnelError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Rejected(_) => StatusCode::BAD_REQUEST,
            Self::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Dial(_) => StatusCode::BAD_GATEWAY,
        }
    }

    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::Rejected(_) => "BadRequest",
            Self::Store { .. } => "InternalError",
            Self::Dial(_) => "BadGateway",
        }
    }
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": self.to_string(),
            "reason": self.reason(),
            "code": status.as_u16(),
        });
        match &self {
            Self::NotFound(instance) | Self::Store { instance, .. } => {
                body["details"] = json!({
                    "name": instance.name,
                    "group": "kubevirt.io",
                    "kind": "virtualmachineinstances",
                });
            }
            Self::Rejected(rejection) => {
                body["details"] = json!({
                    "causes": [{"reason": rejection.kind.as_str(), "message": rejection.message}],
                });
            }
            Self::Dial(_) => {}
        }
        (status, Json(body)).into_response()
    }
}
