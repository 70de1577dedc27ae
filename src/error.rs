//! # Error Surface
//!
//! One typed error covers the control plane and the connectors. Each
//! variant maps to a semantic kind string, an HTTP status for the REST
//! endpoints, and a message-catalog key for delivery on an already
//! upgraded WebSocket.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::i18n;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// The registry and the connector disagree about a session that was
    /// just created; the caller raced a teardown.
    #[error("cannot load session: {0}")]
    LoadSession(String),

    /// The upstream (relay or guacd) refused or dropped the connection
    /// attempt.
    #[error("cannot connect server: {0}")]
    ConnectServer(String),

    #[error("permission denied")]
    NoPerm,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// The semantic kind carried in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::InvalidSessionId(_) => "INVALID_SESSION_ID",
            Self::LoadSession(_) => "LOAD_SESSION",
            Self::ConnectServer(_) | Self::Ssh(_) | Self::Io(_) => "CONNECT_SERVER",
            Self::NoPerm => "NO_PERM",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Database(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) | Self::InvalidSessionId(_) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NoPerm => StatusCode::FORBIDDEN,
            Self::LoadSession(_)
            | Self::ConnectServer(_)
            | Self::Database(_)
            | Self::Ssh(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message-catalog key used when the error must be written onto
    /// a WebSocket instead of an HTTP response.
    pub fn message_key(&self) -> &'static str {
        match self {
            Self::InvalidSessionId(_) | Self::LoadSession(_) => i18n::MSG_INVALID_SESSION,
            Self::NoPerm => i18n::MSG_NO_PERMISSION,
            _ => i18n::MSG_CONNECT_FAILED,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "code": self.kind(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(
            GatewayError::InvalidSessionId("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayError::NoPerm.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::ConnectServer("refused".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::LoadSession("s1".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn connect_failures_share_one_kind() {
        assert_eq!(GatewayError::ConnectServer("x".into()).kind(), "CONNECT_SERVER");
        let io = GatewayError::Io(std::io::Error::other("refused"));
        assert_eq!(io.kind(), "CONNECT_SERVER");
    }
}
