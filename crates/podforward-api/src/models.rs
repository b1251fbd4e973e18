use axum::{http::StatusCode, Json};
use podforward_session::{SessionError, SessionView};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Remote port used when a request does not name one
pub const DEFAULT_REMOTE_PORT: u32 = 8080;

fn default_remote_port() -> u32 {
    DEFAULT_REMOTE_PORT
}

/// Query string of the browser-facing forward endpoint
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ForwardQuery {
    /// Namespace of the pod
    pub namespace: Option<String>,
    /// Pod name
    pub pod: Option<String>,
    /// Port on the pod (default: 8080)
    #[serde(default = "default_remote_port")]
    pub port: u32,
}

/// Request to start a port-forward
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StartForwardRequest {
    /// Namespace of the pod
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Port on the pod (default: 8080)
    #[serde(default = "default_remote_port")]
    pub port: u32,
}

/// Every tracked port-forward
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ForwardList {
    /// Live sessions and recently ended ones still within their grace period
    pub active_forwards: Vec<SessionView>,
    /// Total count
    pub total: usize,
}

/// Result of a stop request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StopResponse {
    pub status: String,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Sessions that are starting, active or stopping
    pub active_forwards: usize,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, error: impl Into<String>, code: &str) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                error: error.into(),
                code: Some(code.to_string()),
            }),
        )
    }
}

/// HTTP status for a session error
pub fn status_for(error: &SessionError) -> StatusCode {
    match error {
        SessionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::RegistryFull { .. } => StatusCode::TOO_MANY_REQUESTS,
        SessionError::TunnelEstablishFailed { .. } | SessionError::TeardownFailed { .. } => {
            StatusCode::BAD_GATEWAY
        }
        SessionError::PortsExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SessionError::InvalidTransition { .. } | SessionError::NotTerminal { .. } => {
            StatusCode::CONFLICT
        }
    }
}

impl From<SessionError> for ErrorResponse {
    fn from(error: SessionError) -> Self {
        Self {
            error: error.to_string(),
            code: Some(error.code().to_string()),
        }
    }
}

/// Map a session error onto the handler error type
pub fn session_error(error: SessionError) -> (StatusCode, Json<ErrorResponse>) {
    (status_for(&error), Json(error.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use podforward_session::{SessionId, SessionState};

    #[test]
    fn test_status_mapping() {
        let id = SessionId::from("abc");
        assert_eq!(
            status_for(&SessionError::InvalidRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&SessionError::NotFound(id.clone())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&SessionError::RegistryFull { max: 1 }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&SessionError::TunnelEstablishFailed {
                id: id.clone(),
                reason: "x".into()
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&SessionError::PortsExhausted { start: 1, end: 2 }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&SessionError::InvalidTransition {
                id,
                from: SessionState::Stopped,
                to: SessionState::Active
            }),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_error_body_carries_code() {
        let (status, Json(body)) = session_error(SessionError::RegistryFull { max: 3 });
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body.code.as_deref(), Some("REGISTRY_FULL"));
        assert!(body.error.contains('3'));
    }

    #[test]
    fn test_start_request_port_defaults() {
        let request: StartForwardRequest =
            serde_json::from_str(r#"{"namespace":"default","pod":"web-1"}"#).unwrap();
        assert_eq!(request.port, DEFAULT_REMOTE_PORT);
    }
}
