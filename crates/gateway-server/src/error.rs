use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kernel::{KernelError, RoutingError};
use serde::Serialize;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.status.as_str().to_string(),
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<RoutingError> for AppError {
    fn from(err: RoutingError) -> Self {
        let message = err.to_string();
        match err {
            RoutingError::NoHealthyBackend(_) | RoutingError::Cancelled => {
                AppError::service_unavailable(message)
            }
            RoutingError::SessionIdNotFound => AppError::bad_request(message),
            RoutingError::SessionInvalid => AppError::not_found(message),
        }
    }
}

impl From<KernelError> for AppError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Routing(err) => err.into(),
            KernelError::BadRequest(_) => AppError::bad_request(err.to_string()),
            KernelError::Upstream(_) => AppError::new(StatusCode::BAD_GATEWAY, err.to_string()),
            KernelError::UpstreamTimeout(_) => {
                AppError::new(StatusCode::GATEWAY_TIMEOUT, err.to_string())
            }
            KernelError::Store(_) | KernelError::Internal(_) => AppError::internal(err.to_string()),
        }
    }
}

impl From<control_plane::ConfigError> for AppError {
    fn from(err: control_plane::ConfigError) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<control_plane::StoreError> for AppError {
    fn from(err: control_plane::StoreError) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status.as_str(), self.message)
    }
}

impl std::error::Error for AppError {}
