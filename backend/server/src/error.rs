use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use records::StorageError;
use thiserror::Error;
use tracing::error;

use crate::{
    guard::SESSION_UNKNOWN,
    notify::{LOADING_TEXT, Level, MALFORMED_REQUEST, Notification, TECHNICAL_ERROR},
    retry::Cancelled,
};

/// Terminal outcome of one submission, as seen by the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormError {
    #[error("Validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("Rejected by guard: {0:?}")]
    Security(Vec<String>),

    #[error("Duplicate submission: {0}")]
    Duplicate(String),

    #[error("Backend unavailable: {0}")]
    Transient(String),

    #[error("Backend rejected submission: {0}")]
    Terminal(String),

    #[error("Submission cancelled")]
    Cancelled,
}

impl From<Cancelled> for FormError {
    fn from(_: Cancelled) -> Self {
        FormError::Cancelled
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Submission already in flight")]
    InFlight,

    #[error(transparent)]
    Form(#[from] FormError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MalformedPayload => StatusCode::BAD_REQUEST,
            AppError::InFlight => StatusCode::CONFLICT,
            AppError::Form(FormError::Security(reasons)) if is_unknown_session(reasons) => {
                StatusCode::UNAUTHORIZED
            }
            AppError::Form(FormError::Validation(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Form(FormError::Security(_)) => StatusCode::FORBIDDEN,
            AppError::Form(FormError::Duplicate(_)) => StatusCode::CONFLICT,
            AppError::Form(FormError::Transient(_) | FormError::Cancelled) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Form(FormError::Terminal(_)) => StatusCode::BAD_GATEWAY,
        }
    }

    fn notification(&self) -> Notification {
        match self {
            AppError::MalformedPayload => Notification::new(Level::Error, MALFORMED_REQUEST),
            AppError::InFlight => Notification::new(Level::Info, LOADING_TEXT),
            AppError::Form(FormError::Security(reasons)) if is_unknown_session(reasons) => {
                Notification::new(Level::Error, SESSION_UNKNOWN)
            }
            AppError::Form(form) => Notification::for_error(form)
                .unwrap_or_else(|| Notification::new(Level::Info, TECHNICAL_ERROR)),
        }
    }
}

fn is_unknown_session(reasons: &[String]) -> bool {
    reasons.len() == 1 && reasons[0] == SESSION_UNKNOWN
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Form(FormError::Terminal(cause)) = &self {
            error!("Submission rejected by backend: {cause}");
        }

        (self.status(), Json(self.notification())).into_response()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Secret {name} unreadable: {source}")]
    Secret {
        name: String,
        source: std::io::Error,
    },

    #[error("{0} is required by the selected configuration")]
    Missing(&'static str),

    #[error("HTTP client could not be built: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cache storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Redis unreachable: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Server I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
