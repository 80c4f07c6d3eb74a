use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure the server can surface. Handlers map these onto HTTP status
/// codes; only [`Error::Conflict`] is retried internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),

    /// A unique key (hostname, public key) is already taken.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Two allocations raced for the same address.
    #[error("allocation conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("store unavailable: {0}")]
    TransientStore(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Duplicate(_) | Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::ResourceExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
            Error::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable category.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::Duplicate(_) => "duplicate",
            Error::Conflict(_) => "conflict",
            Error::NotFound(_) => "not_found",
            Error::Auth(_) => "unauthorized",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::TransientStore(_) => "store_unavailable",
            Error::Internal(_) => "internal_error",
        }
    }

    fn generic_message(&self) -> &'static str {
        match self {
            Error::Validation(_) => "invalid request",
            Error::Duplicate(_) | Error::Conflict(_) => "request conflicts with current state",
            Error::NotFound(_) => "not found",
            Error::Auth(_) => "unauthorized",
            Error::ResourceExhausted(_) => "no capacity available",
            Error::TransientStore(_) => "service temporarily unavailable, retry later",
            Error::Internal(_) => "internal server error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::TransientStore(_))
    }
}

macro_rules! store_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(e: $ty) -> Self {
                    Error::from(redb::Error::from(e))
                }
            }
        )*
    };
}

store_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// I/O failures and a briefly held database lock are worth retrying;
/// corruption and everything else is not.
impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        match e {
            redb::Error::Io(_) | redb::Error::DatabaseAlreadyOpen => {
                Error::TransientStore(e.to_string())
            }
            other => Error::Internal(format!("store: {other}")),
        }
    }
}

// ── HTTP mapping ──────────────────────────────────────────────────────────────

/// Who is on the other end of the request. Administrators get the precise
/// message; gateways and clients only get the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Admin,
    Public,
}

#[derive(Debug)]
pub struct ApiError {
    pub error: Error,
    pub audience: Audience,
}

impl ApiError {
    pub fn admin(error: Error) -> Self {
        Self {
            error,
            audience: Audience::Admin,
        }
    }

    pub fn public(error: Error) -> Self {
        Self {
            error,
            audience: Audience::Public,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status();
        if status.is_server_error() {
            tracing::error!(error = %self.error, "request failed");
        } else {
            tracing::debug!(error = %self.error, "request rejected");
        }

        let message = match (self.audience, &self.error) {
            (_, Error::Internal(_)) => self.error.generic_message().to_owned(),
            (Audience::Admin, e) => e.to_string(),
            (Audience::Public, e) => e.generic_message().to_owned(),
        };
        let body = Json(json!({ "error": self.error.code(), "message": message }));

        if matches!(self.error, Error::TransientStore(_)) {
            (status, [(header::RETRY_AFTER, "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
