use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AppState {
        message: String,
    },
    Config {
        message: String,
    },
    InternalError {
        message: String,
    },
    /// Webhook payload failed HMAC verification. The only rejection the
    /// webhook path ever produces; everything else is acknowledged so the
    /// provider does not redeliver.
    InvalidSignature {
        message: String,
    },
    JsonRequest {
        message: String,
    },
    /// Checkout session exists but the provider does not report it as paid.
    PaymentNotCompleted {
        session_id: String,
    },
    PaymentProvider {
        message: String,
        status_code: Option<StatusCode>,
    },
    PaymentProviderTimeout {
        operation: String,
    },
    RouteNotFound {
        path: String,
        method: String,
    },
    Serialization {
        message: String,
    },
    /// Request arrived without the caller identity header.
    UserIdRequired,
    /// Durable entitlement storage could not be reached. Read paths fail
    /// open to the implicit free record; write paths surface this to the
    /// caller so a paying user is never silently undercounted.
    StorageUnavailable {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidSignature { .. } => tracing::Level::WARN,
            ErrorDetails::JsonRequest { .. } => tracing::Level::WARN,
            ErrorDetails::PaymentNotCompleted { .. } => tracing::Level::WARN,
            ErrorDetails::PaymentProvider { .. } => tracing::Level::ERROR,
            ErrorDetails::PaymentProviderTimeout { .. } => tracing::Level::ERROR,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::UserIdRequired => tracing::Level::WARN,
            ErrorDetails::StorageUnavailable { .. } => tracing::Level::ERROR,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidSignature { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::JsonRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::PaymentNotCompleted { .. } => StatusCode::PAYMENT_REQUIRED,
            ErrorDetails::PaymentProvider { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::PaymentProviderTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::UserIdRequired => StatusCode::UNAUTHORIZED,
            ErrorDetails::StorageUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::Config { message } => {
                write!(f, "{message}")
            }
            ErrorDetails::InternalError { message } => {
                write!(f, "Internal error: {message}")
            }
            ErrorDetails::InvalidSignature { message } => {
                write!(f, "Webhook signature verification failed: {message}")
            }
            ErrorDetails::JsonRequest { message } => write!(f, "{message}"),
            ErrorDetails::PaymentNotCompleted { session_id } => {
                write!(f, "Checkout session {session_id} is not paid")
            }
            ErrorDetails::PaymentProvider {
                message,
                status_code,
            } => {
                write!(
                    f,
                    "Error{} from payment provider: {message}",
                    status_code.map_or(String::new(), |s| format!(" {s}"))
                )
            }
            ErrorDetails::PaymentProviderTimeout { operation } => {
                write!(f, "Payment provider timed out during: {operation}")
            }
            ErrorDetails::RouteNotFound { path, method } => {
                write!(f, "Route not found: {method} {path}")
            }
            ErrorDetails::Serialization { message } => write!(f, "{message}"),
            ErrorDetails::UserIdRequired => {
                write!(f, "Missing x-user-id header")
            }
            ErrorDetails::StorageUnavailable { message } => {
                write!(f, "Entitlement storage unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
    /// Log the error and convert it into an Axum response
    fn into_response(self) -> Response {
        let body = json!({"error": self.to_string()});
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_not_completed_error() {
        let error = Error::new(ErrorDetails::PaymentNotCompleted {
            session_id: "cs_test_123".to_string(),
        });

        assert_eq!(error.to_string(), "Checkout session cs_test_123 is not paid");
        assert_eq!(error.status_code(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_invalid_signature_error_display() {
        let details = ErrorDetails::InvalidSignature {
            message: "digest mismatch".to_string(),
        };

        let formatted = format!("{details}");
        assert_eq!(
            formatted,
            "Webhook signature verification failed: digest mismatch"
        );
        assert_eq!(details.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_into_response() {
        let error = Error::new(ErrorDetails::StorageUnavailable {
            message: "connection refused".to_string(),
        });

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
