use axum::extract::OriginalUri;
use axum::http::Method;

use crate::error::{Error, ErrorDetails};

/// Fallback handler for unmatched routes
pub async fn handle_404(OriginalUri(uri): OriginalUri, method: Method) -> Error {
    Error::new(ErrorDetails::RouteNotFound {
        path: uri.path().to_string(),
        method: method.to_string(),
    })
}
