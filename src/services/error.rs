//! Error logging helper for route handlers.

use axum::http::StatusCode;

/// Log an error with context and collapse it to a 500 for the client.
pub trait LogErr<T> {
    fn log_500(self, context: &str) -> Result<T, StatusCode>;
}

impl<T, E: std::fmt::Display> LogErr<T> for Result<T, E> {
    fn log_500(self, context: &str) -> Result<T, StatusCode> {
        self.map_err(|e| {
            tracing::error!("{}: {}", context, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    }
}
