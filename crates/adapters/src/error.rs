use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<AdapterError>,
    },
    #[error("API returned an empty response")]
    EmptyResponse,
    #[error("operation cancelled by caller")]
    Cancelled,
}

impl AdapterError {
    pub fn retry_exhausted(attempts: usize, source: AdapterError) -> Self {
        AdapterError::RetryExhausted {
            attempts,
            source: Box::new(source),
        }
    }

    /// Transient failures are worth retrying: rate limits, server-side
    /// errors, and transport-level connection problems. Everything else
    /// propagates immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            AdapterError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            AdapterError::HttpStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_server_errors_are_transient() {
        let rate_limited = AdapterError::HttpStatus {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        assert!(rate_limited.is_transient());

        let server = AdapterError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert!(server.is_transient());
    }

    #[test]
    fn client_errors_and_config_errors_are_permanent() {
        let unauthorized = AdapterError::HttpStatus {
            status: StatusCode::UNAUTHORIZED,
            body: String::new(),
        };
        assert!(!unauthorized.is_transient());
        assert!(!AdapterError::InvalidConfig("bad".into()).is_transient());
        assert!(!AdapterError::EmptyResponse.is_transient());
        assert!(!AdapterError::Cancelled.is_transient());
    }
}
