//! Error types and HTTP status code mapping.

use std::fmt;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue, RETRY_AFTER};
use hyper::{Response, StatusCode};

/// Every failure the service can produce, each mapping to a specific HTTP status.
#[derive(Debug)]
pub enum ServiceError {
    /// The configuration file could not be loaded, parsed or validated.
    Config(String),
    /// The client hit the rate-limit gate for this route.
    RateLimited {
        /// Milliseconds until the same key would be admitted again.
        retry_after_ms: u64,
    },
    /// A bandwidth payload (request or response) exceeds the hard cap.
    BodyTooLarge {
        /// The configured cap in bytes.
        limit: u64,
    },
    /// The requested bandwidth length is not acceptable.
    InvalidLength(String),
    /// Reading the request body failed mid-stream.
    Body(String),
    /// Serializing or templating a response failed.
    Render(String),
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::RateLimited { .. } => write!(f, "Too many requests from your IP"),
            Self::BodyTooLarge { .. } => write!(f, "Request size is too big"),
            Self::InvalidLength(msg) => write!(f, "{msg}"),
            Self::Body(msg) => write!(f, "failed to read request body: {msg}"),
            Self::Render(msg) => write!(f, "failed to render response: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl ServiceError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BodyTooLarge { .. } | Self::InvalidLength(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Body(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) | Self::Render(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Converts this error into a plaintext HTTP response whose body is the
    /// error's display form.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let status = self.status_code();
        let retry_after = match &self {
            Self::RateLimited { retry_after_ms } => Some(retry_after_ms.div_ceil(1000).max(1)),
            _ => None,
        };

        let mut response = Response::new(Full::new(Bytes::from(self.to_string())));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain;charset=UTF-8"),
        );
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<hyper::Error> for ServiceError {
    fn from(err: hyper::Error) -> Self {
        Self::Body(err.to_string())
    }
}

impl From<hyper::http::Error> for ServiceError {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Render(err.to_string())
    }
}

impl From<serde_yaml::Error> for ServiceError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Render(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_maps_to_429_with_retry_after() {
        let resp = ServiceError::RateLimited {
            retry_after_ms: 1500,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(RETRY_AFTER).unwrap(), "2");
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        let resp = ServiceError::RateLimited { retry_after_ms: 1 }.into_response();
        assert_eq!(resp.headers().get(RETRY_AFTER).unwrap(), "1");
    }

    #[test]
    fn oversized_payload_maps_to_413() {
        let err = ServiceError::BodyTooLarge { limit: 10 };
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.to_string(), "Request size is too big");
    }

    #[test]
    fn internal_errors_map_to_500() {
        assert_eq!(
            ServiceError::Internal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServiceError::Render("bad".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
