use serde_json::Value;
use thiserror::Error;

use super::transport::HttpResponse;

/// Failure before any HTTP status was received.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP transport failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Connection failed: {0}")]
    Connection(String),
}

/// A response body, normalized according to its content type.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
    Empty,
}

impl ResponseBody {
    pub fn from_response(response: &HttpResponse) -> Self {
        if response.is_json() {
            match serde_json::from_str(&response.body) {
                Ok(value) => return ResponseBody::Json(value),
                Err(_) if response.body.trim().is_empty() => return ResponseBody::Empty,
                Err(_) => {}
            }
        }
        if response.body.is_empty() {
            ResponseBody::Empty
        } else {
            ResponseBody::Text(response.body.clone())
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Unauthorized - session is no longer valid")]
    Unauthorized,

    #[error("Request failed with status {status}")]
    Http { status: u16, body: ResponseBody },

    #[error("Network error: {0}")]
    Network(#[from] TransportError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RequestError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Unauthorized => Some(401),
            RequestError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Message suitable for display. Prefers the backend's `detail` or
    /// `error` field when the body is JSON.
    pub fn message(&self) -> String {
        match self {
            RequestError::Http { status, body } => {
                let from_body = body.as_json().and_then(|value| {
                    ["detail", "error"]
                        .iter()
                        .find_map(|key| value.get(*key).and_then(Value::as_str))
                        .map(str::to_string)
                });
                match (from_body, body) {
                    (Some(message), _) => message,
                    (None, ResponseBody::Text(text)) if *status >= 500 => {
                        format!("Request failed: {} ({})", status, Self::truncate_body(text))
                    }
                    _ => format!("Request failed: {}", status),
                }
            }
            other => other.to_string(),
        }
    }
}
