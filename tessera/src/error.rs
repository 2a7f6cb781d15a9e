//! Errors surfaced by sessions and their request pipeline

use std::{error, fmt, sync::Arc, time::Duration};

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::transport::{ApiRequest, ApiResponse};

/// The structured failure of a sign-in or validation operation
///
/// Serializes as `{"reason": "unauthorized", "errors": [...]}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{reason}: {}", .errors.join(", "))]
pub struct Rejection {
    /// Why the operation was rejected
    pub reason: RejectionReason,
    /// Human-readable error messages
    pub errors: Vec<String>,
}

/// The reason for a [`Rejection`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Credentials were missing, invalid or could not be validated
    Unauthorized,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized => f.write_str("unauthorized"),
        }
    }
}

impl Rejection {
    /// An `unauthorized` rejection carrying the given messages
    pub fn unauthorized<I, S>(errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reason: RejectionReason::Unauthorized,
            errors: errors.into_iter().map(Into::into).collect(),
        }
    }

    /// The rejection issued when sign-in fails
    pub fn invalid_credentials() -> Self {
        Self::unauthorized(["Invalid credentials"])
    }

    /// The rejection issued when validation finds nothing to validate
    pub fn no_credentials() -> Self {
        Self::unauthorized(["No credentials"])
    }

    pub(crate) fn abandoned() -> Self {
        Self::unauthorized(["Operation abandoned"])
    }
}

/// An error raised while sending a request through a session
///
/// Errors are cheap to clone so that every caller joined to a shared
/// refresh observes the same failure.
#[derive(Clone, Debug, Error)]
pub enum RequestError {
    /// The server answered with a non-success status
    #[error("{} {} returned {}", .request.method(), .request.url(), .response.status())]
    Status {
        /// The request that failed
        request: Box<ApiRequest>,
        /// The response received
        response: Box<ApiResponse>,
    },
    /// The transport was unable to exchange the request
    #[error("unable to send {} {}", .request.method(), .request.url())]
    Transport {
        /// The request that failed
        request: Box<ApiRequest>,
        /// The underlying transport error
        source: Arc<dyn error::Error + Send + Sync + 'static>,
    },
    /// The transport did not answer in time
    #[error("{} {} timed out after {:?}", .request.method(), .request.url(), .after)]
    Timeout {
        /// The request that timed out
        request: Box<ApiRequest>,
        /// The limit that was exceeded
        after: Duration,
    },
    /// An authentication response did not include a token
    #[error("authentication response from {url} did not contain a token")]
    MissingToken {
        /// The URL of the authentication endpoint
        url: String,
    },
}

impl RequestError {
    /// The request that failed, if one was sent
    pub fn request(&self) -> Option<&ApiRequest> {
        match self {
            Self::Status { request, .. }
            | Self::Transport { request, .. }
            | Self::Timeout { request, .. } => Some(request),
            Self::MissingToken { .. } => None,
        }
    }

    /// The response received, if the server answered
    pub fn response(&self) -> Option<&ApiResponse> {
        match self {
            Self::Status { response, .. } => Some(response),
            _ => None,
        }
    }

    /// The status of the response, if the server answered
    pub fn status(&self) -> Option<StatusCode> {
        self.response().map(ApiResponse::status)
    }

    /// Whether the server signalled that the presented token expired
    ///
    /// The signal is a body whose first element is `"token_expired"`.
    pub fn is_token_expired(&self) -> bool {
        self.response().map_or(false, |r| is_token_expired(r.body()))
    }

    /// The error messages supplied by the server
    ///
    /// Accepts a body that is a list of strings, or an object carrying
    /// such a list under `errors`. Anything else yields no messages.
    pub fn server_errors(&self) -> Vec<String> {
        self.response()
            .map(|r| server_errors(r.body()))
            .unwrap_or_default()
    }
}

pub(crate) fn is_token_expired(body: &Value) -> bool {
    body.get(0).and_then(Value::as_str) == Some("token_expired")
}

fn server_errors(body: &Value) -> Vec<String> {
    let list = match body {
        Value::Array(_) => body,
        Value::Object(map) => match map.get("errors") {
            Some(list) => list,
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    list.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default()
}
