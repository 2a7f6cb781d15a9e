//! Request decoration and recovery from expired credentials
//!
//! Every request sent through [`AuthSession::send()`] passes two stages.
//! First, requests bound for the configured API receive the persisted
//! credential headers. Then, if the server answers `401 Unauthorized`,
//! the session decides what the failure means:
//!
//! * a failure of the sign-in endpoint itself is returned untouched;
//! * a `["token_expired", …]` body triggers a single refresh followed by a
//!   single replay of the original request, unless the refresh endpoint
//!   itself failed or there are no credentials to refresh;
//! * anything else invalidates the session and publishes a bare
//!   `auth:error` before the original error is returned.
//!
//! If the refresh fails, its error is returned in place of the original.

use std::sync::Arc;

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::Value;

use crate::{
    error::{self, RequestError},
    events::AuthEvent,
    session::{is_empty, AuthSession},
    transport::{ApiRequest, ApiResponse},
};

/// What to do about a failed response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// Return the failure as-is
    Propagate,
    /// The token expired, but there are no credentials to refresh; return
    /// the failure as-is
    NoCredentials,
    /// Refresh the credentials and replay the request once
    RefreshAndRetry,
    /// Invalidate the session, publish `auth:error` and return the failure
    Invalidate,
}

impl AuthSession {
    /// Sends a request through the session's interceptors
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, RequestError> {
        let error = match self.dispatch(request).await {
            Ok(response) => return Ok(response),
            Err(error) => error,
        };

        match self.recovery_for(&error, false) {
            Recovery::RefreshAndRetry => {}
            recovery => return Err(self.conclude(recovery, error)),
        }

        let request = match error {
            RequestError::Status { request, .. } => *request,
            other => return Err(other),
        };

        tracing::debug!(url = request.url(), "token expired, refreshing");
        if let Err(refresh_error) = self.refresh().await {
            tracing::debug!(
                url = request.url(),
                error = (&refresh_error as &dyn std::error::Error),
                "refresh failed, abandoning request"
            );
            return Err(refresh_error);
        }

        tracing::debug!(url = request.url(), "replaying request with refreshed credentials");
        match self.dispatch(request).await {
            Ok(response) => Ok(response),
            Err(retry_error) => {
                let recovery = self.recovery_for(&retry_error, true);
                Err(self.conclude(recovery, retry_error))
            }
        }
    }

    /// Decides how to treat a failed response
    ///
    /// `replayed` marks a request that was already replayed after a
    /// refresh; such requests are never refreshed again.
    pub fn classify(&self, url: &str, status: StatusCode, body: &Value, replayed: bool) -> Recovery {
        let config = &self.inner.config;

        if status != StatusCode::UNAUTHORIZED || config.is_sign_in_url(url) {
            return Recovery::Propagate;
        }

        if !replayed && error::is_token_expired(body) && !config.is_refresh_url(url) {
            return if is_empty(&self.stored_credentials()) {
                Recovery::NoCredentials
            } else {
                Recovery::RefreshAndRetry
            };
        }

        Recovery::Invalidate
    }

    /// Invalidates the session after an unrecoverable `401` and publishes a
    /// bare `auth:error`
    pub fn invalidate_unauthorized(&self) {
        tracing::info!("unrecoverable authorization failure, invalidating session");
        self.invalidate();
        self.inner.events.emit(AuthEvent::Error {
            stage: None,
            error: None,
        });
    }

    /// The persisted credential headers that are valid HTTP headers
    ///
    /// Values are marked as sensitive. Entries that cannot be represented
    /// as HTTP headers are skipped.
    pub fn credential_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in self.auth_headers().unwrap_or_default() {
            let name = match HeaderName::from_bytes(name.as_bytes()) {
                Ok(name) => name,
                Err(_) => {
                    tracing::warn!(header = %name, "skipping credential header with invalid name");
                    continue;
                }
            };
            let mut value = match HeaderValue::from_str(&value) {
                Ok(value) => value,
                Err(_) => {
                    tracing::warn!(header = %name, "skipping credential header with invalid value");
                    continue;
                }
            };
            value.set_sensitive(true);
            headers.insert(name, value);
        }
        headers
    }

    /// Merges the credential headers into a request bound for the API
    ///
    /// Headers already present are kept unless a credential header has
    /// the same name. Requests elsewhere are left untouched.
    pub fn attach_credentials(&self, request: &mut ApiRequest) {
        if !self.inner.config.is_api_url(request.url()) {
            tracing::trace!(url = request.url(), "request not bound for the API");
            return;
        }

        let headers = self.credential_headers();
        tracing::trace!(
            url = request.url(),
            headers = headers.len(),
            "attaching credential headers"
        );
        for (name, value) in headers.iter() {
            request.headers_mut().insert(name.clone(), value.clone());
        }
    }

    async fn dispatch(&self, mut request: ApiRequest) -> Result<ApiResponse, RequestError> {
        self.attach_credentials(&mut request);

        let exchange = self.inner.transport.send(request.clone());
        let outcome = match self.inner.config.request_timeout() {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(RequestError::Timeout {
                        request: Box::new(request),
                        after: limit,
                    })
                }
            },
            None => exchange.await,
        };

        match outcome {
            Ok(response) if response.status().is_success() => {
                tracing::trace!(
                    url = request.url(),
                    status = response.status().as_u16(),
                    "request succeeded"
                );
                Ok(response)
            }
            Ok(response) => {
                tracing::debug!(
                    url = request.url(),
                    status = response.status().as_u16(),
                    "request failed"
                );
                Err(RequestError::Status {
                    request: Box::new(request),
                    response: Box::new(response),
                })
            }
            Err(source) => Err(RequestError::Transport {
                request: Box::new(request),
                source: Arc::from(source),
            }),
        }
    }

    fn recovery_for(&self, error: &RequestError, replayed: bool) -> Recovery {
        match (error.request(), error.response()) {
            (Some(request), Some(response)) => {
                self.classify(request.url(), response.status(), response.body(), replayed)
            }
            _ => Recovery::Propagate,
        }
    }

    fn conclude(&self, recovery: Recovery, error: RequestError) -> RequestError {
        match recovery {
            Recovery::Invalidate => self.invalidate_unauthorized(),
            Recovery::NoCredentials => {
                tracing::debug!("token expired without stored credentials, not refreshing")
            }
            Recovery::Propagate | Recovery::RefreshAndRetry => {}
        }
        error
    }
}
