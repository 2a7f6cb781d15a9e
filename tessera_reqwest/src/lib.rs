//! Session-aware authorization for reqwest
//!
//! This crate connects a [`tessera::AuthSession`] to `reqwest` in two
//! directions:
//!
//! * [`ReqwestTransport`] lets the session itself talk to the API, so that
//!   sign-in, validation, refresh and sign-out go over HTTP.
//! * [`AuthSessionMiddleware`] decorates the requests sent through a
//!   [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware) with
//!   the session's credential headers, and recovers from expired tokens by
//!   refreshing the session and replaying the request once.
//!
//! Requests that already carry a header with the same name as a credential
//! header have it replaced by the session's value.
//!
//! ```
//! use reqwest::{Client, Url};
//! use reqwest_middleware::ClientBuilder;
//! use tessera::{AuthConfig, AuthSession};
//! use tessera_reqwest::{AuthSessionMiddleware, ReqwestTransport};
//!
//! let base = Url::parse("https://example.com").unwrap();
//! let session = AuthSession::builder(AuthConfig::default())
//!     .build(ReqwestTransport::new(Client::new(), base));
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AuthSessionMiddleware::new(session))
//!     .build();
//!
//! let req = client.get("https://example.com/api/me");
//! # let _ = req;
//! ```
//!
//! The session's own transport should use a plain client: refreshing
//! through the middleware stack would decorate and intercept the refresh
//! request twice.
//!
//! The middleware can also be configured to decorate requests based on a
//! custom predicate, replacing the default match on the configured API URL.
//!
//! ```
//! use reqwest::{Client, Url};
//! use tessera::{AuthConfig, AuthSession};
//! use tessera_reqwest::{ApiUrlMatch, AuthSessionMiddleware, ReqwestTransport};
//!
//! # let base = Url::parse("https://example.com").unwrap();
//! # let session = AuthSession::builder(AuthConfig::default())
//! #     .build(ReqwestTransport::new(Client::new(), base));
//! AuthSessionMiddleware::new(session)
//!     .with_predicate(ApiUrlMatch::new("https://example.com/api"));
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use predicates::{prelude::*, reflection};
use reqwest::{Client, Request, Response, StatusCode, Url};
use reqwest_middleware::{Middleware, Next, Result};
use serde_json::Value;
use tessera::{ApiRequest, ApiResponse, AuthSession, BoxError, Recovery, Transport};

/// A session transport backed by a [`reqwest::Client`]
///
/// Request URLs are resolved against a base URL, so the session can be
/// configured with paths such as `/api`.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: Client,
    base: Url,
}

impl ReqwestTransport {
    /// Constructs a new transport resolving URLs against `base`
    pub fn new(client: Client, base: Url) -> Self {
        Self { client, base }
    }

    /// The base URL requests are resolved against
    pub fn base(&self) -> &Url {
        &self.base
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: ApiRequest) -> std::result::Result<ApiResponse, BoxError> {
        let url = self.base.join(request.url())?;
        tracing::trace!(method = %request.method(), %url, "sending session request");

        let mut builder = self
            .client
            .request(request.method().clone(), url)
            .headers(request.headers().clone());
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(ApiResponse::new(status, decode_body(&body)).with_headers(headers))
    }
}

/// Decodes a response body as JSON
///
/// An empty body decodes as `null`; a body that is not JSON decodes as a
/// JSON string holding the (lossily decoded) text.
pub fn decode_body(body: &[u8]) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }

    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// A middleware that decorates outgoing requests with session credentials
#[derive(Clone, Debug)]
pub struct AuthSessionMiddleware<P> {
    session: AuthSession,
    predicate: P,
}

impl AuthSessionMiddleware<ApiUrlMatch> {
    /// Construct a new middleware from a session
    ///
    /// By default, this middleware only decorates requests whose URL
    /// contains the session's configured API URL. To change this behavior,
    /// provide a custom predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(session: AuthSession) -> Self {
        let predicate = ApiUrlMatch::new(session.config().api_url());
        Self { session, predicate }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AuthSessionMiddleware<P> {
        AuthSessionMiddleware {
            session: self.session,
            predicate,
        }
    }
}

impl<P> AuthSessionMiddleware<P> {
    /// The session whose credentials are attached
    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    fn attach_credentials(&self, req: &mut Request) {
        let headers = self.session.credential_headers();
        tracing::trace!(url = %req.url(), headers = headers.len(), "attaching credential headers");
        for (name, value) in headers.iter() {
            req.headers_mut().insert(name.clone(), value.clone());
        }
    }

    /// Consults the session about an unauthorized response
    ///
    /// Returns the response, rebuilt around its buffered body, along with
    /// the session's decision.
    async fn assess(&self, url: &str, response: Response, replayed: bool) -> Result<(Response, Recovery)> {
        let (response, body) = buffer(response).await?;
        let recovery = self
            .session
            .classify(url, response.status(), &body, replayed);
        tracing::debug!(url, ?recovery, replayed, "assessed unauthorized response");

        if recovery == Recovery::Invalidate {
            self.session.invalidate_unauthorized();
        }

        Ok((response, recovery))
    }
}

#[async_trait]
impl<P> Middleware for AuthSessionMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let decorate = self.predicate.eval(&req);
        if decorate {
            self.attach_credentials(&mut req);
        }

        let url = req.url().to_string();
        let replay = req.try_clone();

        let response = next.clone().run(req, extensions).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let (response, recovery) = self.assess(&url, response, false).await?;
        if recovery != Recovery::RefreshAndRetry {
            return Ok(response);
        }

        let Some(mut replay) = replay else {
            tracing::warn!(%url, "request body cannot be replayed, returning expired response");
            return Ok(response);
        };

        tracing::debug!(%url, "token expired, refreshing");
        if let Err(error) = self.session.refresh().await {
            tracing::debug!(%url, %error, "refresh failed, abandoning request");
            return Err(reqwest_middleware::Error::middleware(error));
        }

        if decorate {
            self.attach_credentials(&mut replay);
        }

        tracing::debug!(%url, "replaying request with refreshed credentials");
        let response = next.run(replay, extensions).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let (response, _) = self.assess(&url, response, true).await?;
        Ok(response)
    }
}

/// Reads a response body into memory and rebuilds the response around it
///
/// The rebuilt response keeps the status, version and headers of the
/// original.
async fn buffer(response: Response) -> Result<(Response, Value)> {
    let status = response.status();
    let version = response.version();
    let headers = response.headers().clone();
    let bytes: Bytes = response.bytes().await?;
    let body = decode_body(&bytes);

    let mut rebuilt = http::Response::new(bytes);
    *rebuilt.status_mut() = status;
    *rebuilt.version_mut() = version;
    *rebuilt.headers_mut() = headers;

    Ok((Response::from(rebuilt), body))
}

/// Only decorate requests whose URL contains the given fragment
///
/// This mirrors how a session recognizes requests bound for its API.
#[derive(Clone, Debug)]
pub struct ApiUrlMatch {
    fragment: String,
}

impl ApiUrlMatch {
    /// Construct a new predicate from a URL fragment
    pub fn new<S>(fragment: S) -> Self
    where
        S: ToString,
    {
        Self {
            fragment: fragment.to_string(),
        }
    }
}

impl Predicate<Request> for ApiUrlMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().as_str().contains(&self.fragment)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result)
                    .add_product(reflection::Product::new("url", req.url().to_string())),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ApiUrlMatch {}
impl fmt::Display for ApiUrlMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("url contains ")?;
        f.write_str(&self.fragment)
    }
}
