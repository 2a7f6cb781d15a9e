//! The HTTP transport capability consumed by a session

use std::{error, sync::Arc};

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde_json::Value;

/// A boxed error returned by injected capabilities
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// A request passing through the session pipeline
///
/// URLs are kept as given; resolving relative URLs against an origin is
/// the transport's concern.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<Value>,
}

impl ApiRequest {
    /// Constructs a request without headers or body
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Constructs a `GET` request
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Constructs a `POST` request
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Constructs a `DELETE` request
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Attaches a JSON body
    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets a header, replacing any existing value
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// The request method
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request URL
    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The request headers
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the request headers
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The JSON body, if any
    #[inline]
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }
}

/// A response returned by a transport
///
/// Bodies are decoded as JSON. Transports should map an empty body to
/// `null` and a body that is not JSON to a JSON string.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl ApiResponse {
    /// Constructs a new response
    pub fn new(status: StatusCode, body: Value) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    /// Replaces the response headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// The response status
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The response headers
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The decoded body
    #[inline]
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Takes the decoded body
    #[inline]
    pub fn into_body(self) -> Value {
        self.body
    }
}

/// An asynchronous HTTP transport
///
/// Implementations return responses of every status; only failures to
/// exchange a request at all should be reported as errors.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and returns its response
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, BoxError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, BoxError> {
        (**self).send(request).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, BoxError> {
        (**self).send(request).await
    }
}
