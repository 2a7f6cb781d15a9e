//! The authentication session state machine

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::{
    braids::AccessToken,
    config::AuthConfig,
    error::{Rejection, RequestError},
    events::{AuthEvent, AuthStage, EventBus},
    headers::{AuthHeaders, HeaderFormatter},
    operation::{Operation, OperationResult, Resolver},
    store::CredentialStore,
    transport::{ApiRequest, ApiResponse, Transport},
};

const DEFAULT_EVENT_CAPACITY: usize = 64;

/// A refresh exchange shared by every caller that needs it
type PendingRefresh = Shared<BoxFuture<'static, Result<(), RequestError>>>;

/// The fields a successful authentication response must carry
#[derive(Deserialize)]
struct TokenPayload {
    token: AccessToken,
}

/// A client-side authentication session
///
/// A session owns its configuration, credential store, transport and
/// event channel. Clones share all of them, so a session can be handed to
/// every component that needs to send authenticated requests.
///
/// At most one sign-in or validation operation is in flight at a time.
/// Callers that start one while another is pending receive a handle to
/// the pending operation instead.
#[derive(Clone)]
pub struct AuthSession {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: AuthConfig,
    pub(crate) formatter: HeaderFormatter,
    pub(crate) store: CredentialStore,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) events: EventBus,
    logged_in: AtomicBool,
    pending: Mutex<Option<Operation>>,
    refreshing: Mutex<Option<PendingRefresh>>,
    next_operation: AtomicU64,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("config", &self.inner.config)
            .field("store", &self.inner.store)
            .field("logged_in", &self.inner.logged_in.load(Ordering::Acquire))
            .field("pending", &self.inner.pending.lock().as_ref().map(Operation::id))
            .field("refreshing", &self.inner.refreshing.lock().is_some())
            .finish()
    }
}

/// Builder for an [`AuthSession`]
#[derive(Debug)]
pub struct AuthSessionBuilder {
    config: AuthConfig,
    store: Option<CredentialStore>,
    events: EventBus,
}

impl AuthSessionBuilder {
    /// Uses `store` to persist credentials
    ///
    /// Defaults to an in-memory store.
    pub fn with_store(mut self, store: CredentialStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets how many events are buffered for slow subscribers
    ///
    /// Subscribers taken before this call are dropped from the new channel.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.events = EventBus::new(capacity);
        self
    }

    /// Subscribes to session events before the session exists
    ///
    /// Useful to observe the validation that [`start()`][Self::start()]
    /// may run.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// Builds the session without running start-up validation
    pub fn build(self, transport: impl Transport + 'static) -> AuthSession {
        let formatter = HeaderFormatter::new(self.config.token_format().clone());

        AuthSession {
            inner: Arc::new(Inner {
                config: self.config,
                formatter,
                store: self.store.unwrap_or_default(),
                transport: Box::new(transport),
                events: self.events,
                logged_in: AtomicBool::new(false),
                pending: Mutex::new(None),
                refreshing: Mutex::new(None),
                next_operation: AtomicU64::new(1),
            }),
        }
    }

    /// Builds the session and, if configured to, starts validating any
    /// persisted credentials
    ///
    /// The validation runs in the background; its handle is available
    /// from [`AuthSession::pending_operation()`] until it settles.
    ///
    /// # Panics
    ///
    /// Panics if validation is configured and this is called outside a
    /// tokio runtime.
    pub fn start(self, transport: impl Transport + 'static) -> AuthSession {
        let session = self.build(transport);
        if session.inner.config.validate_on_page_load() {
            tracing::debug!("validating persisted credentials on start-up");
            session.validate_user();
        }
        session
    }
}

impl AuthSession {
    /// Begins building a session with the given configuration
    pub fn builder(config: AuthConfig) -> AuthSessionBuilder {
        AuthSessionBuilder {
            config,
            store: None,
            events: EventBus::new(DEFAULT_EVENT_CAPACITY),
        }
    }

    /// The session configuration
    #[inline]
    pub fn config(&self) -> &AuthConfig {
        &self.inner.config
    }

    /// The credential store
    #[inline]
    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    /// Subscribes to session events
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    /// The operation currently in flight, if any
    pub fn pending_operation(&self) -> Option<Operation> {
        self.inner
            .pending
            .lock()
            .as_ref()
            .filter(|op| !op.is_settled())
            .cloned()
    }

    /// Signs in with the given credentials
    ///
    /// If a sign-in or validation is already in flight, its handle is
    /// returned and `credentials` are ignored.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn sign_in<C: Serialize + ?Sized>(&self, credentials: &C) -> Operation {
        let (operation, resolver) = self.begin_operation();
        let Some(resolver) = resolver else {
            tracing::debug!(operation = operation.id(), "joining pending operation");
            return operation;
        };

        let body = match serde_json::to_value(credentials) {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!(%error, "unable to serialize sign-in credentials");
                self.inner.events.emit(AuthEvent::Error {
                    stage: Some(AuthStage::Login),
                    error: None,
                });
                self.reject(resolver, Rejection::invalid_credentials());
                return operation;
            }
        };

        let session = self.clone();
        tokio::spawn(async move { session.run_sign_in(body, resolver).await });
        operation
    }

    async fn run_sign_in(&self, credentials: Value, resolver: Resolver) {
        let url = self.inner.config.sign_in_url();
        let request = ApiRequest::post(url.clone()).with_json(credentials);

        let outcome = match self.send(request).await {
            Ok(response) => self.accept_token(&url, response),
            Err(error) => Err(error),
        };

        match outcome {
            Ok(payload) => {
                tracing::info!(operation = resolver.id(), "signed in");
                self.inner.events.emit(AuthEvent::Success {
                    stage: AuthStage::Login,
                    payload: payload.clone(),
                });
                self.resolve(resolver, Some(payload));
            }
            Err(error) => {
                tracing::info!(
                    operation = resolver.id(),
                    error = (&error as &dyn std::error::Error),
                    "sign-in failed"
                );
                self.inner.events.emit(AuthEvent::Error {
                    stage: Some(AuthStage::Login),
                    error: Some(Arc::new(error)),
                });
                self.reject(resolver, Rejection::invalid_credentials());
            }
        }
    }

    /// Whether the session holds credentials and is marked as signed in
    ///
    /// Persisted credentials alone are not enough: after a sign-out or an
    /// unvalidated restart, this reports `false` until sign-in or
    /// validation succeeds.
    pub fn is_authenticated(&self) -> bool {
        !is_empty(&self.stored_credentials()) && self.inner.logged_in.load(Ordering::Acquire)
    }

    /// Ensures the user is authenticated
    ///
    /// Resolves immediately if the session is already authenticated,
    /// validates persisted credentials with the server if there are any,
    /// and otherwise rejects with `No credentials` and publishes
    /// `auth:invalid`.
    ///
    /// # Panics
    ///
    /// Panics if validation with the server is required and this is called
    /// outside a tokio runtime.
    pub fn validate_user(&self) -> Operation {
        let (operation, resolver) = self.begin_operation();
        let Some(resolver) = resolver else {
            tracing::debug!(operation = operation.id(), "joining pending operation");
            return operation;
        };

        if self.is_authenticated() {
            tracing::trace!(operation = resolver.id(), "already authenticated");
            self.resolve(resolver, None);
        } else if !is_empty(&self.stored_credentials()) {
            let session = self.clone();
            tokio::spawn(async move {
                let outcome = session.validate_token().await;
                session.settle(resolver, outcome);
            });
        } else {
            tracing::debug!(operation = resolver.id(), "no credentials to validate");
            self.reject(resolver, Rejection::no_credentials());
            self.inner.events.emit(AuthEvent::Invalid);
        }

        operation
    }

    /// Validates the persisted credentials with the server
    ///
    /// On success the session is marked as signed in; the persisted headers
    /// are left untouched. On failure the session is invalidated and the
    /// rejection carries the error messages supplied by the server.
    pub async fn validate_token(&self) -> OperationResult {
        let request = ApiRequest::post(self.inner.config.validation_url()).with_json(json!({}));

        match self.send(request).await {
            Ok(response) => {
                self.inner.logged_in.store(true, Ordering::Release);
                let payload = response.into_body();
                tracing::info!("validated persisted credentials");
                self.inner.events.emit(AuthEvent::Success {
                    stage: AuthStage::Validation,
                    payload: payload.clone(),
                });
                Ok(Some(payload))
            }
            Err(error) => {
                let rejection = Rejection::unauthorized(error.server_errors());
                tracing::info!(
                    error = (&error as &dyn std::error::Error),
                    "validation failed"
                );
                self.inner.events.emit(AuthEvent::Error {
                    stage: Some(AuthStage::Validation),
                    error: Some(Arc::new(error)),
                });
                self.invalidate();
                Err(rejection)
            }
        }
    }

    /// Exchanges the current credentials for a new token
    ///
    /// On success, headers rendered from the new token are merged into the
    /// persisted credentials. Failures are returned without publishing any
    /// event of their own.
    ///
    /// At most one exchange is in flight. Callers arriving while one is
    /// pending wait for it and observe its outcome. The exchange continues
    /// as long as any caller is still waiting on it.
    pub fn refresh(&self) -> BoxFuture<'static, Result<(), RequestError>> {
        let mut slot = self.inner.refreshing.lock();
        if let Some(pending) = slot.as_ref() {
            tracing::trace!("joining pending refresh");
            return pending.clone().boxed();
        }

        let session = self.clone();
        let exchange = async move {
            let outcome = session.exchange_refresh().await;
            session.inner.refreshing.lock().take();
            outcome
        }
        .boxed()
        .shared();

        *slot = Some(exchange.clone());
        exchange.boxed()
    }

    async fn exchange_refresh(&self) -> Result<(), RequestError> {
        let url = self.inner.config.refresh_url();
        let response = self.send(ApiRequest::post(url.clone())).await?;
        self.accept_token(&url, response)?;
        tracing::debug!("refreshed credentials");
        Ok(())
    }

    /// Signs out
    ///
    /// Publishes `auth:logout-success` or `auth:logout-error`, then
    /// invalidates the session whatever the server answered.
    pub async fn sign_out(&self) -> Result<(), Arc<RequestError>> {
        let request = ApiRequest::delete(self.inner.config.sign_out_url());

        let outcome = match self.send(request).await {
            Ok(_) => {
                tracing::info!("signed out");
                self.inner.events.emit(AuthEvent::LogoutSuccess);
                Ok(())
            }
            Err(error) => {
                let error = Arc::new(error);
                self.inner.events.emit(AuthEvent::LogoutError {
                    error: error.clone(),
                });
                Err(error)
            }
        };

        self.invalidate();
        outcome
    }

    /// Marks the session as signed out and deletes persisted credentials
    pub fn invalidate(&self) {
        self.inner.logged_in.store(false, Ordering::Release);
        self.inner.store.delete(self.inner.config.storage_key());
    }

    /// The persisted credential headers, if any
    pub fn auth_headers(&self) -> Option<AuthHeaders> {
        self.inner.store.retrieve(self.inner.config.storage_key())
    }

    /// Merges `headers` into the persisted credential headers
    pub fn set_auth_headers(&self, headers: AuthHeaders) {
        self.inner.store.update(
            self.inner.config.storage_key(),
            |current: Option<AuthHeaders>| {
                let mut merged = current.unwrap_or_default();
                merged.extend(headers);
                merged
            },
        );
    }

    pub(crate) fn stored_credentials(&self) -> Value {
        self.inner
            .store
            .retrieve(self.inner.config.storage_key())
            .unwrap_or(Value::Null)
    }

    /// Persists headers rendered from an authentication response and marks
    /// the session as signed in
    fn accept_token(&self, url: &str, response: ApiResponse) -> Result<Value, RequestError> {
        let payload = response.into_body();
        let token = match TokenPayload::deserialize(&payload) {
            Ok(parsed) => parsed.token,
            Err(_) => {
                return Err(RequestError::MissingToken {
                    url: url.to_owned(),
                })
            }
        };

        tracing::trace!(%token, "received token");
        self.set_auth_headers(self.inner.formatter.format(&payload));
        self.inner.logged_in.store(true, Ordering::Release);
        Ok(payload)
    }

    /// Returns the pending operation, or opens a new one along with the
    /// resolver that settles it
    ///
    /// A settled operation still sitting in the slot is treated as stale
    /// and replaced.
    fn begin_operation(&self) -> (Operation, Option<Resolver>) {
        let mut pending = self.inner.pending.lock();
        if let Some(operation) = pending.as_ref().filter(|op| !op.is_settled()) {
            return (operation.clone(), None);
        }

        let id = self.inner.next_operation.fetch_add(1, Ordering::Relaxed);
        let (operation, resolver) = Operation::new(id);
        *pending = Some(operation.clone());
        tracing::trace!(operation = id, "began operation");
        (operation, Some(resolver))
    }

    fn settle(&self, resolver: Resolver, outcome: OperationResult) {
        match outcome {
            Ok(value) => self.resolve(resolver, value),
            Err(rejection) => self.reject(resolver, rejection),
        }
    }

    fn resolve(&self, resolver: Resolver, value: Option<Value>) {
        self.finish(resolver, Ok(value));
    }

    fn reject(&self, resolver: Resolver, rejection: Rejection) {
        self.invalidate();
        self.finish(resolver, Err(rejection));
    }

    /// Clears the slot and settles the operation in one step, so callers
    /// either join before the outcome is published or open a new operation
    fn finish(&self, resolver: Resolver, outcome: OperationResult) {
        let mut pending = self.inner.pending.lock();
        if pending.as_ref().map(Operation::id) == Some(resolver.id()) {
            *pending = None;
        }
        resolver.settle(outcome);
    }
}

/// Whether a stored value counts as "no credentials"
///
/// `null`, `false`, numbers, empty strings, empty arrays and objects
/// without keys are all empty.
pub(crate) fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}
