//! Scripted transports shared by unit tests

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use http::StatusCode;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    config::AuthConfig,
    session::AuthSession,
    store::CredentialStore,
    transport::{ApiRequest, ApiResponse, BoxError, Transport},
};

pub(crate) enum Reply {
    Respond(StatusCode, Value),
    Delayed(Duration, StatusCode, Value),
    Fail(&'static str),
    Hang,
}

/// A transport answering each URL from a queue of scripted replies
///
/// Unscripted requests receive `404` with a `null` body.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push(&self, url: &str, reply: Reply) -> &Self {
        self.replies
            .lock()
            .entry(url.to_owned())
            .or_default()
            .push_back(reply);
        self
    }

    pub(crate) fn reply(&self, url: &str, status: StatusCode, body: Value) -> &Self {
        self.push(url, Reply::Respond(status, body))
    }

    pub(crate) fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().clone()
    }

    pub(crate) fn calls_to(&self, url: &str) -> Vec<ApiRequest> {
        self.calls
            .lock()
            .iter()
            .filter(|r| r.url() == url)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, BoxError> {
        let url = request.url().to_owned();
        self.calls.lock().push(request);

        let reply = self
            .replies
            .lock()
            .get_mut(&url)
            .and_then(VecDeque::pop_front);

        match reply {
            Some(Reply::Respond(status, body)) => Ok(ApiResponse::new(status, body)),
            Some(Reply::Delayed(delay, status, body)) => {
                tokio::time::sleep(delay).await;
                Ok(ApiResponse::new(status, body))
            }
            Some(Reply::Fail(message)) => Err(message.into()),
            Some(Reply::Hang) => futures::future::pending().await,
            None => Ok(ApiResponse::new(StatusCode::NOT_FOUND, Value::Null)),
        }
    }
}

pub(crate) fn session_with(config: AuthConfig, transport: &Arc<ScriptedTransport>) -> AuthSession {
    AuthSession::builder(config)
        .with_store(CredentialStore::in_memory())
        .build(transport.clone())
}

pub(crate) fn session(transport: &Arc<ScriptedTransport>) -> AuthSession {
    session_with(AuthConfig::default(), transport)
}
