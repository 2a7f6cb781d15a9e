//! Notifications published by a session
//!
//! Observers obtain a receiver from
//! [`AuthSession::subscribe()`][crate::AuthSession::subscribe()]. Each event
//! carries a stable [name][AuthEvent::name()] so that observers can
//! dispatch on the same identifiers regardless of how they receive it.

use std::{fmt, sync::Arc};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::RequestError;

/// Name of the event published after a successful sign-in or validation
pub const SUCCESS: &str = "auth:success";
/// Name of the event published after a failed sign-in or validation, or
/// when an unrecoverable `401` invalidates the session
pub const ERROR: &str = "auth:error";
/// Name of the event published when validation finds no credentials
pub const INVALID: &str = "auth:invalid";
/// Name of the event published after a successful sign-out
pub const LOGOUT_SUCCESS: &str = "auth:logout-success";
/// Name of the event published after a failed sign-out
pub const LOGOUT_ERROR: &str = "auth:logout-error";

/// The stage of authentication an event refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthStage {
    /// Signing in with credentials
    Login,
    /// Validating previously persisted credentials
    Validation,
}

impl AuthStage {
    /// The stage's identifier, `login` or `validation`
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Validation => "validation",
        }
    }
}

impl fmt::Display for AuthStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event published by a session
#[derive(Clone, Debug)]
pub enum AuthEvent {
    /// `auth:success`: sign-in or validation succeeded
    Success {
        /// Which stage succeeded
        stage: AuthStage,
        /// The payload returned by the server
        payload: Value,
    },
    /// `auth:error`: sign-in or validation failed, or the session was
    /// invalidated by an unrecoverable `401`
    ///
    /// Invalidation by the response pipeline carries neither a stage nor
    /// an error.
    Error {
        /// Which stage failed, if any
        stage: Option<AuthStage>,
        /// The failure, if any
        error: Option<Arc<RequestError>>,
    },
    /// `auth:invalid`: validation was requested without any credentials
    Invalid,
    /// `auth:logout-success`: the server accepted the sign-out
    LogoutSuccess,
    /// `auth:logout-error`: the sign-out request failed
    LogoutError {
        /// The failure
        error: Arc<RequestError>,
    },
}

impl AuthEvent {
    /// The event's name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Success { .. } => SUCCESS,
            Self::Error { .. } => ERROR,
            Self::Invalid => INVALID,
            Self::LogoutSuccess => LOGOUT_SUCCESS,
            Self::LogoutError { .. } => LOGOUT_ERROR,
        }
    }

    /// The stage the event refers to, if any
    pub fn stage(&self) -> Option<AuthStage> {
        match self {
            Self::Success { stage, .. } => Some(*stage),
            Self::Error { stage, .. } => *stage,
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<AuthEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: AuthEvent) {
        match &event {
            AuthEvent::Error {
                error: Some(error), ..
            }
            | AuthEvent::LogoutError { error } => tracing::debug!(
                event = event.name(),
                stage = event.stage().map(AuthStage::as_str),
                error = (&**error as &dyn std::error::Error),
                "publishing session event"
            ),
            _ => tracing::debug!(
                event = event.name(),
                stage = event.stage().map(AuthStage::as_str),
                "publishing session event"
            ),
        }

        // No subscribers is not an error: events are fire-and-forget.
        let _ = self.tx.send(event);
    }
}
