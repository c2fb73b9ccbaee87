//! Audit progress events.
//!
//! A reduced fan-out bus: stages and providers emit [`AuditEvent`]s through an
//! [`EventEmitter`]; the transport can subscribe to a per-audit channel, and
//! anything left unconsumed is mirrored to `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::StageName;

/// A single progress or diagnostic event raised during an audit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub when: DateTime<Utc>,
    /// Stage that raised the event, when attributable.
    pub stage: Option<StageName>,
    /// Short machine-readable scope, e.g. `"simulator.start"`.
    pub scope: String,
    pub message: String,
}

impl AuditEvent {
    #[must_use]
    pub fn stage(stage: StageName, scope: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            when: Utc::now(),
            stage: Some(stage),
            scope: scope.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            when: Utc::now(),
            stage: None,
            scope: scope.into(),
            message: message.into(),
        }
    }
}

/// Emits audit events to subscribers. Cheap to clone; safe to share.
#[derive(Clone)]
pub struct EventEmitter {
    sender: Option<flume::Sender<AuditEvent>>,
}

impl EventEmitter {
    /// Emitter that only mirrors events to tracing.
    #[must_use]
    pub fn tracing_only() -> Self {
        Self { sender: None }
    }

    /// Emitter plus a receiver for this audit's event stream.
    #[must_use]
    pub fn channel() -> (Self, flume::Receiver<AuditEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { sender: Some(tx) }, rx)
    }

    /// Deliver an event. Never fails: a disconnected subscriber degrades to
    /// the tracing mirror.
    pub fn emit(&self, event: AuditEvent) {
        tracing::debug!(
            scope = %event.scope,
            stage = event.stage.map(|s| s.as_str()),
            "{}",
            event.message
        );
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribed", &self.sender.is_some())
            .finish()
    }
}

/// Shared emitter handle passed down to stages and providers.
pub type SharedEmitter = Arc<EventEmitter>;
