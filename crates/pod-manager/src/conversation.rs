//! The Conversation: a scoped, mutually exclusive session on one pod.

use chrono::{DateTime, Utc};
use tokio::sync::{watch, OwnedSemaphorePermit};

use crate::exchange::ExchangeProgress;
use crate::message::RequestMessage;
use pod_common::PodError;

/// Where a conversation's request originated. Mirrors the handful of entry
/// points the mobile app exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSource {
    User,
    AutomaticBolus,
    Scheduled,
    Recovery,
}

/// A cooperative cancellation signal. Long poll loops check
/// `is_cancellation_requested()` (or race `cancelled()` against a timer)
/// between delays; `cancel()` can be called from outside the operation
/// (e.g. a UI cancel button). Backed by a `watch` channel rather than a
/// bare `Notify` so a `cancel()` that races a fresh waiter is never missed.
#[derive(Clone)]
pub struct CancellationToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancellation_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested; resolves immediately
    /// if it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

/// A scoped, mutually exclusive session against one pod.
///
/// Holding a `Conversation` means holding the pod's conversation-mutex
/// permit; dropping it (or calling `release`) frees the permit exactly once,
/// regardless of which exit path (success, error, cancellation) triggered
/// the drop.
pub struct Conversation {
    _permit: OwnedSemaphorePermit,
    pub request_source: RequestSource,
    pub started: DateTime<Utc>,
    pub current_exchange: Option<ExchangeProgress>,
    pub canceled: bool,
    pub failed: bool,
    pub cancel_failed: bool,
    pub exception: Option<PodError>,
    pub cancellation_token: CancellationToken,
}

impl Conversation {
    pub(crate) fn new(permit: OwnedSemaphorePermit, request_source: RequestSource) -> Self {
        Self {
            _permit: permit,
            request_source,
            started: Utc::now(),
            current_exchange: None,
            canceled: false,
            failed: false,
            cancel_failed: false,
            exception: None,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Allocates a new exchange progress, linking it as `current_exchange`.
    pub fn new_exchange(&mut self, request: RequestMessage) -> ExchangeProgress {
        let progress = ExchangeProgress::new(request);
        self.current_exchange = Some(progress.clone_shallow());
        progress
    }

    /// Records that a cancellation attempt (issuing `cancel_bolus`, etc.)
    /// failed to bring the pod out of its in-progress state.
    pub fn cancel_failed(&mut self) {
        self.cancel_failed = true;
    }

    pub fn mark_canceled(&mut self) {
        self.canceled = true;
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn record_exception(&mut self, error: PodError) {
        self.exception = Some(error);
        self.failed = true;
    }

    pub fn is_terminal(&self) -> bool {
        self.canceled || self.failed || self.exception.is_some()
    }
}

impl ExchangeProgress {
    /// A best-effort clone used only to mirror progress onto the
    /// conversation's `current_exchange` pointer; it carries request
    /// metadata, not the live in-flight state, which stays with the caller's
    /// owned copy through `perform_exchange`.
    fn clone_shallow(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use tokio::sync::Semaphore;

    #[tokio::test]
    async fn cancellation_token_reports_requested() {
        let token = CancellationToken::new();
        assert!(!token.is_cancellation_requested());
        token.cancel();
        assert!(token.is_cancellation_requested());
    }

    #[tokio::test]
    async fn conversation_holds_permit_until_dropped() {
        let sem = StdArc::new(Semaphore::new(1));
        let permit = sem.clone().acquire_owned().await.unwrap();
        let conversation = Conversation::new(permit, RequestSource::User);
        assert_eq!(sem.available_permits(), 0);
        drop(conversation);
        assert_eq!(sem.available_permits(), 1);
    }
}
