//! Per-call context: cancellation, deadline, journal id, cache bypass.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::journal::JournalId;
use wash_types::{WashError, WashResult};

/// The handle every capability call is parameterized by.
///
/// Contexts are cheap to clone and flow downward: a FUSE or HTTP request
/// builds one at the edge and the same context reaches the plugin
/// subprocess. Cancelling the token or passing the deadline makes
/// [`Context::cancelled`] complete; subprocess invocations translate that
/// into SIGTERM/SIGKILL escalation.
#[derive(Debug, Clone)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    journal: Option<JournalId>,
    bypass_cache: bool,
}

impl Context {
    /// A context with no deadline and no journal id.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            journal: None,
            bypass_cache: false,
        }
    }

    /// Derive a context that is cancelled when `self` is, with its own
    /// independently-cancellable token.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    pub fn with_journal(mut self, id: JournalId) -> Self {
        self.journal = Some(id);
        self
    }

    /// Disable both lookup and population of the operation cache for calls
    /// made with this context.
    pub fn with_cache_bypass(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn journal(&self) -> Option<&JournalId> {
        self.journal.as_ref()
    }

    pub fn bypasses_cache(&self) -> bool {
        self.bypass_cache
    }

    /// Request cancellation of this context (and contexts derived from it).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Completes when the token is cancelled or the deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// Run a future, returning `Cancelled` if the context fires first.
    pub async fn run<T>(
        &self,
        fut: impl std::future::Future<Output = WashResult<T>>,
    ) -> WashResult<T> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(WashError::Cancelled),
            result = fut => result,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
