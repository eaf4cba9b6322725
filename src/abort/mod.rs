//! Composable cancellation.
//!
//! An [`AbortOperation`] merges an optional parent [`AbortSignal`] with any
//! number of timeout sources it owns. Its signal fires when the parent fires
//! or when one of its own timeouts elapses, and it remembers which of the two
//! happened so callers can tell a timeout apart from an external abort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Read side of an abort operation. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    /// A signal that never fires unless aborted through its owning operation.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has fired.
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }

    fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

/// A timeout registered on an [`AbortOperation`].
#[derive(Debug, Clone)]
pub struct TimeoutSource {
    after: Duration,
    fired: Arc<AtomicBool>,
}

impl TimeoutSource {
    pub fn duration(&self) -> Duration {
        self.after
    }

    /// True once the timer elapsed and cancelled its operation.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

struct Timer {
    source: TimeoutSource,
    task: JoinHandle<()>,
}

/// One node in the abort tree.
pub struct AbortOperation {
    parent: Option<CancellationToken>,
    token: CancellationToken,
    timers: Mutex<Vec<Timer>>,
    ended: AtomicBool,
}

impl AbortOperation {
    /// Start an operation that is aborted whenever `parent` is.
    pub fn start(parent: Option<&AbortSignal>) -> Self {
        let token = match parent {
            Some(signal) => signal.child_token(),
            None => CancellationToken::new(),
        };
        Self {
            parent: parent.map(|signal| signal.token.clone()),
            token,
            timers: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
        }
    }

    /// A root operation with no parent.
    pub fn root() -> Self {
        Self::start(None)
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            token: self.token.clone(),
        }
    }

    /// Abort this operation (and every operation started from its signal).
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Register a timeout that aborts this operation after `after`.
    ///
    /// Must be called from within a tokio runtime. Has no effect once the
    /// operation has ended.
    pub fn add_timeout(&self, after: Duration) -> TimeoutSource {
        let source = TimeoutSource {
            after,
            fired: Arc::new(AtomicBool::new(false)),
        };
        if self.ended.load(Ordering::SeqCst) {
            return source;
        }

        let token = self.token.clone();
        let fired = source.fired.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    fired.store(true, Ordering::SeqCst);
                    debug!(after_ms = after.as_millis() as u64, "abort operation timed out");
                    token.cancel();
                }
            }
        });

        if let Ok(mut timers) = self.timers.lock() {
            timers.push(Timer {
                source: source.clone(),
                task,
            });
        }
        source
    }

    /// True when `source` fired and the parent had not aborted.
    ///
    /// An abort coming from an ancestor always outranks a timeout.
    pub fn timed_out_by(&self, source: &TimeoutSource) -> bool {
        source.has_fired() && !self.parent_aborted()
    }

    /// True when any of this operation's own timeouts caused the abort.
    pub fn timed_out(&self) -> bool {
        if self.parent_aborted() {
            return false;
        }
        match self.timers.lock() {
            Ok(timers) => timers.iter().any(|t| t.source.has_fired()),
            Err(_) => false,
        }
    }

    fn parent_aborted(&self) -> bool {
        self.parent
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }

    /// Release pending timers. Idempotent.
    pub fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        // Sources stay registered so timed_out() still answers after end().
        if let Ok(timers) = self.timers.lock() {
            for timer in timers.iter() {
                timer.task.abort();
            }
        }
    }
}

impl Drop for AbortOperation {
    fn drop(&mut self) {
        self.end();
    }
}
