//! Idempotent stop for runtime instances.
//!
//! [`StopLatch`] lets any number of callers request a stop, concurrently or
//! one after another. The first caller runs the stop procedure; everyone else
//! waits for it and receives the same [`StopOutcome`].

use std::future::Future;

use tokio::sync::watch;

/// How a stop request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The runtime shut down within the grace period.
    Graceful,
    /// The grace period elapsed and the runtime was killed or detached.
    Forced,
    /// Nothing was running by the time stop was requested.
    AlreadyExited,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopState {
    NotStopped,
    Stopping,
    Stopped(StopOutcome),
}

#[derive(Debug)]
pub struct StopLatch {
    state: watch::Sender<StopState>,
}

impl Default for StopLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl StopLatch {
    pub fn new() -> Self {
        let (state, _) = watch::channel(StopState::NotStopped);
        Self { state }
    }

    pub fn state(&self) -> StopState {
        self.state.borrow().clone()
    }

    /// Run `stop` unless a stop already started, then return the first
    /// call's outcome.
    pub async fn stop_with<F, Fut>(&self, stop: F) -> StopOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StopOutcome>,
    {
        // The only NotStopped -> Stopping transition.
        let claimed = self.state.send_if_modified(|state| {
            if *state == StopState::NotStopped {
                *state = StopState::Stopping;
                true
            } else {
                false
            }
        });

        if claimed {
            let mut guard = StoppingGuard {
                latch: self,
                armed: true,
            };
            let outcome = stop().await;
            guard.armed = false;
            self.state.send_replace(StopState::Stopped(outcome.clone()));
            return outcome;
        }

        let mut receiver = self.state.subscribe();
        let result = match receiver
            .wait_for(|state| matches!(state, StopState::Stopped(_)))
            .await
        {
            Ok(state) => match &*state {
                StopState::Stopped(outcome) => outcome.clone(),
                _ => StopOutcome::Failed("stop latch in unexpected state".to_string()),
            },
            Err(_) => StopOutcome::Failed("stop latch dropped".to_string()),
        };
        result
    }
}

/// Settles the latch if the claiming caller's future is dropped mid-stop.
struct StoppingGuard<'a> {
    latch: &'a StopLatch,
    armed: bool,
}

impl Drop for StoppingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.latch.state.send_replace(StopState::Stopped(StopOutcome::Failed(
                "stop interrupted".to_string(),
            )));
        }
    }
}
