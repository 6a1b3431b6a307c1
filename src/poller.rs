//! Fixed-interval status polling with synchronous cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::models::ProviderStatus;
use crate::provider::GenerationProvider;

/// Cancellation handle shared between a poll loop and whoever may stop it.
///
/// Callbacks run while holding the ticket's gate, and [`PollTicket::cancel`]
/// takes the same gate. Once `cancel` returns, no callback is running and
/// none will start. A callback may cancel its own ticket: on the firing
/// thread `cancel` only raises the flag.
#[derive(Clone, Default)]
pub struct PollTicket {
    inner: Arc<TicketInner>,
}

#[derive(Default)]
struct TicketInner {
    gate: Mutex<()>,
    firing: Mutex<Option<ThreadId>>,
    cancelled: AtomicBool,
    notify: Notify,
}

impl TicketInner {
    fn raise(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn firing_here(&self) -> bool {
        *lock(&self.firing) == Some(thread::current().id())
    }
}

/// Clears the firing thread even if the callback panics.
struct FiringGuard<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for FiringGuard<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

impl PollTicket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if self.inner.firing_here() {
            self.inner.raise();
            return;
        }
        let _gate = lock(&self.inner.gate);
        self.inner.raise();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Run `f` unless the ticket is cancelled. Returns whether it ran.
    pub fn fire<F: FnOnce()>(&self, f: F) -> bool {
        let _gate = lock(&self.inner.gate);
        if self.is_cancelled() {
            return false;
        }
        *lock(&self.inner.firing) = Some(thread::current().id());
        let _firing = FiringGuard(&self.inner.firing);
        f();
        true
    }

    /// Resolves once the ticket is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// One successful status query, as reported to progress callbacks.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PollTick {
    pub attempt: u32,
    pub status: ProviderStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollFailure {
    /// The provider itself reported failure.
    Provider(String),
    /// Attempt budget exhausted without a terminal status.
    Timeout { attempts: u32 },
    /// Status query number `attempts` could not be made or decoded.
    Transport { attempts: u32, detail: String },
}

impl PollFailure {
    /// Status queries issued before the failure, when known.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            PollFailure::Provider(_) => None,
            PollFailure::Timeout { attempts } | PollFailure::Transport { attempts, .. } => {
                Some(*attempts)
            }
        }
    }

    pub fn error_detail(&self) -> String {
        match self {
            PollFailure::Provider(detail) => detail.clone(),
            PollFailure::Timeout { attempts } => {
                format!("Generation timed out after {} status checks", attempts)
            }
            PollFailure::Transport { detail, .. } => format!("Status query failed: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Ready(String),
    Failed(PollFailure),
    Cancelled,
}

const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub struct StatusPoller {
    provider: Arc<dyn GenerationProvider>,
    interval: Duration,
    max_attempts: u32,
}

impl StatusPoller {
    /// A zero `interval` is raised to one millisecond.
    pub fn new(provider: Arc<dyn GenerationProvider>, interval: Duration, max_attempts: u32) -> Self {
        Self {
            provider,
            interval: interval.max(MIN_INTERVAL),
            max_attempts,
        }
    }

    /// Query `handle` now and then every interval until the provider reports
    /// a terminal status, a query fails, the budget runs out or `ticket` is
    /// cancelled. `on_tick` sees every decoded status.
    pub async fn poll<F>(&self, handle: &str, ticket: &PollTicket, mut on_tick: F) -> PollOutcome
    where
        F: FnMut(&PollTick) + Send,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for attempt in 1..=self.max_attempts {
            tokio::select! {
                biased;
                _ = ticket.cancelled() => return PollOutcome::Cancelled,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = ticket.cancelled() => return PollOutcome::Cancelled,
                r = self.provider.poll_status(handle) => r,
            };

            let status = match result {
                Ok(status) => status,
                Err(e) => {
                    if ticket.is_cancelled() {
                        return PollOutcome::Cancelled;
                    }
                    tracing::warn!("Status query {} for {} failed: {}", attempt, handle, e);
                    return PollOutcome::Failed(PollFailure::Transport {
                        attempts: attempt,
                        detail: e.to_string(),
                    });
                }
            };

            tracing::debug!("Poll {}/{} for {}: {:?}", attempt, self.max_attempts, handle, status);
            let tick = PollTick { attempt, status };
            if !ticket.fire(|| on_tick(&tick)) {
                return PollOutcome::Cancelled;
            }

            match tick.status {
                ProviderStatus::Ready { sample } => return PollOutcome::Ready(sample),
                ProviderStatus::Failed { detail } => {
                    return PollOutcome::Failed(PollFailure::Provider(detail))
                }
                ProviderStatus::Queued | ProviderStatus::Processing => {}
            }
        }

        tracing::warn!(
            "Giving up on {} after {} status checks",
            handle,
            self.max_attempts
        );
        PollOutcome::Failed(PollFailure::Timeout {
            attempts: self.max_attempts,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
