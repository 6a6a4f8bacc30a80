//! Session admission slot
//!
//! A process-wide arbiter for "who owns the player". At most one connection
//! holds the slot; only the holder may drive the player. ANNOUNCE claims it,
//! optionally pre-empting the current holder, and cleanup releases it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{Instant, sleep};

use super::connection::ConnHandle;

/// How long an ANNOUNCE will wait for the slot to free up.
pub const ACQUIRE_BUDGET: Duration = Duration::from_secs(3);

/// How often a waiting ANNOUNCE re-checks the slot.
const ACQUIRE_POLL: Duration = Duration::from_millis(100);

/// Outcome of an acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The slot is ours.
    ///
    /// `interrupted` is true when it was taken by stopping another session;
    /// a fresh acquisition additionally resets the RTP port pool.
    Acquired {
        /// Whether another session was pre-empted to get here
        interrupted: bool,
    },
    /// Another connection holds the slot and would not yield.
    Busy,
}

/// The process-wide playing-connection slot.
#[derive(Debug, Default)]
pub struct SessionSlot {
    holder: Mutex<Option<Arc<ConnHandle>>>,
}

impl SessionSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `conn` currently owns the player.
    #[must_use]
    pub fn holder_is(&self, conn: &Arc<ConnHandle>) -> bool {
        let holder = self.holder.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        holder.as_ref().is_some_and(|h| Arc::ptr_eq(h, conn))
    }

    /// Release the slot if `conn` holds it. Returns whether it did.
    pub fn release_if(&self, conn: &Arc<ConnHandle>) -> bool {
        let mut holder = self.holder.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if holder.as_ref().is_some_and(|h| Arc::ptr_eq(h, conn)) {
            tracing::debug!("connection {}: unlocking play lock", conn.number());
            *holder = None;
            true
        } else {
            false
        }
    }

    /// Try to acquire the slot for `conn`, waiting out (or pre-empting) the
    /// current holder within `budget`.
    pub async fn acquire(
        &self,
        conn: &Arc<ConnHandle>,
        allow_interruption: bool,
        budget: Duration,
    ) -> AcquireOutcome {
        enum Claim {
            Taken,
            AlreadyOurs,
            WaitFor(Arc<ConnHandle>, bool),
            Refused,
        }

        let claim = {
            let mut holder = self.holder.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match holder.clone() {
                None => {
                    *holder = Some(conn.clone());
                    Claim::Taken
                }
                Some(current) if Arc::ptr_eq(&current, conn) => Claim::AlreadyOurs,
                Some(current) if current.stop_requested() => Claim::WaitFor(current, false),
                Some(current) if allow_interruption => Claim::WaitFor(current, true),
                Some(_) => Claim::Refused,
            }
        };

        let interrupting = match claim {
            Claim::Taken => return AcquireOutcome::Acquired { interrupted: false },
            Claim::AlreadyOurs => {
                tracing::warn!("duplicate ANNOUNCE, by the look of it!");
                return AcquireOutcome::Acquired { interrupted: false };
            }
            Claim::Refused => return AcquireOutcome::Busy,
            Claim::WaitFor(current, interrupt) => {
                if interrupt {
                    tracing::debug!(
                        "connection {}: ANNOUNCE: asking playing connection {} to shut down",
                        conn.number(),
                        current.number()
                    );
                    current.request_stop();
                } else {
                    tracing::debug!(
                        "connection {}: ANNOUNCE is waiting for connection {} to shut down",
                        conn.number(),
                        current.number()
                    );
                }
                interrupt
            }
        };

        let deadline = Instant::now() + budget;
        loop {
            {
                let mut holder = self.holder.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if holder.is_none() {
                    *holder = Some(conn.clone());
                    tracing::debug!("connection {}: ANNOUNCE got the player", conn.number());
                    return AcquireOutcome::Acquired {
                        interrupted: interrupting,
                    };
                }
            }
            if Instant::now() >= deadline {
                tracing::debug!("connection {}: ANNOUNCE failed to get the player", conn.number());
                return AcquireOutcome::Busy;
            }
            sleep(ACQUIRE_POLL).await;
        }
    }
}
