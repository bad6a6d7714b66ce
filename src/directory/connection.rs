//! Lazy connection state machine with exponential reconnect backoff
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Ready
//!       ▲                       │                │
//!       │                     error          link error
//!       │                       ▼                │
//!       └──── backoff elapsed ─ Degraded ◀───────┘ (via Disconnected)
//! ```
//!
//! Callers in `Degraded` fail fast with `DirectoryUnavailable` until the
//! backoff window has elapsed; the next call after that reconnects.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Degraded,
}

/// Exponential backoff shared by directory reconnects and message redelivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failure, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on the delay, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

impl BackoffPolicy {
    /// Delay for a 0-indexed attempt: `base * 2^attempt`, capped at `max`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(exp_delay.min(self.max_delay_ms))
    }
}

struct SlotInner<C> {
    state: ConnectionState,
    conn: Option<C>,
    failures: u32,
    retry_at: Option<Instant>,
}

/// A lazily established, shareable connection handle
///
/// `C` is a cheap-to-clone handle (e.g. a multiplexed connection).
pub struct ConnectionSlot<C> {
    inner: Mutex<SlotInner<C>>,
    policy: BackoffPolicy,
}

impl<C: Clone + Send> ConnectionSlot<C> {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: ConnectionState::Disconnected,
                conn: None,
                failures: 0,
                retry_at: None,
            }),
            policy,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Consecutive failed connection attempts
    pub async fn failures(&self) -> u32 {
        self.inner.lock().await.failures
    }

    /// Return the live connection, connecting first if needed
    ///
    /// Concurrent callers wait for a single in-progress connect.
    pub async fn get<F, Fut>(&self, connect: F) -> Result<C>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let mut inner = self.inner.lock().await;

        if inner.state == ConnectionState::Ready {
            if let Some(conn) = inner.conn.as_ref() {
                return Ok(conn.clone());
            }
        }

        if inner.state == ConnectionState::Degraded {
            if let Some(retry_at) = inner.retry_at {
                let now = Instant::now();
                if now < retry_at {
                    return Err(PipelineError::DirectoryUnavailable {
                        reason: format!(
                            "reconnect backing off after {} failed attempts",
                            inner.failures
                        ),
                        retry_after: Some(retry_at - now),
                    });
                }
            }
        }

        inner.state = ConnectionState::Connecting;
        match connect().await {
            Ok(conn) => {
                if inner.failures > 0 {
                    tracing::info!(failures = inner.failures, "Directory connection restored");
                }
                inner.conn = Some(conn.clone());
                inner.state = ConnectionState::Ready;
                inner.failures = 0;
                inner.retry_at = None;
                Ok(conn)
            }
            Err(e) => {
                let delay = self.policy.delay_for_attempt(inner.failures);
                inner.failures += 1;
                inner.conn = None;
                inner.state = ConnectionState::Degraded;
                inner.retry_at = Some(Instant::now() + delay);
                tracing::warn!(
                    failures = inner.failures,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Directory connection failed"
                );
                Err(PipelineError::DirectoryUnavailable {
                    reason: e.to_string(),
                    retry_after: Some(delay),
                })
            }
        }
    }

    /// Drop a broken connection so the next call reconnects immediately
    pub async fn invalidate(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Ready {
            tracing::warn!("Directory link lost, will reconnect on next call");
            inner.conn = None;
            inner.state = ConnectionState::Disconnected;
        }
    }

    /// Tear down the connection
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.conn = None;
        inner.state = ConnectionState::Disconnected;
        inner.failures = 0;
        inner.retry_at = None;
    }
}
