//! Bounded connection pool with least-busy selection.
//!
//! The pool owns up to `max_connection` sessions to a single target. Every
//! acquisition returns a guard that marks the underlying session busy for its
//! lifetime; selection prefers idle sessions, grows the pool below the cap,
//! and otherwise multiplexes onto the least-busy session. Connecting is
//! retried on transient failures and aborted immediately on fatal ones.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{classify_connect, ErrorClass, Result};
use crate::ports::{Session, SessionFactory};

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrent sessions to the target
    pub max_connection: usize,
    /// Transient connect failures retried before giving up
    pub connection_retry: u32,
    /// Delay between connect attempts, in milliseconds
    pub connection_retry_delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connection: 4,
            connection_retry: 5,
            connection_retry_delay_ms: 1000,
        }
    }
}

struct PoolSlot<S> {
    session: Arc<S>,
    busy: Arc<AtomicUsize>,
}

/// Pool of sessions produced by a [`SessionFactory`].
pub struct ConnectionPool<F: SessionFactory> {
    factory: F,
    config: PoolConfig,
    slots: Mutex<Vec<PoolSlot<F::Session>>>,
}

impl<F: SessionFactory> ConnectionPool<F> {
    /// Create a new pool.
    ///
    /// If `max_connection` is 0, it is silently clamped to 1 to avoid a
    /// pool that can never hand out a session.
    #[must_use]
    pub fn new(factory: F, mut config: PoolConfig) -> Self {
        config.max_connection = config.max_connection.max(1);
        Self {
            factory,
            config,
            slots: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire a connected session.
    ///
    /// Preference order: an idle session, then a fresh session while the
    /// pool is below `max_connection`, then the session with the fewest
    /// concurrent users (lowest slot index on ties).
    ///
    /// # Errors
    ///
    /// Returns the last connect error after retries are exhausted, or the
    /// first error classified as fatal.
    pub async fn acquire(&self) -> Result<PooledSession<F::Session>> {
        let (session, busy) = {
            let mut slots = self.slots.lock().await;

            let selected = if let Some(idx) = slots
                .iter()
                .position(|slot| slot.busy.load(Ordering::SeqCst) == 0)
            {
                debug!(slot = idx, "Reusing idle pooled session");
                idx
            } else if slots.len() < self.config.max_connection {
                info!(slot = slots.len(), "Opening new pooled session");
                let session = self.factory.open().await?;
                slots.push(PoolSlot {
                    session: Arc::new(session),
                    busy: Arc::new(AtomicUsize::new(0)),
                });
                slots.len() - 1
            } else {
                let idx = slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| slot.busy.load(Ordering::SeqCst))
                    .map(|(idx, _)| idx)
                    .unwrap_or(0);
                debug!(
                    slot = idx,
                    busy = slots[idx].busy.load(Ordering::SeqCst),
                    "Pool at capacity, multiplexing onto least-busy session"
                );
                idx
            };

            let slot = &slots[selected];
            // Claim the slot before releasing the lock so concurrent
            // acquisitions see it as busy.
            slot.busy.fetch_add(1, Ordering::SeqCst);
            (Arc::clone(&slot.session), Arc::clone(&slot.busy))
        };

        if let Err(e) = self.ensure_connected(&session).await {
            busy.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }

        Ok(PooledSession { session, busy })
    }

    /// Connect the session if it is not already connected, retrying
    /// transient failures up to `connection_retry` times.
    async fn ensure_connected(&self, session: &F::Session) -> Result<()> {
        if session.is_connected().await {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        loop {
            match session.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if classify_connect(&e) == ErrorClass::ConnectFatal => {
                    warn!(error = %e, "Connect failed fatally, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    if attempt >= self.config.connection_retry {
                        warn!(
                            attempts = attempt + 1,
                            error = %e,
                            "Connect retries exhausted"
                        );
                        return Err(e);
                    }
                    attempt += 1;
                    debug!(attempt, error = %e, "Transient connect failure, retrying");
                    tokio::time::sleep(Duration::from_millis(
                        self.config.connection_retry_delay_ms,
                    ))
                    .await;
                }
            }
        }
    }

    /// Get pool statistics
    #[must_use = "pool stats should be used for monitoring or logging"]
    pub async fn stats(&self) -> PoolStats {
        let slots = self.slots.lock().await;
        let busy = slots
            .iter()
            .filter(|slot| slot.busy.load(Ordering::SeqCst) > 0)
            .count();
        PoolStats {
            total_sessions: slots.len(),
            busy_sessions: busy,
        }
    }

    /// Close every session and empty the pool. Idempotent; sessions still
    /// held by guards are closed in place and their guards become inert.
    pub async fn disconnect_all(&self) {
        let drained: Vec<_> = {
            let mut slots = self.slots.lock().await;
            slots.drain(..).collect()
        };

        for slot in &drained {
            if let Err(e) = slot.session.close().await {
                warn!(error = %e, "Failed to close pooled session");
            }
        }

        if !drained.is_empty() {
            info!(closed = drained.len(), "Connection pool closed");
        }
    }
}

/// Statistics about the connection pool
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_sessions: usize,
    pub busy_sessions: usize,
}

/// Guard over one pooled session; the session counts as busy until the
/// guard is dropped.
pub struct PooledSession<S: Session> {
    session: Arc<S>,
    busy: Arc<AtomicUsize>,
}

impl<S: Session> PooledSession<S> {
    /// Tear the underlying session down without removing its slot; the
    /// next acquisition of the slot reconnects it.
    pub async fn force_close(&self) {
        if let Err(e) = self.session.close().await {
            warn!(error = %e, "Failed to close session");
        }
    }
}

// Manual impl: the session type itself carries no Debug bound.
impl<S: Session> std::fmt::Debug for PooledSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("busy", &self.busy.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<S: Session> std::ops::Deref for PooledSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: Session> Drop for PooledSession<S> {
    fn drop(&mut self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Tests
// ============================================================================
