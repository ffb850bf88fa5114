//! Order scheduler.
//!
//! Orders are queued FIFO and dispatched by a single pump task that fans
//! work out onto pooled sessions, bounded by a running ceiling of twice the
//! pool's `max_connection` (command multiplexing keeps two orders per
//! session reasonable). Failed orders are requeued at the front of the
//! queue when the failure is transient, so retries keep their place in
//! line.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use crate::error::{classify_exec, Error, ErrorClass, Result};
use crate::pool::{ConnectionPool, PooledSession};
use crate::ports::{CommandOutput, ExecOptions, Session, SessionFactory};
use crate::transfer::{TransferEngine, TransferFilter, TransferSummary};

/// Configuration for the scheduler
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Delay before a transiently failed order is dispatched again, in
    /// milliseconds
    pub exec_retry_delay_ms: u64,
    /// Override of the running ceiling; defaults to `max_connection * 2`
    pub max_running: Option<usize>,
}

impl SchedulerConfig {
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            exec_retry_delay_ms: 1000,
            max_running: None,
        }
    }
}

/// The work a single order performs.
pub enum OrderPayload {
    Exec {
        command: String,
        options: ExecOptions,
    },
    Put {
        local: PathBuf,
        remote: String,
    },
    Get {
        remote: String,
        local: PathBuf,
    },
    PutRecursive {
        local: PathBuf,
        remote: String,
        filter: TransferFilter,
    },
    GetRecursive {
        remote: String,
        local: PathBuf,
        filter: TransferFilter,
    },
}

impl OrderPayload {
    fn kind(&self) -> &'static str {
        match self {
            Self::Exec { .. } => "exec",
            Self::Put { .. } => "put",
            Self::Get { .. } => "get",
            Self::PutRecursive { .. } => "put-recursive",
            Self::GetRecursive { .. } => "get-recursive",
        }
    }

    /// Whether the order can be retried after its connection dropped
    /// mid-flight. Transfers overwrite their destination, so re-running
    /// them is safe; a remote command may already have taken effect.
    fn idempotent(&self) -> bool {
        !matches!(self, Self::Exec { .. })
    }
}

/// What a completed order produced.
#[derive(Debug, Clone)]
pub enum OrderOutcome {
    Exec(CommandOutput),
    Transfer(TransferSummary),
}

struct Order {
    payload: OrderPayload,
    reply: oneshot::Sender<Result<OrderOutcome>>,
}

struct Inner<F: SessionFactory> {
    pool: Arc<ConnectionPool<F>>,
    queue: Mutex<VecDeque<Order>>,
    running: AtomicUsize,
    max_running: usize,
    exec_retry_delay: Duration,
    wake: Notify,
    closed: AtomicBool,
}

impl<F: SessionFactory> Inner<F> {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Order>> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Put a transiently failed order back at the head of the line.
    ///
    /// Shutdown drains the queue under the same lock, so an order requeued
    /// after the drain is failed here instead of sitting in a queue nobody
    /// pumps anymore.
    fn requeue_front(&self, order: Order) {
        let mut queue = self.lock_queue();
        if self.closed.load(Ordering::SeqCst) {
            drop(queue);
            let _ = order.reply.send(Err(Error::SchedulerClosed));
            return;
        }
        queue.push_front(order);
        drop(queue);
        self.wake.notify_one();
    }
}

/// Handle to the scheduler; cheap to clone.
pub struct Scheduler<F: SessionFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: SessionFactory> Clone for Scheduler<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: SessionFactory> Scheduler<F> {
    /// Create a scheduler over `pool` and start its pump task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool<F>>, config: SchedulerConfig) -> Self {
        let max_running = config
            .max_running
            .unwrap_or(pool.config().max_connection * 2)
            .max(1);
        let inner = Arc::new(Inner {
            pool,
            queue: Mutex::new(VecDeque::new()),
            running: AtomicUsize::new(0),
            max_running,
            exec_retry_delay: Duration::from_millis(config.exec_retry_delay_ms),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(pump(Arc::clone(&inner)));
        Self { inner }
    }

    /// Queue an order and wait for its outcome.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerClosed` if the scheduler was shut down before the
    /// order completed, otherwise the order's own error.
    pub async fn submit(&self, payload: OrderPayload) -> Result<OrderOutcome> {
        debug!(kind = payload.kind(), "Queueing order");
        let (reply, receiver) = oneshot::channel();
        {
            let mut queue = self.inner.lock_queue();
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(Error::SchedulerClosed);
            }
            queue.push_back(Order { payload, reply });
        }
        self.inner.wake.notify_one();
        receiver.await.map_err(|_| Error::SchedulerClosed)?
    }

    /// Stop accepting orders and fail everything still queued. Orders
    /// already running complete normally.
    pub async fn shutdown(&self) {
        let drained: Vec<Order> = {
            let mut queue = self.inner.lock_queue();
            self.inner.closed.store(true, Ordering::SeqCst);
            queue.drain(..).collect()
        };
        self.inner.wake.notify_one();
        if !drained.is_empty() {
            info!(orders = drained.len(), "Failing queued orders on shutdown");
        }
        for order in drained {
            let _ = order.reply.send(Err(Error::SchedulerClosed));
        }
    }

    /// Queued orders not yet dispatched.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.lock_queue().len()
    }

    /// Orders currently running.
    #[must_use]
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }
}

/// Single dispatcher loop: pop the oldest order whenever there is running
/// capacity, acquire a session for it, and fan it out to its own task.
async fn pump<F: SessionFactory>(inner: Arc<Inner<F>>) {
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let order = if inner.running.load(Ordering::SeqCst) < inner.max_running {
            inner.lock_queue().pop_front()
        } else {
            None
        };

        let Some(order) = order else {
            inner.wake.notified().await;
            continue;
        };

        let session = match inner.pool.acquire().await {
            Ok(session) => session,
            Err(e) => {
                warn!(kind = order.payload.kind(), error = %e, "No session for order");
                let _ = order.reply.send(Err(e));
                continue;
            }
        };

        inner.running.fetch_add(1, Ordering::SeqCst);
        let worker_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            run_order(&worker_inner, session, order).await;
            worker_inner.running.fetch_sub(1, Ordering::SeqCst);
            worker_inner.wake.notify_one();
        });
    }
}

async fn run_order<F: SessionFactory>(
    inner: &Inner<F>,
    session: PooledSession<F::Session>,
    order: Order,
) {
    let kind = order.payload.kind();
    match execute(&*session, &order.payload).await {
        Ok(outcome) => {
            let _ = order.reply.send(Ok(outcome));
        }
        Err(e) => match classify_exec(&e) {
            ErrorClass::ExecTransientBusy => {
                debug!(kind, error = %e, "Session busy, requeuing order");
                drop(session);
                tokio::time::sleep(inner.exec_retry_delay).await;
                inner.requeue_front(order);
            }
            ErrorClass::NeedsReconnect => {
                warn!(kind, error = %e, "Connection lost during order");
                session.force_close().await;
                drop(session);
                if order.payload.idempotent() {
                    inner.requeue_front(order);
                } else {
                    let _ = order.reply.send(Err(e));
                }
            }
            _ => {
                let _ = order.reply.send(Err(e));
            }
        },
    }
}

async fn execute<S: Session>(session: &S, payload: &OrderPayload) -> Result<OrderOutcome> {
    if let OrderPayload::Exec { command, options } = payload {
        return session.exec(command, options).await.map(OrderOutcome::Exec);
    }

    let mut channel = session.open_data_channel().await?;
    let result = {
        let engine = TransferEngine::new(channel.as_ref());
        run_transfer(&engine, payload).await
    };
    if let Err(e) = channel.close().await {
        debug!(error = %e, "Failed to close data channel");
    }
    result.map(OrderOutcome::Transfer)
}

async fn run_transfer(
    engine: &TransferEngine<'_>,
    payload: &OrderPayload,
) -> Result<TransferSummary> {
    match payload {
        OrderPayload::Put { local, remote } => {
            let bytes = engine.put(local, remote).await?;
            Ok(TransferSummary {
                files: 1,
                bytes,
                dirs: 0,
            })
        }
        OrderPayload::Get { remote, local } => {
            let bytes = engine.get(remote, local).await?;
            Ok(TransferSummary {
                files: 1,
                bytes,
                dirs: 0,
            })
        }
        OrderPayload::PutRecursive {
            local,
            remote,
            filter,
        } => engine.put_recursive(local, remote, filter).await,
        OrderPayload::GetRecursive {
            remote,
            local,
            filter,
        } => engine.get_recursive(remote, local, filter).await,
        OrderPayload::Exec { .. } => Err(Error::Exec {
            reason: "exec order routed to transfer path".to_string(),
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::ports::memory::{MemoryFactory, MemoryRemote};

    fn scheduler(
        remote: &MemoryRemote,
        max_connection: usize,
        max_running: Option<usize>,
    ) -> Scheduler<MemoryFactory> {
        let pool = Arc::new(ConnectionPool::new(
            MemoryFactory::new(remote.clone()),
            PoolConfig {
                max_connection,
                connection_retry: 2,
                connection_retry_delay_ms: 1,
            },
        ));
        Scheduler::new(
            pool,
            SchedulerConfig {
                exec_retry_delay_ms: 5,
                max_running,
            },
        )
    }

    fn exec_order(command: &str) -> OrderPayload {
        OrderPayload::Exec {
            command: command.to_string(),
            options: ExecOptions::default(),
        }
    }

    // ============== Basic dispatch ==============

    #[tokio::test]
    async fn test_exec_order_returns_command_output() {
        let remote = MemoryRemote::new();
        let sched = scheduler(&remote, 1, None);

        let outcome = sched.submit(exec_order("uname -a")).await.unwrap();
        match outcome {
            OrderOutcome::Exec(output) => {
                assert_eq!(output.stdout, "uname -a\n");
                assert_eq!(output.exit_status, 0);
            }
            OrderOutcome::Transfer(_) => panic!("expected exec outcome"),
        }
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_transfer_order_returns_summary() {
        let remote = MemoryRemote::new();
        remote.add_dir("/inbox");
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("data.bin");
        std::fs::write(&local, b"12345").unwrap();

        let sched = scheduler(&remote, 1, None);
        let outcome = sched
            .submit(OrderPayload::Put {
                local,
                remote: "/inbox/data.bin".to_string(),
            })
            .await
            .unwrap();
        match outcome {
            OrderOutcome::Transfer(summary) => {
                assert_eq!(summary.files, 1);
                assert_eq!(summary.bytes, 5);
            }
            OrderOutcome::Exec(_) => panic!("expected transfer outcome"),
        }
        assert_eq!(remote.file_data("/inbox/data.bin").unwrap(), b"12345");
        sched.shutdown().await;
    }

    // ============== Concurrency ceiling ==============

    #[tokio::test]
    async fn test_running_orders_bounded_by_twice_max_connection() {
        let remote = MemoryRemote::new();
        remote.set_exec_delay(Duration::from_millis(30));
        let sched = scheduler(&remote, 2, None);

        let mut handles = Vec::new();
        for i in 0..10 {
            let sched = sched.clone();
            handles.push(tokio::spawn(async move {
                sched.submit(exec_order(&format!("job-{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(remote.peak_execs() <= 4, "peak {}", remote.peak_execs());
        assert_eq!(remote.exec_log().len(), 10);
        sched.shutdown().await;
    }

    // ============== Transient busy retry ==============

    #[tokio::test]
    async fn test_busy_failure_is_retried_and_succeeds() {
        let remote = MemoryRemote::new();
        remote.push_exec_failure(Error::ChannelOpen {
            reason: "no free channel".to_string(),
        });
        let sched = scheduler(&remote, 1, None);

        let outcome = sched.submit(exec_order("date")).await.unwrap();
        assert!(matches!(outcome, OrderOutcome::Exec(_)));
        assert_eq!(remote.exec_log(), vec!["date"]);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_busy_order_requeues_at_the_front() {
        let remote = MemoryRemote::new();
        remote.push_exec_failure(Error::Busy {
            reason: "channel limit".to_string(),
        });
        // One order at a time, so queue order is observable in the log.
        let sched = scheduler(&remote, 1, Some(1));

        let first = sched.clone();
        let h1 = tokio::spawn(async move { first.submit(exec_order("first")).await });
        // Give the first order time to be dispatched and hit the fault.
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = sched.clone();
        let h2 = tokio::spawn(async move { second.submit(exec_order("second")).await });

        h1.await.unwrap().unwrap();
        h2.await.unwrap().unwrap();
        assert_eq!(remote.exec_log(), vec!["first", "second"]);
        sched.shutdown().await;
    }

    // ============== Connection loss ==============

    #[tokio::test]
    async fn test_exec_order_fails_when_connection_drops() {
        let remote = MemoryRemote::new();
        remote.push_exec_failure(Error::ConnectionReset);
        let sched = scheduler(&remote, 1, None);

        let err = sched.submit(exec_order("apt upgrade")).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionReset));

        // The slot reconnects for the next order.
        sched.submit(exec_order("date")).await.unwrap();
        assert_eq!(remote.connect_attempts(), 2);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_transfer_order_retries_after_connection_drop() {
        let remote = MemoryRemote::new();
        remote.add_file("/outbox/log.txt", b"entries", 0o644);
        remote.push_channel_failure(Error::ConnectionReset);
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&remote, 1, None);

        let outcome = sched
            .submit(OrderPayload::Get {
                remote: "/outbox/log.txt".to_string(),
                local: dir.path().join("log.txt"),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, OrderOutcome::Transfer(_)));
        assert_eq!(
            std::fs::read(dir.path().join("log.txt")).unwrap(),
            b"entries"
        );
        assert_eq!(remote.connect_attempts(), 2);
        sched.shutdown().await;
    }

    // ============== Fatal failures ==============

    #[tokio::test]
    async fn test_fatal_exec_failure_is_not_retried() {
        let remote = MemoryRemote::new();
        remote.push_exec_failure(Error::Exec {
            reason: "command not found".to_string(),
        });
        let sched = scheduler(&remote, 1, None);

        let err = sched.submit(exec_order("nope")).await.unwrap_err();
        assert!(matches!(err, Error::Exec { .. }));
        assert!(remote.exec_log().is_empty());
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_pool_fails_the_order() {
        let remote = MemoryRemote::new();
        remote.push_connect_failure(Error::Auth {
            user: "deploy".to_string(),
            host: "remote".to_string(),
        });
        let sched = scheduler(&remote, 1, None);

        let err = sched.submit(exec_order("date")).await.unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
        sched.shutdown().await;
    }

    // ============== Shutdown ==============

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let remote = MemoryRemote::new();
        let sched = scheduler(&remote, 1, None);

        sched.shutdown().await;
        let err = sched.submit(exec_order("date")).await.unwrap_err();
        assert!(matches!(err, Error::SchedulerClosed));
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_orders() {
        let remote = MemoryRemote::new();
        remote.set_exec_delay(Duration::from_millis(50));
        let sched = scheduler(&remote, 1, Some(1));

        let running = sched.clone();
        let h1 = tokio::spawn(async move { running.submit(exec_order("long")).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let queued = sched.clone();
        let h2 = tokio::spawn(async move { queued.submit(exec_order("waiting")).await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        sched.shutdown().await;

        // The running order completes, the queued one is failed.
        h1.await.unwrap().unwrap();
        let err = h2.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::SchedulerClosed));
    }

    #[tokio::test]
    async fn test_shutdown_during_busy_backoff_fails_the_order() {
        let remote = MemoryRemote::new();
        remote.push_exec_failure(Error::Busy {
            reason: "channel limit".to_string(),
        });
        let pool = Arc::new(ConnectionPool::new(
            MemoryFactory::new(remote.clone()),
            PoolConfig {
                max_connection: 1,
                connection_retry: 2,
                connection_retry_delay_ms: 1,
            },
        ));
        // Long backoff so shutdown lands while the order is between attempts.
        let sched = Scheduler::new(
            pool,
            SchedulerConfig {
                exec_retry_delay_ms: 200,
                max_running: None,
            },
        );

        let pending = sched.clone();
        let handle = tokio::spawn(async move { pending.submit(exec_order("date")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        sched.shutdown().await;

        // The order must still settle: requeued after the drain, it is failed
        // rather than parked in a queue nobody pumps.
        let err = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("order settled after shutdown")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::SchedulerClosed));
        assert!(remote.exec_log().is_empty());
    }
}
