//! sshmux - resilient SSH command execution and file transfer.
//!
//! Work is expressed as orders submitted to a FIFO [`sched::Scheduler`],
//! dispatched over a bounded [`pool::ConnectionPool`] of SSH sessions.
//! Failures are classified centrally in [`error`]: fatal connect errors
//! abort, transient ones retry with a delay, busy servers get their order
//! requeued at the front, and dropped connections are rebuilt transparently.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod ports;
pub mod sched;
pub mod ssh;
pub mod transfer;

pub use client::RemoteClient;
pub use config::Config;
pub use error::{Error, ErrorClass, Result};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
pub use sched::{OrderOutcome, OrderPayload, Scheduler, SchedulerConfig};
pub use ssh::SshSessionFactory;
pub use transfer::{TransferFilter, TransferSummary};
