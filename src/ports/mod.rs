//! Ports module - trait definitions for the transport boundary
//!
//! The pool, scheduler and transfer engine drive a transport through these
//! traits; the `ssh` module provides the russh-backed adapter and `memory`
//! provides an in-process loopback transport used by tests and demos.

pub mod memory;
mod session;

pub use session::{
    CommandOutput, DataChannel, DirEntry, ExecOptions, FileKind, FileStat, OutputChunk, Session,
    SessionFactory,
};
