//! SSH transport adapter
//!
//! Implements the session ports over russh and russh-sftp. The rest of the
//! crate only sees [`crate::ports::Session`] and friends; everything
//! protocol-specific lives here.

mod session;
mod sftp;

pub use session::{SshSession, SshSessionFactory};
pub use sftp::SftpChannel;
