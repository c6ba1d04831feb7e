//! Control channel: the single blocking call a request is carried by.
//!
//! The contract is "open the encoded path read-write, then close it". The
//! open's outcome is the protocol result: a successful open, or the reserved
//! `EOK` code, means success; any other code is the backend's answer.
//!
//! # Implementations
//!
//! - [`MountChannel`]: the literal mechanic, an `open(2)` below a mounted
//!   control filesystem.
//! - [`SocketChannel`]: the same path string sent as a unary call over a
//!   local socket, for hosts without the control mount. [`ControlServer`]
//!   is its serving side.

pub mod mount;
pub mod protocol;
pub mod server;
pub mod socket;

pub use mount::MountChannel;
pub use protocol::{OpenReply, OpenRequest};
pub use server::{ControlBackend, ControlServer, ControlServerHandle};
pub use socket::SocketChannel;

use crate::error::Result;
use async_trait::async_trait;

/// What the backend answered to one open.
#[derive(Debug)]
pub enum OpenOutcome {
    /// The open succeeded; the handle must be closed to end the transaction.
    Opened(Box<dyn OpenHandle>),
    /// The open failed with this positive error number.
    Failed(i32),
}

/// A successfully opened control path.
#[async_trait]
pub trait OpenHandle: Send + std::fmt::Debug {
    /// End the transaction. Nothing is read or written before this.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Transport carrying encoded requests to the backend.
///
/// `Err` is reserved for transport failures (lost connection, unusable
/// mount); backend answers, errors included, come back as an [`OpenOutcome`].
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn open(&self, path: &str) -> Result<OpenOutcome>;

    /// Short label for logs.
    fn describe(&self) -> String;
}

/// Handle with nothing left to release.
#[derive(Debug)]
pub struct NoopHandle;

#[async_trait]
impl OpenHandle for NoopHandle {
    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
