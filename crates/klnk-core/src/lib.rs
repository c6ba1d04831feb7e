//! klnk - client side of a cluster-wide System V IPC service.
//!
//! Message queues, semaphores, shared memory and task membership are served
//! by a remote backend. Every request travels as a single open of an encoded
//! path below a control mount; the open's outcome is the answer. Payloads
//! move through registered buffers named by token inside the path.
//!
//! # Example
//!
//! ```rust,ignore
//! use klnk::{ExecContext, KlnkClient, MountChannel, MountTable, ResourceClass};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> klnk::Result<()> {
//!     let mounts = MountTable::load_default()?;
//!     let client = KlnkClient::new(Arc::new(MountChannel::new()), mounts);
//!
//!     let ctx = ExecContext::current()?.with_global_id(7);
//!     let id = client.get(&ctx, ResourceClass::MessageQueue, 0x1234, 0, 0).await?;
//!     println!("queue id {}", id);
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod migrate;
pub mod mounts;
pub mod ops;
pub mod records;
pub mod request;
pub mod scope;
pub mod taxonomy;

// Re-export commonly used types
pub use buffer::{BufferLease, BufferRegistry, BufferToken, SharedBuffer};
pub use channel::{
    ControlBackend, ControlChannel, ControlServer, ControlServerHandle, MountChannel, OpenOutcome,
    SocketChannel,
};
pub use client::KlnkClient;
pub use config::{ChannelConfig, PathsConfig, ProtocolConfig};
pub use error::{KlnkError, Result};
pub use migrate::{ExecCandidate, MigrationState};
pub use mounts::MountTable;
pub use records::{MsgBuf, Record, SemBuf, ShmFaultResult};
pub use request::{RequestPath, ResourceRequest};
pub use scope::ExecContext;
pub use taxonomy::{Operation, ResourceClass, ResourceDescriptor, ResourceEntry, Slot};
