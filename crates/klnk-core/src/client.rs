//! The transaction entry point.

use crate::buffer::BufferRegistry;
use crate::channel::{ControlChannel, OpenOutcome};
use crate::config::ProtocolConfig;
use crate::error::{KlnkError, Result};
use crate::mounts::MountTable;
use crate::request::ResourceRequest;
use std::sync::Arc;
use tracing::{debug, trace};

/// Issues requests over a control channel.
///
/// Holds no per-request state: every [`transact`](Self::transact) is an
/// independent open+close with no retry, batching or caching.
#[derive(Clone)]
pub struct KlnkClient {
    channel: Arc<dyn ControlChannel>,
    mounts: MountTable,
    buffers: BufferRegistry,
}

impl std::fmt::Debug for KlnkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlnkClient")
            .field("channel", &self.channel.describe())
            .field("mounts", &self.mounts)
            .finish()
    }
}

impl KlnkClient {
    pub fn new(channel: Arc<dyn ControlChannel>, mounts: MountTable) -> Self {
        Self {
            channel,
            mounts,
            buffers: BufferRegistry::new(),
        }
    }

    /// Use a specific registry, e.g. one shared with an in-process backend.
    pub fn with_buffers(mut self, buffers: BufferRegistry) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    pub fn buffers(&self) -> &BufferRegistry {
        &self.buffers
    }

    /// Run one request as a single open+close on the control channel.
    ///
    /// A successful open and the reserved `EOK` code both mean success. Any
    /// other code comes back classified by [`KlnkError::from_code`], with the
    /// original code still available through [`KlnkError::errno`].
    pub async fn transact(&self, request: &ResourceRequest<'_>) -> Result<()> {
        let path = request.to_path()?.render(&self.mounts.control_root)?;
        debug!(
            target: "klnk::channel",
            cls = %request.cls,
            op = %request.op,
            id = request.id,
            "transact {}",
            path
        );

        match self.channel.open(&path).await? {
            OpenOutcome::Opened(handle) => {
                handle.close().await?;
                trace!(target: "klnk::channel", "{} opened", path);
                Ok(())
            }
            OpenOutcome::Failed(code) if code == ProtocolConfig::EOK => Ok(()),
            OpenOutcome::Failed(code) => {
                debug!(target: "klnk::channel", code, "{} failed", path);
                Err(KlnkError::from_code(code))
            }
        }
    }
}
