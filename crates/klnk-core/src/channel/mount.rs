//! Control channel over a mounted control filesystem.

use super::{ControlChannel, OpenHandle, OpenOutcome};
use crate::error::Result;
use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tracing::trace;

/// Opens encoded paths directly; the mounted backend answers through the
/// open's error number.
#[derive(Debug, Clone, Default)]
pub struct MountChannel;

impl MountChannel {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug)]
struct FileHandle(File);

#[async_trait]
impl OpenHandle for FileHandle {
    async fn close(self: Box<Self>) -> Result<()> {
        drop(self.0);
        Ok(())
    }
}

#[async_trait]
impl ControlChannel for MountChannel {
    async fn open(&self, path: &str) -> Result<OpenOutcome> {
        match OpenOptions::new().read(true).write(true).open(path).await {
            Ok(file) => Ok(OpenOutcome::Opened(Box::new(FileHandle(file)))),
            Err(e) => {
                let code = e.raw_os_error().unwrap_or(libc::EIO);
                trace!(target: "klnk::channel", path, code, "open failed");
                Ok(OpenOutcome::Failed(code))
            }
        }
    }

    fn describe(&self) -> String {
        "mount".to_string()
    }
}
