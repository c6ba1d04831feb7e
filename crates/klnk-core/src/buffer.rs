//! Payload transfer by handle.
//!
//! A request never carries its payload inline. The caller leases a buffer from
//! a [`BufferRegistry`], writes the argument record into it, and the request
//! path carries the lease's [`BufferToken`]. The backend resolves the token
//! through the same registry, reads `inlen` bytes from offset 0 and writes at
//! most `outlen` bytes of result back at offset 0.
//!
//! The registry is the only thing that turns a token into memory, so a token
//! is meaningful only to a backend sharing the registry (in-process, or behind
//! a server that owns it). Token 0 always means "no payload".

use crate::config::BufferConfig;
use crate::error::{KlnkError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Opaque location token embedded in a request path. Zero means no buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BufferToken(pub u64);

impl BufferToken {
    pub const NONE: BufferToken = BufferToken(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

/// A contiguous byte region shared between a requester and the backend.
#[derive(Debug, Clone)]
pub struct SharedBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    fn zeroed(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<u8>>> {
        self.data.lock().map_err(|e| KlnkError::ResourceExhausted {
            message: format!("buffer lock poisoned: {}", e),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().map(|data| data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `bytes` into the buffer at `offset`.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut data = self.lock()?;
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                KlnkError::invalid(
                    "buffer",
                    format!("write of {} at {} past {}", bytes.len(), offset, data.len()),
                )
            })?;
        data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy out `len` bytes starting at `offset`.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let data = self.lock()?;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                KlnkError::invalid(
                    "buffer",
                    format!("read of {} at {} past {}", len, offset, data.len()),
                )
            })?;
        Ok(data[offset..end].to_vec())
    }
}

#[derive(Debug)]
struct RegistryInner {
    capacity: usize,
    next_token: AtomicU64,
    regions: Mutex<HashMap<BufferToken, SharedBuffer>>,
}

/// Hands out transient buffers and resolves their tokens.
///
/// Cloning shares the same registry.
#[derive(Debug, Clone)]
pub struct BufferRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::with_capacity(BufferConfig::DEFAULT_CAPACITY)
    }
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that refuses leases once `capacity` bytes are outstanding.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                capacity,
                next_token: AtomicU64::new(1),
                regions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Allocate a zeroed buffer of `len` bytes and register it.
    ///
    /// Fails with `ResourceExhausted` when the registry is at capacity or the
    /// allocation itself fails. Never retries.
    pub fn lease(&self, len: usize) -> Result<BufferLease> {
        if len == 0 {
            return Err(KlnkError::invalid("len", "cannot lease an empty buffer"));
        }
        let mut regions = self.inner.regions.lock().map_err(|e| {
            KlnkError::ResourceExhausted {
                message: format!("registry lock poisoned: {}", e),
            }
        })?;
        let in_use: usize = regions.values().map(SharedBuffer::len).sum();
        if in_use.saturating_add(len) > self.inner.capacity {
            return Err(KlnkError::ResourceExhausted {
                message: format!(
                    "{} bytes requested, {} of {} in use",
                    len, in_use, self.inner.capacity
                ),
            });
        }
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| KlnkError::ResourceExhausted {
                message: e.to_string(),
            })?;
        data.resize(len, 0);

        let token = BufferToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        let buffer = SharedBuffer::zeroed(data);
        regions.insert(token, buffer.clone());
        debug!(target: "klnk::channel", token = token.0, len, "leased buffer");

        Ok(BufferLease {
            token,
            buffer,
            registry: self.clone(),
        })
    }

    /// Resolve a token to its buffer. Backends call this.
    pub fn resolve(&self, token: BufferToken) -> Option<SharedBuffer> {
        if token.is_none() {
            return None;
        }
        self.inner
            .regions
            .lock()
            .ok()
            .and_then(|regions| regions.get(&token).cloned())
    }

    /// Number of leases currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.inner
            .regions
            .lock()
            .map(|regions| regions.len())
            .unwrap_or(0)
    }

    fn release(&self, token: BufferToken) {
        if let Ok(mut regions) = self.inner.regions.lock() {
            regions.remove(&token);
            debug!(target: "klnk::channel", token = token.0, "released buffer");
        }
    }
}

/// A leased buffer. Dropping the lease unregisters it.
#[derive(Debug)]
pub struct BufferLease {
    token: BufferToken,
    buffer: SharedBuffer,
    registry: BufferRegistry,
}

impl BufferLease {
    pub fn token(&self) -> BufferToken {
        self.token
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.registry.release(self.token);
    }
}
