//! Migration trigger for executable opens.
//!
//! When a cluster participant opens an executable, one `Migrate` request asks
//! the backend whether the fetch should be relocated. The decision always
//! comes back as an error for the open:
//!
//! ```text
//! Start ─▶ ScopeChecked ─┬─▶ Requested ─▶ Decided
//!                        └─▶ Rejected
//! ```
//!
//! | outcome                     | result                                  |
//! |-----------------------------|-----------------------------------------|
//! | not a participant           | `NotFound` (fall through to local open) |
//! | path too long               | `InvalidArgument`, nothing sent         |
//! | buffer lease fails          | `ResourceExhausted`                     |
//! | backend success / `EOK`     | `Interrupted` (retry the open)          |
//! | backend `EAGAIN`            | `RetrySignal`, path rewritten to local  |
//! | anything else               | propagated unchanged                    |
//!
//! Backend success is not actionable for this operation, hence
//! `Interrupted`; this matches the only deployed backend and should be
//! re-checked against any other.

use crate::client::KlnkClient;
use crate::error::{KlnkError, Result};
use crate::records::{MigrationArg, Record};
use crate::request::ResourceRequest;
use crate::scope::ExecContext;
use crate::taxonomy::{Operation, ResourceClass};
use std::convert::Infallible;
use tracing::{debug, trace};

/// Where a migration decision currently stands. Used for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Start,
    ScopeChecked,
    Requested,
    Decided,
    Rejected,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MigrationState::Start => "start",
            MigrationState::ScopeChecked => "scope_checked",
            MigrationState::Requested => "requested",
            MigrationState::Decided => "decided",
            MigrationState::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// The path an intercepted open is about to fetch. Rewritten in place when
/// the backend asks for local resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCandidate {
    path: String,
}

impl ExecCandidate {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn into_path(self) -> String {
        self.path
    }
}

fn advance(gpid: i32, from: MigrationState, to: MigrationState) -> MigrationState {
    trace!(target: "klnk::migrate", gpid, "{} -> {}", from, to);
    to
}

impl KlnkClient {
    /// Decide whether an executable open is served locally or relocated.
    ///
    /// Never returns `Ok`: every outcome is the error the intercepted open
    /// should fail with. On [`KlnkError::RetrySignal`] the candidate now names
    /// the local fallback root and the caller retries the open there.
    pub async fn migrate(
        &self,
        ctx: &ExecContext,
        candidate: &mut ExecCandidate,
    ) -> Result<Infallible> {
        let gpid = ctx.get_global_id();
        let state = MigrationState::Start;

        if !ctx.is_global() {
            advance(gpid, state, MigrationState::Rejected);
            return Err(KlnkError::NotFound { code: libc::ENOENT });
        }
        let state = advance(gpid, state, MigrationState::ScopeChecked);

        let arg = match MigrationArg::new(candidate.path()) {
            Ok(arg) => arg,
            Err(e) => {
                debug!(target: "klnk::migrate", gpid, "invalid path");
                advance(gpid, state, MigrationState::Rejected);
                return Err(e);
            }
        };

        let lease = match self.buffers().lease(MigrationArg::SIZE) {
            Ok(lease) => lease,
            Err(e) => {
                debug!(target: "klnk::migrate", gpid, "no memory");
                advance(gpid, state, MigrationState::Rejected);
                return Err(e);
            }
        };
        lease.buffer().write_at(0, &arg.to_bytes())?;

        let request = ResourceRequest::new(ResourceClass::Task, gpid, Operation::Migrate, gpid)
            .payload(&lease, MigrationArg::SIZE, 0);
        let state = advance(gpid, state, MigrationState::Requested);
        let outcome = self.transact(&request).await;
        drop(lease);
        advance(gpid, state, MigrationState::Decided);

        let err = match outcome {
            Ok(()) => KlnkError::Interrupted,
            Err(KlnkError::RetrySignal) => {
                candidate.path = self.mounts().local_fallback_root.display().to_string();
                KlnkError::RetrySignal
            }
            Err(e) => e,
        };
        debug!(
            target: "klnk::migrate",
            gpid,
            path = arg.path(),
            errno = err.errno(),
            "migration decided"
        );
        Err(err)
    }

    /// Interception point for an executable-file open.
    ///
    /// Local contexts get `NotFound` so the caller falls through to the
    /// ordinary open; participants go through [`migrate`](Self::migrate).
    pub async fn filp_open(
        &self,
        ctx: &ExecContext,
        candidate: &mut ExecCandidate,
    ) -> Result<Infallible> {
        if ctx.is_global() {
            self.migrate(ctx, candidate).await
        } else {
            Err(KlnkError::NotFound { code: libc::ENOENT })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferRegistry;
    use crate::client::testing::{client_with, ScriptedChannel};
    use crate::config::ProtocolConfig;
    use crate::request::RequestPath;
    use std::path::Path;

    fn participant() -> ExecContext {
        ExecContext::new("/").with_global_id(42)
    }

    #[tokio::test]
    async fn test_bare_success_is_interrupted() {
        let channel = ScriptedChannel::answering(&[0]);
        let client = client_with(channel.clone());
        let mut candidate = ExecCandidate::new("/vhub/root/bin/app");

        let err = client.migrate(&participant(), &mut candidate).await.unwrap_err();
        assert!(matches!(err, KlnkError::Interrupted));
        assert_eq!(candidate.path(), "/vhub/root/bin/app");
        assert_eq!(channel.calls(), 1);
    }

    #[tokio::test]
    async fn test_eok_is_interrupted() {
        let client = client_with(ScriptedChannel::answering(&[ProtocolConfig::EOK]));
        let mut candidate = ExecCandidate::new("/bin/true");
        assert!(matches!(
            client.migrate(&participant(), &mut candidate).await,
            Err(KlnkError::Interrupted)
        ));
        assert_eq!(candidate.path(), "/bin/true");
    }

    #[tokio::test]
    async fn test_retry_signal_rewrites_to_local_fallback() {
        let client = client_with(ScriptedChannel::answering(&[libc::EAGAIN]));
        let mut candidate = ExecCandidate::new("/vhub/root/bin/app");

        let err = client.migrate(&participant(), &mut candidate).await.unwrap_err();
        assert!(matches!(err, KlnkError::RetrySignal));
        assert_eq!(candidate.path(), "/vhub/mnt/lbfs");
    }

    #[tokio::test]
    async fn test_other_errors_propagate() {
        let client = client_with(ScriptedChannel::answering(&[ProtocolConfig::EMIGRATE]));
        let mut candidate = ExecCandidate::new("/bin/true");
        let err = client.migrate(&participant(), &mut candidate).await.unwrap_err();
        assert!(matches!(err, KlnkError::TransactionFailed { code: 903 }));
        assert_eq!(candidate.path(), "/bin/true");
    }

    #[tokio::test]
    async fn test_path_limit_sends_nothing() {
        for len in [ProtocolConfig::PATH_MAX, ProtocolConfig::PATH_MAX + 1] {
            let channel = ScriptedChannel::answering(&[]);
            let client = client_with(channel.clone());
            let mut candidate = ExecCandidate::new(format!("/{}", "x".repeat(len - 1)));
            assert_eq!(candidate.path().len(), len);

            let err = client.migrate(&participant(), &mut candidate).await.unwrap_err();
            assert!(matches!(err, KlnkError::InvalidArgument { .. }));
            assert_eq!(channel.calls(), 0);
            assert_eq!(client.buffers().outstanding(), 0);
        }
    }

    #[tokio::test]
    async fn test_local_context_is_not_found() {
        let channel = ScriptedChannel::answering(&[]);
        let client = client_with(channel.clone());
        let mut candidate = ExecCandidate::new("/bin/true");

        for ctx in [ExecContext::new("/"), ExecContext::new("/").with_global_id(-1)] {
            let err = client.filp_open(&ctx, &mut candidate).await.unwrap_err();
            assert!(matches!(err, KlnkError::NotFound { code } if code == libc::ENOENT));
            let err = client.migrate(&ctx, &mut candidate).await.unwrap_err();
            assert!(matches!(err, KlnkError::NotFound { .. }));
        }
        assert_eq!(channel.calls(), 0);
    }

    #[tokio::test]
    async fn test_allocation_failure_is_resource_exhausted() {
        let channel = ScriptedChannel::answering(&[]);
        let client = client_with(channel.clone()).with_buffers(BufferRegistry::with_capacity(16));
        let mut candidate = ExecCandidate::new("/bin/true");

        let err = client.migrate(&participant(), &mut candidate).await.unwrap_err();
        assert!(matches!(err, KlnkError::ResourceExhausted { .. }));
        assert_eq!(channel.calls(), 0);
    }

    #[tokio::test]
    async fn test_request_shape_and_buffer_release() {
        let channel = ScriptedChannel::answering(&[libc::EAGAIN]);
        let client = client_with(channel.clone());
        let mut candidate = ExecCandidate::new("/vhub/root/bin/app");
        let _ = client.filp_open(&participant(), &mut candidate).await;

        let path = channel.last_path().unwrap();
        let fields = RequestPath::parse(Path::new("/vhub/mnt/klnk"), &path).unwrap();
        assert_eq!(fields.class(), Some(ResourceClass::Task));
        assert_eq!(fields.operation(), Some(Operation::Migrate));
        assert_eq!((fields.key(), fields.id()), (42, 42));
        assert_eq!((fields.val1(), fields.val2()), (0, 0));
        assert_eq!(fields.inlen as usize, MigrationArg::SIZE);
        assert_eq!(fields.outlen, 0);
        assert_ne!(fields.addr, 0);
        assert_eq!(client.buffers().outstanding(), 0);
    }
}
