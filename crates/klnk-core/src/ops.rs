//! Typed operations on cluster resources.
//!
//! Each helper builds the request with the right slot overlay, carries its
//! argument record through a leased buffer and decodes the result record the
//! backend wrote back at offset 0. Results whose `retval` is negative are
//! backend errors (`-errno`) and come back as `Err`.
//!
//! Every operation except [`KlnkClient::join`] requires a cluster participant;
//! a local context gets `NotFound` without any request being sent.

use crate::buffer::BufferLease;
use crate::client::KlnkClient;
use crate::config::ProtocolConfig;
use crate::error::{KlnkError, Result};
use crate::records::{
    CancelArg, CtlArg, MsgBuf, MsgTransferArg, Record, Retval, SemBuf, SemCtlArg, SemOpArg,
    ShmFaultResult, Timespec,
};
use crate::request::ResourceRequest;
use crate::scope::ExecContext;
use crate::taxonomy::{Operation, ResourceClass};
use bytes::BytesMut;
use std::time::Duration;
use tracing::debug;

/// Largest text a single `msg_rcv` can ask for.
pub const MSG_RCV_MAX: usize = ProtocolConfig::IO_MAX - 16;

fn require_global(ctx: &ExecContext) -> Result<()> {
    if ctx.is_global() {
        Ok(())
    } else {
        Err(KlnkError::NotFound { code: libc::ENOENT })
    }
}

fn check_retval(retval: i64) -> Result<i64> {
    if retval < 0 {
        let code = i32::try_from(-retval).unwrap_or(libc::EIO);
        Err(KlnkError::from_code(code))
    } else {
        Ok(retval)
    }
}

impl KlnkClient {
    /// Lease a buffer sized for `input` and `outlen`, write the input, run the
    /// request and hand back the lease for the caller to decode.
    async fn call_with_buffer(
        &self,
        request: ResourceRequest<'_>,
        input: Option<&BytesMut>,
        outlen: usize,
    ) -> Result<BufferLease> {
        let inlen = input.map_or(0, |bytes| bytes.len());
        let lease = self.buffers().lease(inlen.max(outlen))?;
        if let Some(bytes) = input {
            lease.buffer().write_at(0, bytes)?;
        }
        self.transact(&request.payload(&lease, inlen, outlen)).await?;
        Ok(lease)
    }

    /// Run a request whose result is a single [`Retval`].
    async fn call_retval(
        &self,
        request: ResourceRequest<'_>,
        input: Option<&BytesMut>,
    ) -> Result<i64> {
        let lease = self.call_with_buffer(request, input, Retval::default().encoded_len()).await?;
        let result = Retval::decode(&lease.buffer().read_at(0, 8)?)?;
        check_retval(result.retval)
    }

    /// Look up or create a resource by key. Returns its cluster id.
    ///
    /// The key travels in entry slot 1; `flags` and `size` (queue bytes,
    /// semaphore count or segment size) in slots 2 and 3.
    pub async fn get(
        &self,
        ctx: &ExecContext,
        cls: ResourceClass,
        key: i32,
        flags: i32,
        size: i32,
    ) -> Result<i32> {
        require_global(ctx)?;
        let request = ResourceRequest::new(cls, key, Operation::get_for(cls), key).values(flags, size);
        let id = self.call_retval(request, None).await?;
        debug!(target: "klnk::channel", gpid = ctx.get_global_id(), %cls, key, id, "get");
        i32::try_from(id).map_err(|_| KlnkError::invalid("retval", format!("id {} out of range", id)))
    }

    /// Drop this participant's reference to a resource.
    pub async fn put(&self, ctx: &ExecContext, cls: ResourceClass, key: i32, id: i32) -> Result<()> {
        require_global(ctx)?;
        self.transact(&ResourceRequest::new(cls, key, Operation::put_for(cls), id))
            .await
    }

    pub async fn msg_snd(
        &self,
        ctx: &ExecContext,
        key: i32,
        id: i32,
        msg: &MsgBuf,
        msgflg: i32,
    ) -> Result<i64> {
        require_global(ctx)?;
        let arg = MsgTransferArg {
            msgtyp: msg.mtype,
            msgsz: msg.mtext.len() as u64,
            msgflg,
        };
        let mut input = arg.to_bytes();
        msg.encode(&mut input);
        let request = ResourceRequest::new(ResourceClass::MessageQueue, key, Operation::MsgSnd, id);
        self.call_retval(request, Some(&input)).await
    }

    /// Receive one message of at most `msgsz` text bytes.
    ///
    /// The backend writes a [`Retval`] holding the text length, followed by
    /// the message type and text.
    pub async fn msg_rcv(
        &self,
        ctx: &ExecContext,
        key: i32,
        id: i32,
        msgtyp: i64,
        msgsz: usize,
        msgflg: i32,
    ) -> Result<MsgBuf> {
        require_global(ctx)?;
        if msgsz > MSG_RCV_MAX {
            return Err(KlnkError::invalid(
                "msgsz",
                format!("{} exceeds {}", msgsz, MSG_RCV_MAX),
            ));
        }
        let arg = MsgTransferArg {
            msgtyp,
            msgsz: msgsz as u64,
            msgflg,
        };
        let outlen = 8 + 8 + msgsz;
        let request = ResourceRequest::new(ResourceClass::MessageQueue, key, Operation::MsgRcv, id);
        let lease = self.call_with_buffer(request, Some(&arg.to_bytes()), outlen).await?;

        let out = lease.buffer().read_at(0, outlen)?;
        let received = check_retval(Retval::decode(&out)?.retval)? as usize;
        if received > msgsz {
            return Err(KlnkError::invalid(
                "retval",
                format!("{} bytes received into {}", received, msgsz),
            ));
        }
        let mut msg = MsgBuf::decode(&out[8..])?;
        msg.mtext.truncate(received);
        Ok(msg)
    }

    pub async fn msg_ctl(&self, ctx: &ExecContext, key: i32, id: i32, cmd: i32) -> Result<i64> {
        require_global(ctx)?;
        let request = ResourceRequest::new(ResourceClass::MessageQueue, key, Operation::MsgCtl, id);
        self.call_retval(request, Some(&CtlArg { cmd }.to_bytes())).await
    }

    /// Apply semaphore operations. `timeout` is carried to the backend, which
    /// is the one that enforces it; `None` waits indefinitely.
    pub async fn sem_op(
        &self,
        ctx: &ExecContext,
        key: i32,
        id: i32,
        sops: Vec<SemBuf>,
        timeout: Option<Duration>,
    ) -> Result<i64> {
        require_global(ctx)?;
        let arg = SemOpArg::new(timeout.map(Timespec::from).unwrap_or_default(), sops)?;
        let request = ResourceRequest::new(ResourceClass::Semaphore, key, Operation::SemOp, id);
        self.call_retval(request, Some(&arg.to_bytes())).await
    }

    /// Semaphore control. `val` is the command operand (e.g. the SETVAL value).
    pub async fn sem_ctl(
        &self,
        ctx: &ExecContext,
        key: i32,
        id: i32,
        semnum: i32,
        cmd: i32,
        val: i32,
    ) -> Result<i64> {
        require_global(ctx)?;
        let request =
            ResourceRequest::new(ResourceClass::Semaphore, key, Operation::SemCtl, id).values(val, 0);
        self.call_retval(request, Some(&SemCtlArg { semnum, cmd }.to_bytes()))
            .await
    }

    /// Undo this participant's pending semaphore adjustments on exit.
    pub async fn sem_exit(&self, ctx: &ExecContext, key: i32, id: i32) -> Result<()> {
        require_global(ctx)?;
        self.transact(&ResourceRequest::new(ResourceClass::Semaphore, key, Operation::SemExit, id))
            .await
    }

    /// Fetch one page of a shared segment. `page` is the page index within the
    /// segment and `flags` the fault flags (write, etc.).
    pub async fn shm_fault(
        &self,
        ctx: &ExecContext,
        key: i32,
        id: i32,
        page: i32,
        flags: i32,
    ) -> Result<ShmFaultResult> {
        require_global(ctx)?;
        let request = ResourceRequest::new(ResourceClass::SharedMemory, key, Operation::ShmFault, id)
            .values(page, flags);
        let lease = self.call_with_buffer(request, None, ShmFaultResult::SIZE).await?;
        let result = ShmFaultResult::decode(&lease.buffer().read_at(0, ShmFaultResult::SIZE)?)?;
        check_retval(result.retval)?;
        Ok(result)
    }

    pub async fn shm_ctl(&self, ctx: &ExecContext, key: i32, id: i32, cmd: i32) -> Result<i64> {
        require_global(ctx)?;
        let request = ResourceRequest::new(ResourceClass::SharedMemory, key, Operation::ShmCtl, id);
        self.call_retval(request, Some(&CtlArg { cmd }.to_bytes())).await
    }

    /// Cancel a pending operation by its index. The index rides in entry
    /// slot 3 and in the [`CancelArg`] payload.
    pub async fn cancel(
        &self,
        ctx: &ExecContext,
        cls: ResourceClass,
        key: i32,
        id: i32,
        op: Operation,
        index: i32,
    ) -> Result<()> {
        require_global(ctx)?;
        let arg = CancelArg::new(op, index)?;
        let input = arg.to_bytes();
        let lease = self.buffers().lease(input.len())?;
        lease.buffer().write_at(0, &input)?;
        let request = ResourceRequest::new(cls, key, Operation::Cancel, id)
            .values(op.code() as i32, index)
            .payload(&lease, input.len(), 0);
        self.transact(&request).await
    }

    /// Ask to join the cluster. Only a context whose working directory is
    /// inside the cluster root may join; the returned global id is for the
    /// process manager to store with [`ExecContext::set_global_id`].
    pub async fn join(&self, ctx: &ExecContext) -> Result<i32> {
        if !ctx.can_enter(self.mounts()) {
            return Err(KlnkError::Denied { code: libc::EACCES });
        }
        let pid = ctx.get_global_id().max(0);
        let request = ResourceRequest::new(ResourceClass::Task, pid, Operation::Join, pid);
        let gpid = self.call_retval(request, None).await?;
        if gpid <= 0 || gpid > i64::from(i32::MAX) {
            return Err(KlnkError::invalid("retval", format!("{} is not a global id", gpid)));
        }
        debug!(target: "klnk::scope", gpid, "joined");
        Ok(gpid as i32)
    }

    pub async fn leave(&self, ctx: &ExecContext) -> Result<()> {
        require_global(ctx)?;
        let gpid = ctx.get_global_id();
        self.transact(&ResourceRequest::new(ResourceClass::Task, gpid, Operation::Leave, gpid))
            .await
    }

    /// Wait until the backend has applied everything this participant issued
    /// against the resource.
    pub async fn sync(&self, ctx: &ExecContext, cls: ResourceClass, key: i32, id: i32) -> Result<()> {
        require_global(ctx)?;
        self.transact(&ResourceRequest::new(cls, key, Operation::Sync, id))
            .await
    }

    /// Whether a resource of class `target` with this id still exists.
    /// The target class travels in entry slot 2.
    pub async fn probe(&self, ctx: &ExecContext, target: ResourceClass, id: i32) -> Result<bool> {
        require_global(ctx)?;
        let gpid = ctx.get_global_id();
        let request = ResourceRequest::new(ResourceClass::Task, gpid, Operation::Probe, id)
            .values(target.code() as i32, 0);
        match self.transact(&request).await {
            Ok(()) => Ok(true),
            Err(KlnkError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Release a resource of class `target` held by this participant.
    pub async fn release(&self, ctx: &ExecContext, target: ResourceClass, id: i32) -> Result<()> {
        require_global(ctx)?;
        let gpid = ctx.get_global_id();
        let request = ResourceRequest::new(ResourceClass::Task, gpid, Operation::Release, id)
            .values(target.code() as i32, 0);
        self.transact(&request).await
    }
}
