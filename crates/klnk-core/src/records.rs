//! Argument and result records carried through request buffers.
//!
//! Layouts follow C natural alignment on a 64-bit little-endian host so an
//! existing backend can read them in place:
//!
//! ```text
//! Retval          i64 retval                                   8 bytes
//! MsgTransferArg  i64 msgtyp | u64 msgsz | i32 msgflg | pad4   24 bytes
//! CtlArg          i32 cmd                                      4 bytes
//! SemCtlArg       i32 semnum | i32 cmd                         8 bytes
//! SemOpArg        i64 sec | i64 nsec | i16 nsops | SemBuf*n    18 + 6n bytes
//! SemBuf          u16 num | i16 op | i16 flg                   6 bytes
//! CancelArg       u32 op | i32 index                           8 bytes
//! MigrationArg    u8[128] path, NUL padded                     128 bytes
//! ShmFaultResult  i64 retval | u8[PAGE_SIZE] page              8 + 4096 bytes
//! ```

use crate::config::ProtocolConfig;
use crate::error::{KlnkError, Result};
use crate::taxonomy::{self, Operation};
use bytes::{Buf, BufMut, BytesMut};

/// A fixed-layout record that can be written to and read from a request buffer.
pub trait Record: Sized {
    /// Bytes this value occupies on the wire.
    fn encoded_len(&self) -> usize;

    fn encode(&self, buf: &mut BytesMut);

    /// Decode from the front of `bytes`. Trailing bytes are ignored.
    fn decode(bytes: &[u8]) -> Result<Self>;

    fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf
    }
}

fn ensure_len(bytes: &[u8], need: usize, record: &str) -> Result<()> {
    if bytes.len() < need {
        return Err(KlnkError::invalid(
            record,
            format!("need {} bytes, got {}", need, bytes.len()),
        ));
    }
    Ok(())
}

/// Single return value. Every simple result record has this shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Retval {
    pub retval: i64,
}

pub type MsgSndResult = Retval;
pub type MsgRcvResult = Retval;
pub type MsgCtlResult = Retval;
pub type SemOpResult = Retval;
pub type SemCtlResult = Retval;
pub type ShmCtlResult = Retval;

impl Record for Retval {
    fn encoded_len(&self) -> usize {
        8
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.retval);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, 8, "retval")?;
        let mut bytes = bytes;
        Ok(Self {
            retval: bytes.get_i64_le(),
        })
    }
}

/// Message send/receive argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgTransferArg {
    pub msgtyp: i64,
    pub msgsz: u64,
    pub msgflg: i32,
}

pub type MsgSndArg = MsgTransferArg;
pub type MsgRcvArg = MsgTransferArg;

impl MsgTransferArg {
    pub const SIZE: usize = 24;
}

impl Record for MsgTransferArg {
    fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.msgtyp);
        buf.put_u64_le(self.msgsz);
        buf.put_i32_le(self.msgflg);
        buf.put_bytes(0, 4);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, Self::SIZE, "msg_arg")?;
        let mut bytes = bytes;
        Ok(Self {
            msgtyp: bytes.get_i64_le(),
            msgsz: bytes.get_u64_le(),
            msgflg: bytes.get_i32_le(),
        })
    }
}

/// Control command argument shared by msgctl and shmctl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CtlArg {
    pub cmd: i32,
}

pub type MsgCtlArg = CtlArg;
pub type ShmCtlArg = CtlArg;

impl Record for CtlArg {
    fn encoded_len(&self) -> usize {
        4
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.cmd);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, 4, "ctl_arg")?;
        let mut bytes = bytes;
        Ok(Self {
            cmd: bytes.get_i32_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SemCtlArg {
    pub semnum: i32,
    pub cmd: i32,
}

impl Record for SemCtlArg {
    fn encoded_len(&self) -> usize {
        8
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.semnum);
        buf.put_i32_le(self.cmd);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, 8, "semctl_arg")?;
        let mut bytes = bytes;
        Ok(Self {
            semnum: bytes.get_i32_le(),
            cmd: bytes.get_i32_le(),
        })
    }
}

/// One semaphore operation, as in `struct sembuf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SemBuf {
    pub num: u16,
    pub op: i16,
    pub flg: i16,
}

impl SemBuf {
    pub const SIZE: usize = 6;
}

/// Relative wait limit for a semop. A zero timeout means "wait forever";
/// the backend enforces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl From<std::time::Duration> for Timespec {
    fn from(d: std::time::Duration) -> Self {
        Self {
            sec: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
            nsec: i64::from(d.subsec_nanos()),
        }
    }
}

/// Semaphore operation list with its timeout.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SemOpArg {
    pub timeout: Timespec,
    pub sops: Vec<SemBuf>,
}

impl SemOpArg {
    /// Offset of the first `SemBuf`.
    pub const HEADER_SIZE: usize = 18;

    pub fn new(timeout: Timespec, sops: Vec<SemBuf>) -> Result<Self> {
        if sops.is_empty() {
            return Err(KlnkError::invalid("sops", "empty operation list"));
        }
        let max = (ProtocolConfig::IO_MAX - Self::HEADER_SIZE) / SemBuf::SIZE;
        if sops.len() > max || sops.len() > i16::MAX as usize {
            return Err(KlnkError::invalid(
                "sops",
                format!("{} operations, at most {}", sops.len(), max),
            ));
        }
        Ok(Self { timeout, sops })
    }
}

impl Record for SemOpArg {
    fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.sops.len() * SemBuf::SIZE
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.timeout.sec);
        buf.put_i64_le(self.timeout.nsec);
        buf.put_i16_le(self.sops.len() as i16);
        for sop in &self.sops {
            buf.put_u16_le(sop.num);
            buf.put_i16_le(sop.op);
            buf.put_i16_le(sop.flg);
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, Self::HEADER_SIZE, "semop_arg")?;
        let mut cur = bytes;
        let timeout = Timespec {
            sec: cur.get_i64_le(),
            nsec: cur.get_i64_le(),
        };
        let nsops = cur.get_i16_le();
        if nsops < 0 {
            return Err(KlnkError::invalid("nsops", format!("negative count {}", nsops)));
        }
        let nsops = nsops as usize;
        ensure_len(bytes, Self::HEADER_SIZE + nsops * SemBuf::SIZE, "semop_arg")?;
        let sops = (0..nsops)
            .map(|_| SemBuf {
                num: cur.get_u16_le(),
                op: cur.get_i16_le(),
                flg: cur.get_i16_le(),
            })
            .collect();
        Ok(Self { timeout, sops })
    }
}

/// Cancellation of a pending operation by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelArg {
    pub op: Operation,
    pub index: i32,
}

impl CancelArg {
    pub fn new(op: Operation, index: i32) -> Result<Self> {
        taxonomy::validate_index(index)?;
        Ok(Self { op, index })
    }
}

impl Record for CancelArg {
    fn encoded_len(&self) -> usize {
        8
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.op.code());
        buf.put_i32_le(self.index);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, 8, "cancel_arg")?;
        let mut bytes = bytes;
        let code = bytes.get_u32_le();
        let op = Operation::from_code(code)
            .ok_or_else(|| KlnkError::invalid("op", format!("unknown operation code {}", code)))?;
        Self::new(op, bytes.get_i32_le())
    }
}

/// Executable path handed to the backend on a migration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationArg {
    path: String,
}

impl MigrationArg {
    pub const SIZE: usize = ProtocolConfig::PATH_MAX;

    /// The path must leave room for its terminating NUL and contain none itself.
    pub fn new(path: &str) -> Result<Self> {
        if path.len() >= Self::SIZE {
            return Err(KlnkError::invalid(
                "path",
                format!("{} bytes, limit is {}", path.len(), Self::SIZE - 1),
            ));
        }
        if path.as_bytes().contains(&0) {
            return Err(KlnkError::invalid("path", "contains NUL"));
        }
        Ok(Self {
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Record for MigrationArg {
    fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.path.as_bytes());
        buf.put_bytes(0, Self::SIZE - self.path.len());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, Self::SIZE, "migration_arg")?;
        let raw = &bytes[..Self::SIZE];
        let end = raw
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| KlnkError::invalid("path", "not NUL terminated"))?;
        let path = std::str::from_utf8(&raw[..end])
            .map_err(|e| KlnkError::invalid("path", e.to_string()))?;
        Self::new(path)
    }
}

/// Result of a shared-memory fault: the return value and one page of data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmFaultResult {
    pub retval: i64,
    pub page: Box<[u8]>,
}

impl ShmFaultResult {
    pub const SIZE: usize = 8 + ProtocolConfig::PAGE_SIZE;
}

impl Record for ShmFaultResult {
    fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.retval);
        let n = self.page.len().min(ProtocolConfig::PAGE_SIZE);
        buf.put_slice(&self.page[..n]);
        buf.put_bytes(0, ProtocolConfig::PAGE_SIZE - n);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, Self::SIZE, "shmfault_result")?;
        let mut cur = bytes;
        let retval = cur.get_i64_le();
        Ok(Self {
            retval,
            page: cur[..ProtocolConfig::PAGE_SIZE].into(),
        })
    }
}

/// A queued message: `struct msgbuf` with its type and text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MsgBuf {
    pub mtype: i64,
    pub mtext: Vec<u8>,
}

impl Record for MsgBuf {
    fn encoded_len(&self) -> usize {
        8 + self.mtext.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.mtype);
        buf.put_slice(&self.mtext);
    }

    /// Takes every byte after the type as text; callers trim to the reported size.
    fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, 8, "msgbuf")?;
        let mut cur = bytes;
        let mtype = cur.get_i64_le();
        Ok(Self {
            mtype,
            mtext: cur.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_arg_layout() {
        let arg = MsgTransferArg {
            msgtyp: 2,
            msgsz: 5,
            msgflg: 0o4000,
        };
        let bytes = arg.to_bytes();
        assert_eq!(bytes.len(), MsgTransferArg::SIZE);
        assert_eq!(&bytes[0..8], &2i64.to_le_bytes());
        assert_eq!(&bytes[8..16], &5u64.to_le_bytes());
        assert_eq!(&bytes[16..20], &0o4000i32.to_le_bytes());
        assert_eq!(&bytes[20..24], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_semop_variable_length() {
        let arg = SemOpArg::new(
            Timespec { sec: 1, nsec: 500 },
            vec![
                SemBuf { num: 0, op: -1, flg: 0 },
                SemBuf { num: 3, op: 1, flg: 0x1000 },
            ],
        )
        .unwrap();
        let bytes = arg.to_bytes();
        assert_eq!(bytes.len(), 18 + 12);
        assert_eq!(&bytes[16..18], &2i16.to_le_bytes());
        assert_eq!(SemOpArg::decode(&bytes).unwrap(), arg);
    }

    #[test]
    fn test_semop_rejects_empty_and_truncated() {
        assert!(SemOpArg::new(Timespec::default(), vec![]).is_err());

        let arg = SemOpArg::new(Timespec::default(), vec![SemBuf::default(); 3]).unwrap();
        let bytes = arg.to_bytes();
        assert!(SemOpArg::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_timespec_from_duration_saturates() {
        let ts = Timespec::from(std::time::Duration::new(3, 250));
        assert_eq!(ts, Timespec { sec: 3, nsec: 250 });

        let ts = Timespec::from(std::time::Duration::new(u64::MAX, 999_999_999));
        assert_eq!(ts.sec, i64::MAX);
        assert_eq!(ts.nsec, 999_999_999);
    }

    #[test]
    fn test_cancel_index_bound() {
        assert!(CancelArg::new(Operation::SemOp, ProtocolConfig::INDEX_MAX - 1).is_ok());
        assert!(CancelArg::new(Operation::SemOp, ProtocolConfig::INDEX_MAX).is_err());
        assert!(CancelArg::new(Operation::SemOp, ProtocolConfig::INDEX_MAX + 1).is_err());

        let mut buf = BytesMut::new();
        buf.put_u32_le(Operation::MsgRcv.code());
        buf.put_i32_le(-4);
        assert!(CancelArg::decode(&buf).is_err());
    }

    #[test]
    fn test_migration_arg_limits() {
        let ok = "a".repeat(127);
        assert!(MigrationArg::new(&ok).is_ok());
        assert!(MigrationArg::new(&"a".repeat(128)).is_err());
        assert!(MigrationArg::new("/bin/\0sh").is_err());

        let arg = MigrationArg::new("/usr/bin/env").unwrap();
        let bytes = arg.to_bytes();
        assert_eq!(bytes.len(), 128);
        assert_eq!(bytes[12], 0);
        assert_eq!(MigrationArg::decode(&bytes).unwrap().path(), "/usr/bin/env");
    }

    #[test]
    fn test_shmfault_result_pads_page() {
        let result = ShmFaultResult {
            retval: 0,
            page: vec![7u8; 16].into(),
        };
        let bytes = result.to_bytes();
        assert_eq!(bytes.len(), ShmFaultResult::SIZE);
        let decoded = ShmFaultResult::decode(&bytes).unwrap();
        assert_eq!(&decoded.page[..16], &[7u8; 16]);
        assert!(decoded.page[16..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_short_buffers_are_rejected() {
        assert!(Retval::decode(&[0u8; 7]).is_err());
        assert!(SemCtlArg::decode(&[0u8; 4]).is_err());
        assert!(MsgTransferArg::decode(&[0u8; 23]).is_err());
    }
}
