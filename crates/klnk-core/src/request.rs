//! Request encoding.
//!
//! A [`ResourceRequest`] is rendered into a canonical path below the control
//! mount:
//!
//! ```text
//! <control-root>/<cls>_<key>_<op>_<id>_<val1>_<val2>_<addr>_<inlen>_<outlen>
//! ```
//!
//! Every field is lowercase hexadecimal without `0x` or leading zeros. Signed
//! fields (key, id, val1, val2) are written as their 32-bit two's-complement
//! pattern, so `-1` becomes `ffffffff`. The whole path, terminating NUL
//! included, must fit in [`ProtocolConfig::PATH_MAX`].

use crate::buffer::{BufferLease, BufferToken};
use crate::config::ProtocolConfig;
use crate::error::{KlnkError, Result};
use crate::taxonomy::{self, Operation, ResourceClass, ResourceEntry};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One request, alive for exactly one transaction.
#[derive(Debug, Clone, Copy)]
pub struct ResourceRequest<'a> {
    pub cls: ResourceClass,
    pub key: i32,
    pub op: Operation,
    pub id: i32,
    pub val1: i32,
    pub val2: i32,
    pub buffer: Option<&'a BufferLease>,
    pub inlen: usize,
    pub outlen: usize,
}

impl<'a> ResourceRequest<'a> {
    pub fn new(cls: ResourceClass, key: i32, op: Operation, id: i32) -> Self {
        Self {
            cls,
            key,
            op,
            id,
            val1: 0,
            val2: 0,
            buffer: None,
            inlen: 0,
            outlen: 0,
        }
    }

    pub fn values(mut self, val1: i32, val2: i32) -> Self {
        self.val1 = val1;
        self.val2 = val2;
        self
    }

    /// Attach a payload buffer with its meaningful input and output lengths.
    pub fn payload(mut self, buffer: &'a BufferLease, inlen: usize, outlen: usize) -> Self {
        self.buffer = Some(buffer);
        self.inlen = inlen;
        self.outlen = outlen;
        self
    }

    /// The four-slot head of this request.
    pub fn entry(&self) -> ResourceEntry {
        ResourceEntry::new(self.op, self.id, self.val1, self.val2)
    }

    pub fn token(&self) -> BufferToken {
        self.buffer.map_or(BufferToken::NONE, BufferLease::token)
    }

    /// Check the request against the taxonomy and the buffer convention.
    pub fn validate(&self) -> Result<()> {
        taxonomy::validate_pair(self.cls, self.op)?;
        if self.op == Operation::Cancel {
            taxonomy::validate_index(self.val2)?;
        }
        match self.buffer {
            None => {
                if self.inlen != 0 || self.outlen != 0 {
                    return Err(KlnkError::invalid(
                        "buffer",
                        format!(
                            "no buffer but inlen={} outlen={}",
                            self.inlen, self.outlen
                        ),
                    ));
                }
            }
            Some(lease) => {
                if self.inlen == 0 && self.outlen == 0 {
                    return Err(KlnkError::invalid("buffer", "buffer with zero lengths"));
                }
                let need = self.inlen.max(self.outlen);
                if need > lease.len() {
                    return Err(KlnkError::invalid(
                        "buffer",
                        format!("{} bytes declared, buffer holds {}", need, lease.len()),
                    ));
                }
                if need > ProtocolConfig::IO_MAX {
                    return Err(KlnkError::invalid(
                        "buffer",
                        format!("{} bytes exceeds {}", need, ProtocolConfig::IO_MAX),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Validate and render into wire fields.
    pub fn to_path(&self) -> Result<RequestPath> {
        self.validate()?;
        Ok(RequestPath {
            cls: self.cls.code(),
            key: self.key as u32,
            op: self.op.code(),
            id: self.id as u32,
            val1: self.val1 as u32,
            val2: self.val2 as u32,
            addr: self.token().0,
            inlen: self.inlen as u64,
            outlen: self.outlen as u64,
        })
    }
}

/// The nine wire fields of an encoded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPath {
    pub cls: u32,
    pub key: u32,
    pub op: u32,
    pub id: u32,
    pub val1: u32,
    pub val2: u32,
    pub addr: u64,
    pub inlen: u64,
    pub outlen: u64,
}

/// Hex digits needed to write `value`.
const fn hex_width(mut value: u64) -> usize {
    let mut width = 1;
    while value >= 16 {
        value >>= 4;
        width += 1;
    }
    width
}

impl RequestPath {
    pub const FIELDS: usize = 9;

    /// Longest name a valid request renders to below the control root,
    /// leading `/` included.
    pub const MAX_NAME_LEN: usize = 1
        + hex_width(ResourceClass::Task as u64)
        + hex_width(Operation::NR_OPERATIONS as u64 - 1)
        + 4 * hex_width(u32::MAX as u64)
        + hex_width(u64::MAX)
        + 2 * hex_width(ProtocolConfig::IO_MAX as u64)
        + (Self::FIELDS - 1);

    /// Longest control root that still fits every valid request.
    pub const MAX_CONTROL_ROOT_LEN: usize = ProtocolConfig::PATH_MAX - 1 - Self::MAX_NAME_LEN;

    /// Render below `control_root`. Fails if the result would not fit.
    pub fn render(&self, control_root: &Path) -> Result<String> {
        let root = control_root
            .to_str()
            .ok_or_else(|| KlnkError::invalid("control_root", "not valid UTF-8"))?
            .trim_end_matches('/');
        let path = format!(
            "{}/{:x}_{:x}_{:x}_{:x}_{:x}_{:x}_{:x}_{:x}_{:x}",
            root,
            self.cls,
            self.key,
            self.op,
            self.id,
            self.val1,
            self.val2,
            self.addr,
            self.inlen,
            self.outlen
        );
        if path.len() >= ProtocolConfig::PATH_MAX {
            return Err(KlnkError::invalid(
                "path",
                format!(
                    "encoded request is {} bytes, limit is {}",
                    path.len(),
                    ProtocolConfig::PATH_MAX - 1
                ),
            ));
        }
        Ok(path)
    }

    /// Parse an encoded path back into its fields.
    ///
    /// Only the canonical form is accepted: lowercase hex, no leading zeros,
    /// exactly nine fields, directly below `control_root`.
    pub fn parse(control_root: &Path, path: &str) -> Result<Self> {
        let root = control_root
            .to_str()
            .ok_or_else(|| KlnkError::invalid("control_root", "not valid UTF-8"))?
            .trim_end_matches('/');
        let name = path
            .strip_prefix(root)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| KlnkError::invalid("path", format!("{} is not below {}", path, root)))?;

        let fields = name
            .split('_')
            .map(parse_hex)
            .collect::<Result<Vec<u64>>>()?;
        if fields.len() != Self::FIELDS {
            return Err(KlnkError::invalid(
                "path",
                format!("expected {} fields, got {}", Self::FIELDS, fields.len()),
            ));
        }
        let narrow = |i: usize, name: &str| -> Result<u32> {
            u32::try_from(fields[i])
                .map_err(|_| KlnkError::invalid(name, format!("{:x} exceeds 32 bits", fields[i])))
        };
        Ok(Self {
            cls: narrow(0, "cls")?,
            key: narrow(1, "key")?,
            op: narrow(2, "op")?,
            id: narrow(3, "id")?,
            val1: narrow(4, "val1")?,
            val2: narrow(5, "val2")?,
            addr: fields[6],
            inlen: fields[7],
            outlen: fields[8],
        })
    }

    pub fn class(&self) -> Option<ResourceClass> {
        ResourceClass::from_code(self.cls)
    }

    pub fn operation(&self) -> Option<Operation> {
        Operation::from_code(self.op)
    }

    pub fn key(&self) -> i32 {
        self.key as i32
    }

    pub fn id(&self) -> i32 {
        self.id as i32
    }

    pub fn val1(&self) -> i32 {
        self.val1 as i32
    }

    pub fn val2(&self) -> i32 {
        self.val2 as i32
    }

    pub fn token(&self) -> BufferToken {
        BufferToken(self.addr)
    }

    pub fn entry(&self) -> ResourceEntry {
        ResourceEntry([self.op as i32, self.id(), self.val1(), self.val2()])
    }
}

fn parse_hex(field: &str) -> Result<u64> {
    let canonical = !field.is_empty()
        && field.len() <= 16
        && field.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        && (field == "0" || !field.starts_with('0'));
    if !canonical {
        return Err(KlnkError::invalid(
            "path",
            format!("'{}' is not canonical lowercase hex", field),
        ));
    }
    u64::from_str_radix(field, 16).map_err(|e| KlnkError::invalid("path", e.to_string()))
}
