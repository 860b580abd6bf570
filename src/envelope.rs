//! Framed records exchanged with the injected hook.
//!
//! Two call shapes cross the boundary, plus a parameterless notice:
//!
//! - pre-call:  `target:u64 | opcode:u32 | flags:u32 | uid:u32 | pid:i32 | len:u64 | payload`
//! - post-call: `target:u64 | opcode:u32 | flags:u32 | uid:u32 | pid:i32 | result:i32 |
//!   len:u64 | payload | reply_len:u64 | reply`
//! - interceptor-replaced: empty body
//!
//! Decisions travel back as an `i32` tag followed by variant fields:
//! `1` pass through, `2` continue, `3` override response (`code:i32 | len:u64 | bytes`),
//! `4` override request (`len:u64 | bytes`).
//!
//! All integers are little-endian. A zero-length block decodes to an empty
//! `Vec` without allocating.

use thiserror::Error;

pub const RECORD_PRE_CALL: u32 = 1;
pub const RECORD_POST_CALL: u32 = 2;
pub const RECORD_INTERCEPTOR_REPLACED: u32 = 3;

const TAG_PASS_THROUGH: i32 = 1;
const TAG_CONTINUE: i32 = 2;
const TAG_OVERRIDE_RESPONSE: i32 = 3;
const TAG_OVERRIDE_REQUEST: i32 = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("record truncated: need {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("block length {len} exceeds the {remaining} bytes left in the record")]
    BlockTooLong { len: u64, remaining: usize },
    #[error("unknown record kind {0}")]
    UnknownKind(u32),
    #[error("unknown decision tag {0}")]
    UnknownDecision(i32),
    #[error("{0} trailing bytes after record")]
    Trailing(usize),
}

/// Caller attached to an intercepted call by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    pub uid: u32,
    pub pid: i32,
}

impl Identity {
    pub fn new(uid: u32, pid: i32) -> Self {
        Self { uid, pid }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterceptedCall {
    pub target: u64,
    pub opcode: u32,
    pub flags: u32,
    pub identity: Identity,
    pub payload: Vec<u8>,
    /// Reply produced by the real backend. `None` when it produced no data.
    pub prior_reply: Option<Vec<u8>>,
    /// Status returned by the real backend; present only on post-call records.
    pub prior_result: Option<i32>,
}

impl InterceptedCall {
    pub fn pre(target: u64, opcode: u32, identity: Identity, payload: Vec<u8>) -> Self {
        Self {
            target,
            opcode,
            flags: 0,
            identity,
            payload,
            prior_reply: None,
            prior_result: None,
        }
    }

    pub fn post(
        target: u64,
        opcode: u32,
        identity: Identity,
        payload: Vec<u8>,
        result: i32,
        reply: Option<Vec<u8>>,
    ) -> Self {
        Self {
            target,
            opcode,
            flags: 0,
            identity,
            payload,
            prior_reply: reply,
            prior_result: Some(result),
        }
    }

    pub fn phase(&self) -> Phase {
        if self.prior_result.is_some() {
            Phase::Post
        } else {
            Phase::Pre
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    PreCall(InterceptedCall),
    PostCall(InterceptedCall),
    InterceptorReplaced,
}

impl Record {
    pub fn kind(&self) -> u32 {
        match self {
            Record::PreCall(_) => RECORD_PRE_CALL,
            Record::PostCall(_) => RECORD_POST_CALL,
            Record::InterceptorReplaced => RECORD_INTERCEPTOR_REPLACED,
        }
    }

    pub fn decode(kind: u32, body: &[u8]) -> Result<Self, FramingError> {
        let mut cursor = 0usize;
        let record = match kind {
            RECORD_PRE_CALL => {
                let (target, opcode, flags, identity) = read_header(body, &mut cursor)?;
                let payload = read_block(body, &mut cursor)?;
                Record::PreCall(InterceptedCall {
                    target,
                    opcode,
                    flags,
                    identity,
                    payload,
                    prior_reply: None,
                    prior_result: None,
                })
            }
            RECORD_POST_CALL => {
                let (target, opcode, flags, identity) = read_header(body, &mut cursor)?;
                let result = read_i32(body, &mut cursor)?;
                let payload = read_block(body, &mut cursor)?;
                let reply = read_block(body, &mut cursor)?;
                Record::PostCall(InterceptedCall {
                    target,
                    opcode,
                    flags,
                    identity,
                    payload,
                    prior_reply: if reply.is_empty() { None } else { Some(reply) },
                    prior_result: Some(result),
                })
            }
            RECORD_INTERCEPTOR_REPLACED => Record::InterceptorReplaced,
            other => return Err(FramingError::UnknownKind(other)),
        };
        if cursor != body.len() {
            return Err(FramingError::Trailing(body.len() - cursor));
        }
        Ok(record)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Record::PreCall(call) => {
                write_header(&mut out, call);
                write_block(&mut out, &call.payload);
            }
            Record::PostCall(call) => {
                write_header(&mut out, call);
                out.extend_from_slice(&call.prior_result.unwrap_or(0).to_le_bytes());
                write_block(&mut out, &call.payload);
                write_block(&mut out, call.prior_reply.as_deref().unwrap_or(&[]));
            }
            Record::InterceptorReplaced => {}
        }
        out
    }
}

/// Outcome of one intercepted call. Exactly one is produced per record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    PassThrough,
    /// Let the real call proceed unmodified; meaningful only before the call.
    Continue,
    OverrideRequest(Vec<u8>),
    OverrideResponse { code: i32, payload: Vec<u8> },
}

impl Decision {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Decision::PassThrough => out.extend_from_slice(&TAG_PASS_THROUGH.to_le_bytes()),
            Decision::Continue => out.extend_from_slice(&TAG_CONTINUE.to_le_bytes()),
            Decision::OverrideResponse { code, payload } => {
                out.extend_from_slice(&TAG_OVERRIDE_RESPONSE.to_le_bytes());
                out.extend_from_slice(&code.to_le_bytes());
                write_block(&mut out, payload);
            }
            Decision::OverrideRequest(payload) => {
                out.extend_from_slice(&TAG_OVERRIDE_REQUEST.to_le_bytes());
                write_block(&mut out, payload);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        let mut cursor = 0usize;
        let decision = match read_i32(bytes, &mut cursor)? {
            TAG_PASS_THROUGH => Decision::PassThrough,
            TAG_CONTINUE => Decision::Continue,
            TAG_OVERRIDE_RESPONSE => {
                let code = read_i32(bytes, &mut cursor)?;
                let payload = read_block(bytes, &mut cursor)?;
                Decision::OverrideResponse { code, payload }
            }
            TAG_OVERRIDE_REQUEST => Decision::OverrideRequest(read_block(bytes, &mut cursor)?),
            other => return Err(FramingError::UnknownDecision(other)),
        };
        if cursor != bytes.len() {
            return Err(FramingError::Trailing(bytes.len() - cursor));
        }
        Ok(decision)
    }

    pub fn is_override(&self) -> bool {
        matches!(
            self,
            Decision::OverrideRequest(_) | Decision::OverrideResponse { .. }
        )
    }
}

fn read_header(
    bytes: &[u8],
    cursor: &mut usize,
) -> Result<(u64, u32, u32, Identity), FramingError> {
    let target = read_u64(bytes, cursor)?;
    let opcode = read_u32(bytes, cursor)?;
    let flags = read_u32(bytes, cursor)?;
    let uid = read_u32(bytes, cursor)?;
    let pid = read_i32(bytes, cursor)?;
    Ok((target, opcode, flags, Identity { uid, pid }))
}

fn write_header(out: &mut Vec<u8>, call: &InterceptedCall) {
    out.extend_from_slice(&call.target.to_le_bytes());
    out.extend_from_slice(&call.opcode.to_le_bytes());
    out.extend_from_slice(&call.flags.to_le_bytes());
    out.extend_from_slice(&call.identity.uid.to_le_bytes());
    out.extend_from_slice(&call.identity.pid.to_le_bytes());
}

pub(crate) fn read_slice<'a>(
    bytes: &'a [u8],
    cursor: &mut usize,
    len: usize,
) -> Result<&'a [u8], FramingError> {
    let available = bytes.len().saturating_sub(*cursor);
    if len > available {
        return Err(FramingError::Truncated {
            offset: *cursor,
            needed: len,
            available,
        });
    }
    let out = &bytes[*cursor..*cursor + len];
    *cursor += len;
    Ok(out)
}

pub(crate) fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, FramingError> {
    let slice = read_slice(bytes, cursor, 4)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_i32(bytes: &[u8], cursor: &mut usize) -> Result<i32, FramingError> {
    read_u32(bytes, cursor).map(|v| v as i32)
}

pub(crate) fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64, FramingError> {
    let slice = read_slice(bytes, cursor, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(slice);
    Ok(u64::from_le_bytes(buf))
}

fn read_block(bytes: &[u8], cursor: &mut usize) -> Result<Vec<u8>, FramingError> {
    let len = read_u64(bytes, cursor)?;
    if len == 0 {
        return Ok(Vec::new());
    }
    let remaining = bytes.len() - *cursor;
    if len > remaining as u64 {
        return Err(FramingError::BlockTooLong { len, remaining });
    }
    Ok(read_slice(bytes, cursor, len as usize)?.to_vec())
}

fn write_block(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}
