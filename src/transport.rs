//! Socket framing between the injected hook and the daemon.
//!
//! After connecting, the hook writes one announcement listing the binder
//! handles it intercepts:
//! `count:u32 | count x (kind:u32 | security_level:i32 | handle:u64)`.
//!
//! It then streams records, each answered by exactly one reply:
//! - hook -> daemon: `call_id:u64 | kind:u32 | len:u64 | body`
//! - daemon -> hook: `call_id:u64 | len:u64 | decision`
//!
//! Replies may arrive out of order; the hook matches them by `call_id`.

use parking_lot::Mutex;
use std::fmt::Display;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;
use thiserror::Error;

use crate::dispatcher::{Dispatcher, TargetKind};
use crate::envelope::RECORD_INTERCEPTOR_REPLACED;
use crate::keystore::security_level;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;
const MAX_TARGETS: u32 = 64;

const TARGET_KEYSTORE: u32 = 1;
const TARGET_SECURITY_LEVEL: u32 = 2;
const TARGET_REMOTE_PROVISIONING: u32 = 3;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("could not attach to the keystore backend after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub call_id: u64,
    pub kind: u32,
    pub body: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The hook closed the stream; the backend process went away.
    BackendClosed,
    InterceptorReplaced,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Announcement {
    pub targets: Vec<(u64, TargetKind)>,
}

impl Announcement {
    /// Whether a trusted-environment security level was announced.
    pub fn has_tee(&self) -> bool {
        self.targets.iter().any(|(_, kind)| {
            *kind == TargetKind::SecurityLevel(security_level::TRUSTED_ENVIRONMENT)
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.targets.len() * 16);
        out.extend_from_slice(&(self.targets.len() as u32).to_le_bytes());
        for (handle, kind) in &self.targets {
            let (tag, level) = match kind {
                TargetKind::KeystoreService => (TARGET_KEYSTORE, 0),
                TargetKind::SecurityLevel(level) => (TARGET_SECURITY_LEVEL, *level),
                TargetKind::RemoteProvisioning => (TARGET_REMOTE_PROVISIONING, 0),
            };
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&level.to_le_bytes());
            out.extend_from_slice(&handle.to_le_bytes());
        }
        out
    }

    pub fn read_from(reader: &mut impl Read) -> io::Result<Self> {
        let count = read_u32(reader)?;
        if count > MAX_TARGETS {
            return Err(invalid(format!("announcement lists {} targets", count)));
        }
        let mut targets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let tag = read_u32(reader)?;
            let level = read_u32(reader)? as i32;
            let handle = read_u64(reader)?;
            let kind = match tag {
                TARGET_KEYSTORE => TargetKind::KeystoreService,
                TARGET_SECURITY_LEVEL => TargetKind::SecurityLevel(level),
                TARGET_REMOTE_PROVISIONING => TargetKind::RemoteProvisioning,
                other => return Err(invalid(format!("unknown target kind {}", other))),
            };
            targets.push((handle, kind));
        }
        Ok(Self { targets })
    }
}

/// Calls `attach` up to `attempts` times, sleeping `delay` between failures.
pub fn bootstrap<T, E, F>(attempts: u32, delay: Duration, mut attach: F) -> Result<T, BootstrapError>
where
    E: Display,
    F: FnMut(u32) -> Result<T, E>,
{
    for attempt in 1..=attempts {
        log::info!("attaching to keystore backend ({}/{})", attempt, attempts);
        match attach(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                log::warn!("attach attempt {} failed: {}", attempt, err);
                if attempt < attempts {
                    std::thread::sleep(delay);
                }
            }
        }
    }
    Err(BootstrapError::Exhausted { attempts })
}

/// Daemon side of an attached hook.
pub struct HookConnection {
    stream: UnixStream,
    announcement: Announcement,
}

impl HookConnection {
    pub fn connect(path: &Path) -> io::Result<Self> {
        let mut stream = UnixStream::connect(path)?;
        let announcement = Announcement::read_from(&mut stream)?;
        Ok(Self {
            stream,
            announcement,
        })
    }

    pub fn announcement(&self) -> &Announcement {
        &self.announcement
    }

    /// A second handle on the socket, used to shut it down from elsewhere.
    pub fn try_clone_stream(&self) -> io::Result<UnixStream> {
        self.stream.try_clone()
    }

    pub fn serve(self, dispatcher: &Dispatcher, workers: usize) -> io::Result<ServeOutcome> {
        let reader = self.stream.try_clone()?;
        Ok(serve(reader, self.stream, dispatcher, workers))
    }
}

/// Reads frames on the calling thread and answers them from `workers` threads.
///
/// Returns once the stream ends or the hook reports it was replaced; all
/// queued frames are answered first.
pub fn serve<R, W>(mut reader: R, writer: W, dispatcher: &Dispatcher, workers: usize) -> ServeOutcome
where
    R: Read,
    W: Write + Send,
{
    let writer = Mutex::new(writer);
    let (tx, rx) = mpsc::channel::<Frame>();
    let rx = Mutex::new(rx);

    std::thread::scope(|scope| {
        for _ in 0..workers.max(1) {
            scope.spawn(|| loop {
                let next = rx.lock().recv();
                let Ok(frame) = next else {
                    break;
                };
                answer(&writer, dispatcher, &frame);
            });
        }

        let outcome = loop {
            match read_frame(&mut reader) {
                Ok(Some(frame)) if frame.kind == RECORD_INTERCEPTOR_REPLACED => {
                    answer(&writer, dispatcher, &frame);
                    break ServeOutcome::InterceptorReplaced;
                }
                Ok(Some(frame)) => {
                    if tx.send(frame).is_err() {
                        break ServeOutcome::BackendClosed;
                    }
                }
                Ok(None) => {
                    log::warn!("hook closed the connection");
                    break ServeOutcome::BackendClosed;
                }
                Err(err) => {
                    log::error!("hook connection failed: {}", err);
                    break ServeOutcome::BackendClosed;
                }
            }
        };
        drop(tx);
        outcome
    })
}

fn answer<W: Write>(writer: &Mutex<W>, dispatcher: &Dispatcher, frame: &Frame) {
    let decision = dispatcher.dispatch_raw(frame.kind, &frame.body);
    let mut out = writer.lock();
    if let Err(err) = write_reply(&mut *out, frame.call_id, &decision) {
        log::warn!("failed to answer call {}: {}", frame.call_id, err);
    }
}

/// `Ok(None)` on a clean end of stream between frames.
pub fn read_frame(reader: &mut impl Read) -> io::Result<Option<Frame>> {
    let mut id = [0u8; 8];
    if !read_exact_or_eof(reader, &mut id)? {
        return Ok(None);
    }
    let kind = read_u32(reader)?;
    let body = read_block(reader)?;
    Ok(Some(Frame {
        call_id: u64::from_le_bytes(id),
        kind,
        body,
    }))
}

pub fn write_frame(writer: &mut impl Write, frame: &Frame) -> io::Result<()> {
    let mut out = Vec::with_capacity(20 + frame.body.len());
    out.extend_from_slice(&frame.call_id.to_le_bytes());
    out.extend_from_slice(&frame.kind.to_le_bytes());
    out.extend_from_slice(&(frame.body.len() as u64).to_le_bytes());
    out.extend_from_slice(&frame.body);
    writer.write_all(&out)?;
    writer.flush()
}

pub fn write_reply(writer: &mut impl Write, call_id: u64, decision: &[u8]) -> io::Result<()> {
    let mut out = Vec::with_capacity(16 + decision.len());
    out.extend_from_slice(&call_id.to_le_bytes());
    out.extend_from_slice(&(decision.len() as u64).to_le_bytes());
    out.extend_from_slice(decision);
    writer.write_all(&out)?;
    writer.flush()
}

/// Hook side counterpart of [`write_reply`].
pub fn read_reply(reader: &mut impl Read) -> io::Result<Option<(u64, Vec<u8>)>> {
    let mut id = [0u8; 8];
    if !read_exact_or_eof(reader, &mut id)? {
        return Ok(None);
    }
    Ok(Some((u64::from_le_bytes(id), read_block(reader)?)))
}

fn read_block(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = read_u64(reader)?;
    if len > MAX_FRAME_LEN {
        return Err(invalid(format!("frame length {} exceeds limit", len)));
    }
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(body)
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
