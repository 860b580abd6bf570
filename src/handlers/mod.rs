//! Per-interface call handlers.
//!
//! Handlers return `Result<Decision, HandlerError>`; the dispatcher turns
//! every error into the non-forging outcome.

use std::sync::Arc;
use thiserror::Error;

use crate::cache::BoundedCache;
use crate::forge::{ForgeError, KeyPair};
use crate::parcel::ParcelError;

mod entry_fetch;
mod keygen;
mod provisioning;

pub use entry_fetch::EntryFetchHandler;
pub use keygen::KeyGenHandler;
pub use provisioning::{ProvisionedKey, ProvisioningHandler};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed call payload: {0}")]
    Parcel(#[from] ParcelError),
    #[error(transparent)]
    Forge(#[from] ForgeError),
}

/// Forged keys are cached per caller uid and alias.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyId {
    pub uid: u32,
    pub alias: String,
}

impl KeyId {
    pub fn new(uid: u32, alias: impl Into<String>) -> Self {
        Self {
            uid,
            alias: alias.into(),
        }
    }
}

/// A key forged at creation time, kept so later fetches answer identically.
#[derive(Debug)]
pub struct ForgedKey {
    pub key_pair: KeyPair,
    /// Complete `getKeyEntry` reply parcel.
    pub entry_reply: Vec<u8>,
}

pub type ForgedKeyCache = BoundedCache<KeyId, Arc<ForgedKey>>;

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
