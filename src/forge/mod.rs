//! Key and certificate synthesis.
//!
//! Handlers only talk to the [`Forge`] trait. [`SoftwareForge`] is the bundled
//! implementation; deployments with a real keybox plug in their own.

use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::device::DeviceProfile;
use crate::envelope::Identity;
use crate::keystore::KeyGenParameters;

mod der;
pub mod seed;
mod software;

pub use software::SoftwareForge;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("no issuing key loaded")]
    NotReady,
    #[error("unsupported key request: {0}")]
    Unsupported(String),
    #[error("certificate chain is empty")]
    EmptyChain,
    #[error("forging failed: {0}")]
    Failed(String),
}

/// Forged key material. The private half is wiped on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    pub algorithm: i32,
    pub public_key: Vec<u8>,
    secret: Vec<u8>,
}

impl KeyPair {
    pub fn new(algorithm: i32, public_key: Vec<u8>, secret: Vec<u8>) -> Self {
        Self {
            algorithm,
            public_key,
            secret,
        }
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm)
            .field("public_key", &hex::encode(&self.public_key))
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct GeneratedKey {
    pub key_pair: KeyPair,
    /// Leaf first.
    pub chain: Vec<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct ProvisioningKey {
    pub key_pair: KeyPair,
    pub maced_public_key: Vec<u8>,
}

pub trait Forge: Send + Sync {
    /// False until issuing material is available; handlers pass everything
    /// through while not ready.
    fn is_ready(&self) -> bool;

    fn generate_key(
        &self,
        identity: &Identity,
        params: &KeyGenParameters,
        device: &DeviceProfile,
    ) -> Result<GeneratedKey, ForgeError>;

    /// Returns a replacement chain for a real key. The leaf must keep
    /// describing the caller's real key.
    fn substitute_cert_chain(
        &self,
        real_chain: &[Vec<u8>],
        identity: &Identity,
        device: &DeviceProfile,
    ) -> Result<Vec<Vec<u8>>, ForgeError>;

    fn generate_provisioning_key(&self) -> Result<ProvisioningKey, ForgeError>;

    fn device_info(&self, device: &DeviceProfile) -> Result<Vec<u8>, ForgeError>;

    fn build_provisioning_response(
        &self,
        public_keys: &[Vec<u8>],
        challenge: &[u8],
        device_info: &[u8],
    ) -> Result<Vec<u8>, ForgeError>;
}
