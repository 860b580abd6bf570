use anyhow::Result;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use zeroize::Zeroize;

use super::{der, seed, Forge, ForgeError, GeneratedKey, KeyPair, ProvisioningKey};
use crate::device::DeviceProfile;
use crate::envelope::Identity;
use crate::keystore::{algorithm, KeyGenParameters};

const ROOT_SUBJECT: &str = "attest-shim software root";

/// Self-consistent ed25519 signer. Every record it emits is
/// `SEQUENCE { tbs, OCTET STRING signature }` signed by the issuing key.
pub struct SoftwareForge {
    issuer: Option<SigningKey>,
    serial: AtomicU64,
}

#[derive(Serialize)]
struct DeviceInfoRecord<'a> {
    brand: &'a str,
    manufacturer: &'a str,
    product: &'a str,
    model: &'a str,
    device: &'a str,
    os_version: i32,
    system_patch_level: i32,
    boot_patch_level: i32,
    vendor_patch_level: i32,
}

impl SoftwareForge {
    pub fn new(issuer: SigningKey) -> Self {
        Self {
            issuer: Some(issuer),
            serial: AtomicU64::new(1),
        }
    }

    /// A forge that reports not ready and refuses every request.
    pub fn unloaded() -> Self {
        Self {
            issuer: None,
            serial: AtomicU64::new(1),
        }
    }

    pub fn from_seed(seed: &str) -> Result<Self> {
        Ok(Self::new(seed::signing_key_from_seed(seed)?))
    }

    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let seed = seed::load_or_create_seed(path)?;
        Self::from_seed(&seed)
    }

    pub fn issuer_public_key(&self) -> Option<VerifyingKey> {
        self.issuer.as_ref().map(SigningKey::verifying_key)
    }

    fn issuer(&self) -> Result<&SigningKey, ForgeError> {
        self.issuer.as_ref().ok_or(ForgeError::NotReady)
    }

    fn next_serial(&self) -> i64 {
        (self.serial.fetch_add(1, Ordering::Relaxed) & i64::MAX as u64) as i64
    }

    fn root_certificate(issuer: &SigningKey) -> Vec<u8> {
        let tbs = der::sequence(&[
            der::utf8(ROOT_SUBJECT),
            der::octets(issuer.verifying_key().as_bytes()),
        ]);
        signed(issuer, tbs)
    }
}

fn signed(issuer: &SigningKey, tbs: Vec<u8>) -> Vec<u8> {
    let signature = issuer.sign(&tbs);
    der::sequence(&[tbs, der::octets(&signature.to_bytes())])
}

/// Attested device fields shared by generated and substituted leaves.
fn attested_device(device: &DeviceProfile) -> Vec<Vec<u8>> {
    let mut fields = vec![der::integer(device.patch_level as i64)];
    if let Some(hash) = &device.module_hash {
        fields.push(der::octets(hash));
    }
    fields
}

fn fresh_key_pair(algorithm: i32) -> KeyPair {
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    let public_key = SigningKey::from_bytes(&secret).verifying_key().to_bytes().to_vec();
    let pair = KeyPair::new(algorithm, public_key, secret.to_vec());
    secret.zeroize();
    pair
}

impl Forge for SoftwareForge {
    fn is_ready(&self) -> bool {
        self.issuer.is_some()
    }

    fn generate_key(
        &self,
        identity: &Identity,
        params: &KeyGenParameters,
        device: &DeviceProfile,
    ) -> Result<GeneratedKey, ForgeError> {
        let issuer = self.issuer()?;
        if params.algorithm != algorithm::EC {
            return Err(ForgeError::Unsupported(format!(
                "algorithm {}",
                params.algorithm
            )));
        }
        let key_pair = fresh_key_pair(params.algorithm);
        let mut fields = vec![
            der::integer(self.next_serial()),
            der::utf8("leaf"),
            der::octets(&key_pair.public_key),
            der::integer(identity.uid as i64),
            der::integer(params.algorithm as i64),
            der::octets(params.attestation_challenge.as_deref().unwrap_or_default()),
            der::utf8(&device.model),
        ];
        fields.extend(attested_device(device));
        let tbs = der::sequence(&fields);
        let chain = vec![signed(issuer, tbs), Self::root_certificate(issuer)];
        Ok(GeneratedKey { key_pair, chain })
    }

    fn substitute_cert_chain(
        &self,
        real_chain: &[Vec<u8>],
        identity: &Identity,
        device: &DeviceProfile,
    ) -> Result<Vec<Vec<u8>>, ForgeError> {
        let issuer = self.issuer()?;
        let real_leaf = real_chain.first().ok_or(ForgeError::EmptyChain)?;
        let mut fields = vec![
            der::integer(self.next_serial()),
            der::utf8("substituted"),
            der::octets(real_leaf),
            der::integer(identity.uid as i64),
        ];
        fields.extend(attested_device(device));
        let tbs = der::sequence(&fields);
        Ok(vec![signed(issuer, tbs), Self::root_certificate(issuer)])
    }

    fn generate_provisioning_key(&self) -> Result<ProvisioningKey, ForgeError> {
        let issuer = self.issuer()?;
        let key_pair = fresh_key_pair(algorithm::EC);
        let maced_public_key = signed(issuer, der::sequence(&[der::octets(&key_pair.public_key)]));
        Ok(ProvisioningKey {
            key_pair,
            maced_public_key,
        })
    }

    fn device_info(&self, device: &DeviceProfile) -> Result<Vec<u8>, ForgeError> {
        let record = DeviceInfoRecord {
            brand: &device.brand,
            manufacturer: &device.manufacturer,
            product: &device.product,
            model: &device.model,
            device: &device.device,
            os_version: device.os_version,
            system_patch_level: device.patch_level,
            boot_patch_level: device.patch_level_long,
            vendor_patch_level: device.patch_level_long,
        };
        serde_json::to_vec(&record).map_err(|e| ForgeError::Failed(e.to_string()))
    }

    fn build_provisioning_response(
        &self,
        public_keys: &[Vec<u8>],
        challenge: &[u8],
        device_info: &[u8],
    ) -> Result<Vec<u8>, ForgeError> {
        let issuer = self.issuer()?;
        let keys: Vec<Vec<u8>> = public_keys.iter().map(|k| der::octets(k)).collect();
        let tbs = der::sequence(&[
            der::sequence(&keys),
            der::octets(challenge),
            der::octets(device_info),
        ]);
        Ok(signed(issuer, tbs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::split_der_chain;
    use ed25519_dalek::{Signature, Verifier};

    fn forge() -> SoftwareForge {
        SoftwareForge::from_seed("keybox:test").expect("seed")
    }

    fn ec_params(challenge: &[u8]) -> KeyGenParameters {
        KeyGenParameters {
            algorithm: algorithm::EC,
            attestation_challenge: Some(challenge.to_vec()),
            ..KeyGenParameters::default()
        }
    }

    /// Splits a signed record into (tbs, signature).
    fn open(record: &[u8]) -> (Vec<u8>, Signature) {
        let header = if record[1] < 0x80 {
            2
        } else {
            2 + (record[1] & 0x7f) as usize
        };
        let parts = split_der_chain(&record[header..]).expect("record body");
        assert_eq!(parts.len(), 2);
        let sig: [u8; 64] = parts[1][2..].try_into().expect("64-byte signature");
        (parts[0].clone(), Signature::from_bytes(&sig))
    }

    #[test]
    fn generated_chain_is_signed_by_issuer() {
        let forge = forge();
        let issuer = forge.issuer_public_key().expect("loaded");
        let key = forge
            .generate_key(
                &Identity::new(10123, 42),
                &ec_params(b"nonce"),
                &DeviceProfile::default(),
            )
            .expect("generate");
        assert_eq!(key.chain.len(), 2);
        for cert in &key.chain {
            let (tbs, sig) = open(cert);
            issuer.verify(&tbs, &sig).expect("valid signature");
        }
        assert_eq!(key.key_pair.public_key.len(), 32);
        assert_eq!(key.key_pair.secret().len(), 32);
    }

    #[test]
    fn unloaded_forge_refuses() {
        let forge = SoftwareForge::unloaded();
        assert!(!forge.is_ready());
        assert!(matches!(
            forge.generate_provisioning_key(),
            Err(ForgeError::NotReady)
        ));
    }

    #[test]
    fn rsa_requests_are_unsupported() {
        let params = KeyGenParameters {
            algorithm: algorithm::RSA,
            ..ec_params(b"nonce")
        };
        assert!(matches!(
            forge().generate_key(&Identity::new(1, 1), &params, &DeviceProfile::default()),
            Err(ForgeError::Unsupported(_))
        ));
    }

    #[test]
    fn substitution_requires_a_leaf() {
        let forge = forge();
        let device = DeviceProfile::default();
        assert!(matches!(
            forge.substitute_cert_chain(&[], &Identity::new(1, 1), &device),
            Err(ForgeError::EmptyChain)
        ));
        let chain = forge
            .substitute_cert_chain(&[vec![0x30, 0x00]], &Identity::new(1, 1), &device)
            .expect("substitute");
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn substituted_leaf_attests_module_hash() {
        let forge = forge();
        let hash = vec![0xde, 0xad, 0xbe, 0xef];
        let device = DeviceProfile {
            module_hash: Some(hash.clone()),
            ..DeviceProfile::default()
        };
        let chain = forge
            .substitute_cert_chain(&[vec![0x30, 0x00]], &Identity::new(1, 1), &device)
            .expect("substitute");
        let (tbs, _) = open(&chain[0]);
        assert!(tbs.ends_with(&der::octets(&hash)));

        let plain = forge
            .substitute_cert_chain(&[vec![0x30, 0x00]], &Identity::new(1, 1), &DeviceProfile::default())
            .expect("substitute");
        let (tbs, _) = open(&plain[0]);
        assert!(tbs.ends_with(&der::integer(DeviceProfile::default().patch_level as i64)));
    }

    #[test]
    fn device_info_carries_profile() {
        let info = forge()
            .device_info(&DeviceProfile::default())
            .expect("device info");
        let value: serde_json::Value = serde_json::from_slice(&info).expect("json");
        assert_eq!(value["model"], "Pixel");
        assert_eq!(value["system_patch_level"], 202404);
    }
}
