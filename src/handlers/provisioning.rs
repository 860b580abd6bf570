use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::HandlerError;
use crate::cache::BoundedCache;
use crate::device::DeviceProfile;
use crate::envelope::{Decision, InterceptedCall, Phase};
use crate::forge::{Forge, KeyPair};
use crate::keystore::opcode;
use crate::keystore::rkp::{
    DeviceInfo, MacedPublicKey, ProtectedData, RpcHardwareInfo, CURVE_25519,
    HARDWARE_INFO_VERSION, MAX_KEYS_IN_CSR, RKP_DESCRIPTOR,
};
use crate::parcel::{ParcelReader, ParcelWriter};
use crate::policy::PolicyEngine;

pub const HANDLE_LEN: usize = 32;
const RPC_AUTHOR: &str = "Google";

/// An ephemeral provisioning key and the wrapped public key handed out for it.
#[derive(Debug)]
pub struct ProvisionedKey {
    pub key_pair: KeyPair,
    pub maced_public_key: Vec<u8>,
}

/// Forges the remote key provisioning HAL while `rkp_bypass` is on.
pub struct ProvisioningHandler {
    policy: Arc<PolicyEngine>,
    forge: Arc<dyn Forge>,
    keys: BoundedCache<u64, Arc<ProvisionedKey>>,
    next_handle: AtomicU64,
}

impl ProvisioningHandler {
    pub fn new(policy: Arc<PolicyEngine>, forge: Arc<dyn Forge>, capacity: usize) -> Self {
        Self {
            policy,
            forge,
            keys: BoundedCache::new(capacity),
            next_handle: AtomicU64::new(0),
        }
    }

    /// Looks up a key by the opaque handle returned from `generateEcdsaP256KeyPair`.
    pub fn provisioned_key(&self, handle: &[u8]) -> Option<Arc<ProvisionedKey>> {
        let raw: [u8; 8] = handle.get(..8)?.try_into().ok()?;
        self.keys.get(&u64::from_be_bytes(raw))
    }

    pub fn handle(&self, call: &InterceptedCall) -> Result<Decision, HandlerError> {
        if call.phase() == Phase::Post {
            return Ok(Decision::PassThrough);
        }
        let snapshot = self.policy.snapshots().load();
        if !snapshot.policy.modes.rkp_bypass {
            return Ok(Decision::PassThrough);
        }
        let device = &snapshot.device;
        let uid = call.identity.uid;
        let reply = match call.opcode {
            opcode::RKP_GET_HARDWARE_INFO => {
                log::info!("forging RKP hardware info for uid={}", uid);
                self.hardware_info(device)
            }
            opcode::RKP_GENERATE_KEY_PAIR => self.generate_key_pair(call)?,
            opcode::RKP_GENERATE_CERTIFICATE_REQUEST => {
                self.certificate_request(call, false, device)?
            }
            opcode::RKP_GENERATE_CERTIFICATE_REQUEST_V2 => {
                self.certificate_request(call, true, device)?
            }
            _ => return Ok(Decision::PassThrough),
        };
        Ok(Decision::OverrideResponse {
            code: 0,
            payload: reply.into_bytes(),
        })
    }

    fn hardware_info(&self, device: &DeviceProfile) -> ParcelWriter {
        let info = RpcHardwareInfo {
            version_number: HARDWARE_INFO_VERSION,
            rpc_author_name: RPC_AUTHOR.to_string(),
            supported_eek_curve: CURVE_25519,
            unique_id: Some(device.device.clone()),
            supported_num_keys_in_csr: MAX_KEYS_IN_CSR,
        };
        let mut out = ParcelWriter::reply();
        out.write_parcelable(Some(&info));
        out
    }

    fn generate_key_pair(&self, call: &InterceptedCall) -> Result<ParcelWriter, HandlerError> {
        let mut input = ParcelReader::new(&call.payload);
        input.enforce_interface(RKP_DESCRIPTOR)?;
        let _test_mode = input.read_bool()?;

        let key = self.forge.generate_provisioning_key()?;
        let index = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut handle = [0u8; HANDLE_LEN];
        handle[..8].copy_from_slice(&index.to_be_bytes());
        let maced = MacedPublicKey {
            maced_key: key.maced_public_key.clone(),
        };
        self.keys.insert(
            index,
            Arc::new(ProvisionedKey {
                key_pair: key.key_pair,
                maced_public_key: key.maced_public_key,
            }),
        );
        log::info!(
            "generated RKP key pair handle={} for uid={}",
            index,
            call.identity.uid
        );

        // Return value first, then the out parameter.
        let mut out = ParcelWriter::reply();
        out.write_byte_array(Some(&handle[..]));
        out.write_parcelable(Some(&maced));
        Ok(out)
    }

    fn certificate_request(
        &self,
        call: &InterceptedCall,
        v2: bool,
        device: &DeviceProfile,
    ) -> Result<ParcelWriter, HandlerError> {
        let mut input = ParcelReader::new(&call.payload);
        input.enforce_interface(RKP_DESCRIPTOR)?;
        let (keys, challenge) = if v2 {
            let keys = input.read_typed_array::<MacedPublicKey>()?;
            (keys, input.read_byte_array()?)
        } else {
            let _test_mode = input.read_bool()?;
            let keys = input.read_typed_array::<MacedPublicKey>()?;
            let _endpoint_chain = input.read_byte_array()?;
            (keys, input.read_byte_array()?)
        };
        let public_keys: Vec<Vec<u8>> = keys
            .unwrap_or_default()
            .into_iter()
            .map(|k| k.maced_key)
            .collect();

        let device_info = self.forge.device_info(device)?;
        let response = self.forge.build_provisioning_response(
            &public_keys,
            challenge.as_deref().unwrap_or_default(),
            &device_info,
        )?;
        log::info!(
            "forged RKP certificate request ({} keys, v2={}) for uid={}",
            public_keys.len(),
            v2,
            call.identity.uid
        );

        let mut out = ParcelWriter::reply();
        out.write_byte_array(Some(response.as_slice()));
        if !v2 {
            out.write_parcelable(Some(&DeviceInfo::default()));
            out.write_parcelable(Some(&ProtectedData::default()));
        }
        Ok(out)
    }
}
