use std::sync::Arc;

use super::{now_ms, ForgedKey, ForgedKeyCache, HandlerError, KeyId};
use crate::device::DeviceProfile;
use crate::envelope::{Decision, InterceptedCall};
use crate::forge::Forge;
use crate::keystore::{
    tag, Authorization, KeyDescriptor, KeyEntryResponse, KeyGenParameters, KeyMetadata,
    KeyParameter, KeyParameterValue, KEY_ORIGIN_GENERATED, SECURITY_LEVEL_DESCRIPTOR,
};
use crate::parcel::{ParcelError, ParcelReader, ParcelWriter};
use crate::policy::{resolver::PER_USER_RANGE, PolicyEngine};

/// `IKeystoreSecurityLevel.generateKey` arguments this handler reads.
struct GenerateKeyRequest {
    key: KeyDescriptor,
    attestation_key: Option<KeyDescriptor>,
    params: Vec<KeyParameter>,
}

impl GenerateKeyRequest {
    fn decode(payload: &[u8]) -> Result<Self, ParcelError> {
        let mut input = ParcelReader::new(payload);
        input.enforce_interface(SECURITY_LEVEL_DESCRIPTOR)?;
        Ok(Self {
            key: input.read_required("generateKey.key")?,
            attestation_key: input.read_parcelable()?,
            params: input.read_typed_array()?.unwrap_or_default(),
        })
    }
}

/// Answers key creation for generate-class callers with a forged key.
pub struct KeyGenHandler {
    policy: Arc<PolicyEngine>,
    forge: Arc<dyn Forge>,
    keys: Arc<ForgedKeyCache>,
}

impl KeyGenHandler {
    pub fn new(policy: Arc<PolicyEngine>, forge: Arc<dyn Forge>, keys: Arc<ForgedKeyCache>) -> Self {
        Self {
            policy,
            forge,
            keys,
        }
    }

    pub fn pre_call(
        &self,
        call: &InterceptedCall,
        security_level: i32,
    ) -> Result<Decision, HandlerError> {
        let uid = call.identity.uid;
        let caller = self.policy.caller(uid);
        let verdict = caller.verdict;
        if !verdict.generate {
            return Ok(if verdict.hack {
                Decision::Continue
            } else {
                Decision::PassThrough
            });
        }
        if !self.forge.is_ready() {
            log::warn!("forge not ready, key generation for uid={} passes through", uid);
            return Ok(Decision::PassThrough);
        }

        let request = GenerateKeyRequest::decode(&call.payload)?;
        let Some(alias) = request.key.alias.clone() else {
            log::warn!("key generation without alias from uid={}, passing through", uid);
            return Ok(Decision::PassThrough);
        };
        let params = KeyGenParameters::from_params(&request.params);
        if params.attestation_challenge.is_none() {
            log::debug!("uid={} alias={} requested no attestation", uid, alias);
            return Ok(Decision::PassThrough);
        }
        if request.attestation_key.is_some() {
            log::warn!(
                "uid={} alias={} supplied an attestation key, not supported",
                uid,
                alias
            );
            return Ok(Decision::PassThrough);
        }

        let generated = self
            .forge
            .generate_key(&call.identity, &params, &caller.device)?;
        let metadata = build_metadata(
            &generated.chain,
            &params,
            &request.key,
            security_level,
            uid,
            &caller.device,
        );

        let mut entry = ParcelWriter::reply();
        entry.write_parcelable(Some(&KeyEntryResponse {
            security_level: Some(call.target),
            metadata: metadata.clone(),
        }));
        let mut reply = ParcelWriter::reply();
        reply.write_parcelable(Some(&metadata));

        let forged = ForgedKey {
            key_pair: generated.key_pair,
            entry_reply: entry.into_bytes(),
        };
        if let Some((evicted, _)) = self.keys.insert(KeyId::new(uid, alias.clone()), Arc::new(forged)) {
            log::debug!("evicted forged key uid={} alias={}", evicted.uid, evicted.alias);
        }
        log::info!("forged key for uid={} alias={}", uid, alias);
        Ok(Decision::OverrideResponse {
            code: 0,
            payload: reply.into_bytes(),
        })
    }
}

fn build_metadata(
    chain: &[Vec<u8>],
    params: &KeyGenParameters,
    descriptor: &KeyDescriptor,
    security_level: i32,
    uid: u32,
    device: &DeviceProfile,
) -> KeyMetadata {
    let mut authorizations = Vec::with_capacity(params.purposes.len() + params.digests.len() + 12);
    let mut add = |tag: i32, value: KeyParameterValue| {
        authorizations.push(Authorization {
            security_level,
            key_parameter: KeyParameter::new(tag, value),
        })
    };
    for purpose in &params.purposes {
        add(tag::PURPOSE, KeyParameterValue::KeyPurpose(*purpose));
    }
    for digest in &params.digests {
        add(tag::DIGEST, KeyParameterValue::Digest(*digest));
    }
    add(tag::ALGORITHM, KeyParameterValue::Algorithm(params.algorithm));
    add(tag::KEY_SIZE, KeyParameterValue::Integer(params.key_size));
    add(tag::EC_CURVE, KeyParameterValue::EcCurve(params.ec_curve));
    if params.no_auth_required {
        add(tag::NO_AUTH_REQUIRED, KeyParameterValue::BoolValue(true));
    }
    add(tag::ORIGIN, KeyParameterValue::Origin(KEY_ORIGIN_GENERATED));
    add(tag::OS_VERSION, KeyParameterValue::Integer(device.os_version));
    add(tag::OS_PATCHLEVEL, KeyParameterValue::Integer(device.patch_level));
    add(tag::VENDOR_PATCHLEVEL, KeyParameterValue::Integer(device.patch_level_long));
    add(tag::BOOT_PATCHLEVEL, KeyParameterValue::Integer(device.patch_level_long));
    add(tag::CREATION_DATETIME, KeyParameterValue::DateTime(now_ms()));
    add(tag::USER_ID, KeyParameterValue::Integer((uid / PER_USER_RANGE) as i32));

    let mut metadata = KeyMetadata {
        key: KeyDescriptor {
            domain: descriptor.domain,
            nspace: descriptor.nspace,
            alias: None,
            blob: None,
        },
        key_security_level: security_level,
        authorizations,
        ..KeyMetadata::default()
    };
    metadata.set_chain(chain);
    metadata
}
