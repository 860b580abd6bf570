#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use attest_shim::device::DeviceProfile;
use attest_shim::envelope::{Decision, Identity, InterceptedCall, Record};
use attest_shim::forge::{Forge, ForgeError, GeneratedKey, KeyPair, ProvisioningKey};
use attest_shim::keystore::{
    algorithm, security_level, tag, KeyDescriptor, KeyEntryResponse, KeyGenParameters,
    KeyMetadata, KeyParameter, KeyParameterValue, KEYSTORE_DESCRIPTOR,
    SECURITY_LEVEL_DESCRIPTOR,
};
use attest_shim::parcel::ParcelWriter;
use attest_shim::policy::{ModeFlags, PackageResolver, PolicyEngine, PolicyLookupError, PolicySnapshot};
use attest_shim::{CacheCapacities, Dispatcher, Snapshot, SnapshotCell, TargetKind};

pub const KEYSTORE: u64 = 0x1000;
pub const TEE: u64 = 0x2000;
pub const RKP: u64 = 0x3000;

pub const GMS_UID: u32 = 10123;
pub const BANK_UID: u32 = 10200;
pub const OTHER_UID: u32 = 10300;
pub const UNKNOWN_UID: u32 = 10999;

pub const FORGED_LEAF: [u8; 5] = [0x30, 0x03, 0x02, 0x01, 0x2a];

pub struct StaticResolver(HashMap<u32, Vec<String>>);

impl StaticResolver {
    pub fn standard() -> Self {
        let mut map = HashMap::new();
        map.insert(GMS_UID, vec!["com.google.gms".to_string()]);
        map.insert(BANK_UID, vec!["com.bank.app".to_string()]);
        map.insert(OTHER_UID, vec!["org.example.other".to_string()]);
        Self(map)
    }
}

impl PackageResolver for StaticResolver {
    fn packages_for_uid(&self, uid: u32) -> Result<Vec<String>, PolicyLookupError> {
        self.0
            .get(&(uid % 100_000))
            .cloned()
            .ok_or(PolicyLookupError::UnknownUid(uid))
    }
}

/// Deterministic forge with failure injection.
#[derive(Default)]
pub struct FakeForge {
    pub fail: AtomicBool,
    pub panic: AtomicBool,
    pub generated: AtomicUsize,
    /// OS patch level of the last device profile handed to the forge.
    pub patch_level: AtomicI32,
}

impl FakeForge {
    fn check(&self) -> Result<(), ForgeError> {
        if self.panic.load(Ordering::SeqCst) {
            panic!("forge exploded");
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ForgeError::Failed("injected".into()));
        }
        Ok(())
    }
}

impl Forge for FakeForge {
    fn is_ready(&self) -> bool {
        true
    }

    fn generate_key(
        &self,
        identity: &Identity,
        params: &KeyGenParameters,
        device: &DeviceProfile,
    ) -> Result<GeneratedKey, ForgeError> {
        self.check()?;
        self.patch_level.store(device.patch_level, Ordering::SeqCst);
        let n = self.generated.fetch_add(1, Ordering::SeqCst) as u8;
        let leaf = vec![0x30, 0x02, 0x04, n];
        let root = vec![0x30, 0x03, 0x02, 0x01, (identity.uid % 128) as u8];
        Ok(GeneratedKey {
            key_pair: KeyPair::new(params.algorithm, vec![n], vec![0xaa; 32]),
            chain: vec![leaf, root],
        })
    }

    fn substitute_cert_chain(
        &self,
        real_chain: &[Vec<u8>],
        _identity: &Identity,
        device: &DeviceProfile,
    ) -> Result<Vec<Vec<u8>>, ForgeError> {
        self.check()?;
        self.patch_level.store(device.patch_level, Ordering::SeqCst);
        let mut out = vec![FORGED_LEAF.to_vec()];
        out.extend(real_chain.iter().skip(1).cloned());
        Ok(out)
    }

    fn generate_provisioning_key(&self) -> Result<ProvisioningKey, ForgeError> {
        self.check()?;
        let n = self.generated.fetch_add(1, Ordering::SeqCst) as u8;
        Ok(ProvisioningKey {
            key_pair: KeyPair::new(algorithm::EC, vec![n], vec![0xbb; 32]),
            maced_public_key: vec![0xa5, n],
        })
    }

    fn device_info(&self, device: &DeviceProfile) -> Result<Vec<u8>, ForgeError> {
        Ok(device.device.as_bytes().to_vec())
    }

    fn build_provisioning_response(
        &self,
        public_keys: &[Vec<u8>],
        challenge: &[u8],
        device_info: &[u8],
    ) -> Result<Vec<u8>, ForgeError> {
        self.check()?;
        Ok([public_keys.concat(), challenge.to_vec(), device_info.to_vec()].concat())
    }
}

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub forge: Arc<FakeForge>,
    pub snapshots: Arc<SnapshotCell>,
}

pub fn harness(rules: &[&str], modes: ModeFlags) -> Harness {
    harness_with(Snapshot {
        policy: PolicySnapshot::from_lines(rules.iter().copied(), modes),
        ..Snapshot::default()
    })
}

pub fn harness_with(snapshot: Snapshot) -> Harness {
    let snapshots = Arc::new(SnapshotCell::new(snapshot));
    let forge = Arc::new(FakeForge::default());
    let policy = Arc::new(PolicyEngine::new(
        snapshots.clone(),
        Arc::new(StaticResolver::standard()),
    ));
    let dispatcher = Dispatcher::new(policy, forge.clone(), CacheCapacities::default());
    dispatcher.register_target(KEYSTORE, TargetKind::KeystoreService);
    dispatcher.register_target(
        TEE,
        TargetKind::SecurityLevel(security_level::TRUSTED_ENVIRONMENT),
    );
    dispatcher.register_target(RKP, TargetKind::RemoteProvisioning);
    Harness {
        dispatcher,
        forge,
        snapshots,
    }
}

pub fn descriptor(alias: &str) -> KeyDescriptor {
    KeyDescriptor {
        domain: 0,
        nspace: -1,
        alias: Some(alias.to_string()),
        blob: None,
    }
}

pub fn generate_key_payload(alias: &str, challenge: Option<&[u8]>, attestation_key: bool) -> Vec<u8> {
    let mut params = vec![
        KeyParameter::new(tag::ALGORITHM, KeyParameterValue::Algorithm(algorithm::EC)),
        KeyParameter::new(tag::KEY_SIZE, KeyParameterValue::Integer(256)),
        KeyParameter::new(tag::EC_CURVE, KeyParameterValue::EcCurve(1)),
        KeyParameter::new(tag::PURPOSE, KeyParameterValue::KeyPurpose(2)),
        KeyParameter::new(tag::DIGEST, KeyParameterValue::Digest(4)),
    ];
    if let Some(challenge) = challenge {
        params.push(KeyParameter::new(
            tag::ATTESTATION_CHALLENGE,
            KeyParameterValue::Blob(challenge.to_vec()),
        ));
    }
    let attest = descriptor("attest-key");
    let mut p = ParcelWriter::new();
    p.write_interface_token(SECURITY_LEVEL_DESCRIPTOR);
    p.write_parcelable(Some(&descriptor(alias)));
    p.write_parcelable(attestation_key.then_some(&attest));
    p.write_typed_array(Some(params.as_slice()));
    p.write_i32(0);
    p.write_byte_array(None);
    p.into_bytes()
}

pub fn get_key_entry_payload(alias: &str) -> Vec<u8> {
    let mut p = ParcelWriter::new();
    p.write_interface_token(KEYSTORE_DESCRIPTOR);
    p.write_parcelable(Some(&descriptor(alias)));
    p.into_bytes()
}

/// A backend `getKeyEntry` reply carrying `chain`.
pub fn real_entry_reply(alias: &str, chain: &[Vec<u8>]) -> Vec<u8> {
    let mut metadata = KeyMetadata {
        key: descriptor(alias),
        key_security_level: security_level::TRUSTED_ENVIRONMENT,
        modification_time_ms: 1_700_000_000_000,
        ..KeyMetadata::default()
    };
    metadata.set_chain(chain);
    let mut p = ParcelWriter::reply();
    p.write_parcelable(Some(&KeyEntryResponse {
        security_level: Some(TEE),
        metadata,
    }));
    p.into_bytes()
}

pub fn pre(target: u64, opcode: u32, uid: u32, payload: Vec<u8>) -> Record {
    Record::PreCall(InterceptedCall::pre(
        target,
        opcode,
        Identity::new(uid, 4242),
        payload,
    ))
}

pub fn post(
    target: u64,
    opcode: u32,
    uid: u32,
    payload: Vec<u8>,
    result: i32,
    reply: Option<Vec<u8>>,
) -> Record {
    Record::PostCall(InterceptedCall::post(
        target,
        opcode,
        Identity::new(uid, 4242),
        payload,
        result,
        reply,
    ))
}

pub fn override_payload(decision: Decision) -> Vec<u8> {
    match decision {
        Decision::OverrideResponse { code: 0, payload } => payload,
        other => panic!("expected an override response, got {:?}", other),
    }
}
