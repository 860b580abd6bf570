//! Routes decoded records to handlers and turns every failure into a
//! non-forging decision.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::envelope::{Decision, InterceptedCall, Phase, Record};
use crate::forge::Forge;
use crate::handlers::{
    EntryFetchHandler, ForgedKeyCache, HandlerError, KeyGenHandler, ProvisionedKey,
    ProvisioningHandler,
};
use crate::keystore::opcode;
use crate::policy::PolicyEngine;

/// Interface behind an intercepted binder handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    KeystoreService,
    SecurityLevel(i32),
    RemoteProvisioning,
}

#[derive(Clone, Copy, Debug)]
pub struct CacheCapacities {
    pub keys: usize,
    pub provisioning: usize,
}

impl Default for CacheCapacities {
    fn default() -> Self {
        Self {
            keys: 1000,
            provisioning: 100,
        }
    }
}

pub struct Dispatcher {
    targets: RwLock<HashMap<u64, TargetKind>>,
    keygen: KeyGenHandler,
    entry_fetch: EntryFetchHandler,
    provisioning: ProvisioningHandler,
    policy: Arc<PolicyEngine>,
    replaced: AtomicBool,
}

impl Dispatcher {
    pub fn new(policy: Arc<PolicyEngine>, forge: Arc<dyn Forge>, capacities: CacheCapacities) -> Self {
        let keys = Arc::new(ForgedKeyCache::new(capacities.keys));
        Self {
            targets: RwLock::new(HashMap::new()),
            keygen: KeyGenHandler::new(policy.clone(), forge.clone(), keys.clone()),
            entry_fetch: EntryFetchHandler::new(policy.clone(), forge.clone(), keys),
            provisioning: ProvisioningHandler::new(policy.clone(), forge, capacities.provisioning),
            policy,
            replaced: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn register_target(&self, handle: u64, kind: TargetKind) {
        log::info!("intercepting {:?} at handle {:#x}", kind, handle);
        self.targets.write().insert(handle, kind);
    }

    pub fn target(&self, handle: u64) -> Option<TargetKind> {
        self.targets.read().get(&handle).copied()
    }

    /// True once the hook reported that a newer interceptor replaced it.
    pub fn is_replaced(&self) -> bool {
        self.replaced.load(Ordering::SeqCst)
    }

    pub fn provisioned_key(&self, handle: &[u8]) -> Option<Arc<ProvisionedKey>> {
        self.provisioning.provisioned_key(handle)
    }

    /// Decodes one framed record and returns the encoded decision.
    /// Malformed records degrade to pass-through.
    pub fn dispatch_raw(&self, kind: u32, body: &[u8]) -> Vec<u8> {
        let decision = match Record::decode(kind, body) {
            Ok(record) => self.dispatch(record),
            Err(err) => {
                log::warn!("dropping malformed record (kind {}): {}", kind, err);
                Decision::PassThrough
            }
        };
        decision.encode()
    }

    pub fn dispatch(&self, record: Record) -> Decision {
        match record {
            Record::PreCall(call) | Record::PostCall(call) => self.handle_call(&call),
            Record::InterceptorReplaced => {
                log::warn!("interceptor was replaced by a newer instance");
                self.replaced.store(true, Ordering::SeqCst);
                Decision::PassThrough
            }
        }
    }

    fn handle_call(&self, call: &InterceptedCall) -> Decision {
        let Some(kind) = self.target(call.target) else {
            log::debug!("call to unregistered handle {:#x}", call.target);
            return Decision::PassThrough;
        };
        log::debug!(
            "{:?} {:?} opcode={} uid={} payload={}B reply={}B",
            kind,
            call.phase(),
            call.opcode,
            call.identity.uid,
            call.payload.len(),
            call.prior_reply.as_ref().map_or(0, Vec::len)
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.route(kind, call)));
        let decision = match outcome {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) => {
                log::warn!(
                    "{:?} opcode={} uid={} pid={} degraded to pass-through: {}",
                    kind,
                    call.opcode,
                    call.identity.uid,
                    call.identity.pid,
                    err
                );
                Decision::PassThrough
            }
            Err(_) => {
                log::error!(
                    "handler panicked for {:?} opcode={} uid={} pid={}",
                    kind,
                    call.opcode,
                    call.identity.uid,
                    call.identity.pid
                );
                Decision::PassThrough
            }
        };
        match (call.phase(), decision) {
            (Phase::Post, Decision::Continue) => Decision::PassThrough,
            (_, decision) => decision,
        }
    }

    fn route(&self, kind: TargetKind, call: &InterceptedCall) -> Result<Decision, HandlerError> {
        match (kind, call.opcode, call.phase()) {
            (TargetKind::KeystoreService, opcode::KEYSTORE_GET_KEY_ENTRY, Phase::Pre) => {
                self.entry_fetch.pre_call(call)
            }
            (TargetKind::KeystoreService, opcode::KEYSTORE_GET_KEY_ENTRY, Phase::Post) => {
                self.entry_fetch.post_call(call)
            }
            (TargetKind::SecurityLevel(level), opcode::SECURITY_LEVEL_GENERATE_KEY, Phase::Pre) => {
                self.keygen.pre_call(call, level)
            }
            (TargetKind::RemoteProvisioning, _, _) => self.provisioning.handle(call),
            _ => Ok(Decision::PassThrough),
        }
    }
}
