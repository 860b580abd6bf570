use std::sync::Arc;

use super::{ForgedKeyCache, HandlerError, KeyId};
use crate::envelope::{Decision, InterceptedCall};
use crate::forge::Forge;
use crate::keystore::{KeyDescriptor, KeyEntryResponse, KEYSTORE_DESCRIPTOR};
use crate::parcel::{ParcelError, ParcelReader, ParcelWriter};
use crate::policy::PolicyEngine;

/// Handles `IKeystoreService.getKeyEntry`.
///
/// Generate-class callers are answered from the forged key cache. Hack-class
/// callers reach the real backend and get their certificate chain replaced
/// on the way back.
pub struct EntryFetchHandler {
    policy: Arc<PolicyEngine>,
    forge: Arc<dyn Forge>,
    keys: Arc<ForgedKeyCache>,
}

impl EntryFetchHandler {
    pub fn new(policy: Arc<PolicyEngine>, forge: Arc<dyn Forge>, keys: Arc<ForgedKeyCache>) -> Self {
        Self {
            policy,
            forge,
            keys,
        }
    }

    pub fn pre_call(&self, call: &InterceptedCall) -> Result<Decision, HandlerError> {
        if !self.forge.is_ready() {
            return Ok(Decision::PassThrough);
        }
        let uid = call.identity.uid;
        let verdict = self.policy.verdict(uid);
        if verdict.generate {
            let mut input = ParcelReader::new(&call.payload);
            input.enforce_interface(KEYSTORE_DESCRIPTOR)?;
            let descriptor: KeyDescriptor = input.read_required("getKeyEntry.key")?;
            if let Some(alias) = descriptor.alias {
                if let Some(forged) = self.keys.get(&KeyId::new(uid, alias.as_str())) {
                    log::info!("serving forged key entry uid={} alias={}", uid, alias);
                    return Ok(Decision::OverrideResponse {
                        code: 0,
                        payload: forged.entry_reply.clone(),
                    });
                }
                log::debug!("no forged key for uid={} alias={}", uid, alias);
            }
            return Ok(Decision::Continue);
        }
        Ok(if verdict.hack {
            Decision::Continue
        } else {
            Decision::PassThrough
        })
    }

    pub fn post_call(&self, call: &InterceptedCall) -> Result<Decision, HandlerError> {
        let uid = call.identity.uid;
        let Some(reply) = call.prior_reply.as_deref() else {
            return Ok(Decision::PassThrough);
        };
        if call.prior_result != Some(0) || !self.forge.is_ready() {
            return Ok(Decision::PassThrough);
        }

        let mut input = ParcelReader::new(reply);
        match input.read_exception() {
            Ok(()) => {}
            Err(ParcelError::RemoteException(code)) => {
                log::debug!("getKeyEntry for uid={} failed remotely ({})", uid, code);
                return Ok(Decision::PassThrough);
            }
            Err(err) => return Err(err.into()),
        }
        let Some(mut response) = input.read_parcelable::<KeyEntryResponse>()? else {
            return Ok(Decision::PassThrough);
        };
        let Some(chain) = response.metadata.chain()? else {
            return Ok(Decision::PassThrough);
        };

        let device = self.policy.caller(uid).device;
        let forged = self
            .forge
            .substitute_cert_chain(&chain, &call.identity, &device)?;
        response.metadata.set_chain(&forged);
        let mut out = ParcelWriter::reply();
        out.write_parcelable(Some(&response));
        log::info!("substituted certificate chain for uid={} pid={}", uid, call.identity.pid);
        Ok(Decision::OverrideResponse {
            code: 0,
            payload: out.into_bytes(),
        })
    }
}
