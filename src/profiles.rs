// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! Communication security profiles of the admission pipeline

use std::collections::BTreeMap;

use ciborium::value::{Integer, Value};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::authz_info::{AdmissionFailure, AuthzInfoPost, PostAdmission, Profile};
use crate::claims::{Claims, ScopeClaim};
use crate::error::Rejection;
use crate::oscore::{self, ContextStore, Id, Nonce, OscoreInputMaterial, StoredContext};
use crate::pop::{Confirmation, KeyIdentity};
use crate::repository::TokenRepository;
use crate::scope::{GroupPolicy, GroupScope};

/// Source of randomness for nonces and challenges
pub type RandomSource = Box<dyn FnMut(&mut [u8]) + Send>;

/// Randomness from the operating system
pub fn os_random() -> RandomSource {
    use rand_core::RngCore;
    Box::new(|data: &mut [u8]| rand::rngs::OsRng.fill_bytes(data))
}

/// Length of generated nonces (`nonce2`, `kdcchallenge`); 64-bit long random numbers are
/// recommended
const NONCE_LEN: usize = 8;

fn fresh_nonce(random: &Mutex<RandomSource>) -> Nonce {
    let mut nonce = Nonce::new();
    nonce.resize_default(NONCE_LEN).expect("NONCE_LEN < MAX_NONCE_LEN");
    let mut source = random.lock();
    (*source)(&mut nonce[..]);
    nonce
}

/// Profile for clients that talk to the RS over DTLS (RFC9202)
///
/// The token is all there is to a POST; the DTLS session later authenticates with the token's key.
#[derive(Debug, Clone, Copy, Default)]
pub struct DtlsProfile;

impl Profile for DtlsProfile {
    type Input = ();

    fn check(&self, _: &AuthzInfoPost, _: &Claims, _: bool) -> Result<(), Rejection> {
        Ok(())
    }

    fn post_admission(&self, _: &mut PostAdmission<'_>, _: ()) -> Result<(), AdmissionFailure> {
        Ok(())
    }
}

/// Parameters of a first POST in the OSCORE profile
#[derive(Debug)]
pub struct OscoreExchange {
    nonce1: Nonce,
    id1: Id,
    material: OscoreInputMaterial,
}

/// OSCORE profile (RFC9203)
///
/// A first POST carries `nonce1` and the client's recipient ID; the RS answers with `nonce2` and
/// its own recipient ID, and both sides derive the security context. Requests arriving through
/// such a context are identified (in [`crate::authz_info::Message::sender_id`] and
/// [`TokenRepository::key_for_sender`]) by the RS's recipient ID in its [`KeyIdentity::from_kid`]
/// form.
///
/// A POST that arrives through an established context and carries a token with only a `kid` for
/// the same key is an update of access rights, and needs no new context.
pub struct OscoreProfile {
    contexts: Mutex<ContextStore>,
    random: Mutex<RandomSource>,
}

impl OscoreProfile {
    pub fn new(random: RandomSource) -> Self {
        Self {
            contexts: Mutex::new(ContextStore::default()),
            random: Mutex::new(random),
        }
    }

    /// Run `f` on the context a request with an OSCORE option for `recipient_id` is to be
    /// processed in
    pub fn with_context<R>(
        &self,
        recipient_id: &[u8],
        f: impl FnOnce(&mut StoredContext) -> R,
    ) -> Option<R> {
        self.contexts.lock().find(recipient_id).map(f)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }
}

impl core::fmt::Debug for OscoreProfile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OscoreProfile")
            .field("contexts", &*self.contexts.lock())
            .finish()
    }
}

fn bytes_param<const N: usize>(
    request: &AuthzInfoPost,
    key: u64,
    name: &'static str,
) -> Result<heapless::Vec<u8, N>, Rejection> {
    match request.param(key) {
        Some(Value::Bytes(b)) => {
            heapless::Vec::from_slice(b).map_err(|_| Rejection::MissingParameter(name))
        }
        _ => Err(Rejection::MissingParameter(name)),
    }
}

impl Profile for OscoreProfile {
    /// `None` for updates
    type Input = Option<OscoreExchange>;

    fn requires_map_payload(&self) -> bool {
        true
    }

    fn check(
        &self,
        request: &AuthzInfoPost,
        claims: &Claims,
        update: bool,
    ) -> Result<Self::Input, Rejection> {
        if update {
            return Ok(None);
        }
        let nonce1 = bytes_param(request, crate::NONCE1, "nonce1")?;
        let id1 = bytes_param(request, crate::ACE_CLIENT_RECIPIENTID, "ace_client_recipientid")?;
        let material = match claims.cnf() {
            Some(Confirmation::Oscore(material)) => material.clone(),
            _ => return Err(Rejection::NoOscoreMaterial),
        };
        Ok(Some(OscoreExchange {
            nonce1,
            id1,
            material,
        }))
    }

    fn post_admission(
        &self,
        admitted: &mut PostAdmission<'_>,
        input: Self::Input,
    ) -> Result<(), AdmissionFailure> {
        let Some(OscoreExchange {
            nonce1,
            id1,
            material,
        }) = input
        else {
            return Ok(());
        };

        let nonce2 = fresh_nonce(&self.random);
        let mut contexts = self.contexts.lock();
        let id2 = contexts.take_id2(&id1);
        let context = oscore::derive(&material, &nonce1, &nonce2, &id1, &id2).map_err(|e| {
            warn!(error = %e, "OSCORE context derivation failed");
            AdmissionFailure::Rejected(Rejection::MalformedClaim("cnf"))
        })?;

        admitted
            .repository
            .bind_sender(KeyIdentity::from_kid(&id2).as_str(), admitted.key)?;
        let evicted = contexts.insert(StoredContext {
            context,
            key: admitted.key.clone(),
        });
        if let Some(evicted) = evicted {
            let sender = KeyIdentity::from_kid(&evicted.context.recipient_id);
            debug!(sender = %sender, key = %evicted.key, "OSCORE context evicted");
            if let Err(e) = admitted.repository.unbind_sender(sender.as_str()) {
                warn!(error = %e, "could not unbind sender of evicted context");
            }
        }

        admitted
            .extras
            .push((crate::NONCE2, Value::Bytes(nonce2.to_vec())));
        admitted
            .extras
            .push((crate::ACE_SERVER_RECIPIENTID, Value::Bytes(id2.to_vec())));
        Ok(())
    }
}

/// Signature information about an OSCORE group, as reported in `sign_info`
#[derive(Debug, Clone, PartialEq)]
pub struct GroupInfo {
    pub sign_alg: i64,
    pub sign_parameters: Option<Value>,
    pub sign_key_parameters: Option<Value>,
    pub cred_fmt: Option<i64>,
}

/// What a group join POST asked for
#[derive(Debug)]
pub struct JoinRequest {
    groups: Vec<String>,
    sign_info: bool,
}

/// Group manager extension of a profile (ACE Key Groupcomm for OSCORE groups)
///
/// Tokens with group scopes must be for this group manager and name groups it has
/// group-membership resources for. They get a `kdcchallenge`, and, on request, signature
/// information for their groups.
pub struct GroupJoin<P> {
    inner: P,
    policy: GroupPolicy,
    groups: BTreeMap<String, GroupInfo>,
    random: Mutex<RandomSource>,
}

impl<P: Profile> GroupJoin<P> {
    pub fn new(inner: P, policy: GroupPolicy, random: RandomSource) -> Self {
        Self {
            inner,
            policy,
            groups: BTreeMap::new(),
            random: Mutex::new(random),
        }
    }

    pub fn with_group_info(mut self, group: impl Into<String>, info: GroupInfo) -> Self {
        self.groups.insert(group.into(), info);
        self
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn sign_info_entry(&self, group: &str) -> Value {
        let int = |i: i64| Value::Integer(Integer::from(i));
        let (alg, params, key_params, cred_fmt) = match self.groups.get(group) {
            Some(info) => (
                int(info.sign_alg),
                info.sign_parameters.clone().unwrap_or(Value::Null),
                info.sign_key_parameters.clone().unwrap_or(Value::Null),
                info.cred_fmt.map_or(Value::Null, int),
            ),
            None => (Value::Null, Value::Null, Value::Null, Value::Null),
        };
        Value::Array(vec![
            Value::Text(group.into()),
            alg,
            params,
            key_params,
            cred_fmt,
        ])
    }
}

impl<P: Profile> Profile for GroupJoin<P> {
    type Input = (P::Input, Option<JoinRequest>);

    fn requires_map_payload(&self) -> bool {
        self.inner.requires_map_payload()
    }

    fn resolve_sender(&self, repository: &TokenRepository, sender: &str) -> Option<KeyIdentity> {
        self.inner.resolve_sender(repository, sender)
    }

    fn check(
        &self,
        request: &AuthzInfoPost,
        claims: &Claims,
        update: bool,
    ) -> Result<Self::Input, Rejection> {
        let inner = self.inner.check(request, claims, update)?;

        let Some(ScopeClaim::Binary(encoded)) = claims.scope() else {
            return Ok((inner, None));
        };
        let scope = GroupScope::decode(encoded)?;
        let for_manager = claims
            .audience()
            .map_or(false, |aud| self.policy.is_manager(aud));
        if !for_manager || !scope.groups().all(|g| self.policy.has_membership_resource(g)) {
            return Err(Rejection::NotGroupMembershipScope);
        }

        let sign_info = match request.param(crate::SIGN_INFO) {
            None => false,
            Some(Value::Null) => true,
            Some(_) => return Err(Rejection::InvalidSignInfo),
        };
        Ok((
            inner,
            Some(JoinRequest {
                groups: scope.groups().map(String::from).collect(),
                sign_info,
            }),
        ))
    }

    fn post_admission(
        &self,
        admitted: &mut PostAdmission<'_>,
        (inner, join): Self::Input,
    ) -> Result<(), AdmissionFailure> {
        self.inner.post_admission(admitted, inner)?;
        let Some(join) = join else {
            return Ok(());
        };

        let challenge = fresh_nonce(&self.random);
        admitted
            .repository
            .set_challenge(admitted.key, challenge.to_vec())?;
        admitted
            .extras
            .push((crate::KDCCHALLENGE, Value::Bytes(challenge.to_vec())));

        if join.sign_info {
            let entries = join
                .groups
                .iter()
                .map(|g| self.sign_info_entry(g))
                .collect();
            admitted
                .extras
                .push((crate::SIGN_INFO, Value::Array(entries)));
        }
        Ok(())
    }
}
