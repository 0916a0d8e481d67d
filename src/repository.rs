// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! Store of admitted tokens, and the access decisions made from them
//!
//! The repository is the only writer of admission state. All of its maps live behind one lock;
//! mutations are committed (and persisted) as a whole or not at all, and readers never see a
//! partially added token. Scope evaluation and introspection happen outside that lock on a
//! snapshot of the relevant grants.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use coset::{CborSerializable, CoseEncrypt0, CoseKey};
use parking_lot::{const_mutex, Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::claims::{Audience, Claims};
use crate::crypto::CwtCryptoContext;
use crate::error::{Rejection, RepositoryError};
use crate::introspection::{Introspection, IntrospectionHandler};
use crate::pop::{Confirmation, KeyIdentity, PopKey};
use crate::scope::{Method, Roles, Scope, ScopeValidator};
use crate::time::TimeSource;

mod store;

/// Store paths of repositories that are currently open in this process
static LIVE_STORES: Mutex<BTreeSet<PathBuf>> = const_mutex(BTreeSet::new());

/// Length of a cti derived from the claims of a token that came without one
const DERIVED_CTI_LEN: usize = 16;

/// Token identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cti(Vec<u8>);

impl Cti {
    pub fn new(cti: impl Into<Vec<u8>>) -> Self {
        Cti(cti.into())
    }

    /// Identifier for a token without `cti`, stable for identical claims
    fn derive(encoded_claims: &[u8]) -> Self {
        Cti(Sha256::digest(encoded_claims)[..DERIVED_CTI_LEN].to_vec())
    }

    /// Parse the base64 rendering produced by `Display`
    pub fn parse(s: &str) -> Option<Self> {
        STANDARD.decode(s).ok().map(Cti)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Cti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(&self.0))
    }
}

/// Outcome of [`TokenRepository::can_access`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Ok,
    /// The key has no valid token at all
    Unauthz,
    /// The key's tokens do not grant the resource under any method
    Forbid,
    /// The key's tokens grant the resource, but not with this method
    MethodNa,
}

/// How a token reached the resource server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOrigin {
    SelfContained,
    /// Posted as a reference; the reference is kept for re-introspection
    Reference(String),
}

#[derive(Debug, Clone)]
struct TokenRecord {
    claims: Claims,
    scope: Scope,
    key: KeyIdentity,
    origin: TokenOrigin,
}

#[derive(Debug, Clone)]
struct BoundKey {
    key: PopKey,
    /// Provisioned out of band rather than learned from a token; stays when its tokens go
    provisioned: bool,
}

#[derive(Debug, Clone, Default)]
struct State {
    open: bool,
    tokens: BTreeMap<Cti, TokenRecord>,
    by_key: BTreeMap<KeyIdentity, BTreeSet<Cti>>,
    keys: BTreeMap<KeyIdentity, BoundKey>,
    /// Channel identities (eg. OSCORE recipient IDs) and the keys they authenticate
    senders: BTreeMap<String, KeyIdentity>,
    challenges: BTreeMap<KeyIdentity, Vec<u8>>,
}

impl State {
    fn insert_record(&mut self, cti: Cti, record: TokenRecord) {
        self.by_key
            .entry(record.key.clone())
            .or_default()
            .insert(cti.clone());
        self.tokens.insert(cti, record);
    }

    fn remove_record(&mut self, cti: &Cti) -> bool {
        let Some(record) = self.tokens.remove(cti) else {
            return false;
        };
        let orphaned = match self.by_key.get_mut(&record.key) {
            Some(ctis) => {
                ctis.remove(cti);
                ctis.is_empty()
            }
            None => true,
        };
        if orphaned {
            self.by_key.remove(&record.key);
            self.release_key(&record.key);
        }
        true
    }

    /// Forget everything about a key that no token refers to any more, unless it was provisioned
    fn release_key(&mut self, key: &KeyIdentity) {
        if self.keys.get(key).map_or(false, |k| k.provisioned) {
            return;
        }
        self.keys.remove(key);
        self.senders.retain(|_, k| k != key);
        self.challenges.remove(key);
    }

    fn sweep(&mut self, now: u64) -> Vec<Cti> {
        let expired: Vec<Cti> = self
            .tokens
            .iter()
            .filter(|(_, r)| r.claims.is_expired_at(now))
            .map(|(c, _)| c.clone())
            .collect();
        for cti in &expired {
            self.remove_record(cti);
        }
        expired
    }

    /// Whether a kid-only token for `key`, posted over a channel authenticated as `sender_key`,
    /// replaces the access rights the key currently has
    fn updates(&self, key: &KeyIdentity, sender_key: Option<&KeyIdentity>, now: u64) -> bool {
        sender_key == Some(key)
            && self.by_key.get(key).map_or(false, |ctis| {
                ctis.iter().any(|cti| {
                    self.tokens
                        .get(cti)
                        .map_or(false, |r| !r.claims.is_expired_at(now))
                })
            })
    }
}

/// What committing a token displaced, so that it can be put back
#[derive(Debug)]
struct Undo {
    replaced: Vec<(Cti, TokenRecord)>,
    previous_key: Option<BoundKey>,
}

/// A token committed by [`TokenRepository::add_token_with`]
#[derive(Debug)]
pub struct AddedToken {
    pub cti: Cti,
    pub key: KeyIdentity,
    /// The token replaced the earlier tokens of its key
    pub update: bool,
    /// `None` if the token was already present
    undo: Option<Undo>,
}

/// What one live token contributes to an access decision
struct Grant {
    audience: Audience,
    scope: Scope,
    origin: TokenOrigin,
}

/// The resource server's token store
///
/// Construct one per store with [`TokenRepository::create`] and share it (typically in an
/// [`Arc`]) with every transport binding; [`TokenRepository::close`] ends its life.
pub struct TokenRepository {
    validator: Arc<dyn ScopeValidator>,
    time: Arc<dyn TimeSource>,
    store: Option<PathBuf>,
    state: RwLock<State>,
}

impl fmt::Debug for TokenRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("TokenRepository")
            .field("store", &self.store)
            .field("open", &state.open)
            .field("tokens", &state.tokens.len())
            .field("keys", &state.keys.len())
            .finish()
    }
}

fn decrypt_cnf(envelope: &CoseEncrypt0, crypto: &CwtCryptoContext) -> Result<PopKey, Rejection> {
    let plaintext = crypto
        .open(envelope, &[])
        .map_err(|_| Rejection::CnfDecryptionFailed)?;
    CoseKey::from_slice(&plaintext)
        .map(PopKey::Cose)
        .map_err(|_| Rejection::MalformedClaim("cnf"))
}

fn decide(
    validator: &dyn ScopeValidator,
    grants: &[Grant],
    resource: &str,
    method: Method,
) -> AccessDecision {
    if grants.is_empty() {
        return AccessDecision::Unauthz;
    }

    let mut names: Vec<(&Audience, &str)> = Vec::new();
    // Roles accumulate per group across all of a key's tokens
    let mut groups: BTreeMap<&str, (Roles, Vec<String>)> = BTreeMap::new();
    for grant in grants {
        match &grant.scope {
            Scope::Text(scope_names) => {
                names.extend(scope_names.iter().map(|n| (&grant.audience, n.as_str())))
            }
            Scope::Group(group_scope) => {
                for entry in &group_scope.0 {
                    let (roles, audiences) = groups
                        .entry(entry.group.as_str())
                        .or_insert_with(|| (Roles::default(), Vec::new()));
                    *roles = *roles | entry.roles;
                    audiences.extend(grant.audience.iter().map(String::from));
                }
            }
        }
    }
    let groups: Vec<(&str, Roles, Audience)> = groups
        .into_iter()
        .map(|(g, (roles, audiences))| (g, roles, Audience::Multiple(audiences)))
        .collect();

    let allows = |method: Method| {
        names
            .iter()
            .any(|(aud, name)| validator.permits(aud, name, resource, method))
            || groups
                .iter()
                .any(|(g, roles, aud)| validator.permits_group(aud, g, *roles, resource, method))
    };

    if allows(method) {
        AccessDecision::Ok
    } else if Method::ALL.into_iter().any(|m| m != method && allows(m)) {
        AccessDecision::MethodNa
    } else {
        AccessDecision::Forbid
    }
}

impl TokenRepository {
    /// Open a repository, loading any state persisted at `store`
    ///
    /// Only one repository may be open per store path at any time.
    pub fn create(
        validator: Arc<dyn ScopeValidator>,
        time: Arc<dyn TimeSource>,
        store: Option<PathBuf>,
    ) -> Result<Self, RepositoryError> {
        let mut state = State {
            open: true,
            ..State::default()
        };
        if let Some(path) = &store {
            if !LIVE_STORES.lock().insert(path.clone()) {
                return Err(RepositoryError::AlreadyOpen(path.clone()));
            }
            match store::load(path) {
                Ok(Some(loaded)) => state = loaded,
                Ok(None) => (),
                Err(e) => {
                    LIVE_STORES.lock().remove(path);
                    return Err(e);
                }
            }
            info!(store = %path.display(), tokens = state.tokens.len(), "token repository opened");
        }
        Ok(Self {
            validator,
            time,
            store,
            state: RwLock::new(state),
        })
    }

    pub fn is_open(&self) -> bool {
        self.state.read().open
    }

    /// Persist the state and release the store; all later calls fail or report no access
    pub fn close(&self) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        if !state.open {
            return Err(RepositoryError::Closed);
        }
        self.persist(&state)?;
        state.open = false;
        if let Some(path) = &self.store {
            LIVE_STORES.lock().remove(path);
        }
        info!("token repository closed");
        Ok(())
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.store.as_deref()
    }

    fn persist(&self, state: &State) -> Result<(), RepositoryError> {
        match &self.store {
            Some(path) => store::save(path, state),
            None => Ok(()),
        }
    }

    /// Persist a mutation, or undo it by restoring `before`
    fn commit(&self, state: &mut State, before: State) -> Result<(), RepositoryError> {
        if let Err(e) = self.persist(state) {
            warn!(error = %e, "persisting token repository failed, mutation rolled back");
            *state = before;
            return Err(e);
        }
        Ok(())
    }

    /// Admit a self-contained token whose claims the caller has authenticated and validated
    ///
    /// `sender_key` is the key identity that authenticated the channel the token came on, if any.
    pub fn add_token(
        &self,
        claims: Claims,
        crypto: &CwtCryptoContext,
        sender_key: Option<&KeyIdentity>,
    ) -> Result<Cti, RepositoryError> {
        self.add_token_with(claims, crypto, sender_key, TokenOrigin::SelfContained)
            .map(|added| added.cti)
    }

    /// Admit a token
    ///
    /// The checks run in this order: scope, `cnf`, `cti` (derived from the claims when absent),
    /// uniqueness. When a token that refers to its key by kid comes from a sender already
    /// authenticated as that very key, and the key has tokens, this is an update of access rights
    /// (see [`TokenRepository::update_applies`]): the key's earlier tokens are replaced. A cti can
    /// only be reused by such an update, and only if it belongs to the same key.
    pub fn add_token_with(
        &self,
        mut claims: Claims,
        crypto: &CwtCryptoContext,
        sender_key: Option<&KeyIdentity>,
        origin: TokenOrigin,
    ) -> Result<AddedToken, RepositoryError> {
        let scope = Scope::parse(claims.scope().ok_or(Rejection::NoScope)?)?;

        let (identity, learned_key) = match claims.cnf().ok_or(Rejection::NoCnf)? {
            Confirmation::Kid(kid) => (KeyIdentity::from_kid(kid), None),
            Confirmation::Key(key) => {
                let key = PopKey::Cose(key.clone());
                (key.identity()?, Some(key))
            }
            Confirmation::Oscore(material) => {
                let key = PopKey::Oscore(material.clone());
                (key.identity()?, Some(key))
            }
            Confirmation::EncryptedKey(envelope) => {
                let key = decrypt_cnf(envelope, crypto)?;
                (key.identity()?, Some(key))
            }
        };

        let (cti, derived) = match claims.cti() {
            Some(cti) => (Cti::new(cti), false),
            None => (Cti::derive(&claims.to_vec()?), true),
        };
        if derived {
            claims.set_cti(cti.0.clone());
        }
        let now = self.time.now();

        let mut state = self.state.write();
        if !state.open {
            return Err(RepositoryError::Closed);
        }
        let before = state.clone();
        let swept = state.sweep(now);
        if !swept.is_empty() {
            debug!(count = swept.len(), "expired tokens swept");
        }

        if learned_key.is_none() && !state.keys.contains_key(&identity) {
            *state = before;
            return Err(Rejection::UnknownKid.into());
        }

        if derived && state.tokens.get(&cti).map_or(false, |r| r.claims == claims) {
            debug!(cti = %cti, "identical token resubmitted");
            *state = before;
            return Ok(AddedToken {
                cti,
                key: identity,
                update: false,
                undo: None,
            });
        }

        let update = learned_key.is_none() && state.updates(&identity, sender_key, now);
        if let Some(existing) = state.tokens.get(&cti) {
            if !update || existing.key != identity {
                *state = before;
                return Err(Rejection::DuplicateCti.into());
            }
        }

        let mut replaced = vec![];
        if update {
            for old in state.by_key.remove(&identity).unwrap_or_default() {
                if let Some(record) = state.tokens.remove(&old) {
                    replaced.push((old, record));
                }
            }
            debug!(key = %identity, replaced = replaced.len(), "access rights updated");
        }
        let previous_key = state.keys.get(&identity).cloned();
        if let Some(key) = learned_key {
            if !previous_key.as_ref().map_or(false, |k| k.provisioned) {
                state.keys.insert(
                    identity.clone(),
                    BoundKey {
                        key,
                        provisioned: false,
                    },
                );
            }
        }
        state.insert_record(
            cti.clone(),
            TokenRecord {
                claims,
                scope,
                key: identity.clone(),
                origin,
            },
        );
        self.commit(&mut state, before)?;
        info!(cti = %cti, key = %identity, update, "token admitted");
        Ok(AddedToken {
            cti,
            key: identity,
            update,
            undo: Some(Undo {
                replaced,
                previous_key,
            }),
        })
    }

    /// Whether [`TokenRepository::add_token_with`] would currently take `claims` from a channel
    /// authenticated as `sender_key` for an update of access rights
    ///
    /// Only tokens that refer to their key by kid alone update access rights; tokens carrying key
    /// material always start afresh.
    pub fn update_applies(&self, claims: &Claims, sender_key: Option<&KeyIdentity>) -> bool {
        let Some(Confirmation::Kid(kid)) = claims.cnf() else {
            return false;
        };
        let now = self.time.now();
        let state = self.state.read();
        state.open && state.updates(&KeyIdentity::from_kid(kid), sender_key, now)
    }

    /// Take back a token committed by [`TokenRepository::add_token_with`]
    ///
    /// The tokens an update replaced and the key material the token brought along are restored.
    /// Tokens that were already present before are left alone.
    pub fn withdraw(&self, added: AddedToken) -> Result<(), RepositoryError> {
        let Some(undo) = added.undo else {
            return Ok(());
        };
        let mut state = self.state.write();
        if !state.open {
            return Err(RepositoryError::Closed);
        }
        let before = state.clone();
        if state.tokens.remove(&added.cti).is_some() {
            if let Some(ctis) = state.by_key.get_mut(&added.key) {
                ctis.remove(&added.cti);
            }
        }
        for (cti, record) in undo.replaced {
            state.insert_record(cti, record);
        }
        if let Some(previous) = undo.previous_key {
            state.keys.insert(added.key.clone(), previous);
        }
        if state.by_key.get(&added.key).map_or(true, |ctis| ctis.is_empty()) {
            state.by_key.remove(&added.key);
            state.release_key(&added.key);
        }
        self.commit(&mut state, before)?;
        info!(cti = %added.cti, key = %added.key, "token withdrawn");
        Ok(())
    }

    /// Decide whether the holder of `key` may perform `method` on `resource` at time `now`
    pub fn can_access(
        &self,
        key: &str,
        resource: &str,
        method: Method,
        now: u64,
    ) -> AccessDecision {
        self.can_access_with(key, resource, method, now, None)
    }

    /// Like [`TokenRepository::can_access`], but tokens that were posted by reference are
    /// introspected again and only count while the AS still considers them active
    pub fn can_access_with(
        &self,
        key: &str,
        resource: &str,
        method: Method,
        now: u64,
        introspection: Option<&dyn IntrospectionHandler>,
    ) -> AccessDecision {
        let grants: Vec<Grant> = {
            let state = self.state.read();
            if !state.open {
                return AccessDecision::Unauthz;
            }
            let Some(ctis) = state.by_key.get(key) else {
                return AccessDecision::Unauthz;
            };
            ctis.iter()
                .filter_map(|cti| state.tokens.get(cti))
                .filter(|record| record.claims.is_valid_at(now))
                .map(|record| Grant {
                    audience: record
                        .claims
                        .audience()
                        .cloned()
                        .unwrap_or(Audience::Multiple(vec![])),
                    scope: record.scope.clone(),
                    origin: record.origin.clone(),
                })
                .collect()
        };

        let grants: Vec<Grant> = match introspection {
            None => grants,
            Some(handler) => grants
                .into_iter()
                .filter(|grant| match &grant.origin {
                    TokenOrigin::SelfContained => true,
                    TokenOrigin::Reference(reference) => matches!(
                        handler.introspect(reference),
                        Ok(Introspection::Active(claims)) if claims.is_valid_at(now)
                    ),
                })
                .collect(),
        };

        let decision = decide(&*self.validator, &grants, resource, method);
        debug!(key, resource, ?method, ?decision, "access decision");
        decision
    }

    /// Proof-of-possession key of a token, unless the token is unknown or expired
    pub fn get_pop(&self, cti: &Cti) -> Option<PopKey> {
        let now = self.time.now();
        let state = self.state.read();
        if !state.open {
            return None;
        }
        let record = state.tokens.get(cti)?;
        if record.claims.is_expired_at(now) {
            return None;
        }
        state.keys.get(&record.key).map(|bound| bound.key.clone())
    }

    pub fn get_claims(&self, cti: &Cti) -> Option<Claims> {
        let state = self.state.read();
        if !state.open {
            return None;
        }
        state.tokens.get(cti).map(|r| r.claims.clone())
    }

    pub fn key_for_token(&self, cti: &Cti) -> Option<KeyIdentity> {
        let state = self.state.read();
        if !state.open {
            return None;
        }
        state.tokens.get(cti).map(|r| r.key.clone())
    }

    /// Tokens bound to `key`; empty once the repository is closed
    pub fn tokens_for_key(&self, key: &str) -> Vec<Cti> {
        let state = self.state.read();
        if !state.open {
            return vec![];
        }
        state
            .by_key
            .get(key)
            .map(|ctis| ctis.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove_token(&self, cti: &Cti) -> Result<bool, RepositoryError> {
        let mut state = self.state.write();
        if !state.open {
            return Err(RepositoryError::Closed);
        }
        let before = state.clone();
        if !state.remove_record(cti) {
            return Ok(false);
        }
        self.commit(&mut state, before)?;
        info!(cti = %cti, "token removed");
        Ok(true)
    }

    /// Remove all tokens expired at `now`; returns their identifiers
    pub fn purge_expired(&self, now: u64) -> Result<Vec<Cti>, RepositoryError> {
        let mut state = self.state.write();
        if !state.open {
            return Err(RepositoryError::Closed);
        }
        let before = state.clone();
        let expired = state.sweep(now);
        if !expired.is_empty() {
            self.commit(&mut state, before)?;
            info!(count = expired.len(), "expired tokens purged");
        }
        Ok(expired)
    }

    /// Make a key known out of band, so that tokens can refer to it by its kid
    pub fn provision_key(&self, key: PopKey) -> Result<KeyIdentity, RepositoryError> {
        let identity = key.identity()?;
        let mut state = self.state.write();
        if !state.open {
            return Err(RepositoryError::Closed);
        }
        let before = state.clone();
        state.keys.insert(
            identity.clone(),
            BoundKey {
                key,
                provisioned: true,
            },
        );
        self.commit(&mut state, before)?;
        Ok(identity)
    }

    /// Record that requests from `sender` are authenticated with `key`
    pub fn bind_sender(
        &self,
        sender: impl Into<String>,
        key: &KeyIdentity,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        if !state.open {
            return Err(RepositoryError::Closed);
        }
        let before = state.clone();
        state.senders.insert(sender.into(), key.clone());
        self.commit(&mut state, before)
    }

    pub fn unbind_sender(&self, sender: &str) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        if !state.open {
            return Err(RepositoryError::Closed);
        }
        let before = state.clone();
        if state.senders.remove(sender).is_some() {
            self.commit(&mut state, before)?;
        }
        Ok(())
    }

    pub fn key_for_sender(&self, sender: &str) -> Option<KeyIdentity> {
        let state = self.state.read();
        if !state.open {
            return None;
        }
        state.senders.get(sender).cloned()
    }

    /// Remember the challenge handed out to the holder of `key` (the group manager's
    /// `kdcchallenge`)
    pub fn set_challenge(
        &self,
        key: &KeyIdentity,
        challenge: Vec<u8>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        if !state.open {
            return Err(RepositoryError::Closed);
        }
        let before = state.clone();
        state.challenges.insert(key.clone(), challenge);
        self.commit(&mut state, before)
    }

    pub fn challenge_for(&self, key: &str) -> Option<Vec<u8>> {
        let state = self.state.read();
        if !state.open {
            return None;
        }
        state.challenges.get(key).cloned()
    }
}

impl Drop for TokenRepository {
    fn drop(&mut self) {
        if let Some(path) = &self.store {
            if self.state.get_mut().open {
                LIVE_STORES.lock().remove(path);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::CcmAlgorithm;
    use crate::oscore::OscoreInputMaterial;
    use crate::scope::{GroupPolicy, GroupScope, GroupScopeEntry, Role, ScopePolicy};
    use crate::time::ManualClock;
    use proptest::prelude::*;

    const GROUP: &str = "feedca570000";

    fn policy() -> ScopePolicy {
        let mut groups = GroupPolicy::default().with_group(GROUP);
        groups.role_methods = BTreeMap::from([
            (Role::Requester, BTreeSet::from([Method::Post])),
            (Role::Responder, BTreeSet::from([Method::Put])),
            (Role::Monitor, BTreeSet::from([Method::Get])),
            (Role::Verifier, BTreeSet::from([Method::Fetch])),
        ]);
        ScopePolicy::new()
            .grant("r_temp", "temp", [Method::Get])
            .grant("rw_config", "config", [Method::Get, Method::Put])
            .grant("r_pressure", "pressure", [Method::Get])
            .with_groups(groups)
    }

    fn crypto() -> CwtCryptoContext {
        CwtCryptoContext::new(vec![0x61; 16], CcmAlgorithm::AesCcm16_64_128).unwrap()
    }

    fn repo_at(clock: Arc<ManualClock>, store: Option<PathBuf>) -> TokenRepository {
        let repo = TokenRepository::create(Arc::new(policy()), clock, store).unwrap();
        if !repo.store_path().map_or(false, |p| p.exists()) {
            repo.provision_key(PopKey::symmetric(b"ourKey", vec![0x01; 16]))
                .unwrap();
        }
        repo
    }

    fn repo() -> (TokenRepository, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1000));
        (repo_at(clock.clone(), None), clock)
    }

    fn kid_token(scope: &str, cti: &[u8]) -> Claims {
        token_for(b"ourKey", scope, cti)
    }

    fn token_for(kid: &[u8], scope: &str, cti: &[u8]) -> Claims {
        Claims::new()
            .with_scope(scope)
            .with_audience("rs1")
            .with_cti(cti.to_vec())
            .with_cnf(Confirmation::Kid(kid.to_vec()))
    }

    fn group_token(roles: Roles, key: &[u8], cti: &[u8]) -> Claims {
        let scope = GroupScope(vec![GroupScopeEntry {
            group: GROUP.into(),
            roles,
        }]);
        Claims::new()
            .with_scope(crate::claims::ScopeClaim::Binary(scope.encode()))
            .with_audience("rs1")
            .with_cti(cti.to_vec())
            .with_cnf(PopKey::symmetric(key, vec![0x02; 16]).to_confirmation())
    }

    #[test]
    fn text_scope_decisions() {
        let (repo, _) = repo();
        repo.add_token(kid_token("r_temp", &[0x01]), &crypto(), None)
            .unwrap();
        assert_eq!(
            repo.can_access("ourKey", "temp", Method::Get, 1000),
            AccessDecision::Ok
        );
        assert_eq!(
            repo.can_access("ourKey", "temp", Method::Post, 1000),
            AccessDecision::MethodNa
        );
        assert_eq!(
            repo.can_access("ourKey", "config", Method::Get, 1000),
            AccessDecision::Forbid
        );
        assert_eq!(
            repo.can_access("otherKey", "temp", Method::Get, 1000),
            AccessDecision::Unauthz
        );
    }

    #[test]
    fn group_scope_decisions() {
        let (repo, _) = repo();
        let requester: Roles = [Role::Requester].into_iter().collect();
        repo.add_token(group_token(requester, b"K", &[0x10]), &crypto(), None)
            .unwrap();
        let resource = format!("ace-group/{GROUP}");
        assert_eq!(
            repo.can_access("K", &resource, Method::Post, 1000),
            AccessDecision::Ok
        );
        assert_eq!(
            repo.can_access("K", &resource, Method::Get, 1000),
            AccessDecision::MethodNa
        );
        assert_eq!(
            repo.can_access("K", "ace-group/other", Method::Post, 1000),
            AccessDecision::Forbid
        );
        assert_eq!(
            repo.can_access("K2", &resource, Method::Post, 1000),
            AccessDecision::Unauthz
        );
    }

    #[test]
    fn missing_parts_are_rejected() {
        let (repo, _) = repo();
        let no_scope = Claims::new().with_cnf(Confirmation::Kid(b"ourKey".to_vec()));
        assert!(matches!(
            repo.add_token(no_scope, &crypto(), None),
            Err(RepositoryError::Rejected(Rejection::NoScope))
        ));
        let no_cnf = Claims::new().with_scope("r_temp");
        assert!(matches!(
            repo.add_token(no_cnf, &crypto(), None),
            Err(RepositoryError::Rejected(Rejection::NoCnf))
        ));
        let unknown = Claims::new()
            .with_scope("r_temp")
            .with_cnf(Confirmation::Kid(b"nobody".to_vec()));
        assert!(matches!(
            repo.add_token(unknown, &crypto(), None),
            Err(RepositoryError::Rejected(Rejection::UnknownKid))
        ));
        let bad_roles = Claims::new()
            .with_scope(crate::claims::ScopeClaim::Binary(vec![
                0x81, 0x82, 0x61, b'g', 0x01,
            ]))
            .with_cnf(Confirmation::Kid(b"ourKey".to_vec()));
        assert!(matches!(
            repo.add_token(bad_roles, &crypto(), None),
            Err(RepositoryError::Rejected(Rejection::InvalidRoles))
        ));
    }

    #[test]
    fn duplicate_cti_keeps_first() {
        let (repo, _) = repo();
        repo.add_token(kid_token("r_temp", &[0x01]), &crypto(), None)
            .unwrap();
        assert!(matches!(
            repo.add_token(kid_token("rw_config", &[0x01]), &crypto(), None),
            Err(RepositoryError::Rejected(Rejection::DuplicateCti))
        ));
        assert_eq!(
            repo.can_access("ourKey", "temp", Method::Get, 1000),
            AccessDecision::Ok
        );
        assert_eq!(
            repo.can_access("ourKey", "config", Method::Get, 1000),
            AccessDecision::Forbid
        );
    }

    #[test]
    fn derived_cti_is_idempotent() {
        let (repo, _) = repo();
        let claims = Claims::new()
            .with_scope("r_temp")
            .with_cnf(Confirmation::Kid(b"ourKey".to_vec()));
        let first = repo.add_token(claims.clone(), &crypto(), None).unwrap();
        let second = repo.add_token(claims, &crypto(), None).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_bytes().len(), DERIVED_CTI_LEN);
        assert_eq!(repo.tokens_for_key("ourKey"), vec![first.clone()]);
        assert_eq!(
            repo.get_claims(&first).unwrap().cti(),
            Some(first.as_bytes())
        );
    }

    #[test]
    fn expired_tokens_do_not_grant() {
        let (repo, clock) = repo();
        let claims = kid_token("r_temp", &[0x01]).with_expiration(1010);
        let cti = repo.add_token(claims, &crypto(), None).unwrap();
        assert_eq!(
            repo.can_access("ourKey", "temp", Method::Get, 1009),
            AccessDecision::Ok
        );
        assert_eq!(
            repo.can_access("ourKey", "temp", Method::Get, 1010),
            AccessDecision::Unauthz
        );
        // still stored until swept
        assert!(repo.get_claims(&cti).is_some());

        clock.set(1010);
        assert_eq!(repo.get_pop(&cti), None);
        assert_eq!(repo.purge_expired(1010).unwrap(), vec![cti.clone()]);
        assert!(repo.get_claims(&cti).is_none());
    }

    #[test]
    fn not_yet_valid_tokens_do_not_grant() {
        let (repo, _) = repo();
        let claims = kid_token("r_temp", &[0x01]).with_not_before(2000);
        repo.add_token(claims, &crypto(), None).unwrap();
        assert_eq!(
            repo.can_access("ourKey", "temp", Method::Get, 1999),
            AccessDecision::Unauthz
        );
        assert_eq!(
            repo.can_access("ourKey", "temp", Method::Get, 2000),
            AccessDecision::Ok
        );
    }

    #[test]
    fn permissions_accumulate_and_shrink_on_removal() {
        let (repo, _) = repo();
        let temp = repo
            .add_token(kid_token("r_temp", &[0x01]), &crypto(), None)
            .unwrap();
        repo.add_token(kid_token("r_pressure", &[0x02]), &crypto(), None)
            .unwrap();
        assert_eq!(
            repo.can_access("ourKey", "pressure", Method::Get, 1000),
            AccessDecision::Ok
        );
        assert!(repo.remove_token(&temp).unwrap());
        assert!(!repo.remove_token(&temp).unwrap());
        assert_eq!(
            repo.can_access("ourKey", "temp", Method::Get, 1000),
            AccessDecision::Forbid
        );
        assert_eq!(
            repo.can_access("ourKey", "pressure", Method::Get, 1000),
            AccessDecision::Ok
        );
    }

    #[test]
    fn update_replaces_scope() {
        let (repo, _) = repo();
        let owner = KeyIdentity::from("ourKey");
        repo.add_token(kid_token("r_temp", &[0x01]), &crypto(), None)
            .unwrap();
        repo.add_token(kid_token("r_pressure", &[0x02]), &crypto(), Some(&owner))
            .unwrap();
        assert_eq!(
            repo.can_access("ourKey", "temp", Method::Get, 1000),
            AccessDecision::Forbid
        );
        assert_eq!(
            repo.can_access("ourKey", "pressure", Method::Get, 1000),
            AccessDecision::Ok
        );
        assert_eq!(repo.tokens_for_key("ourKey").len(), 1);
    }

    #[test]
    fn cti_of_another_key_stays_a_duplicate() {
        let (repo, _) = repo();
        repo.provision_key(PopKey::symmetric(b"alice", vec![0x0a; 16]))
            .unwrap();
        let bob = repo
            .provision_key(PopKey::symmetric(b"bob", vec![0x0b; 16]))
            .unwrap();
        repo.add_token(token_for(b"alice", "r_temp", &[0x01]), &crypto(), None)
            .unwrap();
        repo.add_token(token_for(b"bob", "r_pressure", &[0x02]), &crypto(), None)
            .unwrap();

        assert!(matches!(
            repo.add_token(token_for(b"bob", "rw_config", &[0x01]), &crypto(), Some(&bob)),
            Err(RepositoryError::Rejected(Rejection::DuplicateCti))
        ));
        assert_eq!(
            repo.key_for_token(&Cti::new(vec![0x01])),
            Some(KeyIdentity::from("alice"))
        );
        assert_eq!(
            repo.can_access("alice", "temp", Method::Get, 1000),
            AccessDecision::Ok
        );
        assert_eq!(
            repo.can_access("alice", "config", Method::Put, 1000),
            AccessDecision::Forbid
        );
        assert_eq!(
            repo.can_access("bob", "pressure", Method::Get, 1000),
            AccessDecision::Ok
        );

        // Within its own key, an update may reuse a cti
        let added = repo
            .add_token_with(
                token_for(b"bob", "rw_config", &[0x02]),
                &crypto(),
                Some(&bob),
                TokenOrigin::SelfContained,
            )
            .unwrap();
        assert!(added.update);
        assert_eq!(repo.tokens_for_key("bob"), vec![Cti::new(vec![0x02])]);
        assert_eq!(
            repo.can_access("bob", "pressure", Method::Get, 1000),
            AccessDecision::Forbid
        );
        assert_eq!(repo.tokens_for_key("alice"), vec![Cti::new(vec![0x01])]);
    }

    #[test]
    fn only_kid_tokens_from_their_key_update() {
        let (repo, _) = repo();
        let owner = KeyIdentity::from("ourKey");
        let update = kid_token("r_pressure", &[0x02]);
        assert!(!repo.update_applies(&update, Some(&owner)));

        repo.add_token(kid_token("r_temp", &[0x01]), &crypto(), None)
            .unwrap();
        assert!(repo.update_applies(&update, Some(&owner)));
        assert!(!repo.update_applies(&update, None));
        assert!(!repo.update_applies(&update, Some(&KeyIdentity::from("other"))));

        let with_material = update.with_cnf(
            PopKey::symmetric(b"ourKey", vec![0x01; 16]).to_confirmation(),
        );
        assert!(!repo.update_applies(&with_material, Some(&owner)));
    }

    #[test]
    fn withdrawn_update_restores_replaced_tokens() {
        let (repo, _) = repo();
        let owner = KeyIdentity::from("ourKey");
        let first = repo
            .add_token(kid_token("r_temp", &[0x01]), &crypto(), None)
            .unwrap();
        let added = repo
            .add_token_with(
                kid_token("r_pressure", &[0x02]),
                &crypto(),
                Some(&owner),
                TokenOrigin::SelfContained,
            )
            .unwrap();
        assert!(added.update);
        assert_eq!(
            repo.can_access("ourKey", "temp", Method::Get, 1000),
            AccessDecision::Forbid
        );

        repo.withdraw(added).unwrap();
        assert_eq!(repo.tokens_for_key("ourKey"), vec![first]);
        assert_eq!(
            repo.can_access("ourKey", "temp", Method::Get, 1000),
            AccessDecision::Ok
        );
        assert_eq!(
            repo.can_access("ourKey", "pressure", Method::Get, 1000),
            AccessDecision::Forbid
        );
    }

    #[test]
    fn withdrawn_token_restores_previous_key() {
        let (repo, _) = repo();
        let material = OscoreInputMaterial::new(b"osc".to_vec(), vec![0x44; 16]);
        let key = KeyIdentity::from("osc");
        let claims = Claims::new()
            .with_scope("r_temp")
            .with_cti(vec![0x09])
            .with_cnf(Confirmation::Oscore(material.clone()));
        let first = repo.add_token(claims, &crypto(), None).unwrap();
        repo.bind_sender("\u{2}", &key).unwrap();

        let replacement = OscoreInputMaterial::new(b"osc".to_vec(), vec![0x55; 16]);
        let claims = Claims::new()
            .with_scope("r_pressure")
            .with_cti(vec![0x0a])
            .with_cnf(Confirmation::Oscore(replacement.clone()));
        let added = repo
            .add_token_with(claims, &crypto(), Some(&key), TokenOrigin::SelfContained)
            .unwrap();
        assert!(!added.update);
        assert_eq!(repo.get_pop(&first), Some(PopKey::Oscore(replacement)));

        repo.withdraw(added).unwrap();
        assert_eq!(repo.tokens_for_key("osc"), vec![first.clone()]);
        assert_eq!(repo.get_pop(&first), Some(PopKey::Oscore(material)));
        assert_eq!(repo.key_for_sender("\u{2}"), Some(key));

        // Withdrawing a key's only token releases the key
        let lone = Claims::new()
            .with_scope("r_temp")
            .with_cti(vec![0x0b])
            .with_cnf(Confirmation::Oscore(OscoreInputMaterial::new(
                b"lone".to_vec(),
                vec![0x66; 16],
            )));
        let added = repo
            .add_token_with(lone, &crypto(), None, TokenOrigin::SelfContained)
            .unwrap();
        repo.withdraw(added).unwrap();
        let follow_up = token_for(b"lone", "r_temp", &[0x0c]);
        assert!(matches!(
            repo.add_token(follow_up, &crypto(), None),
            Err(RepositoryError::Rejected(Rejection::UnknownKid))
        ));
    }

    #[test]
    fn withdrawing_a_resubmission_keeps_the_token() {
        let (repo, _) = repo();
        let claims = Claims::new()
            .with_scope("r_temp")
            .with_cnf(Confirmation::Kid(b"ourKey".to_vec()));
        let cti = repo.add_token(claims.clone(), &crypto(), None).unwrap();
        let again = repo
            .add_token_with(claims, &crypto(), None, TokenOrigin::SelfContained)
            .unwrap();
        assert_eq!(again.cti, cti);
        repo.withdraw(again).unwrap();
        assert_eq!(repo.tokens_for_key("ourKey"), vec![cti]);
    }

    #[test]
    fn unauthenticated_submission_accumulates() {
        let (repo, _) = repo();
        let stranger = KeyIdentity::from("someoneElse");
        repo.add_token(kid_token("r_temp", &[0x01]), &crypto(), None)
            .unwrap();
        repo.add_token(kid_token("r_pressure", &[0x02]), &crypto(), Some(&stranger))
            .unwrap();
        assert_eq!(
            repo.can_access("ourKey", "temp", Method::Get, 1000),
            AccessDecision::Ok
        );
        // and an unauthenticated re-use of a cti is still a duplicate
        assert!(matches!(
            repo.add_token(kid_token("rw_config", &[0x02]), &crypto(), Some(&stranger)),
            Err(RepositoryError::Rejected(Rejection::DuplicateCti))
        ));
    }

    #[test]
    fn encrypted_cnf() {
        let (repo, _) = repo();
        let key = PopKey::symmetric(b"sealed", vec![0x33; 16]);
        let PopKey::Cose(cose_key) = &key else {
            unreachable!()
        };
        let envelope = crypto()
            .seal(&cose_key.clone().to_vec().unwrap(), &[], &[5; 13])
            .unwrap();
        let claims = Claims::new()
            .with_scope("r_temp")
            .with_cti(vec![0x07])
            .with_cnf(Confirmation::EncryptedKey(envelope.clone()));
        let cti = repo.add_token(claims, &crypto(), None).unwrap();
        assert_eq!(repo.get_pop(&cti), Some(key));
        assert_eq!(repo.key_for_token(&cti), Some(KeyIdentity::from("sealed")));

        let other = CwtCryptoContext::new(vec![0x62; 16], CcmAlgorithm::AesCcm16_64_128).unwrap();
        let claims = Claims::new()
            .with_scope("r_temp")
            .with_cnf(Confirmation::EncryptedKey(envelope));
        assert!(matches!(
            repo.add_token(claims, &other, None),
            Err(RepositoryError::Rejected(Rejection::CnfDecryptionFailed))
        ));
    }

    #[test]
    fn learned_keys_go_with_their_last_token() {
        let (repo, _) = repo();
        let material = OscoreInputMaterial::new(b"osc".to_vec(), vec![0x44; 16]);
        let claims = Claims::new()
            .with_scope("r_temp")
            .with_cti(vec![0x09])
            .with_cnf(Confirmation::Oscore(material.clone()));
        let cti = repo.add_token(claims, &crypto(), None).unwrap();
        let key = KeyIdentity::from("osc");
        repo.bind_sender("\u{2}", &key).unwrap();
        repo.set_challenge(&key, vec![1, 2, 3]).unwrap();
        assert_eq!(repo.key_for_sender("\u{2}"), Some(key.clone()));
        assert_eq!(repo.challenge_for("osc"), Some(vec![1, 2, 3]));
        assert_eq!(repo.get_pop(&cti), Some(PopKey::Oscore(material)));

        repo.remove_token(&cti).unwrap();
        assert_eq!(repo.key_for_sender("\u{2}"), None);
        assert_eq!(repo.challenge_for("osc"), None);
        // A kid-only token cannot refer to it any more
        let follow_up = Claims::new()
            .with_scope("r_temp")
            .with_cnf(Confirmation::Kid(b"osc".to_vec()));
        assert!(matches!(
            repo.add_token(follow_up, &crypto(), None),
            Err(RepositoryError::Rejected(Rejection::UnknownKid))
        ));

        // Provisioned keys stay
        let cti = repo
            .add_token(kid_token("r_temp", &[0x01]), &crypto(), None)
            .unwrap();
        repo.remove_token(&cti).unwrap();
        assert!(repo
            .add_token(kid_token("r_temp", &[0x02]), &crypto(), None)
            .is_ok());
    }

    struct Revoked;

    impl IntrospectionHandler for Revoked {
        fn introspect(
            &self,
            _token: &str,
        ) -> Result<Introspection, crate::introspection::IntrospectionError> {
            Ok(Introspection::Inactive)
        }
    }

    #[test]
    fn reference_tokens_are_reintrospected() {
        let (repo, _) = repo();
        repo.add_token_with(
            kid_token("r_temp", b"ref-1"),
            &crypto(),
            None,
            TokenOrigin::Reference("ref-1".into()),
        )
        .unwrap();
        assert_eq!(
            repo.can_access("ourKey", "temp", Method::Get, 1000),
            AccessDecision::Ok
        );
        assert_eq!(
            repo.can_access_with("ourKey", "temp", Method::Get, 1000, Some(&Revoked)),
            AccessDecision::Unauthz
        );
    }

    #[test]
    fn closed_repository_fails_fast() {
        let (repo, _) = repo();
        let cti = repo
            .add_token(kid_token("r_temp", &[0x01]), &crypto(), None)
            .unwrap();
        let key = KeyIdentity::from("ourKey");
        repo.bind_sender("peer", &key).unwrap();
        repo.set_challenge(&key, vec![1]).unwrap();
        repo.close().unwrap();
        assert!(!repo.is_open());
        assert_eq!(repo.get_pop(&cti), None);
        assert_eq!(repo.get_claims(&cti), None);
        assert_eq!(repo.key_for_token(&cti), None);
        assert!(repo.tokens_for_key("ourKey").is_empty());
        assert_eq!(repo.key_for_sender("peer"), None);
        assert_eq!(repo.challenge_for("ourKey"), None);
        assert!(!repo.update_applies(&kid_token("r_temp", &[0x02]), Some(&key)));
        assert_eq!(
            repo.can_access("ourKey", "temp", Method::Get, 1000),
            AccessDecision::Unauthz
        );
        assert!(matches!(
            repo.add_token(kid_token("r_temp", &[0x02]), &crypto(), None),
            Err(RepositoryError::Closed)
        ));
        assert!(matches!(repo.close(), Err(RepositoryError::Closed)));
    }

    #[test]
    fn persisted_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let clock = Arc::new(ManualClock::new(1000));

        let repo = repo_at(clock.clone(), Some(path.clone()));
        let cti = repo
            .add_token(kid_token("r_temp", &[0x01]), &crypto(), None)
            .unwrap();
        repo.bind_sender("peer", &KeyIdentity::from("ourKey")).unwrap();
        assert!(matches!(
            TokenRepository::create(Arc::new(policy()), clock.clone(), Some(path.clone())),
            Err(RepositoryError::AlreadyOpen(_))
        ));
        repo.close().unwrap();

        let reopened = repo_at(clock, Some(path));
        assert_eq!(
            reopened.can_access("ourKey", "temp", Method::Get, 1000),
            AccessDecision::Ok
        );
        assert!(reopened.get_pop(&cti).is_some());
        assert_eq!(
            reopened.key_for_sender("peer"),
            Some(KeyIdentity::from("ourKey"))
        );
    }

    #[test]
    fn failed_write_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("tokens.json");
        let clock = Arc::new(ManualClock::new(1000));
        let repo = TokenRepository::create(Arc::new(policy()), clock, Some(path)).unwrap();

        assert!(matches!(
            repo.provision_key(PopKey::symmetric(b"ourKey", vec![1; 16])),
            Err(RepositoryError::Storage(_))
        ));
        let material = OscoreInputMaterial::new(b"osc".to_vec(), vec![0x44; 16]);
        let claims = Claims::new()
            .with_scope("r_temp")
            .with_cti(vec![0x09])
            .with_cnf(Confirmation::Oscore(material));
        assert!(matches!(
            repo.add_token(claims, &crypto(), None),
            Err(RepositoryError::Storage(_))
        ));
        assert!(repo.get_claims(&Cti::new(vec![0x09])).is_none());
        assert!(repo.tokens_for_key("osc").is_empty());
    }

    #[test]
    fn cti_rendering() {
        let cti = Cti::new(b"token1".to_vec());
        assert_eq!(cti.to_string(), "dG9rZW4x");
        assert_eq!(Cti::parse("dG9rZW4x"), Some(cti));
    }

    proptest! {
        #[test]
        fn group_roles_or_compose(a in 1u64..16, b in 1u64..16, method_code in 1u8..8) {
            let method = Method::from_code(method_code).unwrap();
            let a = Roles::from_bits(a << 1).unwrap();
            let b = Roles::from_bits(b << 1).unwrap();
            let (repo, _) = repo();
            repo.add_token(group_token(a, b"split", &[1]), &crypto(), None).unwrap();
            repo.add_token(group_token(b, b"split", &[2]), &crypto(), None).unwrap();
            repo.add_token(group_token(a | b, b"joined", &[3]), &crypto(), None).unwrap();
            let resource = format!("ace-group/{GROUP}");
            prop_assert_eq!(
                repo.can_access("split", &resource, method, 1000),
                repo.can_access("joined", &resource, method, 1000)
            );
        }
    }
}
