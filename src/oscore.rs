// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! OSCORE input material and security context derivation for the OSCORE profile (RFC9203)
//!
//! The context derivation is that of RFC8613 Section 3.2, with the Master Salt extended by the
//! nonces exchanged through /authz-info (RFC9203 Section 4.3).

use core::num::Wrapping;

use ciborium::value::{Integer, Value};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

use crate::pop::KeyIdentity;

// When configuring an RS with more than 256 active contexts, beware that not only last_id2 needs a
// larger type, but also one needs to start considering the relevant algorithms' maximum ID
// lengths.
pub const MAX_CONTEXTS: usize = 16;

/// Maximum length of any ID stored.
///
/// To accomodate any choice of the peers, this should be the longest nonce length supported by any
/// algorithm minus 6. (Longer values do no harm, this implementation will not choose any long
/// IDs on its own).
pub const MAX_ID_LEN: usize = 7;

pub const MAX_NONCE_LEN: usize = 16;

pub type Id = heapless::Vec<u8, MAX_ID_LEN>;
pub type Nonce = heapless::Vec<u8, MAX_NONCE_LEN>;

/// AES-CCM-16-64-128, the algorithm used when the material does not name one
pub const DEFAULT_ALG: i64 = 10;
/// HKDF SHA-256, the only key derivation function supported here
pub const HKDF_SHA_256: i64 = -10;

const ID: u64 = 0;
const VERSION: u64 = 1;
const MS: u64 = 2;
const HKDF: u64 = 3;
const ALG: u64 = 4;
const SALT: u64 = 5;
const CONTEXT_ID: u64 = 6;

/// OSCORE_Input_Material (RFC9203 Section 3.2.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OscoreInputMaterial {
    pub id: Vec<u8>,
    pub version: Option<u64>,
    pub ms: Vec<u8>,
    pub hkdf: Option<i64>,
    pub alg: Option<i64>,
    pub salt: Option<Vec<u8>>,
    pub context_id: Option<Vec<u8>>,
}

impl OscoreInputMaterial {
    pub fn new(id: Vec<u8>, ms: Vec<u8>) -> Self {
        Self {
            id,
            version: None,
            ms,
            hkdf: None,
            alg: None,
            salt: None,
            context_id: None,
        }
    }

    /// Parse from the CBOR map form; `None` if it is malformed or lacks `id` or `ms`
    pub fn from_cbor_value(value: Value) -> Option<Self> {
        let Value::Map(entries) = value else {
            return None;
        };
        let mut id = None;
        let mut ms = None;
        let mut material = Self::new(vec![], vec![]);
        for (k, v) in entries {
            let label = match k {
                Value::Integer(i) => u64::try_from(i).ok()?,
                _ => return None,
            };
            match (label, v) {
                (ID, Value::Bytes(b)) if id.is_none() => id = Some(b),
                (MS, Value::Bytes(b)) if ms.is_none() => ms = Some(b),
                (VERSION, Value::Integer(i)) => material.version = Some(u64::try_from(i).ok()?),
                (HKDF, Value::Integer(i)) => material.hkdf = Some(i64::try_from(i).ok()?),
                (ALG, Value::Integer(i)) => material.alg = Some(i64::try_from(i).ok()?),
                (SALT, Value::Bytes(b)) => material.salt = Some(b),
                (CONTEXT_ID, Value::Bytes(b)) => material.context_id = Some(b),
                _ => return None,
            }
        }
        material.id = id?;
        material.ms = ms?;
        Some(material)
    }

    pub fn to_cbor_value(&self) -> Value {
        let key = |k: u64| Value::Integer(Integer::from(k));
        let mut entries = vec![(key(ID), Value::Bytes(self.id.clone()))];
        if let Some(v) = self.version {
            entries.push((key(VERSION), Value::Integer(Integer::from(v))));
        }
        entries.push((key(MS), Value::Bytes(self.ms.clone())));
        if let Some(h) = self.hkdf {
            entries.push((key(HKDF), Value::Integer(Integer::from(h))));
        }
        if let Some(a) = self.alg {
            entries.push((key(ALG), Value::Integer(Integer::from(a))));
        }
        if let Some(s) = &self.salt {
            entries.push((key(SALT), Value::Bytes(s.clone())));
        }
        if let Some(c) = &self.context_id {
            entries.push((key(CONTEXT_ID), Value::Bytes(c.clone())));
        }
        Value::Map(entries)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeriveError {
    #[error("unsupported OSCORE version {0}")]
    UnsupportedVersion(u64),
    #[error("unsupported HKDF algorithm {0}")]
    UnsupportedHkdf(i64),
    #[error("unsupported AEAD algorithm {0}")]
    UnsupportedAlgorithm(i64),
    #[error("sender and recipient ID are identical")]
    IdenticalIds,
}

/// Key and nonce length of the AEAD algorithms OSCORE contexts can be set up for
fn aead_lengths(alg: i64) -> Option<(usize, usize)> {
    Some(match alg {
        // A128GCM, A192GCM, A256GCM
        1 => (16, 12),
        2 => (24, 12),
        3 => (32, 12),
        // AES-CCM-16-64-128 and -256, AES-CCM-64-64-128 and -256
        10 => (16, 13),
        11 => (32, 13),
        12 => (16, 7),
        13 => (32, 7),
        // ChaCha20/Poly1305
        24 => (32, 12),
        // AES-CCM-16-128-128 and -256, AES-CCM-64-128-128 and -256
        30 => (16, 13),
        31 => (32, 13),
        32 => (16, 7),
        33 => (32, 7),
        _ => return None,
    })
}

fn info(id: &[u8], id_context: Option<&[u8]>, alg: i64, kind: &str, len: usize) -> Vec<u8> {
    let info = Value::Array(vec![
        Value::Bytes(id.to_vec()),
        id_context.map_or(Value::Null, |c| Value::Bytes(c.to_vec())),
        Value::Integer(Integer::from(alg)),
        Value::Text(kind.into()),
        Value::Integer(Integer::from(len as u64)),
    ]);
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&info, &mut buf).expect("writing into a Vec is infallible");
    buf
}

/// Keys and IV of an OSCORE security context, from the RS's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKeys {
    pub sender_key: Vec<u8>,
    pub recipient_key: Vec<u8>,
    pub common_iv: Vec<u8>,
}

/// RFC8613 Section 3.2.1 derivation of sender key, recipient key and common IV
pub fn derive_keys(
    master_secret: &[u8],
    master_salt: &[u8],
    id_context: Option<&[u8]>,
    sender_id: &[u8],
    recipient_id: &[u8],
    alg: i64,
) -> Result<DerivedKeys, DeriveError> {
    let (key_len, nonce_len) = aead_lengths(alg).ok_or(DeriveError::UnsupportedAlgorithm(alg))?;
    let hkdf = Hkdf::<Sha256>::new(Some(master_salt), master_secret);
    let expand = |id: &[u8], kind: &str, len: usize| {
        let mut out = vec![0; len];
        hkdf.expand(&info(id, id_context, alg, kind, len), &mut out)
            .expect("lengths of AEAD keys and IVs are far below the HKDF output limit");
        out
    };
    Ok(DerivedKeys {
        sender_key: expand(sender_id, "Key", key_len),
        recipient_key: expand(recipient_id, "Key", key_len),
        common_iv: expand(&[], "IV", nonce_len),
    })
}

fn push_bstr(buf: &mut Vec<u8>, data: &[u8]) {
    ciborium::ser::into_writer(&Value::Bytes(data.to_vec()), &mut *buf)
        .expect("writing into a Vec is infallible");
}

/// An established OSCORE security context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    pub alg: i64,
    pub id_context: Option<Vec<u8>>,
    pub sender_id: Id,
    pub recipient_id: Id,
    pub keys: DerivedKeys,
}

/// Derive the context the RS uses with a client after a successful token POST
///
/// `id1` is the client's recipient ID (which the RS sends with), `id2` the RS's recipient ID.
pub fn derive(
    material: &OscoreInputMaterial,
    nonce1: &[u8],
    nonce2: &[u8],
    id1: &Id,
    id2: &Id,
) -> Result<SecurityContext, DeriveError> {
    if let Some(version) = material.version.filter(|v| *v != 1) {
        return Err(DeriveError::UnsupportedVersion(version));
    }
    if let Some(hkdf) = material.hkdf.filter(|h| *h != HKDF_SHA_256) {
        return Err(DeriveError::UnsupportedHkdf(hkdf));
    }
    if id1 == id2 {
        return Err(DeriveError::IdenticalIds);
    }
    let alg = material.alg.unwrap_or(DEFAULT_ALG);

    let mut master_salt = Vec::new();
    push_bstr(&mut master_salt, material.salt.as_deref().unwrap_or_default());
    push_bstr(&mut master_salt, nonce1);
    push_bstr(&mut master_salt, nonce2);

    let keys = derive_keys(
        &material.ms,
        &master_salt,
        material.context_id.as_deref(),
        id1,
        id2,
        alg,
    )?;
    Ok(SecurityContext {
        alg,
        id_context: material.context_id.clone(),
        sender_id: id1.clone(),
        recipient_id: id2.clone(),
        keys,
    })
}

/// A security context together with the key identity of the token it was set up for
#[derive(Debug)]
pub struct StoredContext {
    pub context: SecurityContext,
    pub key: KeyIdentity,
}

/// Bounded set of established contexts; the least recently used one makes room for new ones
#[derive(Default)]
pub struct ContextStore {
    last_id2: Wrapping<u8>,
    // Note that for the relevant MAX_CONTEXTS, there'd be no gains from an indexed data structure
    contexts: uluru::LRUCache<StoredContext, MAX_CONTEXTS>,
}

impl ContextStore {
    /// Produce an id2 value that is not in current use and differs from the peer's `id1`
    ///
    /// This is infallible, because the context pool is always smaller than the ID space
    ///
    /// When called in succession, this produces different IDs (without actually wasting any -- the
    /// skipped ones will be used when the internals wrap)
    pub fn take_id2(&mut self, id1: &[u8]) -> Id {
        loop {
            self.last_id2 += 1;
            let mut id = Id::new();
            id.push(self.last_id2.0).expect("1 <= MAX_ID_LEN");
            if id.as_slice() != id1
                && self
                    .contexts
                    .iter()
                    .all(|stored| stored.context.recipient_id != id)
            {
                return id;
            }
        }
    }

    /// Store a context; returns the one evicted to make room, if any
    pub fn insert(&mut self, stored: StoredContext) -> Option<StoredContext> {
        self.contexts.insert(stored)
    }

    /// Find the context by the recipient ID found in an incoming request's OSCORE option
    pub fn find(&mut self, recipient_id: &[u8]) -> Option<&mut StoredContext> {
        self.contexts
            .find(|stored| stored.context.recipient_id.as_slice() == recipient_id)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl core::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ContextStore")
            .field("last_id2", &self.last_id2)
            .field("contexts", &self.contexts.len())
            .finish()
    }
}
