// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! Proof-of-possession confirmations (the `cnf` claim, RFC8747 and RFC9203 Section 3.2.1)

use std::borrow::Borrow;
use std::fmt;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ciborium::value::{Integer, Value};
use coset::{iana, AsCborValue, CborSerializable, CoseEncrypt0, CoseKey, KeyType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CodecError, Rejection};
use crate::oscore::OscoreInputMaterial;

const COSE_KEY: u64 = 1;
const ENCRYPTED_COSE_KEY: u64 = 2;
const KID: u64 = 3;
const OSCORE_INPUT_MATERIAL: u64 = 4;

const MALFORMED_CNF: Rejection = Rejection::MalformedClaim("cnf");

/// Content of a `cnf` claim
///
/// Exactly one confirmation method is present in any valid claim.
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    Key(CoseKey),
    /// A COSE_Key encrypted for the resource server with the key it shares with the AS
    EncryptedKey(CoseEncrypt0),
    /// Reference to a key the resource server knows already
    Kid(Vec<u8>),
    Oscore(OscoreInputMaterial),
}

impl Confirmation {
    pub fn from_cbor_value(value: Value) -> Result<Self, Rejection> {
        let Value::Map(entries) = value else {
            return Err(MALFORMED_CNF);
        };
        let mut entries = entries.into_iter();
        let (Some((key, value)), None) = (entries.next(), entries.next()) else {
            return Err(MALFORMED_CNF);
        };
        let label = match key {
            Value::Integer(i) => u64::try_from(i).map_err(|_| MALFORMED_CNF)?,
            _ => return Err(MALFORMED_CNF),
        };
        Ok(match label {
            COSE_KEY => {
                Confirmation::Key(CoseKey::from_cbor_value(value).map_err(|_| MALFORMED_CNF)?)
            }
            ENCRYPTED_COSE_KEY => {
                let value = match value {
                    Value::Tag(16, inner) => *inner,
                    v => v,
                };
                Confirmation::EncryptedKey(
                    CoseEncrypt0::from_cbor_value(value).map_err(|_| MALFORMED_CNF)?,
                )
            }
            KID => match value {
                Value::Bytes(kid) => Confirmation::Kid(kid),
                _ => return Err(Rejection::InvalidKid),
            },
            OSCORE_INPUT_MATERIAL => Confirmation::Oscore(
                OscoreInputMaterial::from_cbor_value(value).ok_or(MALFORMED_CNF)?,
            ),
            _ => return Err(MALFORMED_CNF),
        })
    }

    pub fn to_cbor_value(&self) -> Result<Value, CodecError> {
        let (label, value) = match self {
            Confirmation::Key(k) => (COSE_KEY, k.clone().to_cbor_value()?),
            Confirmation::EncryptedKey(e) => (ENCRYPTED_COSE_KEY, e.clone().to_cbor_value()?),
            Confirmation::Kid(kid) => (KID, Value::Bytes(kid.clone())),
            Confirmation::Oscore(m) => (OSCORE_INPUT_MATERIAL, m.to_cbor_value()),
        };
        Ok(Value::Map(vec![(Value::Integer(Integer::from(label)), value)]))
    }
}

/// Name under which the repository indexes a proof-of-possession key
///
/// Symmetric keys and OSCORE input material are named by their identifiers (as text where they
/// are UTF-8, base64 otherwise); asymmetric keys by a `ni:` URI over their hash (RFC6920).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyIdentity(String);

impl KeyIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        KeyIdentity(name.into())
    }

    /// Identity of a key referred to by its key identifier
    pub fn from_kid(kid: &[u8]) -> Self {
        match core::str::from_utf8(kid) {
            Ok(s) => KeyIdentity(s.into()),
            Err(_) => KeyIdentity(STANDARD.encode(kid)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for KeyIdentity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for KeyIdentity {
    fn from(s: &str) -> Self {
        KeyIdentity(s.into())
    }
}

/// Key material a token is bound to, once any indirection in its `cnf` is resolved
#[derive(Debug, Clone, PartialEq)]
pub enum PopKey {
    Cose(CoseKey),
    Oscore(OscoreInputMaterial),
}

impl PopKey {
    /// Build a symmetric COSE key, as provisioned out of band for clients using DTLS PSK
    pub fn symmetric(kid: &[u8], k: Vec<u8>) -> Self {
        PopKey::Cose(
            coset::CoseKeyBuilder::new_symmetric_key(k)
                .key_id(kid.to_vec())
                .build(),
        )
    }

    pub fn identity(&self) -> Result<KeyIdentity, Rejection> {
        match self {
            PopKey::Oscore(material) => Ok(KeyIdentity::from_kid(&material.id)),
            PopKey::Cose(key) if key.kty == KeyType::Assigned(iana::KeyType::Symmetric) => {
                if key.key_id.is_empty() {
                    return Err(MALFORMED_CNF);
                }
                Ok(KeyIdentity::from_kid(&key.key_id))
            }
            PopKey::Cose(key) => {
                let mut anonymous = key.clone();
                anonymous.key_id.clear();
                let encoded = anonymous.to_vec().map_err(|_| MALFORMED_CNF)?;
                let digest = Sha256::digest(&encoded);
                Ok(KeyIdentity(format!(
                    "ni:///sha-256;{}",
                    URL_SAFE_NO_PAD.encode(digest)
                )))
            }
        }
    }

    pub fn to_confirmation(&self) -> Confirmation {
        match self {
            PopKey::Cose(k) => Confirmation::Key(k.clone()),
            PopKey::Oscore(m) => Confirmation::Oscore(m.clone()),
        }
    }

    /// Inverse of [`PopKey::to_confirmation`]; `None` for confirmations that are only references
    pub fn from_confirmation(cnf: Confirmation) -> Option<Self> {
        match cnf {
            Confirmation::Key(k) => Some(PopKey::Cose(k)),
            Confirmation::Oscore(m) => Some(PopKey::Oscore(m)),
            _ => None,
        }
    }
}
