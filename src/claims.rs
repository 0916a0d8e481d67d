// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! Typed claims sets of access tokens
//!
//! Claims arrive as CBOR maps keyed by small integers (RFC8392 Section 4, RFC9200 Section 8.13).
//! Every claim this crate acts on has a fixed CBOR type; [`Claims::from_cbor_value`] enforces that
//! per key, so that later stages never need to second-guess a value's shape. Claims with keys not
//! listed in [`ClaimKey`] are kept as they came, and are encoded back unchanged.

use std::collections::BTreeMap;

use ciborium::value::{Integer, Value};

use crate::error::{CodecError, Rejection};
use crate::pop::Confirmation;

/// CWT claim keys acted on by the resource server
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClaimKey {
    Iss,
    Sub,
    Aud,
    Exp,
    Nbf,
    Iat,
    Cti,
    Cnf,
    Scope,
    AceProfile,
    Cnonce,
    Exi,
}

impl ClaimKey {
    pub const ALL: [ClaimKey; 12] = [
        ClaimKey::Iss,
        ClaimKey::Sub,
        ClaimKey::Aud,
        ClaimKey::Exp,
        ClaimKey::Nbf,
        ClaimKey::Iat,
        ClaimKey::Cti,
        ClaimKey::Cnf,
        ClaimKey::Scope,
        ClaimKey::AceProfile,
        ClaimKey::Cnonce,
        ClaimKey::Exi,
    ];

    /// CBOR map key of the claim
    pub fn label(self) -> u64 {
        match self {
            ClaimKey::Iss => 1,
            ClaimKey::Sub => 2,
            ClaimKey::Aud => 3,
            ClaimKey::Exp => 4,
            ClaimKey::Nbf => 5,
            ClaimKey::Iat => 6,
            ClaimKey::Cti => 7,
            ClaimKey::Cnf => 8,
            ClaimKey::Scope => 9,
            ClaimKey::AceProfile => 38,
            ClaimKey::Cnonce => 39,
            ClaimKey::Exi => 40,
        }
    }

    pub fn from_label(label: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.label() == label)
    }

    /// Claim name as registered with IANA
    pub fn name(self) -> &'static str {
        match self {
            ClaimKey::Iss => "iss",
            ClaimKey::Sub => "sub",
            ClaimKey::Aud => "aud",
            ClaimKey::Exp => "exp",
            ClaimKey::Nbf => "nbf",
            ClaimKey::Iat => "iat",
            ClaimKey::Cti => "cti",
            ClaimKey::Cnf => "cnf",
            ClaimKey::Scope => "scope",
            ClaimKey::AceProfile => "ace_profile",
            ClaimKey::Cnonce => "cnonce",
            ClaimKey::Exi => "exi",
        }
    }
}

/// Audience claim: a single resource server identifier, or several of them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice = match self {
            Audience::Single(s) => core::slice::from_ref(s),
            Audience::Multiple(v) => v.as_slice(),
        };
        slice.iter().map(|s| s.as_str())
    }

    pub fn contains(&self, audience: &str) -> bool {
        self.iter().any(|a| a == audience)
    }

    fn to_cbor_value(&self) -> Value {
        match self {
            Audience::Single(s) => Value::Text(s.clone()),
            Audience::Multiple(v) => Value::Array(v.iter().cloned().map(Value::Text).collect()),
        }
    }
}

impl From<&str> for Audience {
    fn from(s: &str) -> Self {
        Audience::Single(s.into())
    }
}

/// Scope claim in its transported form; see [`crate::scope::Scope`] for the interpreted form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeClaim {
    Text(String),
    /// Byte string encoded scope, used by group scopes
    Binary(Vec<u8>),
}

impl From<&str> for ScopeClaim {
    fn from(s: &str) -> Self {
        ScopeClaim::Text(s.into())
    }
}

/// Value of a recognized claim, after per-key type checking
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimValue {
    Text(String),
    Bytes(Vec<u8>),
    Uint(u64),
    Audience(Audience),
    Scope(ScopeClaim),
    Cnf(Confirmation),
}

/// A decoded claims set
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Claims {
    known: BTreeMap<ClaimKey, ClaimValue>,
    /// Claims under keys this crate does not interpret, in the order they were found
    extra: Vec<(Value, Value)>,
}

fn uint_of(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(i) => u64::try_from(*i).ok(),
        // Epoch-based date/time; RFC8392 describes NumericDate without the tag, but it's easy to
        // tolerate
        Value::Tag(1, inner) => uint_of(inner),
        _ => None,
    }
}

fn decode_claim(key: ClaimKey, value: Value) -> Result<ClaimValue, Rejection> {
    let malformed = Rejection::MalformedClaim(key.name());
    Ok(match key {
        ClaimKey::Iss | ClaimKey::Sub => match value {
            Value::Text(t) => ClaimValue::Text(t),
            _ => return Err(malformed),
        },
        ClaimKey::Aud => match value {
            Value::Text(t) => ClaimValue::Audience(Audience::Single(t)),
            Value::Array(items) => ClaimValue::Audience(Audience::Multiple(
                items
                    .into_iter()
                    .map(|i| match i {
                        Value::Text(t) => Ok(t),
                        _ => Err(Rejection::MalformedClaim(key.name())),
                    })
                    .collect::<Result<_, _>>()?,
            )),
            _ => return Err(malformed),
        },
        ClaimKey::Exp | ClaimKey::Nbf | ClaimKey::Iat | ClaimKey::Exi | ClaimKey::AceProfile => {
            ClaimValue::Uint(uint_of(&value).ok_or(malformed)?)
        }
        ClaimKey::Cti => match value {
            Value::Bytes(b) => ClaimValue::Bytes(b),
            _ => return Err(Rejection::InvalidCti),
        },
        ClaimKey::Cnonce => match value {
            Value::Bytes(b) => ClaimValue::Bytes(b),
            _ => return Err(malformed),
        },
        ClaimKey::Scope => match value {
            Value::Text(t) => ClaimValue::Scope(ScopeClaim::Text(t)),
            Value::Bytes(b) => ClaimValue::Scope(ScopeClaim::Binary(b)),
            _ => return Err(Rejection::InvalidScopeFormat),
        },
        ClaimKey::Cnf => ClaimValue::Cnf(Confirmation::from_cbor_value(value)?),
    })
}

impl Claims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a claims set from its CBOR map form, checking the type of every recognized claim
    ///
    /// Anything that is not a map at all is an invalid token.
    pub fn from_cbor_value(value: Value) -> Result<Self, Rejection> {
        let Value::Map(entries) = value else {
            return Err(Rejection::TokenInvalid);
        };
        let mut claims = Claims::new();
        for (k, v) in entries {
            let key = match &k {
                Value::Integer(i) => u64::try_from(*i).ok().and_then(ClaimKey::from_label),
                _ => None,
            };
            match key {
                Some(key) => {
                    let decoded = decode_claim(key, v)?;
                    if claims.known.insert(key, decoded).is_some() {
                        return Err(Rejection::MalformedClaim(key.name()));
                    }
                }
                None => claims.extra.push((k, v)),
            }
        }
        Ok(claims)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Rejection> {
        let value: Value =
            ciborium::de::from_reader(data).map_err(|_| Rejection::TokenInvalid)?;
        Self::from_cbor_value(value)
    }

    /// Encode into the CBOR map form
    ///
    /// The encoding is deterministic for a given claims set: recognized claims come first in
    /// ascending key order, followed by unrecognized ones in their original order.
    pub fn to_cbor_value(&self) -> Result<Value, CodecError> {
        let mut entries = Vec::with_capacity(self.known.len() + self.extra.len());
        for (key, value) in &self.known {
            let value = match value {
                ClaimValue::Text(t) => Value::Text(t.clone()),
                ClaimValue::Bytes(b) => Value::Bytes(b.clone()),
                ClaimValue::Uint(u) => Value::Integer(Integer::from(*u)),
                ClaimValue::Audience(a) => a.to_cbor_value(),
                ClaimValue::Scope(ScopeClaim::Text(t)) => Value::Text(t.clone()),
                ClaimValue::Scope(ScopeClaim::Binary(b)) => Value::Bytes(b.clone()),
                ClaimValue::Cnf(c) => c.to_cbor_value()?,
            };
            entries.push((Value::Integer(Integer::from(key.label())), value));
        }
        entries.extend(self.extra.iter().cloned());
        Ok(Value::Map(entries))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&self.to_cbor_value()?, &mut buf)?;
        Ok(buf)
    }

    pub fn get(&self, key: ClaimKey) -> Option<&ClaimValue> {
        self.known.get(&key)
    }

    pub fn contains(&self, key: ClaimKey) -> bool {
        self.known.contains_key(&key)
    }

    pub fn remove(&mut self, key: ClaimKey) -> Option<ClaimValue> {
        self.known.remove(&key)
    }

    /// Claims under keys without a [`ClaimKey`]
    pub fn extra(&self) -> &[(Value, Value)] {
        &self.extra
    }

    fn text(&self, key: ClaimKey) -> Option<&str> {
        match self.known.get(&key) {
            Some(ClaimValue::Text(t)) => Some(t),
            _ => None,
        }
    }

    fn uint(&self, key: ClaimKey) -> Option<u64> {
        match self.known.get(&key) {
            Some(ClaimValue::Uint(u)) => Some(*u),
            _ => None,
        }
    }

    fn bytes(&self, key: ClaimKey) -> Option<&[u8]> {
        match self.known.get(&key) {
            Some(ClaimValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    pub fn issuer(&self) -> Option<&str> {
        self.text(ClaimKey::Iss)
    }

    pub fn subject(&self) -> Option<&str> {
        self.text(ClaimKey::Sub)
    }

    pub fn audience(&self) -> Option<&Audience> {
        match self.known.get(&ClaimKey::Aud) {
            Some(ClaimValue::Audience(a)) => Some(a),
            _ => None,
        }
    }

    pub fn expiration(&self) -> Option<u64> {
        self.uint(ClaimKey::Exp)
    }

    pub fn not_before(&self) -> Option<u64> {
        self.uint(ClaimKey::Nbf)
    }

    pub fn issued_at(&self) -> Option<u64> {
        self.uint(ClaimKey::Iat)
    }

    pub fn expires_in(&self) -> Option<u64> {
        self.uint(ClaimKey::Exi)
    }

    pub fn ace_profile(&self) -> Option<u64> {
        self.uint(ClaimKey::AceProfile)
    }

    pub fn cti(&self) -> Option<&[u8]> {
        self.bytes(ClaimKey::Cti)
    }

    pub fn cnonce(&self) -> Option<&[u8]> {
        self.bytes(ClaimKey::Cnonce)
    }

    pub fn scope(&self) -> Option<&ScopeClaim> {
        match self.known.get(&ClaimKey::Scope) {
            Some(ClaimValue::Scope(s)) => Some(s),
            _ => None,
        }
    }

    pub fn cnf(&self) -> Option<&Confirmation> {
        match self.known.get(&ClaimKey::Cnf) {
            Some(ClaimValue::Cnf(c)) => Some(c),
            _ => None,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.known
            .insert(ClaimKey::Iss, ClaimValue::Text(issuer.into()));
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.known
            .insert(ClaimKey::Sub, ClaimValue::Text(subject.into()));
        self
    }

    pub fn with_audience(mut self, audience: impl Into<Audience>) -> Self {
        self.known
            .insert(ClaimKey::Aud, ClaimValue::Audience(audience.into()));
        self
    }

    pub fn with_expiration(mut self, exp: u64) -> Self {
        self.known.insert(ClaimKey::Exp, ClaimValue::Uint(exp));
        self
    }

    pub fn with_not_before(mut self, nbf: u64) -> Self {
        self.known.insert(ClaimKey::Nbf, ClaimValue::Uint(nbf));
        self
    }

    pub fn with_issued_at(mut self, iat: u64) -> Self {
        self.known.insert(ClaimKey::Iat, ClaimValue::Uint(iat));
        self
    }

    pub fn with_cti(mut self, cti: impl Into<Vec<u8>>) -> Self {
        self.set_cti(cti.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<ScopeClaim>) -> Self {
        self.known
            .insert(ClaimKey::Scope, ClaimValue::Scope(scope.into()));
        self
    }

    pub fn with_cnf(mut self, cnf: Confirmation) -> Self {
        self.known.insert(ClaimKey::Cnf, ClaimValue::Cnf(cnf));
        self
    }

    pub fn with_cnonce(mut self, cnonce: impl Into<Vec<u8>>) -> Self {
        self.known
            .insert(ClaimKey::Cnonce, ClaimValue::Bytes(cnonce.into()));
        self
    }

    pub fn with_extra(mut self, key: Value, value: Value) -> Self {
        self.extra.push((key, value));
        self
    }

    pub fn set_cti(&mut self, cti: Vec<u8>) {
        self.known.insert(ClaimKey::Cti, ClaimValue::Bytes(cti));
    }

    /// Replace claims by those of `newer` where both carry the same key
    ///
    /// Used when an introspection response refines the claims found inside a token.
    pub fn overlay(&mut self, newer: Claims) {
        self.known.extend(newer.known);
        for (k, v) in newer.extra {
            match self.extra.iter_mut().find(|(ek, _)| *ek == k) {
                Some(existing) => existing.1 = v,
                None => self.extra.push((k, v)),
            }
        }
    }

    /// Whether the token has begun and not yet ended its validity at `now`
    ///
    /// Absent `nbf` and `exp` do not limit validity.
    pub fn is_valid_at(&self, now: u64) -> bool {
        self.not_before().map_or(true, |nbf| nbf <= now)
            && self.expiration().map_or(true, |exp| now < exp)
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expiration().map_or(false, |exp| exp <= now)
    }
}
