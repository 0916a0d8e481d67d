// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! JSON file form of the repository state
//!
//! Claims and keys are kept in their CBOR encoding (base64 in the JSON document), so that a
//! reloaded token is byte for byte the token that was admitted.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use super::{BoundKey, Cti, State, TokenOrigin, TokenRecord};
use crate::claims::Claims;
use crate::error::{CodecError, RepositoryError};
use crate::pop::{Confirmation, KeyIdentity, PopKey};
use crate::scope::Scope;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    tokens: Vec<StoredToken>,
    keys: Vec<StoredKey>,
    #[serde(default)]
    senders: BTreeMap<String, KeyIdentity>,
    #[serde(default)]
    challenges: BTreeMap<KeyIdentity, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredToken {
    cti: String,
    claims: String,
    key: KeyIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reference: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    identity: KeyIdentity,
    /// The key in `cnf` form
    cnf: String,
    provisioned: bool,
}

fn corrupt(what: impl Into<String>) -> RepositoryError {
    RepositoryError::CorruptStore(what.into())
}

fn decode_b64(field: &str, data: &str) -> Result<Vec<u8>, RepositoryError> {
    STANDARD
        .decode(data)
        .map_err(|e| corrupt(format!("{field}: {e}")))
}

fn encode_key(key: &PopKey) -> Result<String, RepositoryError> {
    let value = key.to_confirmation().to_cbor_value()?;
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&value, &mut buf).map_err(CodecError::from)?;
    Ok(STANDARD.encode(buf))
}

fn decode_key(data: &str) -> Result<PopKey, RepositoryError> {
    let bytes = decode_b64("key", data)?;
    let value: Value =
        ciborium::de::from_reader(bytes.as_slice()).map_err(|e| corrupt(format!("key: {e}")))?;
    Confirmation::from_cbor_value(value)
        .ok()
        .and_then(PopKey::from_confirmation)
        .ok_or_else(|| corrupt("key is not a COSE key or OSCORE input material"))
}

fn snapshot(state: &State) -> Result<Snapshot, RepositoryError> {
    let tokens = state
        .tokens
        .iter()
        .map(|(cti, record)| {
            Ok(StoredToken {
                cti: cti.to_string(),
                claims: STANDARD.encode(record.claims.to_vec()?),
                key: record.key.clone(),
                reference: match &record.origin {
                    TokenOrigin::SelfContained => None,
                    TokenOrigin::Reference(r) => Some(r.clone()),
                },
            })
        })
        .collect::<Result<_, RepositoryError>>()?;
    let keys = state
        .keys
        .iter()
        .map(|(identity, bound)| {
            Ok(StoredKey {
                identity: identity.clone(),
                cnf: encode_key(&bound.key)?,
                provisioned: bound.provisioned,
            })
        })
        .collect::<Result<_, RepositoryError>>()?;
    Ok(Snapshot {
        tokens,
        keys,
        senders: state.senders.clone(),
        challenges: state
            .challenges
            .iter()
            .map(|(k, c)| (k.clone(), STANDARD.encode(c)))
            .collect(),
    })
}

fn restore(snapshot: Snapshot) -> Result<State, RepositoryError> {
    let mut state = State {
        open: true,
        ..State::default()
    };
    for stored in snapshot.keys {
        state.keys.insert(
            stored.identity,
            BoundKey {
                key: decode_key(&stored.cnf)?,
                provisioned: stored.provisioned,
            },
        );
    }
    for stored in snapshot.tokens {
        let cti = Cti::parse(&stored.cti).ok_or_else(|| corrupt("cti is not base64"))?;
        let claims = Claims::from_slice(&decode_b64("claims", &stored.claims)?)
            .map_err(|e| corrupt(format!("claims of {cti}: {e}")))?;
        let scope = claims
            .scope()
            .and_then(|s| Scope::parse(s).ok())
            .ok_or_else(|| corrupt(format!("scope of {cti}")))?;
        if !state.keys.contains_key(&stored.key) {
            return Err(corrupt(format!("token {cti} refers to unknown key {}", stored.key)));
        }
        state.insert_record(
            cti,
            TokenRecord {
                claims,
                scope,
                key: stored.key,
                origin: stored
                    .reference
                    .map_or(TokenOrigin::SelfContained, TokenOrigin::Reference),
            },
        );
    }
    state.senders = snapshot.senders;
    for (key, challenge) in snapshot.challenges {
        state
            .challenges
            .insert(key, decode_b64("challenge", &challenge)?);
    }
    Ok(state)
}

/// Read the state stored at `path`; `None` if there is no store yet
pub(super) fn load(path: &Path) -> Result<Option<State>, RepositoryError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let snapshot: Snapshot = serde_json::from_slice(&data)?;
    restore(snapshot).map(Some)
}

/// Replace the state stored at `path`
///
/// The document is written next to its destination and renamed into place, so a crash leaves
/// either the old or the new state.
pub(super) fn save(path: &Path, state: &State) -> Result<(), RepositoryError> {
    let document = serde_json::to_vec_pretty(&snapshot(state)?)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, document)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
