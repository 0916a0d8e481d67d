// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! Access tokens as posted to /authz-info

use ciborium::value::Value;
use coset::{AsCborValue, CborSerializable, CoseEncrypt0};

use crate::claims::Claims;
use crate::crypto::{CwtCryptoContext, CCM_NONCE_LEN};
use crate::error::{CodecError, Rejection};

/// CBOR tag of a CWT (RFC8392 Section 6)
const CWT_TAG: u64 = 61;
/// CBOR tag of a COSE_Encrypt0 message
const ENCRYPT0_TAG: u64 = 16;

/// The forms in which a client can present an access token
#[derive(Debug, Clone, PartialEq)]
pub enum AccessToken {
    /// Self-contained token: a CWT, encrypted for the RS
    Cwt(CoseEncrypt0),
    /// Opaque token that only the AS can resolve
    Reference(String),
}

impl AccessToken {
    /// Classify the `access_token` parameter
    pub fn from_cbor_value(value: Value) -> Result<Self, Rejection> {
        match value {
            Value::Bytes(b) => Self::parse_cwt(&b).map(AccessToken::Cwt),
            Value::Text(t) => Ok(AccessToken::Reference(t)),
            _ => Err(Rejection::UnknownTokenFormat),
        }
    }

    fn parse_cwt(data: &[u8]) -> Result<CoseEncrypt0, Rejection> {
        let mut value: Value =
            ciborium::de::from_reader(data).map_err(|_| Rejection::TokenInvalid)?;
        if let Value::Tag(CWT_TAG, inner) = value {
            value = *inner;
        }
        if let Value::Tag(ENCRYPT0_TAG, inner) = value {
            value = *inner;
        }
        CoseEncrypt0::from_cbor_value(value).map_err(|_| Rejection::TokenInvalid)
    }
}

/// Decrypt a CWT and decode its claims
pub fn open_cwt(envelope: &CoseEncrypt0, crypto: &CwtCryptoContext) -> Result<Claims, Rejection> {
    let plaintext = crypto.open(envelope, &[]).map_err(|e| {
        tracing::debug!(error = %e, "CWT did not decrypt");
        Rejection::TokenInvalid
    })?;
    Claims::from_slice(&plaintext)
}

/// Produce a CWT the way the AS does, for tests and for tools that act as an AS towards the RS
pub fn seal_cwt(
    claims: &Claims,
    crypto: &CwtCryptoContext,
    iv: &[u8; CCM_NONCE_LEN],
) -> Result<Vec<u8>, CodecError> {
    let envelope = crypto
        .seal(&claims.to_vec()?, &[], iv)
        .map_err(|e| CodecError::Cose(e.to_string()))?;
    Ok(envelope.to_vec()?)
}
