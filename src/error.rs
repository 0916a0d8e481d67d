// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! Error types shared across the admission pipeline and the token repository

use std::path::PathBuf;

use thiserror::Error;

use crate::authz_info::ResponseCode;

/// ACE error codes (RFC9200 Section 8.4) as sent in the `error` member of an error response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AceErrorCode {
    InvalidRequest = 1,
    InvalidClient = 2,
    InvalidGrant = 3,
    UnauthorizedClient = 4,
    UnsupportedGrantType = 5,
    InvalidScope = 6,
    UnsupportedPopKey = 7,
    IncompatibleAceProfiles = 8,
}

/// Reason for refusing a token that was posted by a client
///
/// The `Display` text of each variant is the literal `error_description` sent back to the client;
/// peers and conformance tests match on it, so it must not change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Invalid payload")]
    InvalidPayload,
    #[error("Payload to authz-info must be a CBOR map")]
    PayloadNotMap,
    #[error("Missing mandatory parameter 'access_token'")]
    MissingAccessToken,
    #[error("Unknown token format")]
    UnknownTokenFormat,
    #[error("Token is invalid")]
    TokenInvalid,
    #[error("Token is not active")]
    TokenNotActive,
    #[error("Token issuer unknown")]
    IssuerUnknown,
    #[error("Token is expired")]
    TokenExpired,
    #[error("Token is not yet valid")]
    TokenNotYetValid,
    #[error("Token has no audience")]
    NoAudience,
    #[error("Audience does not apply")]
    AudienceMismatch,
    #[error("Token has no scope")]
    NoScope,
    #[error("Invalid scope format")]
    InvalidScopeFormat,
    #[error("Scope contains invalid roles")]
    InvalidRoles,
    #[error("Scope does not apply")]
    ScopeNotMeaningful,
    #[error("Malformed {0} claim in token")]
    MalformedClaim(&'static str),
    #[error("Token has no cnf")]
    NoCnf,
    #[error("Token refers to unknown kid")]
    UnknownKid,
    #[error("cnf contains invalid kid")]
    InvalidKid,
    #[error("Error while decrypting a cnf claim")]
    CnfDecryptionFailed,
    #[error("Cti has invalid format")]
    InvalidCti,
    #[error("Duplicate cti")]
    DuplicateCti,
    #[error("Malformed or missing parameter '{0}'")]
    MissingParameter(&'static str),
    #[error("Token must carry OSCORE input material")]
    NoOscoreMaterial,
    #[error("Invalid format for 'sign_info'")]
    InvalidSignInfo,
    #[error("Scope does not refer to group-membership resources")]
    NotGroupMembershipScope,
}

impl Rejection {
    /// Response class the rejection is reported with
    pub fn response_code(&self) -> ResponseCode {
        use Rejection::*;
        match self {
            TokenNotActive | IssuerUnknown | TokenExpired | TokenNotYetValid => {
                ResponseCode::Unauthorized
            }
            AudienceMismatch => ResponseCode::Forbidden,
            _ => ResponseCode::BadRequest,
        }
    }

    /// ACE error code placed next to the description
    pub fn error_code(&self) -> AceErrorCode {
        use Rejection::*;
        match self {
            TokenInvalid | TokenNotActive | TokenExpired | TokenNotYetValid | AudienceMismatch => {
                AceErrorCode::UnauthorizedClient
            }
            NoScope | InvalidScopeFormat | InvalidRoles | ScopeNotMeaningful => {
                AceErrorCode::InvalidScope
            }
            _ => AceErrorCode::InvalidRequest,
        }
    }
}

/// Errors of [`TokenRepository`](crate::repository::TokenRepository) operations
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The token was refused; the admission pipeline reports this to the client verbatim.
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("token repository is closed")]
    Closed,

    #[error("a token repository is already open on {}", .0.display())]
    AlreadyOpen(PathBuf),

    #[error("token store I/O failed: {0}")]
    Storage(#[from] std::io::Error),

    #[error("token store could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("token store is corrupt: {0}")]
    CorruptStore(String),

    #[error("encoding failed: {0}")]
    Codec(#[from] CodecError),
}

/// Failure to produce or consume CBOR/COSE structures that were expected to be well-formed
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("CBOR: {0}")]
    Cbor(String),
    #[error("COSE: {0}")]
    Cose(String),
}

impl From<coset::CoseError> for CodecError {
    fn from(e: coset::CoseError) -> Self {
        CodecError::Cose(format!("{e:?}"))
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for CodecError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        CodecError::Cbor(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for CodecError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        CodecError::Cbor(e.to_string())
    }
}

/// Errors loading an [`RsConfig`](crate::config::RsConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
