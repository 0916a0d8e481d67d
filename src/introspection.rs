// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! Interface to the AS's introspection endpoint (RFC9200 Section 5.9)
//!
//! The transport towards the AS is left to the application; this crate only needs the outcome.

use thiserror::Error;

use crate::claims::Claims;

/// Answer of the AS about a token
#[derive(Debug, Clone, PartialEq)]
pub enum Introspection {
    Active(Claims),
    Inactive,
}

#[derive(Debug, Error)]
pub enum IntrospectionError {
    #[error("introspection endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("malformed introspection response: {0}")]
    Malformed(String),
}

pub trait IntrospectionHandler: Send + Sync {
    /// Ask about a token; `token` is either an opaque reference token, or the base64 rendering of
    /// a self-contained token's `cti`
    ///
    /// This is called without any lock of the repository held; it may block.
    fn introspect(&self, token: &str) -> Result<Introspection, IntrospectionError>;
}
