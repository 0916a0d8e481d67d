// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! Token admission and access control for ACE resource servers (RFC9200)
//!
//! The crate holds everything a resource server needs between "a client POSTed something to
//! /authz-info" and "may this request touch that resource":
//!
//! * [`authz_info::AuthzInfo`] runs the admission pipeline for posted access tokens, with the
//!   communication-security specifics plugged in through [`authz_info::Profile`] (DTLS, the OSCORE
//!   profile of RFC9203, and group joining on top of either).
//! * [`repository::TokenRepository`] keeps the admitted tokens, the proof-of-possession keys they
//!   are bound to, and answers [`repository::TokenRepository::can_access`].
//! * [`scope`] models text and group (AIF-style) scopes and the [`scope::ScopeValidator`] seam
//!   through which applications decide what a scope is worth.
//!
//! CoAP integration is provided by [`coap::AuthzInfoEndpoint`], which implements
//! [`coap_handler::Handler`].

mod ciborium_helpers;

pub mod aesccm;
pub mod authz_info;
pub mod claims;
pub mod coap;
pub mod config;
pub mod crypto;
pub mod error;
pub mod introspection;
pub mod oscore;
pub mod pop;
pub mod profiles;
pub mod repository;
pub mod request_creation_hints;
pub mod scope;
pub mod time;
pub mod token;

pub use authz_info::AuthzInfo;
pub use error::Rejection;
pub use repository::{AccessDecision, TokenRepository};

/// OAuth Parameters CBOR Mapping value for access_token (RFC9200 Section 8.10)
pub const ACCESS_TOKEN: u64 = 1;
/// OAuth Parameters CBOR Mapping value for cnonce (RFC9200 Section 8.10)
pub const CNONCE: u64 = 39;
/// OAuth Parameters CBOR Mapping value for nonce1 (RFC9203 Section 9.3)
pub const NONCE1: u64 = 40;
/// OAuth Parameters CBOR Mapping value for nonce2 (RFC9203 Section 9.3)
pub const NONCE2: u64 = 42;
/// OAuth Parameters CBOR Mapping value for ace_client_recipientid (RFC9203 Section 9.3)
pub const ACE_CLIENT_RECIPIENTID: u64 = 43;
/// OAuth Parameters CBOR Mapping value for ace_server_recipientid (RFC9203 Section 9.3)
pub const ACE_SERVER_RECIPIENTID: u64 = 44;
/// Parameter requesting (and answering with) group signature information (ACE Key Groupcomm)
pub const SIGN_INFO: u64 = 45;
/// Parameter carrying the challenge a group manager hands out at token upload (ACE Key Groupcomm)
pub const KDCCHALLENGE: u64 = 46;

/// Key of the `error` member of an ACE error response (RFC9200 Section 8.10)
pub const ERROR: u64 = 30;
/// Key of the `error_description` member of an ACE error response (RFC9200 Section 8.10)
pub const ERROR_DESCRIPTION: u64 = 31;
