// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! The /authz-info admission pipeline
//!
//! A POSTed token goes through the states of [`AdmissionState`] in order, and ends either
//! committed to the [`TokenRepository`] or rejected with one [`Rejection`]. The pipeline is
//! transport agnostic: it only sees a [`Message`], and produces a [`Reply`] which the transport
//! binding (eg. [`crate::coap::AuthzInfoEndpoint`]) turns into a response.
//!
//! Everything that depends on the communication security profile is behind [`Profile`]: checking
//! the profile's extra request parameters before the token is committed, and producing its extra
//! response parameters (nonces, identifiers) afterwards.

use std::collections::BTreeSet;
use std::sync::Arc;

use ciborium::value::{Integer, Value};
use tracing::{debug, info, warn};

use crate::claims::Claims;
use crate::crypto::CwtCryptoContext;
use crate::error::{RepositoryError, Rejection};
use crate::introspection::{Introspection, IntrospectionHandler};
use crate::pop::KeyIdentity;
use crate::repository::{AddedToken, Cti, TokenOrigin, TokenRepository};
use crate::request_creation_hints::RequestCreationHints;
use crate::scope::{Method, Scope, ScopeValidator};
use crate::time::TimeSource;
use crate::token::{open_cwt, AccessToken};

/// Response class of a [`Reply`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Created,
    BadRequest,
    Unauthorized,
    Forbidden,
    MethodNotAllowed,
    InternalServerError,
}

impl ResponseCode {
    pub fn coap_code(self) -> u8 {
        use coap_numbers::code;
        match self {
            ResponseCode::Created => code::CREATED,
            ResponseCode::BadRequest => code::BAD_REQUEST,
            ResponseCode::Unauthorized => code::UNAUTHORIZED,
            ResponseCode::Forbidden => code::FORBIDDEN,
            ResponseCode::MethodNotAllowed => code::METHOD_NOT_ALLOWED,
            ResponseCode::InternalServerError => code::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Response to a token POST, with a CBOR payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: ResponseCode,
    pub payload: Vec<u8>,
}

/// What the admission pipeline needs to know about an incoming request
pub trait Message {
    /// Request method, if it is one this crate knows
    fn method(&self) -> Option<Method>;

    fn payload(&self) -> &[u8];

    /// Identity that authenticated the channel the request came on (eg. the recipient ID of the
    /// OSCORE context that protected it), if any
    fn sender_id(&self) -> Option<&str>;

    fn success_reply(&self, code: ResponseCode, payload: Vec<u8>) -> Reply {
        Reply { code, payload }
    }

    fn fail_reply(&self, code: ResponseCode, payload: Vec<u8>) -> Reply {
        Reply { code, payload }
    }
}

/// In-process [`Message`], for driving the pipeline without a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMessage {
    pub method: Option<Method>,
    pub payload: Vec<u8>,
    pub sender: Option<String>,
}

impl LocalMessage {
    pub fn post(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            method: Some(Method::Post),
            payload: payload.into(),
            sender: None,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

impl Message for LocalMessage {
    fn method(&self) -> Option<Method> {
        self.method
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn sender_id(&self) -> Option<&str> {
        self.sender.as_deref()
    }
}

/// States a POSTed token passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    AwaitingPayload,
    PayloadDecoded,
    TokenExtracted,
    ClaimsResolved,
    Validated,
    Committed,
    Rejected,
}

/// Why a token was not admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionFailure {
    /// The client's fault; reported with the rejection's own code and description
    Rejected(Rejection),
    /// The server's fault; the text is all the client gets to see
    Internal(&'static str),
}

const INTERNAL_ERROR: &str = "Internal server error";
const INTROSPECTION_FAILED: &str = "Introspection failed";

impl From<Rejection> for AdmissionFailure {
    fn from(r: Rejection) -> Self {
        AdmissionFailure::Rejected(r)
    }
}

impl From<RepositoryError> for AdmissionFailure {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Rejected(r) => AdmissionFailure::Rejected(r),
            e => {
                warn!(error = %e, "token repository failed during admission");
                AdmissionFailure::Internal(INTERNAL_ERROR)
            }
        }
    }
}

/// Decoded request payload
#[derive(Debug, Clone, PartialEq)]
pub struct AuthzInfoPost {
    token: Option<Value>,
    params: Vec<(u64, Value)>,
    is_map: bool,
}

impl AuthzInfoPost {
    fn decode(payload: &[u8], require_map: bool) -> Result<Self, Rejection> {
        let value: Value =
            ciborium::de::from_reader(payload).map_err(|_| Rejection::InvalidPayload)?;
        let entries = match value {
            Value::Map(entries) => entries,
            _ if require_map => return Err(Rejection::PayloadNotMap),
            // The bare token; a CWT is its own encoding rather than a byte string around it
            Value::Bytes(_) | Value::Text(_) => {
                return Ok(Self {
                    token: Some(value),
                    params: vec![],
                    is_map: false,
                })
            }
            _ => {
                return Ok(Self {
                    token: Some(Value::Bytes(payload.to_vec())),
                    params: vec![],
                    is_map: false,
                })
            }
        };
        let mut token = None;
        let mut params = Vec::with_capacity(entries.len());
        for (k, v) in entries {
            let key = match k {
                Value::Integer(i) => u64::try_from(i).map_err(|_| Rejection::InvalidPayload)?,
                _ => return Err(Rejection::InvalidPayload),
            };
            if key == crate::ACCESS_TOKEN {
                token = Some(v);
            } else {
                params.push((key, v));
            }
        }
        Ok(Self {
            token,
            params,
            is_map: true,
        })
    }

    /// A request parameter other than `access_token`
    pub fn param(&self, key: u64) -> Option<&Value> {
        self.params.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Whether the request was a CBOR map (rather than just the token)
    pub fn is_map(&self) -> bool {
        self.is_map
    }
}

/// A freshly committed token, handed to [`Profile::post_admission`]
pub struct PostAdmission<'a> {
    pub repository: &'a TokenRepository,
    pub cti: &'a Cti,
    pub key: &'a KeyIdentity,
    pub claims: &'a Claims,
    pub request: &'a AuthzInfoPost,
    /// Response parameters to send next to the `cti`
    pub extras: &'a mut Vec<(u64, Value)>,
    /// The token replaced the access rights of an already authenticated client
    pub update: bool,
}

/// Communication security profile specifics of the admission pipeline
pub trait Profile: Send + Sync {
    /// What [`Profile::check`] extracted from the request for use after the commit
    type Input;

    /// Whether the payload has to be a map, or may also be the bare token
    fn requires_map_payload(&self) -> bool {
        false
    }

    /// Key identity that authenticated `sender`
    fn resolve_sender(&self, repository: &TokenRepository, sender: &str) -> Option<KeyIdentity> {
        repository
            .key_for_sender(sender)
            .or_else(|| Some(KeyIdentity::new(sender)))
    }

    /// Validate the profile's request parameters and the token's fitness for the profile
    ///
    /// Runs before anything is committed.
    fn check(
        &self,
        request: &AuthzInfoPost,
        claims: &Claims,
        update: bool,
    ) -> Result<Self::Input, Rejection>;

    /// Set up whatever the profile needs for the committed token
    ///
    /// If this fails, the token is removed again.
    fn post_admission(
        &self,
        admitted: &mut PostAdmission<'_>,
        input: Self::Input,
    ) -> Result<(), AdmissionFailure>;
}

/// Successful outcome of an admission
#[derive(Debug, Clone, PartialEq)]
pub struct Admitted {
    pub cti: Cti,
    pub key: KeyIdentity,
    pub extras: Vec<(u64, Value)>,
}

/// Outcome of an admission, with the states it went through
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub trace: Vec<AdmissionState>,
    pub result: Result<Admitted, AdmissionFailure>,
}

struct Trace(Vec<AdmissionState>);

impl Trace {
    fn enter(&mut self, state: AdmissionState) {
        debug!(?state, "admission state");
        self.0.push(state);
    }
}

/// The /authz-info pipeline of a resource server
pub struct AuthzInfo<P: Profile> {
    repository: Arc<TokenRepository>,
    crypto: CwtCryptoContext,
    validator: Arc<dyn ScopeValidator>,
    time: Arc<dyn TimeSource>,
    introspection: Option<Arc<dyn IntrospectionHandler>>,
    issuers: BTreeSet<String>,
    /// Identifiers of this RS; the first one is announced in request creation hints
    audiences: Vec<String>,
    as_uri: String,
    profile: P,
}

impl<P: Profile> AuthzInfo<P> {
    pub fn new(
        repository: Arc<TokenRepository>,
        crypto: CwtCryptoContext,
        validator: Arc<dyn ScopeValidator>,
        time: Arc<dyn TimeSource>,
        profile: P,
    ) -> Self {
        Self {
            repository,
            crypto,
            validator,
            time,
            introspection: None,
            issuers: BTreeSet::new(),
            audiences: vec![],
            as_uri: String::new(),
            profile,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuers.insert(issuer.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audiences.push(audience.into());
        self
    }

    pub fn with_as_uri(mut self, as_uri: impl Into<String>) -> Self {
        self.as_uri = as_uri.into();
        self
    }

    pub fn with_introspection(mut self, handler: Arc<dyn IntrospectionHandler>) -> Self {
        self.introspection = Some(handler);
        self
    }

    pub fn repository(&self) -> &Arc<TokenRepository> {
        &self.repository
    }

    pub fn profile(&self) -> &P {
        &self.profile
    }

    /// Hints for clients whose requests were rejected for lack of a token
    pub fn request_creation_hints(&self) -> RequestCreationHints<&str> {
        RequestCreationHints {
            as_uri: self.as_uri.as_str(),
            audience: self.audiences.first().map_or("", String::as_str),
            scope: None,
            cnonce: None,
        }
    }

    /// Run a POSTed token through the pipeline
    pub fn admit(&self, message: &impl Message) -> Admission {
        let mut trace = Trace(vec![]);
        trace.enter(AdmissionState::AwaitingPayload);
        let result = self.run(message, &mut trace);
        if result.is_err() {
            trace.enter(AdmissionState::Rejected);
        }
        Admission {
            trace: trace.0,
            result,
        }
    }

    /// Run a POSTed token through the pipeline, and build the response
    pub fn process(&self, message: &impl Message) -> Reply {
        match self.admit(message).result {
            Ok(admitted) => {
                let mut body = vec![(
                    Value::Integer(Integer::from(crate::claims::ClaimKey::Cti.label())),
                    Value::Bytes(admitted.cti.as_bytes().to_vec()),
                )];
                body.extend(
                    admitted
                        .extras
                        .into_iter()
                        .map(|(k, v)| (Value::Integer(Integer::from(k)), v)),
                );
                message.success_reply(ResponseCode::Created, encode_map(body))
            }
            Err(AdmissionFailure::Rejected(r)) => {
                warn!(reason = %r, "token rejected");
                let body = vec![
                    (
                        Value::Integer(Integer::from(crate::ERROR)),
                        Value::Integer(Integer::from(r.error_code() as u8)),
                    ),
                    (
                        Value::Integer(Integer::from(crate::ERROR_DESCRIPTION)),
                        Value::Text(r.to_string()),
                    ),
                ];
                message.fail_reply(r.response_code(), encode_map(body))
            }
            Err(AdmissionFailure::Internal(description)) => {
                let body = vec![(
                    Value::Integer(Integer::from(crate::ERROR_DESCRIPTION)),
                    Value::Text(description.into()),
                )];
                message.fail_reply(ResponseCode::InternalServerError, encode_map(body))
            }
        }
    }

    fn run(
        &self,
        message: &impl Message,
        trace: &mut Trace,
    ) -> Result<Admitted, AdmissionFailure> {
        let request =
            AuthzInfoPost::decode(message.payload(), self.profile.requires_map_payload())?;
        trace.enter(AdmissionState::PayloadDecoded);

        let token = request
            .token
            .clone()
            .ok_or(Rejection::MissingAccessToken)?;
        let token = AccessToken::from_cbor_value(token)?;
        trace.enter(AdmissionState::TokenExtracted);

        let (claims, origin) = self.resolve(token)?;
        trace.enter(AdmissionState::ClaimsResolved);

        self.validate(&claims)?;
        let sender_key = message
            .sender_id()
            .and_then(|s| self.profile.resolve_sender(&self.repository, s));
        let update = self
            .repository
            .update_applies(&claims, sender_key.as_ref());
        let input = self.profile.check(&request, &claims, update)?;
        trace.enter(AdmissionState::Validated);

        let added = self.repository.add_token_with(
            claims.clone(),
            &self.crypto,
            sender_key.as_ref(),
            origin,
        )?;
        if added.update != update {
            warn!(cti = %added.cti, "access rights of the key changed during admission");
            self.withdraw(added);
            return Err(AdmissionFailure::Internal(INTERNAL_ERROR));
        }
        let cti = added.cti.clone();
        let key = added.key.clone();

        let mut extras = vec![];
        let mut admitted = PostAdmission {
            repository: &self.repository,
            cti: &cti,
            key: &key,
            claims: &claims,
            request: &request,
            extras: &mut extras,
            update,
        };
        if let Err(e) = self.profile.post_admission(&mut admitted, input) {
            self.withdraw(added);
            return Err(e);
        }
        trace.enter(AdmissionState::Committed);
        info!(cti = %cti, key = %key, update, "token posted to authz-info");

        Ok(Admitted { cti, key, extras })
    }

    /// Undo a commit whose admission failed afterwards
    fn withdraw(&self, added: AddedToken) {
        let cti = added.cti.clone();
        if let Err(e) = self.repository.withdraw(added) {
            warn!(cti = %cti, error = %e, "could not withdraw token after failed setup");
        }
    }

    /// Obtain the claims of a token, along with how it was presented
    fn resolve(&self, token: AccessToken) -> Result<(Claims, TokenOrigin), AdmissionFailure> {
        match token {
            AccessToken::Cwt(envelope) => {
                let mut claims = open_cwt(&envelope, &self.crypto)?;
                if let (Some(handler), Some(cti)) = (&self.introspection, claims.cti()) {
                    let reference = Cti::new(cti).to_string();
                    match introspect(&**handler, &reference)? {
                        Some(fresh) => claims.overlay(fresh),
                        None => return Err(Rejection::TokenNotActive.into()),
                    }
                }
                Ok((claims, TokenOrigin::SelfContained))
            }
            AccessToken::Reference(reference) => {
                let Some(handler) = &self.introspection else {
                    return Err(Rejection::UnknownTokenFormat.into());
                };
                let mut claims =
                    introspect(&**handler, &reference)?.ok_or(Rejection::TokenNotActive)?;
                if claims.cti().is_none() {
                    claims.set_cti(reference.as_bytes().to_vec());
                }
                Ok((claims, TokenOrigin::Reference(reference)))
            }
        }
    }

    /// Checks that do not depend on the profile or on the repository
    fn validate(&self, claims: &Claims) -> Result<(), Rejection> {
        let now = self.time.now();

        match claims.issuer() {
            Some(issuer) if self.issuers.contains(issuer) => (),
            _ => return Err(Rejection::IssuerUnknown),
        }
        if claims.expiration().map_or(false, |exp| exp <= now) {
            return Err(Rejection::TokenExpired);
        }
        if claims.not_before().map_or(false, |nbf| nbf > now) {
            return Err(Rejection::TokenNotYetValid);
        }

        let audience = claims.audience().ok_or(Rejection::NoAudience)?;
        if !self.audiences.iter().any(|a| audience.contains(a)) {
            return Err(Rejection::AudienceMismatch);
        }

        let scope = Scope::parse(claims.scope().ok_or(Rejection::NoScope)?)?;
        if !self.validator.is_meaningful(audience, &scope) {
            return Err(Rejection::ScopeNotMeaningful);
        }
        Ok(())
    }
}

/// Active claims, `None` for inactive tokens
fn introspect(
    handler: &dyn IntrospectionHandler,
    token: &str,
) -> Result<Option<Claims>, AdmissionFailure> {
    match handler.introspect(token) {
        Ok(Introspection::Active(claims)) => Ok(Some(claims)),
        Ok(Introspection::Inactive) => Ok(None),
        Err(e) => {
            warn!(error = %e, "introspection failed");
            Err(AdmissionFailure::Internal(INTROSPECTION_FAILED))
        }
    }
}

fn encode_map(entries: Vec<(Value, Value)>) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&Value::Map(entries), &mut buf)
        .expect("writing into a Vec is infallible");
    buf
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::claims::ScopeClaim;
    use crate::crypto::CcmAlgorithm;
    use crate::introspection::IntrospectionError;
    use crate::pop::{Confirmation, PopKey};
    use crate::profiles::DtlsProfile;
    use crate::repository::AccessDecision;
    use crate::scope::ScopePolicy;
    use crate::time::ManualClock;
    use crate::token::seal_cwt;

    const NOW: u64 = 1_700_000_000;

    fn crypto() -> CwtCryptoContext {
        CwtCryptoContext::new(
            b"abc\x04\x05\x06\x07\x08\x09\x0a\x0b\x0c\x0d\x0e\x0f\x10".to_vec(),
            CcmAlgorithm::AesCcm16_64_128,
        )
        .unwrap()
    }

    fn authz_info() -> AuthzInfo<DtlsProfile> {
        authz_info_with(DtlsProfile)
    }

    fn authz_info_with<P: Profile>(profile: P) -> AuthzInfo<P> {
        let policy: Arc<dyn ScopeValidator> = Arc::new(
            ScopePolicy::new()
                .grant("r_temp", "temp", [Method::Get])
                .grant("co2", "co2", [Method::Get, Method::Post]),
        );
        let time = Arc::new(ManualClock::new(NOW));
        let repository =
            Arc::new(TokenRepository::create(policy.clone(), time.clone(), None).unwrap());
        repository
            .provision_key(PopKey::symmetric(b"ourKey", vec![0x01; 16]))
            .unwrap();
        AuthzInfo::new(repository, crypto(), policy, time, profile)
            .with_issuer("AS")
            .with_audience("rs1")
            .with_as_uri("coap://as.example/token")
    }

    fn claims() -> Claims {
        Claims::new()
            .with_issuer("AS")
            .with_audience("rs1")
            .with_scope("r_temp")
            .with_cti(vec![0x01])
            .with_expiration(NOW + 3600)
            .with_cnf(Confirmation::Kid(b"ourKey".to_vec()))
    }

    fn post(claims: &Claims) -> LocalMessage {
        let token = seal_cwt(claims, &crypto(), &[7; 13]).unwrap();
        LocalMessage::post(encode_map(vec![(
            Value::Integer(Integer::from(crate::ACCESS_TOKEN)),
            Value::Bytes(token),
        )]))
    }

    fn body(reply: &Reply) -> Vec<(Value, Value)> {
        let Value::Map(entries) = ciborium::de::from_reader(reply.payload.as_slice()).unwrap()
        else {
            panic!("reply body is not a map");
        };
        entries
    }

    fn error_description(reply: &Reply) -> String {
        body(reply)
            .into_iter()
            .find_map(|(k, v)| match (k, v) {
                (Value::Integer(k), Value::Text(t)) if k == Integer::from(31) => Some(t),
                _ => None,
            })
            .expect("no error_description")
    }

    fn rejected(claims: Claims) -> Reply {
        let reply = authz_info().process(&post(&claims));
        assert_ne!(reply.code, ResponseCode::Created);
        reply
    }

    #[test]
    fn valid_token_is_committed() {
        let endpoint = authz_info();
        let admission = endpoint.admit(&post(&claims()));
        assert_eq!(
            admission.trace,
            vec![
                AdmissionState::AwaitingPayload,
                AdmissionState::PayloadDecoded,
                AdmissionState::TokenExtracted,
                AdmissionState::ClaimsResolved,
                AdmissionState::Validated,
                AdmissionState::Committed,
            ]
        );
        let admitted = admission.result.unwrap();
        assert_eq!(admitted.cti, Cti::new(vec![0x01]));
        assert_eq!(admitted.key, KeyIdentity::from("ourKey"));
        assert_eq!(
            endpoint
                .repository()
                .can_access("ourKey", "temp", Method::Get, NOW),
            AccessDecision::Ok
        );
    }

    #[test]
    fn reply_carries_cti() {
        let mut claims = claims();
        claims.set_cti(vec![0x02]);
        let reply = authz_info().process(&post(&claims));
        assert_eq!(reply.code, ResponseCode::Created);
        assert_eq!(reply.payload, [0xa1, 0x07, 0x41, 0x02]);
    }

    #[test]
    fn bare_token_payload() {
        let token = seal_cwt(&claims(), &crypto(), &[7; 13]).unwrap();
        let reply = authz_info().process(&LocalMessage::post(token));
        assert_eq!(reply.code, ResponseCode::Created);
    }

    #[test]
    fn malformed_requests() {
        let endpoint = authz_info();

        let reply = endpoint.process(&LocalMessage::post([0xff]));
        assert_eq!(reply.code, ResponseCode::BadRequest);
        assert_eq!(error_description(&reply), "Invalid payload");

        // {2: 1}
        let reply = endpoint.process(&LocalMessage::post([0xa1, 0x02, 0x01]));
        assert_eq!(error_description(&reply), "Missing mandatory parameter 'access_token'");

        // {1: 5}
        let reply = endpoint.process(&LocalMessage::post([0xa1, 0x01, 0x05]));
        assert_eq!(error_description(&reply), "Unknown token format");

        // {1: h'0102'}
        let reply = endpoint.process(&LocalMessage::post([0xa1, 0x01, 0x42, 0x01, 0x02]));
        assert_eq!(error_description(&reply), "Token is invalid");

        let admission = endpoint.admit(&LocalMessage::post([0xff]));
        assert_eq!(
            admission.trace,
            vec![AdmissionState::AwaitingPayload, AdmissionState::Rejected]
        );
        assert_eq!(
            admission.result,
            Err(AdmissionFailure::Rejected(Rejection::InvalidPayload))
        );
    }

    #[test]
    fn error_body_shape() {
        let reply = authz_info().process(&LocalMessage::post([0xff]));
        assert_eq!(
            body(&reply),
            vec![
                (
                    Value::Integer(Integer::from(30)),
                    Value::Integer(Integer::from(1))
                ),
                (
                    Value::Integer(Integer::from(31)),
                    Value::Text("Invalid payload".into())
                ),
            ]
        );
    }

    #[test]
    fn policy_rejections() {
        let mut unknown_issuer = claims();
        unknown_issuer.remove(crate::claims::ClaimKey::Iss);
        let reply = rejected(unknown_issuer.clone().with_issuer("evil AS"));
        assert_eq!(reply.code, ResponseCode::Unauthorized);
        assert_eq!(error_description(&reply), "Token issuer unknown");
        let reply = rejected(unknown_issuer);
        assert_eq!(error_description(&reply), "Token issuer unknown");

        let reply = rejected(claims().with_expiration(NOW));
        assert_eq!(reply.code, ResponseCode::Unauthorized);
        assert_eq!(error_description(&reply), "Token is expired");

        let reply = rejected(claims().with_not_before(NOW + 1));
        assert_eq!(reply.code, ResponseCode::Unauthorized);
        assert_eq!(error_description(&reply), "Token is not yet valid");

        let reply = rejected(claims().with_audience("rs2"));
        assert_eq!(reply.code, ResponseCode::Forbidden);
        assert_eq!(error_description(&reply), "Audience does not apply");

        let mut no_audience = claims();
        no_audience.remove(crate::claims::ClaimKey::Aud);
        let reply = rejected(no_audience);
        assert_eq!(reply.code, ResponseCode::BadRequest);
        assert_eq!(error_description(&reply), "Token has no audience");

        let mut no_scope = claims();
        no_scope.remove(crate::claims::ClaimKey::Scope);
        assert_eq!(error_description(&rejected(no_scope)), "Token has no scope");

        let reply = rejected(claims().with_scope("nothing"));
        assert_eq!(error_description(&reply), "Scope does not apply");

        let reply = rejected(claims().with_scope(ScopeClaim::Text(" ".into())));
        assert_eq!(error_description(&reply), "Invalid scope format");
    }

    #[test]
    fn audience_arrays_match() {
        let claims = claims().with_audience(crate::claims::Audience::Multiple(vec![
            "rs0".into(),
            "rs1".into(),
        ]));
        let reply = authz_info().process(&post(&claims));
        assert_eq!(reply.code, ResponseCode::Created);
    }

    #[test]
    fn repository_rejections_propagate() {
        let endpoint = authz_info();
        assert_eq!(endpoint.process(&post(&claims())).code, ResponseCode::Created);
        let reply = endpoint.process(&post(&claims().with_scope("co2")));
        assert_eq!(reply.code, ResponseCode::BadRequest);
        assert_eq!(error_description(&reply), "Duplicate cti");

        let unknown_kid = claims()
            .with_cti(vec![0x05])
            .with_cnf(Confirmation::Kid(b"stranger".to_vec()));
        let reply = endpoint.process(&post(&unknown_kid));
        assert_eq!(error_description(&reply), "Token refers to unknown kid");
    }

    #[test]
    fn update_from_bound_sender() {
        let endpoint = authz_info();
        endpoint.process(&post(&claims()));
        let second = claims().with_cti(vec![0x02]).with_scope("co2");
        let reply = endpoint.process(&post(&second).with_sender("ourKey"));
        assert_eq!(reply.code, ResponseCode::Created);
        let repository = endpoint.repository();
        assert_eq!(
            repository.can_access("ourKey", "co2", Method::Post, NOW),
            AccessDecision::Ok
        );
        assert_eq!(
            repository.can_access("ourKey", "temp", Method::Get, NOW),
            AccessDecision::Forbid
        );
    }

    /// Fails its setup for every update of access rights
    struct FailingUpdates;

    impl Profile for FailingUpdates {
        type Input = ();

        fn check(
            &self,
            _request: &AuthzInfoPost,
            _claims: &Claims,
            _update: bool,
        ) -> Result<(), Rejection> {
            Ok(())
        }

        fn post_admission(
            &self,
            admitted: &mut PostAdmission<'_>,
            _input: (),
        ) -> Result<(), AdmissionFailure> {
            if admitted.update {
                Err(AdmissionFailure::Internal("setup failed"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn failed_update_setup_keeps_earlier_rights() {
        let endpoint = authz_info_with(FailingUpdates);
        endpoint.admit(&post(&claims())).result.unwrap();

        let second = claims().with_cti(vec![0x02]).with_scope("co2");
        let admission = endpoint.admit(&post(&second).with_sender("ourKey"));
        assert_eq!(
            admission.result,
            Err(AdmissionFailure::Internal("setup failed"))
        );
        let repository = endpoint.repository();
        assert_eq!(repository.tokens_for_key("ourKey"), vec![Cti::new(vec![0x01])]);
        assert_eq!(
            repository.can_access("ourKey", "temp", Method::Get, NOW),
            AccessDecision::Ok
        );
        assert_eq!(
            repository.can_access("ourKey", "co2", Method::Get, NOW),
            AccessDecision::Forbid
        );
    }

    #[test]
    fn cti_of_another_key_is_a_duplicate_for_updates() {
        let endpoint = authz_info();
        endpoint
            .repository()
            .provision_key(PopKey::symmetric(b"otherKey", vec![0x02; 16]))
            .unwrap();
        endpoint.admit(&post(&claims())).result.unwrap();
        let other = claims()
            .with_cti(vec![0x02])
            .with_cnf(Confirmation::Kid(b"otherKey".to_vec()));
        endpoint.admit(&post(&other)).result.unwrap();

        let hijack = claims()
            .with_scope("co2")
            .with_cnf(Confirmation::Kid(b"otherKey".to_vec()));
        let reply = endpoint.process(&post(&hijack).with_sender("otherKey"));
        assert_eq!(reply.code, ResponseCode::BadRequest);
        assert_eq!(error_description(&reply), Rejection::DuplicateCti.to_string());
        assert_eq!(
            endpoint
                .repository()
                .can_access("ourKey", "co2", Method::Get, NOW),
            AccessDecision::Forbid
        );
    }

    struct StaticIntrospection(Result<Introspection, ()>);

    impl IntrospectionHandler for StaticIntrospection {
        fn introspect(&self, _token: &str) -> Result<Introspection, IntrospectionError> {
            self.0
                .clone()
                .map_err(|_| IntrospectionError::Unreachable("down".into()))
        }
    }

    fn reference_post() -> LocalMessage {
        // {1: "tok"}
        LocalMessage::post([0xa1, 0x01, 0x63, b't', b'o', b'k'])
    }

    #[test]
    fn reference_tokens() {
        let reply = authz_info().process(&reference_post());
        assert_eq!(error_description(&reply), "Unknown token format");

        let mut active = claims();
        active.remove(crate::claims::ClaimKey::Cti);
        let endpoint = authz_info().with_introspection(Arc::new(StaticIntrospection(Ok(
            Introspection::Active(active),
        ))));
        let admitted = endpoint.admit(&reference_post()).result.unwrap();
        assert_eq!(admitted.cti, Cti::new(b"tok".to_vec()));

        let endpoint = authz_info()
            .with_introspection(Arc::new(StaticIntrospection(Ok(Introspection::Inactive))));
        let reply = endpoint.process(&reference_post());
        assert_eq!(reply.code, ResponseCode::Unauthorized);
        assert_eq!(error_description(&reply), "Token is not active");

        let endpoint = authz_info().with_introspection(Arc::new(StaticIntrospection(Err(()))));
        let reply = endpoint.process(&reference_post());
        assert_eq!(reply.code, ResponseCode::InternalServerError);
        assert_eq!(error_description(&reply), "Introspection failed");
    }

    #[test]
    fn introspection_overlays_cwt_claims() {
        let fresh = Claims::new().with_scope("co2");
        let endpoint = authz_info().with_introspection(Arc::new(StaticIntrospection(Ok(
            Introspection::Active(fresh),
        ))));
        endpoint.admit(&post(&claims())).result.unwrap();
        assert_eq!(
            endpoint
                .repository()
                .can_access("ourKey", "co2", Method::Post, NOW),
            AccessDecision::Ok
        );

        let endpoint = authz_info()
            .with_introspection(Arc::new(StaticIntrospection(Ok(Introspection::Inactive))));
        assert_eq!(
            endpoint.admit(&post(&claims())).result,
            Err(AdmissionFailure::Rejected(Rejection::TokenNotActive))
        );
    }

    #[test]
    fn hints() {
        let endpoint = authz_info();
        let hints = endpoint.request_creation_hints();
        assert_eq!(hints.as_uri, "coap://as.example/token");
        assert_eq!(hints.audience, "rs1");
    }
}
