// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! CoAP binding of the /authz-info resource

use std::sync::Arc;

use coap_handler_implementations::option_processing::CriticalOptionsRemain;
use coap_message::{MessageOption, MutableWritableMessage, ReadableMessage};

use crate::authz_info::{AuthzInfo, Message, Profile, Reply};
use crate::scope::Method;

/// The CoAP Content-Format for application/ace+cbor (per RFC 9200)
pub const CONTENT_FORMAT_ACE_CBOR: u16 = 19;

/// The /authz-info resource
///
/// Note that all requests are directed at the handler itself, as it's up to the user to place it
/// at a particular path.
///
/// An endpoint created with [`AuthzInfoEndpoint::new`] serves unprotected POSTs. Requests that
/// arrived through an OSCORE context (or another authenticated channel) are served by one created
/// with [`AuthzInfoEndpoint::protected`] for that request's sender, which is what allows tokens
/// to update an existing client's access rights.
pub struct AuthzInfoEndpoint<P: Profile> {
    authz_info: Arc<AuthzInfo<P>>,
    sender: Option<String>,
}

impl<P: Profile> AuthzInfoEndpoint<P> {
    pub fn new(authz_info: Arc<AuthzInfo<P>>) -> Self {
        Self {
            authz_info,
            sender: None,
        }
    }

    pub fn protected(authz_info: Arc<AuthzInfo<P>>, sender: impl Into<String>) -> Self {
        Self {
            authz_info,
            sender: Some(sender.into()),
        }
    }
}

/// Errors that are handled by the binding before the pipeline sees the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointError {
    BadMethod,
    CriticalOptionsRemain,
}

impl From<CriticalOptionsRemain> for EndpointError {
    fn from(_: CriticalOptionsRemain) -> Self {
        EndpointError::CriticalOptionsRemain
    }
}

struct CoapPost<'a> {
    payload: &'a [u8],
    sender: Option<&'a str>,
}

impl Message for CoapPost<'_> {
    fn method(&self) -> Option<Method> {
        Some(Method::Post)
    }

    fn payload(&self) -> &[u8] {
        self.payload
    }

    fn sender_id(&self) -> Option<&str> {
        self.sender
    }
}

impl<P: Profile> coap_handler::Handler for AuthzInfoEndpoint<P> {
    type RequestData = Result<Reply, EndpointError>;

    fn extract_request_data(&mut self, message: &impl ReadableMessage) -> Self::RequestData {
        if message.code().into() != coap_numbers::code::POST {
            return Err(EndpointError::BadMethod);
        }

        use coap_handler_implementations::option_processing::OptionsExt;
        message
            .options()
            .filter(|o| match (o.number(), o.value_uint()) {
                (coap_numbers::option::CONTENT_FORMAT, Some(CONTENT_FORMAT_ACE_CBOR)) => false,
                (coap_numbers::option::ACCEPT, Some(CONTENT_FORMAT_ACE_CBOR)) => false,
                _ => true,
            })
            .ignore_elective_others()?;

        Ok(self.authz_info.process(&CoapPost {
            payload: message.payload(),
            sender: self.sender.as_deref(),
        }))
    }

    fn estimate_length(&mut self, request: &Self::RequestData) -> usize {
        match request {
            Ok(reply) => 2 /* content-format */ + 1 /* payload marker */ + reply.payload.len(),
            Err(_) => 0,
        }
    }

    fn build_response(
        &mut self,
        message: &mut impl MutableWritableMessage,
        request: Self::RequestData,
    ) {
        match request {
            Ok(reply) => {
                message.set_code(
                    reply
                        .code
                        .coap_code()
                        .try_into()
                        .map_err(|_| ())
                        .expect("message supports the standard response codes"),
                );
                message.add_option_uint(
                    coap_numbers::option::CONTENT_FORMAT
                        .try_into()
                        .map_err(|_| ())
                        .expect("message supports the standard options"),
                    CONTENT_FORMAT_ACE_CBOR,
                );
                message.set_payload(&reply.payload);
            }
            Err(e) => {
                let code = match e {
                    EndpointError::CriticalOptionsRemain => coap_numbers::code::BAD_OPTION,
                    EndpointError::BadMethod => coap_numbers::code::METHOD_NOT_ALLOWED,
                };

                message.set_code(
                    code.try_into()
                        .map_err(|_| ())
                        .expect("message supports the standard response codes"),
                );
                message.set_payload(b"");
            }
        }
    }
}
