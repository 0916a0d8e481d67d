// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! AS Request Creation Hints (RFC9200 Section 5.3)

use crate::ciborium_helpers::{pull_into_bytes, pull_into_string};

const AS: u64 = 1;
const AUDIENCE: u64 = 5;
const SCOPE: u64 = 9;
const CNONCE: u64 = crate::CNONCE;

/// What an RS tells an unauthorized client about where and how to get a token
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct RequestCreationHints<S: AsRef<str>> {
    pub as_uri: S,
    pub audience: S,
    pub scope: Option<S>,
    pub cnonce: Option<Vec<u8>>,
}

impl<S: AsRef<str>> RequestCreationHints<S> {
    pub fn push_to_encoder<W: ciborium_io::Write>(
        &self,
        encoder: &mut ciborium_ll::Encoder<W>,
    ) -> Result<(), W::Error> {
        let len = 2 + self.scope.is_some() as usize + self.cnonce.is_some() as usize;
        encoder.push(ciborium_ll::Header::Map(Some(len)))?;
        encoder.push(ciborium_ll::Header::Positive(AS))?;
        encoder.text(self.as_uri.as_ref(), None)?;
        encoder.push(ciborium_ll::Header::Positive(AUDIENCE))?;
        encoder.text(self.audience.as_ref(), None)?;
        if let Some(scope) = &self.scope {
            encoder.push(ciborium_ll::Header::Positive(SCOPE))?;
            encoder.text(scope.as_ref(), None)?;
        }
        if let Some(cnonce) = &self.cnonce {
            encoder.push(ciborium_ll::Header::Positive(CNONCE))?;
            encoder.bytes(cnonce, None)?;
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut encoder = ciborium_ll::Encoder::from(&mut buf);
            self.push_to_encoder(&mut encoder)
                .expect("writing into a Vec is infallible");
        }
        buf
    }
}

impl RequestCreationHints<String> {
    // Running this by ciborium-ll is easier than building the full serde deserializer that appears
    // not to really cater for statically typed maps (see
    // https://github.com/serde-rs/serde/issues/2358)
    pub fn parse_cbor(input: &[u8]) -> Result<Self, &'static str> {
        let mut decoder = ciborium_ll::Decoder::from(input);
        let mut as_uri = None;
        let mut audience = None;
        let mut scope = None;
        let mut cnonce = None;
        match decoder.pull() {
            Ok(ciborium_ll::Header::Map(n)) => n,
            _ => return Err("Map expected"),
        };
        loop {
            match decoder.pull() {
                // Not checking precise length, but that's not really crucial
                Err(ciborium_ll::Error::Io(_)) | Ok(ciborium_ll::Header::Break) => break,
                Ok(ciborium_ll::Header::Positive(AS)) => {
                    as_uri = Some(pull_into_string(&mut decoder)?);
                }
                Ok(ciborium_ll::Header::Positive(AUDIENCE)) => {
                    audience = Some(pull_into_string(&mut decoder)?);
                }
                Ok(ciborium_ll::Header::Positive(SCOPE)) => {
                    scope = Some(pull_into_string(&mut decoder)?);
                }
                Ok(ciborium_ll::Header::Positive(CNONCE)) => {
                    cnonce = Some(pull_into_bytes(&mut decoder)?);
                }
                _ => return Err("Unexpected element"),
            }
        }
        if let (Some(as_uri), Some(audience)) = (as_uri, audience) {
            Ok(RequestCreationHints {
                as_uri,
                audience,
                scope,
                cnonce,
            })
        } else {
            Err("Components missing")
        }
    }
}
