// SPDX-FileCopyrightText: Copyright 2022 EDF (Électricité de France S.A.)
// SPDX-License-Identifier: BSD-3-Clause
// See README for all details on copyright, authorship and license.
//! Pulling whole strings out of a `ciborium_ll` decoder

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PullError {
    /// End of file reached mid-string
    MidStringTermination,
    /// Expected text string contains non-UTF8 bytes
    InvalidUtf8,
    /// Expected that a (text or byte, depending on context) string element would be present
    ExpectedStringElement,
}

use PullError::*;

impl From<PullError> for &'static str {
    fn from(e: PullError) -> Self {
        match e {
            MidStringTermination => "End of file reached mid-stream",
            InvalidUtf8 => "Text string contained invalid (non-UTF8) bytes",
            ExpectedStringElement => "String element expected",
        }
    }
}

fn read_exact<R: ciborium_io::Read>(
    decoder: &mut ciborium_ll::Decoder<R>,
    n: usize,
) -> Result<Vec<u8>, PullError> {
    // Hoping the compiler will know to elide the zeroing when it sees into the reader
    let mut bytes = vec![0; n];
    use ciborium_io::Read;
    decoder
        .read_exact(&mut bytes)
        .map_err(|_| MidStringTermination)?;
    Ok(bytes)
}

pub(crate) fn pull_into_string<R: ciborium_io::Read>(
    decoder: &mut ciborium_ll::Decoder<R>,
) -> Result<String, PullError> {
    match decoder.pull() {
        // Not accepting indefinite-length here even though it'd be technically feasible
        Ok(ciborium_ll::Header::Text(Some(n))) => {
            String::from_utf8(read_exact(decoder, n)?).map_err(|_| InvalidUtf8)
        }
        _ => Err(ExpectedStringElement),
    }
}

pub(crate) fn pull_into_bytes<R: ciborium_io::Read>(
    decoder: &mut ciborium_ll::Decoder<R>,
) -> Result<Vec<u8>, PullError> {
    match decoder.pull() {
        // Not accepting indefinite-length here even though it'd be technically feasible
        Ok(ciborium_ll::Header::Bytes(Some(n))) => read_exact(decoder, n),
        _ => Err(ExpectedStringElement),
    }
}
