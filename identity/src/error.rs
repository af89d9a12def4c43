// Copyright 2022 Protocol Labs.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use std::error::Error;

/// A key or peer id could not be decoded.
#[derive(Debug, thiserror::Error)]
#[error("decoding {what} failed")]
pub struct DecodingError {
    what: &'static str,
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl DecodingError {
    pub(crate) fn bad_protobuf(e: prost::DecodeError) -> Self {
        Self {
            what: "protobuf envelope",
            source: Some(Box::new(e)),
        }
    }

    pub(crate) fn bad_key(what: &'static str, e: impl Error + Send + Sync + 'static) -> Self {
        Self {
            what,
            source: Some(Box::new(e)),
        }
    }

    pub(crate) fn bad_key_len(what: &'static str, len: usize) -> Self {
        log::debug!("rejecting {what} of unexpected length {len}");
        Self { what, source: None }
    }

    pub(crate) fn unsupported_key_type(ty: i32) -> Self {
        log::debug!("rejecting key of unsupported type {ty}");
        Self {
            what: "key of unsupported type",
            source: None,
        }
    }
}

/// A signing operation failed.
#[derive(Debug, thiserror::Error)]
#[error("signing failed")]
pub struct SigningError {
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
}
