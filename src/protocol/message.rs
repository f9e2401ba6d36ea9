use compact_str::CompactString;

use super::{Error, Headers};
use crate::ext::Latin1;


/// A fully-parsed SCGI request.
///
/// A [`Message`] is constructed once from a completed connection buffer and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    headers: Headers,
    body: Vec<u8>,
}

impl Message {
    /// Creates a [`Message`] from decoded headers and a raw body.
    #[inline]
    #[must_use]
    pub fn new(headers: Headers, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    /// Returns the headers of this request.
    #[inline]
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Retrieves the value of a header, if present. Names are case-sensitive.
    #[inline]
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Returns the body length declared by the `CONTENT_LENGTH` header.
    ///
    /// # Errors
    /// See `Headers::content_length`.
    #[inline]
    pub fn content_length(&self) -> Result<usize, Error> {
        self.headers.content_length()
    }

    /// Returns the raw bytes of the body.
    #[inline]
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns the body as text, mapping each byte to one Latin-1 character.
    ///
    /// This never fails, even for binary bodies. Use `Message::body` if you
    /// want to decode the bytes yourself (as UTF-8, for example).
    #[must_use]
    pub fn body_text(&self) -> CompactString {
        self.body.to_latin1()
    }

    /// Consumes the [`Message`], returning its headers and body.
    #[inline]
    #[must_use]
    pub fn into_parts(self) -> (Headers, Vec<u8>) {
        (self.headers, self.body)
    }
}
