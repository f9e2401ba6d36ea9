mod headers;
mod message;

pub use headers::{Headers, Pairs};
pub use message::Message;

use crate::ext::{encode_latin1, BytesVec};


/// The byte terminating the length prefix of an SCGI message.
pub const LENGTH_DELIMITER: u8 = b':';
/// The byte conventionally following the header block. Its value is not
/// validated when parsing.
pub const SEPARATOR: u8 = b',';
/// The byte terminating every header name and value.
pub const NUL: u8 = 0;

/// Maximum number of digits in a length prefix. [`usize::MAX`] has 20
/// decimal digits on 64-bit targets.
pub const MAX_PREFIX_DIGITS: usize = 20;

/// The header carrying the length of the request body.
pub const CONTENT_LENGTH: &str = "CONTENT_LENGTH";
/// The header carrying the SCGI protocol version, always `1`.
pub const SCGI: &str = "SCGI";


/// Error types that may occur while processing SCGI protocol elements.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The length prefix is missing its `:` delimiter, is empty, or contains
    /// something other than ASCII digits.
    #[error("malformed SCGI length prefix")]
    MalformedLength,
    /// The header block does not split into name-value pairs, or a header
    /// to be encoded contains a NUL byte.
    #[error("malformed SCGI header block")]
    MalformedHeaders,
    /// The message ended before its header block and separator were complete.
    #[error("SCGI message truncated: header block needs {expected} bytes, found {actual}")]
    Truncated {
        /// The number of bytes required after the length prefix.
        expected: usize,
        /// The number of bytes actually present after the length prefix.
        actual: usize,
    },
    /// The `CONTENT_LENGTH` header is not a non-negative decimal integer.
    #[error("invalid SCGI CONTENT_LENGTH header {0:?}")]
    InvalidContentLength(compact_str::CompactString),
    /// A header to be encoded contains a character outside of Latin-1,
    /// which has no single-byte representation.
    #[error("SCGI header contains non-Latin-1 character {0:?}")]
    NotLatin1(char),
}


/// The decoded length prefix of an SCGI message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    /// The declared length of the header block in bytes.
    pub header_len: usize,
    /// The offset of the header block, right after the `:` delimiter.
    pub header_start: usize,
}

impl Prefix {
    /// Returns the offset just past the header block, where the
    /// separator is located.
    #[inline]
    #[must_use]
    pub fn header_end(self) -> usize {
        self.header_start.saturating_add(self.header_len)
    }

    /// Returns the offset of the body, right after the separator.
    #[inline]
    #[must_use]
    pub fn body_start(self) -> usize {
        self.header_end().saturating_add(1)
    }
}


/// Attempts to decode the length prefix at the start of `data`.
///
/// `data` may be an incomplete message. Returns [`None`] if `data` consists
/// only of digits so far and more input is needed to find the delimiter.
///
/// # Errors
/// Returns [`Error::MalformedLength`] as soon as a non-digit byte precedes
/// the `:` delimiter, the prefix is empty, or no delimiter is found within
/// [`MAX_PREFIX_DIGITS`] digits.
pub fn parse_prefix(data: &[u8]) -> Result<Option<Prefix>, Error> {
    let window = &data[..data.len().min(MAX_PREFIX_DIGITS + 1)];
    match window.iter().position(|b| !b.is_ascii_digit()) {
        None if window.len() <= MAX_PREFIX_DIGITS => Ok(None),
        Some(digits @ 1..) if window[digits] == LENGTH_DELIMITER => {
            // Only ASCII digits precede the delimiter here
            let header_len = std::str::from_utf8(&window[..digits])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(Error::MalformedLength)?;
            Ok(Some(Prefix { header_len, header_start: digits + 1 }))
        },
        _ => Err(Error::MalformedLength),
    }
}


/// Parses a complete SCGI message into its headers and body.
///
/// All bytes after the separator make up the body. The body length is *not*
/// checked against `CONTENT_LENGTH`; callers must pass exactly one message.
///
/// # Errors
/// Returns an [`Error`] if the length prefix or header block is malformed,
/// or if `data` ends before the separator.
pub fn parse(data: &[u8]) -> Result<Message, Error> {
    let prefix = parse_prefix(data)?.ok_or(Error::MalformedLength)?;
    let after_prefix = data.len() - prefix.header_start;
    let truncated = Error::Truncated {
        expected: prefix.header_len.saturating_add(1),
        actual: after_prefix,
    };

    let Some(block) = data.get(prefix.header_start..prefix.header_end()) else {
        return Err(truncated);
    };
    // The separator must be present, but its value is not checked
    let Some(body) = data.get(prefix.body_start()..) else {
        return Err(truncated);
    };

    let headers = Pairs::new(block)?.collect();
    Ok(Message::new(headers, body.to_vec()))
}


/// Encodes headers and a body into a complete SCGI message.
///
/// Header names and values are expected to be Latin-1 text (see
/// `Message::headers`). `CONTENT_LENGTH` is written exactly as given; use
/// [`encode_request`] to have it derived from `body`.
///
/// # Errors
/// Returns [`Error::MalformedHeaders`] if any name or value contains a NUL
/// byte, or [`Error::NotLatin1`] if one contains a character beyond
/// `U+00FF`. Nothing is written to `out` in either case.
pub fn encode<'a, I>(headers: I, body: &[u8], out: &mut impl BytesVec) -> Result<usize, Error>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    // Most header blocks sent by web servers fit on the stack
    let mut block = smallvec::SmallVec::<[u8; 512]>::new();
    for (name, value) in headers {
        if name.contains('\0') || value.contains('\0') {
            return Err(Error::MalformedHeaders);
        }
        encode_latin1(name, &mut block).map_err(Error::NotLatin1)?;
        block.push(NUL);
        encode_latin1(value, &mut block).map_err(Error::NotLatin1)?;
        block.push(NUL);
    }

    let start = out.len();
    out.extend_from_slice(block.len().to_string().as_bytes());
    out.extend_from_slice(&[LENGTH_DELIMITER]);
    out.extend_from_slice(&block);
    out.extend_from_slice(&[SEPARATOR]);
    out.extend_from_slice(body);
    Ok(out.len() - start)
}

/// Encodes a request the way a web server front-end would: `CONTENT_LENGTH`
/// first (derived from `body`), then `SCGI: 1`, then `headers`.
///
/// # Errors
/// See [`encode`].
pub fn encode_request<'a, I>(headers: I, body: &[u8], out: &mut impl BytesVec) -> Result<usize, Error>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let len = body.len().to_string();
    let required = [(CONTENT_LENGTH, len.as_str()), (SCGI, "1")];
    let rest = headers.into_iter()
        .filter(|&(n, _)| n != CONTENT_LENGTH && n != SCGI)
        // Shorten the caller's lifetime to that of `len`
        .map(|(n, v)| -> (&str, &str) { (n, v) });
    encode(required.into_iter().chain(rest), body, out)
}


#[cfg(test)]
pub(crate) mod test_support;
