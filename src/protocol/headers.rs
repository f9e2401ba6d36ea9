use std::collections::hash_map::{self, HashMap};
use std::iter::FusedIterator;

use compact_str::CompactString;

use super::{Error, CONTENT_LENGTH, NUL};
use crate::ext::Latin1;


/// An iterator decoding the name-value pairs of an SCGI header block.
///
/// The block consists of NUL-terminated strings, alternating between names
/// and values. Creating the iterator validates that the strings pair up, so
/// iteration itself cannot fail.
#[derive(Debug, Clone)]
pub struct Pairs<'a> {
    data: Option<&'a [u8]>,
}

impl<'a> Pairs<'a> {
    /// Creates a new [`Pairs`] iterator over a complete header block.
    ///
    /// # Errors
    /// Returns [`Error::MalformedHeaders`] if the block splits into an odd
    /// number of strings. A single trailing NUL terminates the final value
    /// and does not count as an additional (empty) string.
    pub fn new(block: &'a [u8]) -> Result<Self, Error> {
        if block.is_empty() {
            return Ok(Self { data: None });
        }

        let block = block.strip_suffix(&[NUL]).unwrap_or(block);
        let strings = block.iter().filter(|&&b| b == NUL).count() + 1;
        if strings % 2 != 0 {
            return Err(Error::MalformedHeaders);
        }
        Ok(Self { data: Some(block) })
    }

    /// Splits off the next string, up to (not including) its terminator.
    fn next_str(&mut self) -> Option<&'a [u8]> {
        let data = self.data?;
        match data.iter().position(|&b| b == NUL) {
            Some(end) => {
                self.data = Some(&data[(end + 1)..]);
                Some(&data[..end])
            },
            None => {
                // The final terminator was stripped in Pairs::new
                self.data = None;
                Some(data)
            },
        }
    }
}

impl<'a> Iterator for Pairs<'a> {
    /// The raw name-value pair returned by the iterator.
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let name = self.next_str()?;
        // Pairs::new guarantees an even number of strings
        let value = self.next_str().unwrap_or_default();
        Some((name, value))
    }
}

impl FusedIterator for Pairs<'_> {}


/// The headers of an SCGI request.
///
/// Names are kept exactly as received: no case normalization is performed,
/// and a later header overwrites an earlier one with an identical name.
/// Names and values are decoded byte-for-byte as Latin-1, so arbitrary bytes
/// are preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    map: HashMap<CompactString, CompactString>,
}

impl Headers {
    /// Creates an empty set of [`Headers`].
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of distinct header names.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Tests whether there are no headers at all.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Tests whether a header with exactly this name is present.
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Retrieves the value stored for the header name, if there is one.
    #[inline]
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(CompactString::as_str)
    }

    /// Inserts a header, returning the value it replaced.
    pub fn insert<N, V>(&mut self, name: N, value: V) -> Option<CompactString>
    where
        N: Into<CompactString>,
        V: Into<CompactString>,
    {
        self.map.insert(name.into(), value.into())
    }

    /// Returns the body length declared by the `CONTENT_LENGTH` header.
    ///
    /// A missing header declares an empty body.
    ///
    /// # Errors
    /// Returns [`Error::InvalidContentLength`] if the header is present but
    /// not a non-negative decimal integer.
    pub fn content_length(&self) -> Result<usize, Error> {
        let Some(value) = self.map.get(CONTENT_LENGTH) else {
            return Ok(0);
        };
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidContentLength(value.clone()));
        }
        value.parse().map_err(|_| Error::InvalidContentLength(value.clone()))
    }

    /// Returns an iterator over all headers, in arbitrary order.
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        Iter(self.map.iter())
    }

    /// Returns all headers sorted by name.
    #[must_use]
    pub fn sorted(&self) -> Vec<(&str, &str)> {
        let mut all: Vec<_> = self.iter().collect();
        all.sort_unstable();
        all
    }
}

impl<'a> FromIterator<(&'a [u8], &'a [u8])> for Headers {
    fn from_iter<T: IntoIterator<Item = (&'a [u8], &'a [u8])>>(iter: T) -> Self {
        let mut headers = Self::new();
        headers.extend(iter);
        headers
    }
}

impl<'a> Extend<(&'a [u8], &'a [u8])> for Headers {
    fn extend<T: IntoIterator<Item = (&'a [u8], &'a [u8])>>(&mut self, iter: T) {
        self.map.extend(iter.into_iter().map(|(n, v)| (n.to_latin1(), v.to_latin1())));
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Headers {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        Self { map: iter.into_iter().map(|(n, v)| (n.into(), v.into())).collect() }
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = Iter<'a>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}


/// An iterator over the name-value pairs of [`Headers`].
#[derive(Debug, Clone)]
pub struct Iter<'a>(hash_map::Iter<'a, CompactString, CompactString>);

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, &'a str);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl ExactSizeIterator for Iter<'_> {}
impl FusedIterator for Iter<'_> {}
