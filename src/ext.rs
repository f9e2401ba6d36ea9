use std::io::Write;
use std::ops::DerefMut;

use compact_str::CompactString;
use smallvec::SmallVec;


/// An extension trait for decoding byte slices as ISO-8859-1 (Latin-1) text.
///
/// Every byte maps to exactly one `char` with the same scalar value, so the
/// conversion never fails and `Latin1::to_latin1` followed by
/// [`encode_latin1`] reproduces the original bytes.
pub trait Latin1 {
    /// Decodes the bytes into a [`CompactString`], one `char` per byte.
    #[must_use]
    fn to_latin1(&self) -> CompactString;
}

impl Latin1 for [u8] {
    fn to_latin1(&self) -> CompactString {
        if self.is_ascii() {
            // ASCII is a subset of both Latin-1 and UTF-8
            let mut s = CompactString::with_capacity(self.len());
            s.push_str(std::str::from_utf8(self).unwrap_or_default());
            return s;
        }
        self.iter().map(|&b| char::from(b)).collect()
    }
}

/// Encodes text produced by `Latin1::to_latin1` back into raw bytes.
///
/// # Errors
/// Returns the first character outside of Latin-1, which cannot have
/// originated from a byte. The bytes preceding it are left in `out`.
pub fn encode_latin1(s: &str, out: &mut impl BytesVec) -> Result<(), char> {
    if s.is_ascii() {
        out.extend_from_slice(s.as_bytes());
        return Ok(());
    }
    for c in s.chars() {
        let b = u8::try_from(c).map_err(|_| c)?;
        out.extend_from_slice(&[b]);
    }
    Ok(())
}


/// A trait for generic abstraction over [`Vec<u8>`]-like types.
pub trait BytesVec: DerefMut<Target = [u8]> + Write {
    /// Copies and appends all bytes from `other` to this [`BytesVec`] in-order.
    fn extend_from_slice(&mut self, other: &[u8]);
}

impl BytesVec for Vec<u8> {
    #[inline]
    fn extend_from_slice(&mut self, other: &[u8]) {
        self.extend(other);
    }
}

impl<const N: usize> BytesVec for SmallVec<[u8; N]> {
    #[inline]
    fn extend_from_slice(&mut self, other: &[u8]) {
        self.extend_from_slice(other);
    }
}
