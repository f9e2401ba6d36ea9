use std::fmt;
use std::io::{self, Write};


/// An HTTP status line as written into a CGI-style `Status` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status<'a> {
    /// The three-digit status code.
    pub code: u16,
    /// The reason phrase following the code.
    pub reason: &'a str,
}

impl Status<'static> {
    /// `200 OK`
    pub const OK: Self = Self { code: 200, reason: "OK" };
    /// `400 Bad Request`
    pub const BAD_REQUEST: Self = Self { code: 400, reason: "Bad Request" };
    /// `404 Not Found`
    pub const NOT_FOUND: Self = Self { code: 404, reason: "Not Found" };
    /// `500 Internal Server Error`
    pub const INTERNAL_SERVER_ERROR: Self = Self { code: 500, reason: "Internal Server Error" };
}

impl fmt::Display for Status<'_> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:03} {}", self.code, self.reason)
    }
}

#[cfg(feature = "http")]
impl From<http::StatusCode> for Status<'static> {
    #[inline]
    fn from(status: http::StatusCode) -> Self {
        Self { code: status.as_u16(), reason: status.canonical_reason().unwrap_or("Custom") }
    }
}


/// Writes the head of a document response into the writer.
///
/// The head starts with a `Status` header built from `status`, followed by
/// `headers` and the empty line separating head and body. Header names must
/// not be `Status` (verified by a debug assertion), and values must be a
/// single line. After this function returns [`Ok(n)`], the caller can
/// immediately write the body.
///
/// # Errors
/// Any errors from [`Write::write_all`] are forwarded to the caller.
pub fn write_headers<'a, W, I>(mut w: W, status: Status, headers: I) -> io::Result<usize>
where
    W: Write,
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut sbuf = *b"Status: \0\0\0 ";
    let code = format!("{:03}", status.code.min(999));
    sbuf[8..11].copy_from_slice(code.as_bytes());
    let reason = status.reason.as_bytes();

    w.write_all(&sbuf)?;
    w.write_all(reason)?;
    let mut written = sbuf.len() + reason.len();

    for (name, val) in headers {
        debug_assert!(!name.eq_ignore_ascii_case(b"status"), "header name `Status` is reserved");
        w.write_all(b"\n")?;
        w.write_all(name)?;
        w.write_all(b": ")?;
        w.write_all(val)?;
        written += name.len() + val.len() + 3;
    }

    w.write_all(b"\n\n")?;
    Ok(written + 2)
}

/// Writes the head of an [`http::Response<T>`] into the writer.
///
/// This is a wrapper around [`write_headers`]; the response body is ignored
/// and must be written separately.
///
/// # Errors
/// Any errors from [`Write::write_all`] are forwarded to the caller.
#[cfg(feature = "http")]
#[inline]
pub fn http_headers<T>(w: impl Write, response: &http::Response<T>) -> io::Result<usize> {
    let headers = response.headers().iter().map(|(n, v)| (n.as_ref(), v.as_bytes()));
    write_headers(w, response.status().into(), headers)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display() {
        assert_eq!(Status::OK.to_string(), "200 OK");
        assert_eq!(Status { code: 7, reason: "Odd" }.to_string(), "007 Odd");
    }

    #[test]
    fn headers_head() {
        let mut out = Vec::new();
        let headers: [(&[u8], &[u8]); 2] =
            [(b"Content-Type", b"text/html"), (b"X-Powered-By", b"scgi-server")];
        let written = write_headers(&mut out, Status::OK, headers).unwrap();
        assert_eq!(written, out.len());
        assert_eq!(
            out,
            b"Status: 200 OK\nContent-Type: text/html\nX-Powered-By: scgi-server\n\n",
        );
    }

    #[test]
    fn headers_empty() {
        let mut out = Vec::new();
        let written = write_headers(&mut out, Status::NOT_FOUND, std::iter::empty()).unwrap();
        assert_eq!(written, out.len());
        assert_eq!(out, b"Status: 404 Not Found\n\n");
    }

    #[test]
    fn headers_overflow() {
        let mut buf = [0; 16];
        let res = write_headers(&mut buf[..], Status::INTERNAL_SERVER_ERROR, std::iter::empty());
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::WriteZero);
    }

    #[cfg(feature = "http")]
    #[test]
    fn http_response() {
        let response = http::Response::builder()
            .status(http::StatusCode::CREATED)
            .header(http::header::CONTENT_TYPE, "text/plain")
            .body(())
            .unwrap();
        let mut out = Vec::new();
        http_headers(&mut out, &response).unwrap();
        assert_eq!(out, b"Status: 201 Created\ncontent-type: text/plain\n\n");
    }
}
