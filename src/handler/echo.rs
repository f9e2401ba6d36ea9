use std::io;

use super::response::{self, Status};
use super::Responder;
use crate::ext::encode_latin1;
use crate::protocol::Message;


/// A placeholder [`Responder`] that echoes the request back as HTML.
///
/// The response lists the request headers sorted by name, one
/// `name = value<br/>` line each, followed by a separator line and the raw
/// request body.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoResponder;

impl EchoResponder {
    const SEPARATOR: &'static [u8] = b"=================<br/>";
}

impl Responder for EchoResponder {
    fn respond(&self, message: &Message, out: &mut Vec<u8>) -> io::Result<()> {
        let headers: [(&[u8], &[u8]); 1] = [(b"Content-Type", b"text/html")];
        response::write_headers(&mut *out, Status::OK, headers)?;

        for (name, value) in message.headers().sorted() {
            encode_latin1(name, out).map_err(unencodable)?;
            out.extend_from_slice(b" = ");
            encode_latin1(value, out).map_err(unencodable)?;
            out.extend_from_slice(b"<br/>");
        }
        out.extend_from_slice(Self::SEPARATOR);
        out.extend_from_slice(message.body());
        Ok(())
    }
}

fn unencodable(c: char) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("header contains non-Latin-1 {c:?}"))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, test_support};

    #[test]
    fn echo_scenario() {
        let msg = protocol::parse(test_support::SCENARIO).unwrap();
        let mut out = Vec::new();
        EchoResponder.respond(&msg, &mut out).unwrap();
        assert_eq!(out, test_support::SCENARIO_ECHO);
    }

    #[test]
    fn echo_preserves_bytes() {
        let headers = [("HTTP_X_NAME", "Andr\u{e9}")].into_iter().collect();
        let msg = Message::new(headers, test_support::BYTES.to_vec());
        let mut out = Vec::new();
        EchoResponder.respond(&msg, &mut out).unwrap();

        let listing = b"HTTP_X_NAME = Andr\xe9<br/>=================<br/>";
        let body = out.strip_suffix(test_support::BYTES).expect("body should be echoed verbatim");
        assert!(body.ends_with(listing));
    }
}
