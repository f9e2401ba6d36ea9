use super::{Action, Error, Limits, State};
use crate::macros::trace;
use crate::protocol::{self as scgi, Headers, Pairs};


impl State {
    /// Advances the framing state as far as the buffered bytes allow.
    ///
    /// Each state only inspects the bytes it needs: the prefix window, then
    /// the header block once, then just the buffer length while the body
    /// arrives. The complete message is parsed exactly once.
    fn drive(self, buf: &[u8], limits: Limits) -> (Action, State) {
        use State::*;
        let abort = |e: Error| (Action::Abort(e.clone()), Aborted(e));

        let mut state = self;
        loop {
            state = match state {
                AwaitingLength => match scgi::parse_prefix(buf) {
                    Ok(None) => return (Action::NeedMoreData, AwaitingLength),
                    Ok(Some(prefix)) if prefix.header_len > limits.max_header_len => {
                        return abort(Error::HeadersTooLarge {
                            len: prefix.header_len, max: limits.max_header_len,
                        });
                    },
                    Ok(Some(prefix)) => {
                        trace!(header_len = prefix.header_len, "length prefix received");
                        AwaitingHeaders { prefix }
                    },
                    Err(e) => return abort(e.into()),
                },

                AwaitingHeaders { prefix } => {
                    // Wait for the header block and the separator
                    if buf.len() < prefix.body_start() {
                        return (Action::NeedMoreData, AwaitingHeaders { prefix });
                    }
                    let block = &buf[prefix.header_start..prefix.header_end()];
                    let headers: Headers = match Pairs::new(block) {
                        Ok(p) => p.collect(),
                        Err(e) => return abort(e.into()),
                    };
                    let body_len = match headers.content_length() {
                        Ok(len) if len > limits.max_body_len => {
                            return abort(Error::BodyTooLarge {
                                len, max: limits.max_body_len,
                            });
                        },
                        Ok(len) => len,
                        Err(e) => return abort(e.into()),
                    };
                    // Both summands are bounded by the configured limits
                    let total = prefix.body_start().saturating_add(body_len);
                    trace!(total, body_len, "header block received");
                    AwaitingBody { prefix, total }
                },

                AwaitingBody { prefix, total } => {
                    if buf.len() < total {
                        return (Action::NeedMoreData, AwaitingBody { prefix, total });
                    }
                    if let extra @ 1.. = buf.len() - total {
                        tracing::debug!(bytes = extra, "ignoring data after end of SCGI message");
                    }
                    return match scgi::parse(&buf[..total]) {
                        Ok(msg) => (Action::Dispatch(msg), Complete),
                        Err(e) => abort(e.into()),
                    };
                },

                s @ (Complete | Aborted(_)) => return (Action::Abort(Error::Finished), s),
            };
        }
    }
}


/// An incremental framer which assembles one SCGI message from a connection's
/// byte stream.
///
/// Bytes are passed to `Framer::feed` in arrival order, in chunks of any
/// size. Each call appends the chunk to an internal buffer and re-evaluates
/// the framing [`State`], resulting in an [`Action`] for the caller:
/// - [`Action::NeedMoreData`]: keep reading.
/// - [`Action::Dispatch`]: the complete, parsed [`Message`](scgi::Message).
/// - [`Action::Abort`]: close the connection without a response.
///
/// A message is complete once the buffer holds the length prefix, the header
/// block, the separator, and as many body bytes as `CONTENT_LENGTH` declares
/// (zero if absent). Any bytes past that point are ignored, as each SCGI
/// connection carries exactly one request.
///
/// Once the framer dispatched or aborted, its buffer is released and any
/// further input results in [`Error::Finished`].
#[derive(Debug, Clone)]
#[must_use = "Framer must be fed to assemble a message"]
pub struct Framer {
    buffer: Vec<u8>,
    limits: Limits,
    state: State,
}

impl Default for Framer {
    #[inline]
    fn default() -> Self {
        Self::new(Limits::default())
    }
}

impl Framer {
    /// Creates an empty [`Framer`] enforcing the given [`Limits`].
    #[inline]
    pub fn new(limits: Limits) -> Self {
        Self { buffer: Vec::new(), limits, state: State::AwaitingLength }
    }

    /// Returns the current framing [`State`].
    #[inline]
    #[must_use]
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Returns the number of bytes buffered so far.
    #[inline]
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the total length of the message, once it is known.
    #[inline]
    #[must_use]
    pub fn expected_len(&self) -> Option<usize> {
        match self.state {
            State::AwaitingBody { total, .. } => Some(total),
            _ => None,
        }
    }

    /// Appends `data` to the buffer and re-evaluates the framing state.
    ///
    /// An empty `data` slice signals that the peer closed the connection and
    /// is handled like `Framer::close`.
    pub fn feed(&mut self, data: &[u8]) -> Action {
        if data.is_empty() {
            return self.close();
        }
        if self.state.is_final() {
            return Action::Abort(Error::Finished);
        }

        self.buffer.extend_from_slice(data);
        trace!(bytes = data.len(), buffered = self.buffer.len(), "input buffered");

        let buf = &self.buffer;
        let limits = self.limits;
        let action = replace_with::replace_with_and_return(
            &mut self.state, || State::Aborted(Error::Paniced),
            |s| s.drive(buf, limits),
        );
        if self.state.is_final() {
            self.buffer = Vec::new();
        }
        action
    }

    /// Handles the peer closing its end of the connection.
    ///
    /// Closing before a message is complete aborts with
    /// [`Error::ConnectionClosedEarly`].
    pub fn close(&mut self) -> Action {
        self.abort(Error::ConnectionClosedEarly)
    }

    /// Aborts framing with `reason`, unless the framer is already final.
    pub fn abort(&mut self, reason: Error) -> Action {
        if self.state.is_final() {
            return Action::Abort(Error::Finished);
        }
        tracing::debug!(
            state = self.state.name(), buffered = self.buffer.len(), %reason,
            "SCGI framing aborted",
        );
        self.state = State::Aborted(reason.clone());
        self.buffer = Vec::new();
        Action::Abort(reason)
    }
}
