use crate::protocol::{self as scgi, Message};
use crate::Config;

mod framer;

pub use framer::Framer;


/// Error types that terminate the framing of a single connection.
///
/// None of these affect other connections or the server itself. A
/// connection failing with any of them is closed without a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The buffered bytes do not form a valid SCGI message.
    #[error(transparent)]
    Protocol(#[from] scgi::Error),

    /// The peer closed the connection before a complete message arrived.
    #[error("SCGI connection closed before the message was complete")]
    ConnectionClosedEarly,

    /// The peer stayed silent for longer than the configured read timeout.
    #[error("SCGI connection timed out while waiting for data")]
    TimedOut,

    /// The length prefix declared a header block above the configured limit.
    #[error("SCGI header block of {len} bytes exceeds limit of {max} bytes")]
    HeadersTooLarge {
        /// The declared header block length.
        len: usize,
        /// The configured maximum.
        max: usize,
    },

    /// `CONTENT_LENGTH` declared a body above the configured limit.
    #[error("SCGI body of {len} bytes exceeds limit of {max} bytes")]
    BodyTooLarge {
        /// The declared body length.
        len: usize,
        /// The configured maximum.
        max: usize,
    },

    /// A panic inside the framer left it in an inconsistent state.
    #[error("SCGI framer state was lost due to an unexpected panic")]
    Paniced,

    /// The framer was fed after it already dispatched or aborted.
    #[error("SCGI framer received input after reaching a final state")]
    Finished,
}


/// Size limits applied while framing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum declared header block length.
    pub max_header_len: usize,
    /// Maximum declared `CONTENT_LENGTH`.
    pub max_body_len: usize,
}

impl Default for Limits {
    #[inline]
    fn default() -> Self {
        Self {
            max_header_len: Config::DEFAULT_MAX_HEADER_LEN,
            max_body_len: Config::DEFAULT_MAX_BODY_LEN,
        }
    }
}

impl From<&Config> for Limits {
    #[inline]
    fn from(config: &Config) -> Self {
        Self { max_header_len: config.max_header_len, max_body_len: config.max_body_len }
    }
}


/// The framing progress of a single connection.
#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[non_exhaustive]
pub enum State {
    /// The `:` ending the length prefix has not arrived yet.
    AwaitingLength,
    /// The header block length is known, but the block (and with it
    /// `CONTENT_LENGTH`) is still incomplete.
    AwaitingHeaders {
        /// The decoded length prefix.
        prefix: scgi::Prefix,
    },
    /// The total message length is known and the body is arriving.
    AwaitingBody {
        /// The decoded length prefix.
        prefix: scgi::Prefix,
        /// The number of bytes making up the complete message.
        total: usize,
    },
    /// A complete message was dispatched.
    Complete,
    /// Framing failed or the connection was cut short.
    Aborted(Error),
}

impl State {
    /// Tests whether no further input will be accepted.
    #[inline]
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted(_))
    }

    /// Returns a short, static name of the state for logging.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.into()
    }
}


/// The outcome of feeding input to a [`Framer`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "the connection must be driven according to the Action"]
pub enum Action {
    /// The message is incomplete. Keep reading from the connection.
    NeedMoreData,
    /// A complete message was framed and parsed.
    Dispatch(Message),
    /// The connection must be closed without a response.
    Abort(Error),
}
