// TODO(docs): #![deny(missing_docs)]
#![deny(unsafe_code, single_use_lifetimes, unused_lifetimes)]
#![warn(keyword_idents, let_underscore_drop, unreachable_pub, unused_import_braces)]

#![deny(clippy::suspicious, clippy::cargo)]
#![deny(clippy::exit, clippy::semicolon_inside_block, clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::multiple_crate_versions)]
#![allow(clippy::enum_glob_use, clippy::items_after_statements)]

use std::num::NonZeroUsize;
use std::time::Duration;

use compact_str::CompactString;


/// Helpful extension traits shared across the crate.
pub(crate) mod ext;
pub(crate) mod macros;

/// The SCGI wire format: length-prefixed header blocks and raw bodies.
///
/// See: <https://python.ca/scgi/protocol.txt>
pub mod protocol;

/// Incremental, per-connection framing of SCGI messages.
pub mod parser;

/// The application boundary: [`Responder`]s and the lifecycle of a response.
pub mod handler;

/// The SCGI server and its connection table.
pub mod server;

pub use handler::{EchoResponder, Responder};
pub use protocol::{Headers, Message};
pub use server::Server;


/// Configuration shared by a [`Server`] and the framers of its connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The IPv4 address to listen on, in dotted-quad notation.
    pub address: CompactString,
    /// The TCP port to listen on. Port 0 lets the OS pick a free port.
    pub port: u16,
    /// Maximum accepted length of a header block, excluding its length prefix.
    pub max_header_len: usize,
    /// Maximum accepted `CONTENT_LENGTH` of a request body.
    pub max_body_len: usize,
    /// How long a connection may stay silent before it is aborted. [`None`]
    /// disables the timeout.
    pub read_timeout: Option<Duration>,
    /// Number of bytes requested from the socket per read.
    pub read_chunk: NonZeroUsize,
    /// Whether `SO_REUSEADDR` is set on the listening socket.
    pub reuse_address: bool,
    /// Maximum number of pending connections queued by the OS.
    pub backlog: u32,
}

impl Config {
    /// The default listening address, matching a front-end on the same host.
    pub const DEFAULT_ADDRESS: &'static str = "127.0.0.1";
    /// The default limit for header blocks (64 KiB).
    pub const DEFAULT_MAX_HEADER_LEN: usize = 64 * 1024;
    /// The default limit for request bodies (16 MiB).
    pub const DEFAULT_MAX_BODY_LEN: usize = 16 * 1024 * 1024;
    /// The default per-read idle timeout.
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
    /// The default listen backlog.
    pub const DEFAULT_BACKLOG: u32 = 1024;

    /// Creates a [`Config`] listening on the loopback address at `port`, with
    /// default limits.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            address: CompactString::from(Self::DEFAULT_ADDRESS),
            port,
            max_header_len: Self::DEFAULT_MAX_HEADER_LEN,
            max_body_len: Self::DEFAULT_MAX_BODY_LEN,
            read_timeout: Some(Self::DEFAULT_READ_TIMEOUT),
            read_chunk: NonZeroUsize::new(8 * 1024).unwrap_or(NonZeroUsize::MIN),
            reuse_address: true,
            backlog: Self::DEFAULT_BACKLOG,
        }
    }

    /// Replaces the listening address.
    #[must_use]
    pub fn with_address(mut self, address: &str) -> Self {
        self.address = address.into();
        self
    }
}

impl Default for Config {
    /// A [`Config`] on `127.0.0.1:9998`, the conventional development port.
    #[inline]
    fn default() -> Self {
        Self::new(9998)
    }
}
