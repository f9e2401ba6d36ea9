/// Emits a trace-level event for per-byte framing progress.
///
/// These events fire for every read on every connection, so they are
/// compiled out unless the `trace-more` feature is enabled.
#[cfg(feature = "trace-more")]
macro_rules! trace {
    ($($arg:tt)+) => (::tracing::trace!($($arg)+));
}
/// Emits a trace-level event for per-byte framing progress.
///
/// Disabled: enable the `trace-more` feature to compile these events in.
#[cfg(not(feature = "trace-more"))]
macro_rules! trace {
    ($($arg:tt)+) => {};
}
pub(crate) use trace;
