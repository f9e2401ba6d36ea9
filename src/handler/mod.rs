use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::macros::trace;
use crate::protocol::Message;
use crate::server::ConnId;

mod echo;
/// Helpers for writing CGI-style response heads.
pub mod response;

pub use echo::EchoResponder;


/// Produces the response to a single SCGI request.
///
/// A [`Responder`] is invoked once per dispatched [`Message`] and writes the
/// complete response (head and body) into `out`. The server transmits it and
/// closes the connection afterwards. Returning an error closes the connection
/// without writing any response bytes.
///
/// Responders run on the server's runtime and must not block. Long-running
/// work has to be handed off to another execution context.
pub trait Responder: Send + Sync + 'static {
    /// Writes the response to `message` into `out`.
    ///
    /// # Errors
    /// Any error aborts the response. Bytes already written into `out` are
    /// discarded.
    fn respond(&self, message: &Message, out: &mut Vec<u8>) -> io::Result<()>;
}

impl<F> Responder for F
where
    F: Fn(&Message, &mut Vec<u8>) -> io::Result<()> + Send + Sync + 'static,
{
    #[inline]
    fn respond(&self, message: &Message, out: &mut Vec<u8>) -> io::Result<()> {
        self(message, out)
    }
}


/// How a started [`ResponseHandler`] finished.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Outcome {
    /// The complete response of this many bytes was written and the
    /// connection's write direction was shut down.
    Written(usize),
    /// The [`Responder`] failed or panicked. Nothing was written.
    Declined(Arc<io::Error>),
    /// Transmitting the response failed part-way.
    WriteFailed(Arc<io::Error>),
}

impl Outcome {
    /// Tests whether the whole response reached the connection.
    #[inline]
    #[must_use]
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written(_))
    }
}


#[derive(Debug)]
enum Stage<W> {
    Ready { message: Message, writer: W },
    Running(JoinHandle<()>),
    Ended,
}

/// Owns the writable end of a connection after its request was framed.
///
/// A handler is started at most once. Its response is written by a separate
/// task, which reports its [`Outcome`] through the completion callback given
/// to [`ResponseHandler::start`]. [`ResponseHandler::end`] releases the
/// writer, cancelling the response if it is still in flight. Every handler
/// must be ended exactly once; repeated calls are no-ops.
#[derive(Debug)]
pub struct ResponseHandler<W> {
    id: ConnId,
    stage: Stage<W>,
}

impl<W> ResponseHandler<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a new, not yet started [`ResponseHandler`].
    #[inline]
    #[must_use]
    pub fn new(id: ConnId, message: Message, writer: W) -> Self {
        Self { id, stage: Stage::Ready { message, writer } }
    }

    /// Returns the connection this handler responds on.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Tests whether [`ResponseHandler::end`] has been called.
    #[inline]
    #[must_use]
    pub fn is_ended(&self) -> bool {
        matches!(self.stage, Stage::Ended)
    }

    /// Spawns the task writing the response to the connection.
    ///
    /// `done` is called on the response task once it finishes, whether the
    /// response was written or not. It is not called if the handler is ended
    /// first. Returns `false` (without calling anything) if the handler was
    /// already started or ended.
    ///
    /// # Panics
    /// Panics if called outside of a tokio runtime.
    pub fn start<F>(&mut self, responder: Arc<dyn Responder>, done: F) -> bool
    where
        F: FnOnce(ConnId, Outcome) + Send + 'static,
    {
        let (message, writer) = match std::mem::replace(&mut self.stage, Stage::Ended) {
            Stage::Ready { message, writer } => (message, writer),
            other => {
                self.stage = other;
                return false;
            },
        };

        let id = self.id;
        let span = tracing::error_span!("scgi_response", conn = %id);
        let task = tokio::spawn(async move {
            let outcome = write_response(&*responder, &message, writer).await;
            done(id, outcome);
        }.instrument(span));
        self.stage = Stage::Running(task);
        true
    }

    /// Releases the connection's writable end.
    ///
    /// An in-flight response is cancelled. Returns `true` if this call
    /// released anything, or `false` if the handler was already ended.
    pub fn end(&mut self) -> bool {
        match std::mem::replace(&mut self.stage, Stage::Ended) {
            Stage::Ready { writer, .. } => {
                trace!(conn = %self.id, "handler ended before start");
                drop(writer);
                true
            },
            Stage::Running(task) => {
                // No-op for finished tasks; the writer was dropped on completion
                task.abort();
                true
            },
            Stage::Ended => false,
        }
    }
}

/// Runs the responder and transmits its output. The writer is closed on
/// return, regardless of the outcome.
async fn write_response<W>(responder: &dyn Responder, message: &Message, mut writer: W) -> Outcome
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::new();
    let res = panic::catch_unwind(AssertUnwindSafe(|| responder.respond(message, &mut out)))
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "responder panicked")));
    if let Err(e) = res {
        let error: &dyn std::error::Error = &e;
        tracing::warn!(error, "responder failed, closing without response");
        return Outcome::Declined(Arc::new(e));
    }

    let res = match writer.write_all(&out).await {
        Ok(()) => writer.shutdown().await,
        Err(e) => Err(e),
    };
    match res {
        Ok(()) => {
            tracing::debug!(bytes = out.len(), "response written");
            Outcome::Written(out.len())
        },
        Err(e) => {
            let error: &dyn std::error::Error = &e;
            tracing::info!(error, bytes = out.len(), "writing response failed");
            Outcome::WriteFailed(Arc::new(e))
        },
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::sync::oneshot;

    use super::*;
    use crate::protocol::Headers;

    fn message(body: &[u8]) -> Message {
        let headers: Headers = [("SCGI", "1"), ("REQUEST_METHOD", "GET")].into_iter().collect();
        Message::new(headers, body.to_vec())
    }

    fn reply(message: &Message, out: &mut Vec<u8>) -> io::Result<()> {
        out.extend_from_slice(b"Status: 200 OK\n\n");
        out.extend_from_slice(message.body());
        Ok(())
    }

    fn fail(_: &Message, _: &mut Vec<u8>) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::InvalidData, "nope"))
    }

    fn boom(_: &Message, _: &mut Vec<u8>) -> io::Result<()> {
        panic!("responder bug");
    }

    fn notify(tx: oneshot::Sender<(ConnId, Outcome)>) -> impl FnOnce(ConnId, Outcome) + Send {
        move |id, outcome| drop(tx.send((id, outcome)))
    }

    #[test]
    fn trait_check() {
        fn ok<T: Send + Sync>() {}
        ok::<ResponseHandler<tokio::net::tcp::OwnedWriteHalf>>();
        ok::<Outcome>();
    }

    #[tokio::test]
    async fn writes_and_signals_done() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut handler = ResponseHandler::new(ConnId::new(7), message(b"pong"), server);
        let (tx, rx) = oneshot::channel();
        assert!(handler.start(Arc::new(reply), notify(tx)));

        let (id, outcome) = rx.await.unwrap();
        assert_eq!(id, ConnId::new(7));
        assert!(matches!(outcome, Outcome::Written(20)));

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"Status: 200 OK\n\npong");

        assert!(handler.end());
        assert!(handler.is_ended());
    }

    #[tokio::test]
    async fn failure_still_signals_done() {
        let responders: [Arc<dyn Responder>; 2] = [Arc::new(fail), Arc::new(boom)];
        for responder in responders {
            let (mut client, server) = tokio::io::duplex(1024);
            let mut handler = ResponseHandler::new(ConnId::new(1), message(b""), server);
            let (tx, rx) = oneshot::channel();
            assert!(handler.start(responder, notify(tx)));

            let (_, outcome) = rx.await.unwrap();
            assert!(matches!(outcome, Outcome::Declined(_)));
            assert!(!outcome.is_written());

            let mut got = Vec::new();
            client.read_to_end(&mut got).await.unwrap();
            assert!(got.is_empty());
            assert!(handler.end());
        }
    }

    #[tokio::test]
    async fn start_once() {
        let (_client, server) = tokio::io::duplex(1024);
        let mut handler = ResponseHandler::new(ConnId::new(2), message(b"x"), server);
        let (tx, rx) = oneshot::channel();
        assert!(handler.start(Arc::new(reply), notify(tx)));
        assert!(!handler.start(Arc::new(reply), |_, _| panic!("second start must not run")));
        rx.await.unwrap();

        assert!(handler.end());
        assert!(!handler.start(Arc::new(reply), |_, _| panic!("start after end must not run")));
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut handler = ResponseHandler::new(ConnId::new(3), message(b""), server);
        assert!(handler.end());
        assert!(!handler.end());
        assert!(!handler.end());

        // The writer is released by the first end()
        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn end_cancels_in_flight_response() {
        // The response does not fit into the pipe and nobody reads it
        let (mut client, server) = tokio::io::duplex(16);
        let mut handler = ResponseHandler::new(ConnId::new(4), message(&[b'z'; 4096]), server);
        let (tx, mut rx) = oneshot::channel();
        assert!(handler.start(Arc::new(reply), notify(tx)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(handler.end());
        assert!(!handler.end());

        // The aborted task drops the writer, so the reader sees EOF after
        // whatever fit into the pipe
        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut got))
            .await
            .expect("writer should be dropped")
            .unwrap();
        assert!(got.len() < 4096 + 16);
        assert!(rx.try_recv().is_err());
    }
}
