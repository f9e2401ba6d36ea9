use std::collections::BTreeMap;
use std::io;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use super::conn::Reader;
use super::{ConnId, Stats};
use crate::handler::{Outcome, Responder, ResponseHandler};
use crate::macros::trace;
use crate::parser::{self, Action, Framer, Limits};
use crate::Config;


/// A discrete input to the event loop, produced by connection and response
/// tasks. Events of a single connection arrive in the order they occurred.
#[derive(Debug)]
pub(crate) enum Event {
    /// Bytes were read from a connection.
    Data(ConnId, Vec<u8>),
    /// The peer closed its write direction (a zero-length read).
    Closed(ConnId),
    /// Reading from a connection failed.
    ReadFailed(ConnId, Arc<io::Error>),
    /// A connection stayed silent for longer than the read timeout.
    TimedOut(ConnId),
    /// A response task finished.
    HandlerDone(ConnId, Outcome),
}


/// The phase a connection is in. A connection is owned by exactly one
/// variant at any time; dispatch replaces `Framing` with `Handling` in place.
#[derive(Debug)]
enum Slot<W> {
    Framing { framer: Framer, reader: Reader, writer: W },
    Handling(ResponseHandler<W>),
}

impl<W> Slot<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Releases every resource of the connection.
    fn close(self) {
        match self {
            Self::Framing { reader, writer, .. } => {
                reader.stop();
                drop(writer);
            },
            Self::Handling(mut handler) => {
                handler.end();
            },
        }
    }
}


/// The connection table of a running server.
///
/// A [`Core`] is owned by a single task, which feeds it accepted
/// connections and [`Event`]s. No other task touches the table.
pub(crate) struct Core<W> {
    conns: BTreeMap<ConnId, Slot<W>>,
    handling: usize,
    next_id: u64,
    limits: Limits,
    read_chunk: NonZeroUsize,
    read_timeout: Option<Duration>,
    responder: Arc<dyn Responder>,
    events: mpsc::UnboundedSender<Event>,
}

impl<W> Core<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        config: &Config,
        responder: Arc<dyn Responder>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            conns: BTreeMap::new(),
            handling: 0,
            next_id: 0,
            limits: Limits::from(config),
            read_chunk: config.read_chunk,
            read_timeout: config.read_timeout,
            responder,
            events,
        }
    }

    /// Registers a newly accepted connection for framing and starts reading
    /// from it.
    pub(crate) fn accept<R>(&mut self, input: R, writer: W) -> ConnId
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let id = ConnId::new(self.next_id);
        self.next_id += 1;

        let reader =
            Reader::spawn(id, input, self.read_chunk, self.read_timeout, self.events.clone());
        let framer = Framer::new(self.limits);
        self.conns.insert(id, Slot::Framing { framer, reader, writer });
        id
    }

    pub(crate) fn handle(&mut self, event: Event) {
        match event {
            Event::Data(id, data) => self.drive(id, |framer| framer.feed(&data)),
            Event::Closed(id) => self.drive(id, Framer::close),
            Event::ReadFailed(id, e) => {
                let error: &dyn std::error::Error = &*e;
                tracing::info!(conn = %id, error, "reading from connection failed");
                self.drive(id, Framer::close);
            },
            Event::TimedOut(id) => self.drive(id, |framer| framer.abort(parser::Error::TimedOut)),
            Event::HandlerDone(id, outcome) => {
                tracing::trace!(conn = %id, written = outcome.is_written(), "handler done");
                self.close_handler(id);
            },
        }
    }

    /// Runs `f` on the framer of a connection and acts on its [`Action`].
    /// Connections that are not being framed (anymore) are ignored.
    fn drive(&mut self, id: ConnId, f: impl FnOnce(&mut Framer) -> Action) {
        let Some(Slot::Framing { framer, reader, .. }) = self.conns.get_mut(&id) else {
            trace!(conn = %id, "ignoring event for connection outside of framing");
            return;
        };

        match f(framer) {
            Action::NeedMoreData => reader.rearm(),
            Action::Dispatch(message) => self.dispatch(id, message),
            Action::Abort(reason) => {
                let error: &dyn std::error::Error = &reason;
                tracing::info!(conn = %id, error, "connection aborted");
                self.remove(id);
            },
        }
    }

    /// Hands the connection over to a new [`ResponseHandler`] and starts it.
    fn dispatch(&mut self, id: ConnId, message: crate::Message) {
        let Some(slot) = self.conns.get_mut(&id) else {
            return;
        };
        tracing::debug!(
            conn = %id,
            headers = message.headers().len(),
            body = message.body().len(),
            "request dispatched",
        );

        let responder = self.responder.clone();
        let events = self.events.clone();
        let mut dispatched = false;
        replace_with::replace_with_or_abort(slot, |slot| match slot {
            Slot::Framing { reader, writer, .. } => {
                reader.stop();
                let mut handler = ResponseHandler::new(id, message, writer);
                handler.start(responder, move |id, outcome| {
                    // The event loop is gone during shutdown, which ends us anyway
                    drop(events.send(Event::HandlerDone(id, outcome)));
                });
                dispatched = true;
                Slot::Handling(handler)
            },
            handling @ Slot::Handling(_) => handling,
        });
        if dispatched {
            self.handling += 1;
        }
    }

    /// Ends the handler of a connection and forgets the connection.
    ///
    /// Returns `false` (and does nothing) if the connection has no handler,
    /// either because it is still being framed or because it is already gone.
    pub(crate) fn close_handler(&mut self, id: ConnId) -> bool {
        if !matches!(self.conns.get(&id), Some(Slot::Handling(_))) {
            return false;
        }
        self.remove(id);
        true
    }

    fn remove(&mut self, id: ConnId) {
        let Some(slot) = self.conns.remove(&id) else {
            return;
        };
        if matches!(slot, Slot::Handling(_)) {
            self.handling -= 1;
        }
        slot.close();
    }

    /// Closes all connections, cancelling in-flight responses.
    pub(crate) fn shutdown(&mut self) {
        let stats = self.stats();
        for slot in std::mem::take(&mut self.conns).into_values() {
            slot.close();
        }
        self.handling = 0;
        tracing::debug!(framing = stats.framing, handling = stats.handling, "connections closed");
    }

    #[must_use]
    pub(crate) fn stats(&self) -> Stats {
        Stats {
            framing: self.conns.len() - self.handling,
            handling: self.handling,
            accepted: self.next_id,
        }
    }
}


#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::handler::EchoResponder;
    use crate::protocol::test_support::{SCENARIO, SCENARIO_ECHO as ECHO};

    type TestCore = Core<WriteHalf<DuplexStream>>;

    fn core(responder: Arc<dyn Responder>) -> (TestCore, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Core::new(&Config::default(), responder, tx), rx)
    }

    /// Accepts a connection whose peer never writes, so all input is
    /// injected through synthetic events.
    fn connect(core: &mut TestCore, buffer: usize) -> (ConnId, DuplexStream) {
        let (client, server) = tokio::io::duplex(buffer);
        let (input, output): (ReadHalf<_>, WriteHalf<_>) = tokio::io::split(server);
        (core.accept(input, output), client)
    }

    async fn read_all(mut client: DuplexStream) -> Vec<u8> {
        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        got
    }

    #[track_caller]
    fn check_stats(core: &TestCore, framing: usize, handling: usize) {
        let stats = core.stats();
        assert_eq!((stats.framing, stats.handling), (framing, handling), "{stats:?}");
    }

    #[tokio::test]
    async fn dispatch_and_retire() {
        let (mut core, mut rx) = core(Arc::new(EchoResponder));
        let (id, client) = connect(&mut core, 1024);
        check_stats(&core, 1, 0);

        core.handle(Event::Data(id, SCENARIO[..13].to_vec()));
        check_stats(&core, 1, 0);
        core.handle(Event::Data(id, SCENARIO[13..].to_vec()));
        check_stats(&core, 0, 1);

        // Late input for a dispatched connection is ignored
        core.handle(Event::Data(id, b"trailing".to_vec()));
        core.handle(Event::Closed(id));
        check_stats(&core, 0, 1);

        match rx.recv().await.unwrap() {
            Event::HandlerDone(done, outcome) => {
                assert_eq!(done, id);
                assert!(outcome.is_written());
                core.handle(Event::HandlerDone(done, outcome));
            },
            e => panic!("unexpected event {e:?}"),
        }
        check_stats(&core, 0, 0);
        assert_eq!(core.stats().accepted, 1);
        assert_eq!(read_all(client).await, ECHO);
    }

    #[tokio::test]
    async fn closed_while_awaiting_length() {
        let (mut core, _rx) = core(Arc::new(EchoResponder));
        let (id, client) = connect(&mut core, 1024);

        core.handle(Event::Closed(id));
        check_stats(&core, 0, 0);
        assert!(read_all(client).await.is_empty());

        // Nothing left to touch
        assert!(!core.close_handler(id));
        core.handle(Event::Closed(id));
        core.shutdown();
        check_stats(&core, 0, 0);
    }

    #[tokio::test]
    async fn abort_reasons() {
        let (mut core, _rx) = core(Arc::new(EchoResponder));
        let events = [
            Event::Data(ConnId::new(0), b"abc:".to_vec()),
            Event::Data(ConnId::new(1), b"9:foo\0bar\0\0,".to_vec()),
            Event::TimedOut(ConnId::new(2)),
            Event::ReadFailed(ConnId::new(3), Arc::new(io::ErrorKind::ConnectionReset.into())),
        ];

        let mut clients = Vec::new();
        for event in events {
            let (_, client) = connect(&mut core, 1024);
            clients.push(client);
            core.handle(event);
        }
        check_stats(&core, 0, 0);
        for client in clients {
            assert!(read_all(client).await.is_empty());
        }
    }

    #[tokio::test]
    async fn isolation() {
        let (mut core, mut rx) = core(Arc::new(EchoResponder));
        let (a, client_a) = connect(&mut core, 1024);
        let (b, client_b) = connect(&mut core, 1024);

        core.handle(Event::Data(b, SCENARIO[..5].to_vec()));
        core.handle(Event::Data(a, b"abc:".to_vec()));
        core.handle(Event::Data(b, SCENARIO[5..].to_vec()));
        check_stats(&core, 0, 1);

        let Event::HandlerDone(done, outcome) = rx.recv().await.unwrap() else {
            panic!("expected the handler of b to finish");
        };
        assert_eq!(done, b);
        core.handle(Event::HandlerDone(done, outcome));

        assert!(read_all(client_a).await.is_empty());
        assert_eq!(read_all(client_b).await, ECHO);
    }

    #[tokio::test]
    async fn close_handler_is_idempotent() {
        let (mut core, _rx) = core(Arc::new(EchoResponder));
        // The response does not fit into the pipe, so the handler stays busy
        let (id, client) = connect(&mut core, 8);
        core.handle(Event::Data(id, SCENARIO.to_vec()));
        check_stats(&core, 0, 1);

        assert!(core.close_handler(id));
        check_stats(&core, 0, 0);
        assert!(!core.close_handler(id));
        assert!(!core.close_handler(ConnId::new(42)));

        // A completion racing with the close is harmless
        core.handle(Event::HandlerDone(id, Outcome::Written(0)));
        check_stats(&core, 0, 0);

        let got = read_all(client).await;
        assert!(got.len() < ECHO.len());
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let (mut core, _rx) = core(Arc::new(EchoResponder));
        let (framing, framing_client) = connect(&mut core, 1024);
        let (handling, handling_client) = connect(&mut core, 8);
        core.handle(Event::Data(framing, b"24:CONT".to_vec()));
        core.handle(Event::Data(handling, SCENARIO.to_vec()));
        check_stats(&core, 1, 1);

        core.shutdown();
        check_stats(&core, 0, 0);
        assert!(read_all(framing_client).await.is_empty());
        assert!(read_all(handling_client).await.len() < ECHO.len());

        // Events still queued for closed connections are dropped
        core.handle(Event::Data(framing, b"RAW".to_vec()));
        core.handle(Event::HandlerDone(handling, Outcome::Written(0)));
        check_stats(&core, 0, 0);
        assert_eq!(core.stats().accepted, 2);
    }
}
