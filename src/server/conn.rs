use std::io;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::table::Event;
use super::ConnId;
use crate::macros::trace;


/// The readable end of a connection that is still being framed.
///
/// The reader task delivers one chunk per [`Event::Data`] and then waits
/// until it is re-armed. It stops on its own after reporting end of input,
/// a read failure or a timeout.
#[derive(Debug)]
pub(crate) struct Reader {
    task: JoinHandle<()>,
    rearm: Arc<Notify>,
}

impl Reader {
    /// Spawns the reader task for a freshly accepted connection.
    pub(crate) fn spawn<R>(
        id: ConnId,
        input: R,
        chunk: NonZeroUsize,
        timeout: Option<Duration>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let rearm = Arc::new(Notify::new());
        let span = tracing::error_span!("scgi_connection", conn = %id);
        let task = tokio::spawn(
            read_loop(id, input, chunk, timeout, events, rearm.clone()).instrument(span),
        );
        Self { task, rearm }
    }

    /// Allows the reader to deliver the next chunk.
    #[inline]
    pub(crate) fn rearm(&self) {
        self.rearm.notify_one();
    }

    /// Stops reading and releases the readable end.
    #[inline]
    pub(crate) fn stop(self) {
        self.task.abort();
    }
}


async fn read_loop<R>(
    id: ConnId,
    mut input: R,
    chunk: NonZeroUsize,
    timeout: Option<Duration>,
    events: mpsc::UnboundedSender<Event>,
    rearm: Arc<Notify>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0; chunk.get()];
    loop {
        let read = match timeout {
            Some(t) => tokio::time::timeout(t, input.read(&mut buf)).await,
            None => Ok(input.read(&mut buf).await),
        };
        let event = match read {
            Ok(Ok(0)) => Event::Closed(id),
            Ok(Ok(n)) => {
                trace!(bytes = n, "read from connection");
                Event::Data(id, buf[..n].to_vec())
            },
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => Event::ReadFailed(id, Arc::new(e)),
            Err(_) => Event::TimedOut(id),
        };

        let last = !matches!(event, Event::Data(..));
        if events.send(event).is_err() || last {
            // Either the event loop is gone or the connection is done
            return;
        }
        rearm.notified().await;
    }
}


#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, DuplexStream};

    use super::*;

    type Events = mpsc::UnboundedReceiver<Event>;

    fn spawn(input: DuplexStream, timeout: Option<Duration>) -> (Reader, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        let chunk = NonZeroUsize::new(4).unwrap();
        (Reader::spawn(ConnId::new(9), input, chunk, timeout, tx), rx)
    }

    #[tokio::test]
    async fn waits_for_rearm() {
        let (mut client, server) = tokio::io::duplex(64);
        let (reader, mut rx) = spawn(server, None);
        client.write_all(b"24:CONTENT").await.unwrap();

        match rx.recv().await.unwrap() {
            Event::Data(id, data) => {
                assert_eq!(id, ConnId::new(9));
                assert_eq!(data, b"24:C");
            },
            e => panic!("unexpected event {e:?}"),
        }
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "reader must wait until re-armed");

        reader.rearm();
        assert!(matches!(rx.recv().await.unwrap(), Event::Data(_, d) if d == b"ONTE"));
        reader.rearm();
        assert!(matches!(rx.recv().await.unwrap(), Event::Data(_, d) if d == b"NT"));

        drop(client);
        reader.rearm();
        assert!(matches!(rx.recv().await.unwrap(), Event::Closed(_)));
        // The task ended, so the channel closes
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn times_out() {
        let (_client, server) = tokio::io::duplex(64);
        let (_reader, mut rx) = spawn(server, Some(Duration::from_millis(20)));
        assert!(matches!(rx.recv().await.unwrap(), Event::TimedOut(_)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stop_releases_input() {
        let (mut client, server) = tokio::io::duplex(64);
        let (reader, mut rx) = spawn(server, None);
        reader.stop();

        assert!(rx.recv().await.is_none());
        let err = client.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
