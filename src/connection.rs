//! One duplex messaging session over a connected pipe stream.
//!
//! A `Connection` owns its stream and, once opened, two background
//! loops:
//!
//! - the read loop turns incoming frames into `Message` events until
//!   end-of-stream or a fatal error;
//! - the write loop drains a FIFO queue of outbound messages, encoding
//!   and writing one frame per message.
//!
//! The queue is an mpsc channel: the channel is the thread-safe FIFO
//! *and* the wake signal, so producers on any thread push without
//! blocking and the write loop sleeps in `recv()` between bursts.
//!
//! Closing shuts the socket down both ways and drops the queue sender,
//! which unblocks both loops. The `Disconnected` event fires exactly
//! once, from the read loop's exit path; because the read loop is also
//! the thread that delivers `Message` events, `Disconnected` is always
//! observed after the last message from this connection. The write
//! loop's completion is swallowed by the same one-shot latch.

use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::framing;
use crate::worker::Worker;

/// Events a connection reports to its owner (server bridge or client
/// monitor). The `id` routes the event back to the session.
#[derive(Debug)]
pub(crate) enum ConnEvent<R> {
    /// A decoded inbound message.
    Message { id: u32, msg: R },
    /// The session is over. Fires exactly once per connection.
    Disconnected { id: u32 },
    /// A loop hit an error. Recoverable codec errors leave the
    /// connection open; anything else is followed by `Disconnected`.
    Error { id: u32, error: Error },
    /// The owning component is going away; the consumer loop must
    /// exit even though live senders may remain.
    Shutdown,
}

struct Inner<R, W, C> {
    id: u32,
    name: String,
    /// Kept for shutdown; the loops own their own clones.
    stream: UnixStream,
    codec: Arc<C>,
    events: Sender<ConnEvent<R>>,
    /// FIFO send queue. `None` once the connection is closing, so late
    /// sends become no-ops instead of queueing into the void.
    outbound: Mutex<Option<Sender<W>>>,
    /// Consumed by `open`; present only between `new` and `open`.
    queue_rx: Mutex<Option<Receiver<W>>>,
    opened: AtomicBool,
    connected: AtomicBool,
    disconnect_reported: AtomicBool,
}

impl<R, W, C> Inner<R, W, C> {
    /// Idempotent teardown: stop accepting sends, then shut the socket
    /// down so both loops unblock.
    fn close(&self) {
        self.outbound
            .lock()
            .expect("outbound queue mutex poisoned")
            .take();
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.stream.shutdown(Shutdown::Both);
            log::debug!("[conn {}] closed", self.id);
        }
    }
}

/// Handle to one session. Cheap to clone; all clones refer to the same
/// stream, queue, and loops.
pub struct Connection<R, W, C> {
    inner: Arc<Inner<R, W, C>>,
}

impl<R, W, C> Clone for Connection<R, W, C> {
    fn clone(&self) -> Self {
        Connection {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, W, C> std::fmt::Debug for Connection<R, W, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl<R, W, C> Connection<R, W, C>
where
    R: Send + 'static,
    W: Send + 'static,
    C: Codec<R> + Codec<W>,
{
    /// Wrap a connected stream. The loops do not run until [`open`].
    ///
    /// [`open`]: Connection::open
    pub(crate) fn new(
        id: u32,
        name: String,
        stream: UnixStream,
        codec: Arc<C>,
        events: Sender<ConnEvent<R>>,
    ) -> Connection<R, W, C> {
        let (queue_tx, queue_rx) = mpsc::channel::<W>();
        Connection {
            inner: Arc::new(Inner {
                id,
                name,
                stream,
                codec,
                events,
                outbound: Mutex::new(Some(queue_tx)),
                queue_rx: Mutex::new(Some(queue_rx)),
                opened: AtomicBool::new(false),
                connected: AtomicBool::new(true),
                disconnect_reported: AtomicBool::new(false),
            }),
        }
    }

    /// Start the read and write loops. Call once.
    pub(crate) fn open(&self) -> Result<()> {
        if self.inner.opened.swap(true, Ordering::SeqCst) {
            return Err(Error::Lifecycle("connection is already open"));
        }
        let queue_rx = self
            .inner
            .queue_rx
            .lock()
            .expect("queue receiver mutex poisoned")
            .take()
            .ok_or(Error::Lifecycle("connection queue already consumed"))?;
        let read_stream = self.inner.stream.try_clone()?;
        let write_stream = self.inner.stream.try_clone()?;
        let id = self.inner.id;

        {
            let job_inner = Arc::clone(&self.inner);
            let done_inner = Arc::clone(&self.inner);
            Worker::spawn(
                &format!("pipehub-conn-{id}-read"),
                move || read_loop(&job_inner, read_stream),
                move |result| {
                    finish_loop(&done_inner, result);
                    // The read loop is the one place Disconnected comes
                    // from, so it stays ordered after the last Message.
                    if !done_inner.disconnect_reported.swap(true, Ordering::SeqCst) {
                        let _ = done_inner
                            .events
                            .send(ConnEvent::Disconnected { id: done_inner.id });
                    }
                },
            )?;
        }

        {
            let job_inner = Arc::clone(&self.inner);
            let done_inner = Arc::clone(&self.inner);
            Worker::spawn(
                &format!("pipehub-conn-{id}-write"),
                move || write_loop(&job_inner, write_stream, queue_rx),
                move |result| finish_loop(&done_inner, result),
            )?;
        }

        Ok(())
    }
}

impl<R, W, C> Connection<R, W, C> {
    /// Server-assigned session id, unique for the server's lifetime.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Human-readable session name (`"Client <id>"`).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the session is still open. Once false, stays false.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Queue a message for the write loop. Never blocks.
    ///
    /// Returns false when the connection is closing and the message was
    /// dropped.
    pub fn send(&self, msg: W) -> bool {
        match &*self
            .inner
            .outbound
            .lock()
            .expect("outbound queue mutex poisoned")
        {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Tear the session down. Both loops exit and `Disconnected` fires
    /// (once) if the loops were started.
    pub fn close(&self) {
        self.inner.close();
    }
}

/// Common exit path for both loops: report a genuine failure, then make
/// sure the peer loop unblocks too.
fn finish_loop<R, W, C>(inner: &Inner<R, W, C>, result: Result<()>) {
    if let Err(error) = result {
        // Errors caused by our own shutdown (reads and writes on an
        // already-closed socket) are noise, not news.
        if inner.connected.load(Ordering::SeqCst) {
            log::warn!("[conn {}] loop failed: {error}", inner.id);
            let _ = inner.events.send(ConnEvent::Error {
                id: inner.id,
                error,
            });
        } else {
            log::debug!("[conn {}] loop ended during close: {error}", inner.id);
        }
    }
    inner.close();
}

/// Frames in, `Message` events out, until EOF or a fatal error.
///
/// A recoverable codec failure drops the frame, reports an `Error`
/// event, and keeps reading; frame boundaries make that safe.
fn read_loop<R, W, C>(inner: &Inner<R, W, C>, mut stream: UnixStream) -> Result<()>
where
    R: Send + 'static,
    W: Send + 'static,
    C: Codec<R> + Codec<W>,
{
    loop {
        match framing::read_frame(&mut stream) {
            Ok(Some(payload)) => match <C as Codec<R>>::decode(&inner.codec, &payload) {
                Ok(msg) => {
                    if inner
                        .events
                        .send(ConnEvent::Message { id: inner.id, msg })
                        .is_err()
                    {
                        // Nobody is listening anymore.
                        return Ok(());
                    }
                }
                Err(error) if error.is_recoverable() => {
                    log::warn!("[conn {}] dropping undecodable frame: {error}", inner.id);
                    let _ = inner.events.send(ConnEvent::Error {
                        id: inner.id,
                        error,
                    });
                }
                Err(error) => return Err(error),
            },
            Ok(None) => {
                log::debug!("[conn {}] end of stream", inner.id);
                return Ok(());
            }
            Err(error) => return Err(error),
        }
    }
}

/// Drains the send queue, one frame per message, blocking in `recv`
/// while the queue is empty. Ends when the queue sender is dropped
/// (close) or a write fails.
fn write_loop<R, W, C>(
    inner: &Inner<R, W, C>,
    mut stream: UnixStream,
    queue: Receiver<W>,
) -> Result<()>
where
    R: Send + 'static,
    W: Send + 'static,
    C: Codec<R> + Codec<W>,
{
    for msg in queue {
        let bytes = match <C as Codec<W>>::encode(&inner.codec, &msg) {
            Ok(bytes) => bytes,
            Err(error) => {
                // An unencodable message is the sender's bug, not a
                // reason to kill the session.
                log::warn!("[conn {}] dropping unencodable message: {error}", inner.id);
                let _ = inner.events.send(ConnEvent::Error {
                    id: inner.id,
                    error,
                });
                continue;
            }
        };
        framing::write_frame(&mut stream, &bytes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Json;
    use std::time::Duration;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

    fn open_pair() -> (
        Connection<String, String, Json>,
        UnixStream,
        Receiver<ConnEvent<String>>,
    ) {
        let (local, remote) = UnixStream::pair().unwrap();
        let (tx, rx) = mpsc::channel();
        let conn = Connection::new(1, "Client 1".to_owned(), local, Arc::new(Json), tx);
        conn.open().unwrap();
        (conn, remote, rx)
    }

    #[test]
    fn inbound_frames_become_message_events() {
        let (conn, mut remote, rx) = open_pair();
        let payload = Json.encode(&"hello".to_string()).unwrap();
        framing::write_frame(&mut remote, &payload).unwrap();

        match rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
            ConnEvent::Message { id, msg } => {
                assert_eq!(id, 1);
                assert_eq!(msg, "hello");
            }
            other => panic!("expected Message, got {other:?}"),
        }
        conn.close();
    }

    #[test]
    fn send_writes_one_frame_per_message() {
        let (conn, mut remote, _rx) = open_pair();
        assert!(conn.send("out".to_string()));

        let payload = framing::read_frame(&mut remote).unwrap().unwrap();
        let msg: String = Json.decode(&payload).unwrap();
        assert_eq!(msg, "out");
        conn.close();
    }

    #[test]
    fn messages_arrive_in_push_order() {
        let (conn, mut remote, _rx) = open_pair();
        for i in 0..50 {
            assert!(conn.send(format!("msg-{i}")));
        }
        for i in 0..50 {
            let payload = framing::read_frame(&mut remote).unwrap().unwrap();
            let msg: String = Json.decode(&payload).unwrap();
            assert_eq!(msg, format!("msg-{i}"));
        }
        conn.close();
    }

    #[test]
    fn open_twice_is_a_lifecycle_error() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let (tx, _rx) = mpsc::channel::<ConnEvent<String>>();
        let conn: Connection<String, String, Json> =
            Connection::new(1, "Client 1".to_owned(), local, Arc::new(Json), tx);
        conn.open().unwrap();
        assert!(matches!(conn.open(), Err(Error::Lifecycle(_))));
        conn.close();
    }

    #[test]
    fn peer_eof_fires_disconnected_exactly_once() {
        let (conn, remote, rx) = open_pair();
        drop(remote);

        match rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
            ConnEvent::Disconnected { id } => assert_eq!(id, 1),
            other => panic!("expected Disconnected, got {other:?}"),
        }
        // No second Disconnected from the write loop's completion.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(!conn.is_connected());
    }

    #[test]
    fn close_unblocks_the_loops_and_reports_disconnect() {
        let (conn, _remote, rx) = open_pair();
        conn.close();

        match rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
            ConnEvent::Disconnected { id } => assert_eq!(id, 1),
            other => panic!("expected Disconnected, got {other:?}"),
        }
        assert!(!conn.is_connected());
        assert!(!conn.send("late".to_string()), "send after close is a no-op");
    }

    #[test]
    fn undecodable_frame_reports_error_but_keeps_the_session() {
        let (conn, mut remote, rx) = open_pair();
        framing::write_frame(&mut remote, b"{definitely not json").unwrap();

        match rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
            ConnEvent::Error { id, error } => {
                assert_eq!(id, 1);
                assert!(error.is_recoverable(), "got: {error}");
            }
            other => panic!("expected Error, got {other:?}"),
        }

        // The session survived: a valid frame still comes through.
        let payload = Json.encode(&"still here".to_string()).unwrap();
        framing::write_frame(&mut remote, &payload).unwrap();
        match rx.recv_timeout(EVENT_TIMEOUT).unwrap() {
            ConnEvent::Message { msg, .. } => assert_eq!(msg, "still here"),
            other => panic!("expected Message, got {other:?}"),
        }
        assert!(conn.is_connected());
        conn.close();
    }

    #[test]
    fn torn_frame_tears_the_session_down() {
        use std::io::Write;

        let (conn, mut remote, rx) = open_pair();
        // A header promising more bytes than ever arrive.
        remote.write_all(&100u32.to_le_bytes()).unwrap();
        remote.write_all(b"short").unwrap();
        drop(remote);

        let mut saw_error = false;
        let mut saw_disconnect = false;
        while let Ok(event) = rx.recv_timeout(EVENT_TIMEOUT) {
            match event {
                ConnEvent::Error { error, .. } => {
                    assert!(matches!(error, Error::Protocol(_)), "got: {error}");
                    saw_error = true;
                }
                ConnEvent::Disconnected { .. } => {
                    saw_disconnect = true;
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_error, "protocol error should be reported");
        assert!(saw_disconnect, "protocol error should close the session");
        assert!(!conn.is_connected());
    }
}
