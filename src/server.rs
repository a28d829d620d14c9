//! The connection-multiplexing pipe server.
//!
//! One well-known pipe name serves any number of clients. The listener
//! accepts a client on the well-known pipe, writes it the name of a
//! freshly allocated private pipe, hangs up, and awaits the client
//! there; the private pipe then carries the whole session. The
//! well-known pipe never carries messages, so sessions cannot
//! interleave on it.
//!
//! Every accepted session becomes a [`Connection`] tracked in a
//! mutex-guarded registry keyed by id. A bridge loop converts
//! connection events into [`ServerEvent`]s on the channel the caller
//! supplied at construction and prunes the registry on disconnects.
//!
//! Shutdown has to unblock a listener parked in accept; a flag alone
//! cannot do that. `stop` runs a throwaway client handshake against the
//! well-known name to push the listener through one last iteration,
//! then joins it.

use std::collections::HashMap;
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::codec::{Codec, Json};
use crate::connection::{ConnEvent, Connection};
use crate::constants::{DEFAULT_SOCKET_MODE, HANDSHAKE_ACCEPT_TIMEOUT, STOP_WAKE_TIMEOUT};
use crate::endpoint::{self, PipeName};
use crate::error::{Error, Result};
use crate::framing;
use crate::worker::Worker;

/// Pause before retrying after a failed accept on the well-known pipe.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Events a server delivers on its caller-provided channel.
#[derive(Debug)]
pub enum ServerEvent<R> {
    /// A client completed the handshake and its session is registered.
    ClientConnected {
        /// Session id, assigned in accept order starting at 1.
        id: u32,
        /// Session name, `"Client <id>"`.
        name: String,
    },
    /// A session ended. For a session that never fully established,
    /// this still fires with the id allocated during the handshake.
    ClientDisconnected {
        /// Session id.
        id: u32,
    },
    /// A message arrived from a client.
    Message {
        /// Sender's session id.
        id: u32,
        /// Sender's session name.
        name: String,
        /// The decoded message.
        msg: R,
    },
    /// Something failed. `id` is present when the failure belongs to
    /// one session; absent for listener-level failures.
    Error {
        /// Session the error belongs to, if any.
        id: Option<u32>,
        /// The failure.
        error: Error,
    },
}

struct Shared<R, W, C> {
    registry: Mutex<HashMap<u32, Connection<R, W, C>>>,
    /// Feeds both session ids and private pipe names.
    next_pipe_id: AtomicU32,
    should_keep_running: AtomicBool,
    is_running: AtomicBool,
}

/// A multi-client message server on a well-known pipe name.
///
/// Generic over the inbound message type `R`, the outbound type `W`,
/// and the codec (JSON by default). Events are delivered on the
/// `mpsc::Sender` given to the constructor; the caller drains the
/// matching receiver wherever it wants callbacks to run.
pub struct Server<R, W, C = Json> {
    pipe: PipeName,
    mode: u32,
    codec: Arc<C>,
    events: Sender<ServerEvent<R>>,
    shared: Arc<Shared<R, W, C>>,
    /// Master clone of the bridge input; dropped on stop so the bridge
    /// can drain and exit.
    conn_tx: Mutex<Option<Sender<ConnEvent<R>>>>,
    listener: Mutex<Option<Worker>>,
    bridge: Mutex<Option<Worker>>,
}

impl<R, W, C> Server<R, W, C>
where
    R: Send + 'static,
    W: Send + 'static,
    C: Codec<R> + Codec<W>,
{
    /// A server with the default codec. Does not touch the filesystem
    /// until [`start`].
    ///
    /// [`start`]: Server::start
    pub fn new(pipe: PipeName, events: Sender<ServerEvent<R>>) -> Server<R, W, C>
    where
        C: Default,
    {
        Self::with_codec(pipe, events, C::default())
    }

    /// A server with an explicit codec value.
    pub fn with_codec(pipe: PipeName, events: Sender<ServerEvent<R>>, codec: C) -> Server<R, W, C> {
        Server {
            pipe,
            mode: DEFAULT_SOCKET_MODE,
            codec: Arc::new(codec),
            events,
            shared: Arc::new(Shared {
                registry: Mutex::new(HashMap::new()),
                next_pipe_id: AtomicU32::new(0),
                should_keep_running: AtomicBool::new(false),
                is_running: AtomicBool::new(false),
            }),
            conn_tx: Mutex::new(None),
            listener: Mutex::new(None),
            bridge: Mutex::new(None),
        }
    }

    /// Set the permission bits applied to the server's socket files.
    /// Defaults to owner-only (0600).
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Spawn the listener and start accepting clients.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lifecycle`] if the server is already running.
    /// Listener failures after this returns (a bind error, for example)
    /// surface as a [`ServerEvent::Error`] with no session id.
    pub fn start(&self) -> Result<()> {
        {
            let listener = self.listener.lock().expect("listener mutex poisoned");
            if listener.is_some() || self.shared.is_running.load(Ordering::SeqCst) {
                return Err(Error::Lifecycle("server is already running"));
            }
        }
        self.shared.should_keep_running.store(true, Ordering::SeqCst);

        let (conn_tx, conn_rx) = mpsc::channel::<ConnEvent<R>>();
        *self.conn_tx.lock().expect("conn_tx mutex poisoned") = Some(conn_tx.clone());

        let bridge_shared = Arc::clone(&self.shared);
        let bridge_events = self.events.clone();
        let bridge = Worker::spawn(
            "pipehub-server-bridge",
            move || {
                bridge_loop(&bridge_shared, conn_rx, &bridge_events);
                Ok(())
            },
            |_| {},
        )?;
        *self.bridge.lock().expect("bridge mutex poisoned") = Some(bridge);

        let pipe = self.pipe.clone();
        let mode = self.mode;
        let codec = Arc::clone(&self.codec);
        let events = self.events.clone();
        let shared = Arc::clone(&self.shared);
        let done_shared = Arc::clone(&self.shared);
        let done_events = self.events.clone();
        let listener = Worker::spawn(
            "pipehub-server-listener",
            move || listen_sync(&pipe, mode, &codec, &shared, &conn_tx, &events),
            move |result| {
                done_shared.is_running.store(false, Ordering::SeqCst);
                if let Err(error) = result {
                    log::error!("[server] listener failed: {error}");
                    let _ = done_events.send(ServerEvent::Error { id: None, error });
                }
            },
        );
        match listener {
            Ok(worker) => {
                *self.listener.lock().expect("listener mutex poisoned") = Some(worker);
                Ok(())
            }
            Err(error) => {
                // Roll back so a later start can try again.
                self.shared.should_keep_running.store(false, Ordering::SeqCst);
                self.conn_tx.lock().expect("conn_tx mutex poisoned").take();
                if let Some(bridge) = self.bridge.lock().expect("bridge mutex poisoned").take() {
                    bridge.join();
                }
                Err(error)
            }
        }
    }

    /// Queue `msg` to every connected client. Returns how many sessions
    /// accepted it. Never blocks.
    pub fn broadcast(&self, msg: W) -> usize
    where
        W: Clone,
    {
        let registry = self.shared.registry.lock().expect("registry mutex poisoned");
        let mut delivered = 0;
        for conn in registry.values() {
            if conn.send(msg.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Queue `msg` to the session with `id`. Returns false if no such
    /// session is registered.
    pub fn send_to_id(&self, msg: W, id: u32) -> bool {
        self.shared
            .registry
            .lock()
            .expect("registry mutex poisoned")
            .get(&id)
            .is_some_and(|conn| conn.send(msg))
    }

    /// Queue `msg` to each session whose id appears in `ids`.
    pub fn send_to_ids(&self, msg: W, ids: &[u32]) -> usize
    where
        W: Clone,
    {
        let registry = self.shared.registry.lock().expect("registry mutex poisoned");
        let mut delivered = 0;
        for id in ids {
            if let Some(conn) = registry.get(id) {
                if conn.send(msg.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Queue `msg` to the first session named `name`.
    pub fn send_to_name(&self, msg: W, name: &str) -> bool {
        self.shared
            .registry
            .lock()
            .expect("registry mutex poisoned")
            .values()
            .find(|conn| conn.name() == name)
            .is_some_and(|conn| conn.send(msg))
    }

    /// Queue `msg` to each session whose name appears in `names`.
    pub fn send_to_names(&self, msg: W, names: &[&str]) -> usize
    where
        W: Clone,
    {
        let registry = self.shared.registry.lock().expect("registry mutex poisoned");
        let mut delivered = 0;
        for conn in registry.values() {
            if names.contains(&conn.name()) && conn.send(msg.clone()) {
                delivered += 1;
            }
        }
        delivered
    }
}

impl<R, W, C> Server<R, W, C> {
    /// Stop accepting, close every session, and wait for the listener
    /// and bridge to exit. Returns within a few seconds even if no
    /// client ever connected.
    pub fn stop(&self) {
        self.shared.should_keep_running.store(false, Ordering::SeqCst);

        // Close live sessions first so their loops wind down while the
        // listener is being dealt with.
        let connections: Vec<_> = {
            let mut registry = self.shared.registry.lock().expect("registry mutex poisoned");
            registry.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.close();
        }

        // A listener parked in accept cannot observe the flag; wake it
        // with a throwaway handshake.
        if self.shared.is_running.load(Ordering::SeqCst) {
            if let Err(error) = wake_listener(&self.pipe) {
                log::debug!("[server] shutdown wake-up: {error}");
            }
        }
        if let Some(worker) = self.listener.lock().expect("listener mutex poisoned").take() {
            worker.join();
        }

        // The wake-up registers a short-lived session; sweep anything
        // that arrived while we were shutting down.
        let stragglers: Vec<_> = {
            let mut registry = self.shared.registry.lock().expect("registry mutex poisoned");
            registry.drain().map(|(_, conn)| conn).collect()
        };
        for conn in stragglers {
            conn.close();
        }

        // Dropping the master bridge sender lets the bridge drain the
        // final disconnect events and exit.
        self.conn_tx.lock().expect("conn_tx mutex poisoned").take();
        if let Some(worker) = self.bridge.lock().expect("bridge mutex poisoned").take() {
            worker.join();
        }
        log::info!("[server] stopped");
    }

    /// Whether the listener loop is currently alive.
    pub fn is_running(&self) -> bool {
        self.shared.is_running.load(Ordering::SeqCst)
    }

    /// Number of live sessions in the registry.
    pub fn connection_count(&self) -> usize {
        self.shared
            .registry
            .lock()
            .expect("registry mutex poisoned")
            .len()
    }
}

impl<R, W, C> Drop for Server<R, W, C> {
    /// A dropped server shuts down like a stopped one; `stop` is
    /// idempotent, so an explicit stop beforehand costs nothing.
    fn drop(&mut self) {
        self.stop();
    }
}

impl<R, W, C> std::fmt::Debug for Server<R, W, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("pipe", &self.pipe.name())
            .field("running", &self.is_running())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

/// The listener loop: bind the well-known pipe, then run handshakes
/// until told to stop.
fn listen_sync<R, W, C>(
    pipe: &PipeName,
    mode: u32,
    codec: &Arc<C>,
    shared: &Arc<Shared<R, W, C>>,
    conn_tx: &Sender<ConnEvent<R>>,
    events: &Sender<ServerEvent<R>>,
) -> Result<()>
where
    R: Send + 'static,
    W: Send + 'static,
    C: Codec<R> + Codec<W>,
{
    shared.is_running.store(true, Ordering::SeqCst);
    let listener = endpoint::bind(pipe, mode)?;
    log::info!("[server] listening on pipe '{}'", pipe.name());

    while shared.should_keep_running.load(Ordering::SeqCst) {
        if let Err(error) = wait_for_connection(&listener, pipe, mode, codec, shared, conn_tx, events)
        {
            if !shared.should_keep_running.load(Ordering::SeqCst) {
                break;
            }
            log::error!("[server] accept failed: {error}");
            let _ = events.send(ServerEvent::Error { id: None, error });
            thread::sleep(ACCEPT_RETRY_DELAY);
        }
    }

    endpoint::cleanup(pipe);
    log::info!("[server] listener exiting");
    Ok(())
}

/// One handshake: allocate the private pipe, accept a client on the
/// well-known pipe, redirect it, and register the session.
///
/// Handshake failures are reported and absorbed so the listener keeps
/// accepting; only a failure of the well-known accept itself propagates.
fn wait_for_connection<R, W, C>(
    listener: &UnixListener,
    pipe: &PipeName,
    mode: u32,
    codec: &Arc<C>,
    shared: &Arc<Shared<R, W, C>>,
    conn_tx: &Sender<ConnEvent<R>>,
    events: &Sender<ServerEvent<R>>,
) -> Result<()>
where
    R: Send + 'static,
    W: Send + 'static,
    C: Codec<R> + Codec<W>,
{
    // The counter feeds both the session id and the private pipe name,
    // so neither can ever collide within this server.
    let id = shared.next_pipe_id.fetch_add(1, Ordering::SeqCst) + 1;
    let data_pipe = pipe.child(id)?;

    let (handshake, _addr) = listener.accept().map_err(Error::Transport)?;

    if let Err(error) = establish(id, &data_pipe, handshake, mode, codec, shared, conn_tx, events) {
        log::error!("[server] handshake for client {id} failed: {error}");
        endpoint::cleanup(&data_pipe);
        let _ = events.send(ServerEvent::Error {
            id: Some(id),
            error,
        });
        let _ = events.send(ServerEvent::ClientDisconnected { id });
    }
    Ok(())
}

/// Steps 3..7 of the handshake, after the well-known accept.
#[allow(clippy::too_many_arguments)]
fn establish<R, W, C>(
    id: u32,
    data_pipe: &PipeName,
    mut handshake: std::os::unix::net::UnixStream,
    mode: u32,
    codec: &Arc<C>,
    shared: &Arc<Shared<R, W, C>>,
    conn_tx: &Sender<ConnEvent<R>>,
    events: &Sender<ServerEvent<R>>,
) -> Result<()>
where
    R: Send + 'static,
    W: Send + 'static,
    C: Codec<R> + Codec<W>,
{
    // Bind the private pipe before the redirect goes out, so the name
    // exists by the time the client starts probing for it.
    let data_listener = endpoint::bind(data_pipe, mode)?;

    // Redirect the client onto its private pipe, then hang up; the
    // well-known pipe's only payload is this one frame.
    framing::write_frame(&mut handshake, data_pipe.name().as_bytes())?;
    drop(handshake);

    let stream = endpoint::accept_one(&data_listener, Instant::now() + HANDSHAKE_ACCEPT_TIMEOUT)?;
    drop(data_listener);
    // The accepted stream outlives its socket file.
    endpoint::cleanup(data_pipe);

    let name = format!("Client {id}");
    let conn = Connection::new(id, name.clone(), stream, Arc::clone(codec), conn_tx.clone());

    // Register and announce before the loops start, so no event for
    // this session can precede its ClientConnected, and the bridge's
    // disconnect pruning always finds the entry.
    shared
        .registry
        .lock()
        .expect("registry mutex poisoned")
        .insert(id, conn.clone());
    log::info!("[server] client {id} connected via '{}'", data_pipe.name());
    let _ = events.send(ServerEvent::ClientConnected { id, name });

    if let Err(error) = conn.open() {
        shared
            .registry
            .lock()
            .expect("registry mutex poisoned")
            .remove(&id);
        return Err(error);
    }
    Ok(())
}

/// Converts connection events into server events and prunes the
/// registry. Exits when every connection and the server itself have
/// dropped their senders.
fn bridge_loop<R, W, C>(
    shared: &Shared<R, W, C>,
    queue: Receiver<ConnEvent<R>>,
    events: &Sender<ServerEvent<R>>,
) {
    for event in queue {
        match event {
            ConnEvent::Message { id, msg } => {
                let name = shared
                    .registry
                    .lock()
                    .expect("registry mutex poisoned")
                    .get(&id)
                    .map(|conn| conn.name().to_owned())
                    .unwrap_or_else(|| format!("Client {id}"));
                let _ = events.send(ServerEvent::Message { id, name, msg });
            }
            ConnEvent::Disconnected { id } => {
                shared
                    .registry
                    .lock()
                    .expect("registry mutex poisoned")
                    .remove(&id);
                log::info!("[server] client {id} disconnected");
                let _ = events.send(ServerEvent::ClientDisconnected { id });
            }
            ConnEvent::Error { id, error } => {
                let _ = events.send(ServerEvent::Error {
                    id: Some(id),
                    error,
                });
            }
            ConnEvent::Shutdown => break,
        }
    }
}

/// The shutdown wake-up: a full throwaway handshake against the
/// well-known pipe.
///
/// It must complete the second stage too; a listener that already
/// redirected the wake-up is parked on the data-pipe accept and needs
/// the connect to land there. Every stage is deadline-bounded so `stop`
/// cannot hang on it.
fn wake_listener(pipe: &PipeName) -> Result<()> {
    let no_cancel = AtomicBool::new(false);
    let mut handshake = endpoint::wait_and_connect(
        pipe,
        Some(Instant::now() + STOP_WAKE_TIMEOUT),
        &no_cancel,
    )?;
    let payload = framing::read_frame(&mut handshake)?
        .ok_or_else(|| Error::Protocol("handshake pipe closed before the redirect".into()))?;
    let name = String::from_utf8(payload)
        .map_err(|_| Error::Protocol("redirect name is not valid UTF-8".into()))?;
    drop(handshake);

    let data_pipe = pipe.sibling(&name)?;
    let stream = endpoint::wait_and_connect(
        &data_pipe,
        Some(Instant::now() + STOP_WAKE_TIMEOUT),
        &no_cancel,
    )?;
    drop(stream);
    Ok(())
}
