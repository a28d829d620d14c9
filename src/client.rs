//! The pipe client: handshake, session wrapping, auto-reconnect.
//!
//! `start` runs the client half of the two-stage handshake on a
//! background worker: connect to the well-known pipe (spinning until
//! the server exists), read the one redirect frame, connect to the
//! private data pipe, and wrap it in a [`Connection`].
//!
//! A monitor loop bridges connection events onto the caller's channel.
//! When the session drops and the client was not stopped explicitly,
//! the monitor sleeps the configured delay and launches a fresh
//! handshake against the same well-known name; `wait_for_connection`
//! and `wait_for_disconnection` ride on auto-reset latches pulsed by
//! those transitions.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::codec::{Codec, Json};
use crate::connection::{ConnEvent, Connection};
use crate::constants::CONNECT_TIMEOUT;
use crate::endpoint::{self, PipeName};
use crate::error::{Error, Result};
use crate::framing;
use crate::worker::Worker;

/// Events a client delivers on its caller-provided channel.
#[derive(Debug)]
pub enum ClientEvent<R> {
    /// The handshake completed and the session is live.
    Connected {
        /// Client-local session counter (1 for the first connect, 2
        /// for the first reconnect, and so on).
        id: u32,
    },
    /// A message arrived from the server.
    ServerMessage {
        /// The decoded message.
        msg: R,
    },
    /// The session ended. If auto-reconnect applies, a new handshake
    /// starts after the configured delay.
    Disconnected,
    /// A handshake or session failure.
    Error(Error),
}

struct ClientShared<R, W, C> {
    conn: Mutex<Option<Connection<R, W, C>>>,
    connected: Latch,
    disconnected: Latch,
    closed_explicitly: AtomicBool,
    /// Guards against two handshake workers racing each other.
    connecting: AtomicBool,
    auto_reconnect: AtomicBool,
    auto_reconnect_delay_ms: AtomicU64,
    next_session: AtomicU32,
}

/// Everything a connect attempt or the monitor needs; cloned into the
/// workers so reconnects can launch more of themselves.
struct ConnectCtx<R, W, C> {
    pipe: PipeName,
    codec: Arc<C>,
    events: Sender<ClientEvent<R>>,
    conn_tx: Sender<ConnEvent<R>>,
    shared: Arc<ClientShared<R, W, C>>,
}

impl<R, W, C> Clone for ConnectCtx<R, W, C> {
    fn clone(&self) -> Self {
        ConnectCtx {
            pipe: self.pipe.clone(),
            codec: Arc::clone(&self.codec),
            events: self.events.clone(),
            conn_tx: self.conn_tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// A client of one well-known pipe name.
///
/// Generic over the inbound type `R`, outbound type `W`, and codec
/// (JSON by default), symmetric with the server but with `R` and `W`
/// swapped. Events are delivered on the `mpsc::Sender` given to the
/// constructor.
pub struct Client<R, W, C = Json> {
    shared: Arc<ClientShared<R, W, C>>,
    ctx: ConnectCtx<R, W, C>,
    /// Taken by the monitor on first start.
    conn_rx: Mutex<Option<Receiver<ConnEvent<R>>>>,
    monitor: Mutex<Option<Worker>>,
}

impl<R, W, C> Client<R, W, C>
where
    R: Send + 'static,
    W: Send + 'static,
    C: Codec<R> + Codec<W>,
{
    /// A client with the default codec. Auto-reconnect is on with no
    /// delay; nothing happens until [`start`].
    ///
    /// [`start`]: Client::start
    pub fn new(pipe: PipeName, events: Sender<ClientEvent<R>>) -> Client<R, W, C>
    where
        C: Default,
    {
        Self::with_codec(pipe, events, C::default())
    }

    /// A client with an explicit codec value.
    pub fn with_codec(pipe: PipeName, events: Sender<ClientEvent<R>>, codec: C) -> Client<R, W, C> {
        let (conn_tx, conn_rx) = mpsc::channel::<ConnEvent<R>>();
        let shared = Arc::new(ClientShared {
            conn: Mutex::new(None),
            connected: Latch::new(),
            disconnected: Latch::new(),
            closed_explicitly: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            auto_reconnect: AtomicBool::new(true),
            auto_reconnect_delay_ms: AtomicU64::new(0),
            next_session: AtomicU32::new(0),
        });
        Client {
            ctx: ConnectCtx {
                pipe,
                codec: Arc::new(codec),
                events,
                conn_tx,
                shared: Arc::clone(&shared),
            },
            shared,
            conn_rx: Mutex::new(Some(conn_rx)),
            monitor: Mutex::new(None),
        }
    }

    /// Begin connecting. Returns immediately; the handshake runs on a
    /// background worker and spins until the server's pipe exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lifecycle`] if a session is already live.
    pub fn start(&self) -> Result<()> {
        if self
            .shared
            .conn
            .lock()
            .expect("client connection mutex poisoned")
            .is_some()
        {
            return Err(Error::Lifecycle("client is already connected"));
        }
        self.shared.closed_explicitly.store(false, Ordering::SeqCst);

        // The monitor outlives individual sessions; spawn it once.
        if let Some(conn_rx) = self
            .conn_rx
            .lock()
            .expect("client monitor receiver mutex poisoned")
            .take()
        {
            let ctx = self.ctx.clone();
            let monitor = Worker::spawn(
                "pipehub-client-monitor",
                move || {
                    monitor_loop(&ctx, conn_rx);
                    Ok(())
                },
                |_| {},
            )?;
            *self.monitor.lock().expect("client monitor mutex poisoned") = Some(monitor);
        }

        spawn_connect(self.ctx.clone())
    }

    /// Queue a message for the server. Never blocks; returns false and
    /// drops the message when no session is live.
    pub fn send(&self, msg: W) -> bool {
        match &*self
            .shared
            .conn
            .lock()
            .expect("client connection mutex poisoned")
        {
            Some(conn) => conn.send(msg),
            None => false,
        }
    }
}

impl<R, W, C> Client<R, W, C> {
    /// Whether a dropped session triggers a new handshake. On by
    /// default.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.shared.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    /// Pause between losing a session and starting the next handshake.
    /// Zero by default.
    pub fn set_auto_reconnect_delay(&self, delay: Duration) {
        self.shared
            .auto_reconnect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Close the session and suppress reconnecting. A later [`start`]
    /// begins a fresh session.
    ///
    /// [`start`]: Client::start
    pub fn stop(&self) {
        self.shared.closed_explicitly.store(true, Ordering::SeqCst);
        let conn = self
            .shared
            .conn
            .lock()
            .expect("client connection mutex poisoned")
            .take();
        if let Some(conn) = conn {
            conn.close();
        }
    }

    /// Whether a session is currently live.
    pub fn is_connected(&self) -> bool {
        self.shared
            .conn
            .lock()
            .expect("client connection mutex poisoned")
            .as_ref()
            .is_some_and(Connection::is_connected)
    }

    /// Block until the next connect completes. Returns false on
    /// timeout.
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.shared.connected.wait(timeout)
    }

    /// Block until the next disconnect. Returns false on timeout.
    pub fn wait_for_disconnection(&self, timeout: Duration) -> bool {
        self.shared.disconnected.wait(timeout)
    }
}

impl<R, W, C> Drop for Client<R, W, C> {
    /// Dropping the client closes the session and retires the monitor.
    ///
    /// The monitor cannot rely on its event channel closing (its own
    /// reconnect context keeps a sender alive), so it is dismissed with
    /// an explicit shutdown sentinel.
    fn drop(&mut self) {
        self.stop();
        let _ = self.ctx.conn_tx.send(ConnEvent::Shutdown);
    }
}

impl<R, W, C> std::fmt::Debug for Client<R, W, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("pipe", &self.ctx.pipe.name())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Launch one handshake attempt on a background worker.
fn spawn_connect<R, W, C>(ctx: ConnectCtx<R, W, C>) -> Result<()>
where
    R: Send + 'static,
    W: Send + 'static,
    C: Codec<R> + Codec<W>,
{
    if ctx.shared.connecting.swap(true, Ordering::SeqCst) {
        return Err(Error::Lifecycle("a connect attempt is already in flight"));
    }
    let shared = Arc::clone(&ctx.shared);
    let done_ctx = ctx.clone();
    let spawned = Worker::spawn(
        "pipehub-client-connect",
        move || connect_sync(&ctx),
        move |result| {
            done_ctx.shared.connecting.store(false, Ordering::SeqCst);
            if let Err(error) = result {
                if done_ctx.shared.closed_explicitly.load(Ordering::SeqCst) {
                    log::debug!("[client] connect abandoned: {error}");
                    return;
                }
                log::error!("[client] connect failed: {error}");
                let _ = done_ctx.events.send(ClientEvent::Error(error));
                // A handshake can lose a race with a server that is
                // restarting (redirect read, then the data pipe never
                // opens). With auto-reconnect on, keep trying; the
                // next attempt parks in the existence spin until the
                // server is back.
                if done_ctx.shared.auto_reconnect.load(Ordering::SeqCst) {
                    let delay = Duration::from_millis(
                        done_ctx.shared.auto_reconnect_delay_ms.load(Ordering::SeqCst),
                    );
                    thread::sleep(delay.max(Duration::from_millis(10)));
                    if !done_ctx.shared.closed_explicitly.load(Ordering::SeqCst) {
                        if let Err(error) = spawn_connect(done_ctx.clone()) {
                            let _ = done_ctx.events.send(ClientEvent::Error(error));
                        }
                    }
                }
            }
        },
    );
    match spawned {
        Ok(_worker) => Ok(()),
        Err(error) => {
            // The worker never ran, so its callback cannot clear this.
            shared.connecting.store(false, Ordering::SeqCst);
            Err(error)
        }
    }
}

/// The client half of the handshake.
fn connect_sync<R, W, C>(ctx: &ConnectCtx<R, W, C>) -> Result<()>
where
    R: Send + 'static,
    W: Send + 'static,
    C: Codec<R> + Codec<W>,
{
    // Stage one: the well-known pipe. No deadline; the server may not
    // exist yet, and `stop` cancels the spin via the flag.
    let mut handshake =
        endpoint::wait_and_connect(&ctx.pipe, None, &ctx.shared.closed_explicitly)?;
    let payload = framing::read_frame(&mut handshake)?
        .ok_or_else(|| Error::Protocol("server closed the handshake before the redirect".into()))?;
    let data_name = String::from_utf8(payload)
        .map_err(|_| Error::Protocol("redirect name is not valid UTF-8".into()))?;
    drop(handshake);

    // Stage two: the private data pipe the server just allocated.
    let data_pipe = ctx.pipe.sibling(&data_name)?;
    let stream = endpoint::wait_and_connect(
        &data_pipe,
        Some(Instant::now() + CONNECT_TIMEOUT),
        &ctx.shared.closed_explicitly,
    )?;

    let id = ctx.shared.next_session.fetch_add(1, Ordering::SeqCst) + 1;
    let conn = Connection::new(
        id,
        format!("Client {id}"),
        stream,
        Arc::clone(&ctx.codec),
        ctx.conn_tx.clone(),
    );
    *ctx.shared
        .conn
        .lock()
        .expect("client connection mutex poisoned") = Some(conn.clone());
    if let Err(error) = conn.open() {
        ctx.shared
            .conn
            .lock()
            .expect("client connection mutex poisoned")
            .take();
        conn.close();
        return Err(error);
    }

    log::info!("[client] connected to '{}' via '{data_name}'", ctx.pipe.name());
    ctx.shared.connected.pulse();
    let _ = ctx.events.send(ClientEvent::Connected { id });
    Ok(())
}

/// Bridges connection events to the public channel and drives
/// reconnects. Lives for the client's whole lifetime.
fn monitor_loop<R, W, C>(ctx: &ConnectCtx<R, W, C>, queue: Receiver<ConnEvent<R>>)
where
    R: Send + 'static,
    W: Send + 'static,
    C: Codec<R> + Codec<W>,
{
    for event in queue {
        match event {
            ConnEvent::Message { msg, .. } => {
                let _ = ctx.events.send(ClientEvent::ServerMessage { msg });
            }
            ConnEvent::Error { error, .. } => {
                let _ = ctx.events.send(ClientEvent::Error(error));
            }
            ConnEvent::Shutdown => break,
            ConnEvent::Disconnected { .. } => {
                ctx.shared
                    .conn
                    .lock()
                    .expect("client connection mutex poisoned")
                    .take();
                ctx.shared.disconnected.pulse();
                let _ = ctx.events.send(ClientEvent::Disconnected);

                let explicit = ctx.shared.closed_explicitly.load(Ordering::SeqCst);
                if !explicit && ctx.shared.auto_reconnect.load(Ordering::SeqCst) {
                    let delay = Duration::from_millis(
                        ctx.shared.auto_reconnect_delay_ms.load(Ordering::SeqCst),
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    if !ctx.shared.closed_explicitly.load(Ordering::SeqCst) {
                        log::info!("[client] reconnecting to '{}'", ctx.pipe.name());
                        if let Err(error) = spawn_connect(ctx.clone()) {
                            let _ = ctx.events.send(ClientEvent::Error(error));
                        }
                    }
                }
            }
        }
    }
    log::debug!("[client] monitor exiting");
}

/// Auto-reset latch: `pulse` releases the next `wait`, which consumes
/// the pulse. A pulse with no waiter is held until one arrives.
struct Latch {
    set: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    fn new() -> Latch {
        Latch {
            set: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn pulse(&self) {
        *self.set.lock().expect("latch mutex poisoned") = true;
        self.cv.notify_one();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.set.lock().expect("latch mutex poisoned");
        let (mut guard, _result) = self
            .cv
            .wait_timeout_while(guard, timeout, |set| !*set)
            .expect("latch mutex poisoned");
        if *guard {
            *guard = false;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_consumes_one_pulse_per_wait() {
        let latch = Latch::new();
        latch.pulse();
        assert!(latch.wait(Duration::from_millis(10)));
        // The pulse was consumed.
        assert!(!latch.wait(Duration::from_millis(10)));
    }

    #[test]
    fn latch_wakes_a_parked_waiter() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait(Duration::from_secs(2)))
        };
        thread::sleep(Duration::from_millis(50));
        latch.pulse();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn latch_times_out_without_a_pulse() {
        let latch = Latch::new();
        let started = Instant::now();
        assert!(!latch.wait(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn send_without_a_session_is_a_no_op() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pipe = PipeName::in_dir(tmp.path(), "nobody").unwrap();
        let (tx, _rx) = mpsc::channel();
        let client: Client<String, String> = Client::new(pipe, tx);
        assert!(!client.send("into the void".into()));
        assert!(!client.is_connected());
    }

    #[test]
    fn stop_cancels_a_pending_connect_spin() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pipe = PipeName::in_dir(tmp.path(), "absent").unwrap();
        let (tx, rx) = mpsc::channel();
        let client: Client<String, String> = Client::new(pipe, tx);
        client.start().unwrap();
        // No server exists; the connect worker is spinning on the probe.
        thread::sleep(Duration::from_millis(50));
        client.stop();
        // The spin notices the flag and the worker exits quietly; no
        // Error event for an explicit stop.
        thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());
    }
}
