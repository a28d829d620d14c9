//! pipehub - message-oriented IPC over local named pipes.
//!
//! A [`Server`] listens on one well-known pipe name and multiplexes any
//! number of clients: each accepted client is redirected onto a private
//! pipe by a two-frame handshake, then wrapped in a [`Connection`] that
//! runs its own read and write loops. A [`Client`] performs the other
//! half of the handshake and reconnects automatically when its session
//! drops.
//!
//! Messages are typed: both ends are generic over the inbound and
//! outbound message types, with a serde/JSON [`Codec`] by default.
//! Events (connects, disconnects, messages, errors) arrive on an
//! `mpsc::Sender` the caller provides at construction, so callbacks run
//! on whatever thread drains the receiver.
//!
//! ```no_run
//! use std::sync::mpsc;
//! use pipehub::{Client, ClientEvent, PipeName, Server, ServerEvent};
//!
//! # fn main() -> pipehub::Result<()> {
//! let (server_tx, server_rx) = mpsc::channel();
//! let server: Server<String, String> = Server::new(PipeName::new("chat")?, server_tx);
//! server.start()?;
//!
//! let (client_tx, _client_rx) = mpsc::channel();
//! let client: Client<String, String> = Client::new(PipeName::new("chat")?, client_tx);
//! client.start()?;
//!
//! client.send("hello".to_owned());
//! if let Ok(ServerEvent::Message { name, msg, .. }) = server_rx.recv() {
//!     println!("{name} says {msg}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod constants;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod server;

mod worker;

pub use client::{Client, ClientEvent};
pub use codec::{Codec, Json};
pub use connection::Connection;
pub use endpoint::PipeName;
pub use error::{Error, Result};
pub use server::{Server, ServerEvent};
