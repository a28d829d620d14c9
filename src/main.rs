//! pipechat - a terminal chat room demonstrating the pipehub engine.
//!
//! One process runs `pipechat serve`; any number of others run
//! `pipechat connect` against the same pipe name. The server relays
//! every line to all participants, prefixed with the sender's
//! connection name.

use std::io::BufRead;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use pipehub::{Client, ClientEvent, PipeName, Server, ServerEvent};

#[derive(Parser)]
#[command(name = "pipechat", about = "Chat over local named pipes", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host a chat room on a pipe name.
    Serve {
        /// Pipe name to listen on.
        #[arg(default_value = "pipechat")]
        name: String,
    },
    /// Join a chat room. Lines from stdin are sent; ctrl-d leaves.
    Connect {
        /// Pipe name to connect to.
        #[arg(default_value = "pipechat")]
        name: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { name } => serve(&name),
        Command::Connect { name } => connect(&name),
    }
}

/// Run the relay server until the process is killed.
fn serve(name: &str) -> Result<()> {
    let (events_tx, events_rx) = mpsc::channel();
    let server: Server<String, String> = Server::new(
        PipeName::new(name).context("invalid pipe name")?,
        events_tx,
    );
    server.start().context("start chat server")?;
    println!("chat room open on pipe '{name}' (ctrl-c to close)");

    for event in events_rx {
        match event {
            ServerEvent::ClientConnected { name, .. } => {
                let line = format!("* {name} joined");
                println!("{line}");
                server.broadcast(line);
            }
            ServerEvent::ClientDisconnected { id } => {
                let line = format!("* Client {id} left");
                println!("{line}");
                server.broadcast(line);
            }
            ServerEvent::Message { name, msg, .. } => {
                let line = format!("[{name}] {msg}");
                println!("{line}");
                server.broadcast(line);
            }
            ServerEvent::Error { id, error } => {
                log::warn!("server error (client {id:?}): {error}");
            }
        }
    }
    Ok(())
}

/// Join the room: print what arrives, send what is typed.
fn connect(name: &str) -> Result<()> {
    let (events_tx, events_rx) = mpsc::channel();
    let client: Client<String, String> = Client::new(
        PipeName::new(name).context("invalid pipe name")?,
        events_tx,
    );
    client.start().context("start chat client")?;
    if !client.wait_for_connection(Duration::from_secs(5)) {
        client.stop();
        bail!("no chat server on pipe '{name}'");
    }
    println!("joined '{name}' (ctrl-d to leave)");

    // Print events on a side thread; the main thread owns stdin.
    let printer = thread::spawn(move || {
        for event in events_rx {
            match event {
                ClientEvent::ServerMessage { msg } => println!("{msg}"),
                ClientEvent::Connected { .. } => println!("* connected"),
                ClientEvent::Disconnected => println!("* connection lost"),
                ClientEvent::Error(error) => log::warn!("client error: {error}"),
            }
        }
    });

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        if !client.send(line) {
            log::warn!("message dropped: not connected");
        }
    }

    client.stop();
    drop(client);
    let _ = printer.join();
    println!("left '{name}'");
    Ok(())
}
