use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::link::{ChunkReceiver, Link};

const READ_CHUNK_SIZE: usize = 4 * 1024;

/// A connected TCP byte link.
///
/// Construction spawns a background reader thread that forwards every read
/// into the returned chunk channel; the thread exits (dropping the sender)
/// when the peer closes the connection.
pub struct TcpLink {
    writer: Mutex<TcpStream>,
    peer: String,
}

impl TcpLink {
    /// Connect to a listening peer.
    pub fn connect(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<(TcpLink, ChunkReceiver)> {
        let stream = TcpStream::connect(&addr).map_err(|source| TransportError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        info!(addr = %addr, "connected");
        Self::from_stream(stream)
    }

    /// Wrap an already-connected stream (used by [`TcpServer::accept`]).
    pub fn from_stream(stream: TcpStream) -> Result<(TcpLink, ChunkReceiver)> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;

        let (tx, rx) = mpsc::channel();
        let reader_peer = peer.clone();
        thread::Builder::new()
            .name("mculink-tcp-reader".to_string())
            .spawn(move || read_loop(reader, tx, reader_peer))?;

        Ok((
            TcpLink {
                writer: Mutex::new(stream),
                peer,
            },
            rx,
        ))
    }
}

fn read_loop(mut stream: TcpStream, tx: mpsc::Sender<Vec<u8>>, peer: String) {
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(chunk[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                debug!(peer = %peer, error = %err, "read failed, closing link");
                break;
            }
        }
    }
    debug!(peer = %peer, "reader thread exiting");
    // tx drops here, signalling disconnect to the chunk receiver
}

impl Link for TcpLink {
    fn transmit(&self, buf: &[u8]) -> Result<()> {
        let mut stream = self.writer.lock().map_err(|_| TransportError::Closed)?;
        stream.write_all(buf)?;
        stream.flush()?;
        Ok(())
    }

    fn peer_label(&self) -> String {
        self.peer.clone()
    }
}

impl std::fmt::Debug for TcpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpLink").field("peer", &self.peer).finish()
    }
}

/// Listening side of the TCP transport.
pub struct TcpServer {
    listener: TcpListener,
    addr: String,
}

impl TcpServer {
    /// Bind and listen on the given address.
    pub fn bind(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self> {
        let listener = TcpListener::bind(&addr).map_err(|source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        info!(addr = %addr, "listening");
        Ok(Self { listener, addr })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> &str {
        &self.addr
    }

    /// Accept one incoming connection (blocking).
    pub fn accept(&self) -> Result<(TcpLink, ChunkReceiver)> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(peer = %peer, "accepted connection");
        TcpLink::from_stream(stream)
    }
}
