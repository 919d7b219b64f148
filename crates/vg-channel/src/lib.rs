//! Pluggable channel supplier (C2).
//!
//! The Framer (C7) never blocks, so both connecting and accepting are
//! modelled as poll operations rather than blocking calls. `TcpChannelSupplier`
//! is the production implementation; `test_support` provides an in-memory
//! substitute that can be disabled to simulate "server not up yet"
//! (spec §8 scenario 1), mirroring the pluggability
//! `rt-test-utils::MockWsServer`/`MockWsClient` give async WebSocket
//! clients elsewhere, adapted to this gateway's synchronous poll model.

pub mod test_support;

use std::io;
use std::net::{TcpListener, TcpStream};

/// A non-blocking, byte-oriented connection. Exclusively owned by the
/// Framer while open (spec §3 "ChannelSupplier").
pub trait Channel: Send {
    /// Non-blocking read. `Ok(0)` means the peer closed the connection;
    /// `Err(WouldBlock)` means try again next duty cycle.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking write. May write fewer bytes than given.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn shutdown(&mut self);

    fn description(&self) -> String;
}

/// Outcome of polling a previously-started connect attempt.
pub enum ConnectOutcome {
    Pending,
    Connected(Box<dyn Channel>),
    Failed(String),
}

/// Opaque handle to a pending connect, returned by [`ChannelSupplier::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingConnect(u64);

/// Opaque handle to a bound acceptor, returned by [`ChannelSupplier::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AcceptorId(u64);

/// Produces [`Channel`]s by connecting out or accepting in. Pluggable so
/// tests can delay or fail connects without touching real sockets
/// (spec §3/§4.2).
pub trait ChannelSupplier: Send {
    fn connect(&mut self, target: &str) -> PendingConnect;

    fn poll_connect(&mut self, pending: PendingConnect) -> ConnectOutcome;

    fn bind(&mut self, addr: &str) -> io::Result<AcceptorId>;

    /// Drain any inbound connections accepted on `acceptor` since the last
    /// poll.
    fn poll_accept(&mut self, acceptor: AcceptorId) -> Vec<Box<dyn Channel>>;
}

// ---------------------------------------------------------------------------
// Real TCP implementation
// ---------------------------------------------------------------------------

pub struct TcpChannel {
    stream: TcpStream,
    peer: String,
}

impl Channel for TcpChannel {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        self.stream.read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        use std::io::Write;
        self.stream.write(buf)
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn description(&self) -> String {
        self.peer.clone()
    }
}

enum PendingState {
    Connecting(TcpStream),
    Resolved,
}

/// The production [`ChannelSupplier`]: non-blocking TCP connect and accept.
#[derive(Default)]
pub struct TcpChannelSupplier {
    next_id: u64,
    pending: std::collections::HashMap<u64, PendingState>,
    listeners: std::collections::HashMap<u64, TcpListener>,
}

impl TcpChannelSupplier {
    #[must_use]
    pub fn new() -> Self {
        TcpChannelSupplier {
            next_id: 1,
            pending: std::collections::HashMap::new(),
            listeners: std::collections::HashMap::new(),
        }
    }
}

impl ChannelSupplier for TcpChannelSupplier {
    fn connect(&mut self, target: &str) -> PendingConnect {
        let id = self.next_id;
        self.next_id += 1;
        match TcpStream::connect(target) {
            Ok(stream) => {
                let _ = stream.set_nonblocking(true);
                self.pending.insert(id, PendingState::Connecting(stream));
            }
            Err(e) => {
                tracing::warn!(target, error = %e, "tcp connect failed synchronously");
                // Store nothing: poll_connect will report Failed via absence.
            }
        }
        PendingConnect(id)
    }

    fn poll_connect(&mut self, pending: PendingConnect) -> ConnectOutcome {
        match self.pending.remove(&pending.0) {
            None => ConnectOutcome::Failed("connect never started".to_owned()),
            Some(PendingState::Connecting(stream)) => match stream.take_error() {
                Ok(None) => {
                    let peer = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "<unknown>".to_owned());
                    ConnectOutcome::Connected(Box::new(TcpChannel { stream, peer }))
                }
                Ok(Some(e)) => ConnectOutcome::Failed(e.to_string()),
                Err(e) => ConnectOutcome::Failed(e.to_string()),
            },
            Some(PendingState::Resolved) => ConnectOutcome::Failed("already resolved".to_owned()),
        }
    }

    fn bind(&mut self, addr: &str) -> io::Result<AcceptorId> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.insert(id, listener);
        Ok(AcceptorId(id))
    }

    fn poll_accept(&mut self, acceptor: AcceptorId) -> Vec<Box<dyn Channel>> {
        let Some(listener) = self.listeners.get(&acceptor.0) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    let _ = stream.set_nonblocking(true);
                    out.push(Box::new(TcpChannel {
                        stream,
                        peer: addr.to_string(),
                    }) as Box<dyn Channel>);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        out
    }
}
