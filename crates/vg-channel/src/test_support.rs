//! In-memory, fully deterministic channel supplier for tests.
//!
//! Plays the same role `rt-test-utils::MockWsServer`/`MockWsClient` play for
//! async WebSocket clients elsewhere: a swappable transport that lets
//! tests drive handshakes and retransmits without real socket timing.
//! [`Network::set_enabled`] lets a test simulate "server process not started
//! yet" (spec §8 scenario 1) by making every connect attempt stay `Pending`
//! forever until re-enabled.

use crate::{AcceptorId, Channel, ChannelSupplier, ConnectOutcome, PendingConnect};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct NetworkInner {
    listening: HashMap<String, VecDeque<PipeChannel>>,
}

/// Shared in-memory "network" that one or more [`InMemorySupplier`]s bind
/// and connect against.
#[derive(Clone)]
pub struct Network {
    inner: Arc<Mutex<NetworkInner>>,
    enabled: Arc<AtomicBool>,
}

impl Network {
    #[must_use]
    pub fn new() -> Self {
        Network {
            inner: Arc::new(Mutex::new(NetworkInner::default())),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    #[must_use]
    pub fn supplier(&self) -> InMemorySupplier {
        InMemorySupplier {
            network: self.inner.clone(),
            enabled: self.enabled.clone(),
            next_id: Arc::new(AtomicU64::new(1)),
            pending: HashMap::new(),
            listeners: HashMap::new(),
        }
    }

    /// Disable connect resolution network-wide: existing and future pending
    /// connects stay `Pending` until [`Network::enable`] is called.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InMemorySupplier {
    network: Arc<Mutex<NetworkInner>>,
    enabled: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
    pending: HashMap<u64, String>,
    listeners: HashMap<u64, String>,
}

impl ChannelSupplier for InMemorySupplier {
    fn connect(&mut self, target: &str) -> PendingConnect {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending.insert(id, target.to_owned());
        PendingConnect(id)
    }

    fn poll_connect(&mut self, pending: PendingConnect) -> ConnectOutcome {
        if !self.enabled.load(Ordering::SeqCst) {
            return ConnectOutcome::Pending;
        }
        let Some(target) = self.pending.get(&pending.0).cloned() else {
            return ConnectOutcome::Failed("connect() was never called for this handle".to_owned());
        };
        let mut net = self.network.lock().expect("network mutex poisoned");
        let Some(queue) = net.listening.get_mut(&target) else {
            return ConnectOutcome::Pending;
        };
        let (mine, theirs) = pipe_pair(&target);
        queue.push_back(theirs);
        drop(net);
        self.pending.remove(&pending.0);
        ConnectOutcome::Connected(Box::new(mine))
    }

    fn bind(&mut self, addr: &str) -> io::Result<AcceptorId> {
        let mut net = self.network.lock().expect("network mutex poisoned");
        net.listening.entry(addr.to_owned()).or_default();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.insert(id, addr.to_owned());
        Ok(AcceptorId(id))
    }

    fn poll_accept(&mut self, acceptor: AcceptorId) -> Vec<Box<dyn Channel>> {
        let Some(addr) = self.listeners.get(&acceptor.0) else {
            return Vec::new();
        };
        let mut net = self.network.lock().expect("network mutex poisoned");
        let Some(queue) = net.listening.get_mut(addr) else {
            return Vec::new();
        };
        queue.drain(..).map(|c| Box::new(c) as Box<dyn Channel>).collect()
    }
}

fn pipe_pair(peer_description: &str) -> (PipeChannel, PipeChannel) {
    let a_to_b = Arc::new(Mutex::new(VecDeque::new()));
    let b_to_a = Arc::new(Mutex::new(VecDeque::new()));
    let a_closed = Arc::new(AtomicBool::new(false));
    let b_closed = Arc::new(AtomicBool::new(false));

    let a = PipeChannel {
        send: a_to_b.clone(),
        recv: b_to_a.clone(),
        local_closed: a_closed.clone(),
        peer_closed: b_closed.clone(),
        peer_description: peer_description.to_owned(),
    };
    let b = PipeChannel {
        send: b_to_a,
        recv: a_to_b,
        local_closed: b_closed,
        peer_closed: a_closed,
        peer_description: peer_description.to_owned(),
    };
    (a, b)
}

struct PipeChannel {
    send: Arc<Mutex<VecDeque<u8>>>,
    recv: Arc<Mutex<VecDeque<u8>>>,
    local_closed: Arc<AtomicBool>,
    peer_closed: Arc<AtomicBool>,
    peer_description: String,
}

impl Channel for PipeChannel {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut recv = self.recv.lock().expect("pipe mutex poisoned");
        if recv.is_empty() {
            if self.peer_closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = buf.len().min(recv.len());
        for slot in buf.iter_mut().take(n) {
            *slot = recv.pop_front().expect("checked len");
        }
        Ok(n)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.local_closed.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let mut send = self.send.lock().expect("pipe mutex poisoned");
        send.extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn shutdown(&mut self) {
        self.local_closed.store(true, Ordering::SeqCst);
    }

    fn description(&self) -> String {
        format!("in-memory:{}", self.peer_description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_before_bind_stays_pending_then_resolves() {
        let net = Network::new();
        let mut client = net.supplier();
        let mut server = net.supplier();

        let pending = client.connect("venue:1");
        assert!(matches!(client.poll_connect(pending), ConnectOutcome::Pending));

        let acceptor = server.bind("venue:1").unwrap();
        let pending = client.connect("venue:1");
        match client.poll_connect(pending) {
            ConnectOutcome::Connected(_) => {}
            _ => panic!("expected Connected once bound"),
        }
        assert_eq!(server.poll_accept(acceptor).len(), 1);
    }

    #[test]
    fn disabled_network_never_resolves_connects() {
        let net = Network::new();
        net.disable();
        let mut server = net.supplier();
        let _ = server.bind("venue:1");
        let mut client = net.supplier();
        let pending = client.connect("venue:1");
        assert!(matches!(client.poll_connect(pending), ConnectOutcome::Pending));
        net.enable();
        assert!(matches!(client.poll_connect(pending), ConnectOutcome::Connected(_)));
    }

    #[test]
    fn bytes_written_on_one_end_are_readable_on_the_other() {
        let net = Network::new();
        let mut server = net.supplier();
        let acceptor = server.bind("venue:1").unwrap();
        let mut client = net.supplier();
        let pending = client.connect("venue:1");
        let ConnectOutcome::Connected(mut client_chan) = client.poll_connect(pending) else {
            panic!("expected connected");
        };
        let mut server_chan = server.poll_accept(acceptor).remove(0);

        client_chan.try_write(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = server_chan.try_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
