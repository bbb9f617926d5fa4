use crate::error::{PlexusError, Result};
use crate::store::StoreAdapter;
use crate::types::{Rank, Tag};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Frame lane for collective traffic (engine-allocated tags).
pub(crate) const LANE_COLLECTIVE: u8 = 0x01;
/// Frame lane for point-to-point traffic (caller-supplied tags).
pub(crate) const LANE_P2P: u8 = 0x02;

/// Frame header: lane (u8) + tag (u32 LE) + payload length (u64 LE).
const HEADER_SIZE: usize = 13;

/// Upper bound on a single frame payload (1 GiB). A header announcing more
/// than this means a corrupt or misbehaving peer.
const MAX_FRAME_BYTES: u64 = 1 << 30;

/// Poll interval while waiting for inbound mesh connections.
const ACCEPT_POLL: Duration = Duration::from_millis(1);

/// A transport endpoint configuration: the interface a context binds its
/// listener to during full-mesh rendezvous.
#[derive(Debug, Clone)]
pub struct TcpDevice {
    bind_ip: IpAddr,
}

impl TcpDevice {
    /// Bind on the given interface address.
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }

    /// Bind on 127.0.0.1. Suitable for same-host groups and tests.
    pub fn loopback() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

type MailKey = (Rank, u8, Tag);

struct MailState {
    queues: HashMap<MailKey, VecDeque<Vec<u8>>>,
    /// Per-peer failures recorded when a reader thread dies outside
    /// shutdown. Receivers drain already-delivered frames from a failed
    /// peer first, and a failed peer never blocks receives from healthy
    /// ones.
    failed: HashMap<Rank, PlexusError>,
}

/// Tag-addressed inbox shared by all reader threads of one context.
struct Mailbox {
    /// Our own rank. It has no link and no reader thread, so failure
    /// checks treat it as vacuously satisfied.
    rank: Rank,
    state: Mutex<MailState>,
    cv: Condvar,
}

impl Mailbox {
    fn new(rank: Rank) -> Self {
        Self {
            rank,
            state: Mutex::new(MailState {
                queues: HashMap::new(),
                failed: HashMap::new(),
            }),
            cv: Condvar::new(),
        }
    }

    fn push(&self, key: MailKey, payload: Vec<u8>) {
        let mut state = self.state.lock().expect("mailbox lock poisoned");
        state.queues.entry(key).or_default().push_back(payload);
        self.cv.notify_all();
    }

    fn fail(&self, peer: Rank, err: PlexusError) {
        let mut state = self.state.lock().expect("mailbox lock poisoned");
        state.failed.entry(peer).or_insert(err);
        self.cv.notify_all();
    }

    fn pop_any(&self, peers: &[Rank], lane: u8, tag: Tag, timeout: Duration) -> Result<(Rank, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("mailbox lock poisoned");
        loop {
            for &peer in peers {
                if let Some(queue) = state.queues.get_mut(&(peer, lane, tag))
                    && let Some(payload) = queue.pop_front()
                {
                    return Ok((peer, payload));
                }
            }
            // Fail fast once every peer in the wait set is gone. The
            // wait set may include our own rank (recv from any source),
            // which never gets a failure entry; only real peers count.
            if let Some(err) = peers
                .iter()
                .find_map(|peer| state.failed.get(peer))
                .filter(|_| {
                    peers
                        .iter()
                        .filter(|&&peer| peer != self.rank)
                        .all(|peer| state.failed.contains_key(peer))
                })
            {
                return Err(err.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PlexusError::Timeout {
                    op: "recv",
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let (guard, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .expect("mailbox lock poisoned");
            state = guard;
        }
    }
}

/// Write side of one peer link. The read side lives in a dedicated reader
/// thread feeding the mailbox.
struct Link {
    stream: Mutex<TcpStream>,
}

/// A connected communication group bound to one transport device.
///
/// Holds `size - 1` peer links established by full-mesh rendezvous through
/// the store. Immutable after construction.
pub(crate) struct Context {
    rank: Rank,
    size: u32,
    timeout: Duration,
    /// Indexed by peer rank; `None` at our own rank.
    links: Vec<Option<Link>>,
    mailbox: Arc<Mailbox>,
    shutdown: Arc<AtomicBool>,
    readers: Vec<std::thread::JoinHandle<()>>,
}

impl Context {
    /// Bind a listener, publish our address under the store, wait for all
    /// peers, and connect the full mesh. Lower ranks accept from higher
    /// ranks and dial lower ones, so each pair establishes exactly one
    /// link. `index` scopes the rendezvous keys per configured device.
    pub fn connect_full_mesh(
        rank: Rank,
        size: u32,
        timeout: Duration,
        store: &StoreAdapter,
        device: &TcpDevice,
        index: usize,
    ) -> Result<Self> {
        let mailbox = Arc::new(Mailbox::new(rank));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut links: Vec<Option<Link>> = (0..size).map(|_| None).collect();
        let mut readers = Vec::new();

        if size > 1 {
            let listener = TcpListener::bind((device.bind_ip, 0))
                .map_err(|e| PlexusError::transport_with_source("bind listener", e))?;
            let local_addr = listener
                .local_addr()
                .map_err(|e| PlexusError::transport_with_source("listener address", e))?;

            store.set(
                &rendezvous_key(index, rank),
                local_addr.to_string().into_bytes(),
            )?;
            let keys: Vec<String> = (0..size).map(|peer| rendezvous_key(index, peer)).collect();
            let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            store.wait_timeout(&key_refs, timeout)?;

            // Dial every lower rank.
            for peer in 0..rank {
                let addr = peer_addr(store, index, peer)?;
                let stream =
                    TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
                        PlexusError::ConnectionFailed {
                            rank: peer,
                            reason: e.to_string(),
                        }
                    })?;
                stream
                    .set_nodelay(true)
                    .map_err(|e| PlexusError::transport_with_source("set_nodelay", e))?;
                let mut stream = stream;
                stream
                    .write_all(&rank.to_le_bytes())
                    .map_err(|e| PlexusError::ConnectionFailed {
                        rank: peer,
                        reason: format!("handshake: {e}"),
                    })?;
                links[peer as usize] = Some(Link {
                    stream: Mutex::new(stream),
                });
            }

            // Accept from every higher rank.
            listener
                .set_nonblocking(true)
                .map_err(|e| PlexusError::transport_with_source("listener nonblocking", e))?;
            let deadline = Instant::now() + timeout;
            let mut remaining = (size - 1 - rank) as usize;
            while remaining > 0 {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let peer = accept_handshake(stream, timeout, &mut links)?;
                        tracing::debug!(rank, peer, "accepted mesh link");
                        remaining -= 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        if Instant::now() >= deadline {
                            return Err(PlexusError::Timeout {
                                op: "connect_full_mesh",
                                timeout_ms: timeout.as_millis() as u64,
                            });
                        }
                        std::thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        return Err(PlexusError::transport_with_source("accept", e));
                    }
                }
            }

            // One reader thread per link, feeding the shared mailbox.
            for (peer, link) in links.iter().enumerate() {
                let Some(link) = link else { continue };
                let stream = link
                    .stream
                    .lock()
                    .expect("link lock poisoned")
                    .try_clone()
                    .map_err(|e| PlexusError::transport_with_source("clone link", e))?;
                let mailbox = Arc::clone(&mailbox);
                let shutdown = Arc::clone(&shutdown);
                let peer = peer as Rank;
                let handle = std::thread::Builder::new()
                    .name(format!("plexus-recv-{peer}"))
                    .spawn(move || reader_loop(peer, stream, mailbox, shutdown))
                    .map_err(|e| PlexusError::transport_with_source("spawn reader", e))?;
                readers.push(handle);
            }
        }

        Ok(Self {
            rank,
            size,
            timeout,
            links,
            mailbox,
            shutdown,
            readers,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Write one frame to `peer`. Blocks only while the payload drains
    /// into the socket; the remote reader thread is always consuming.
    pub fn send(&self, peer: Rank, lane: u8, tag: Tag, payload: &[u8]) -> Result<()> {
        let link = self
            .links
            .get(peer as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                PlexusError::transport(format!("no link to rank {peer} (group size {})", self.size))
            })?;
        let mut header = [0u8; HEADER_SIZE];
        header[0] = lane;
        header[1..5].copy_from_slice(&tag.to_le_bytes());
        header[5..13].copy_from_slice(&(payload.len() as u64).to_le_bytes());

        let map_io = |e: std::io::Error| match e.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                PlexusError::PeerDisconnected { rank: peer }
            }
            _ => PlexusError::transport_with_source(format!("send to rank {peer}"), e),
        };
        let mut stream = link.stream.lock().expect("link lock poisoned");
        stream.write_all(&header).map_err(map_io)?;
        stream.write_all(payload).map_err(map_io)
    }

    /// Receive one frame from `peer` addressed to `(lane, tag)`.
    pub fn recv(&self, peer: Rank, lane: u8, tag: Tag) -> Result<Vec<u8>> {
        let (_, payload) = self.mailbox.pop_any(&[peer], lane, tag, self.timeout)?;
        Ok(payload)
    }

    /// Receive one frame from any of `peers` addressed to `(lane, tag)`.
    pub fn recv_any(&self, peers: &[Rank], lane: u8, tag: Tag) -> Result<(Rank, Vec<u8>)> {
        self.mailbox.pop_any(peers, lane, tag, self.timeout)
    }

}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for link in self.links.iter().flatten() {
            let stream = link.stream.lock().expect("link lock poisoned");
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn rendezvous_key(index: usize, rank: Rank) -> String {
    format!("mesh/{index}/{rank}")
}

fn peer_addr(store: &StoreAdapter, index: usize, peer: Rank) -> Result<SocketAddr> {
    let raw = store.get(&rendezvous_key(index, peer))?;
    let text = String::from_utf8(raw)
        .map_err(|e| PlexusError::Store(format!("malformed address for rank {peer}: {e}")))?;
    text.parse()
        .map_err(|e| PlexusError::Store(format!("malformed address for rank {peer}: {e}")))
}

/// Read the 4-byte rank handshake from an accepted stream and slot it.
fn accept_handshake(
    mut stream: TcpStream,
    timeout: Duration,
    links: &mut [Option<Link>],
) -> Result<Rank> {
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| PlexusError::transport_with_source("handshake timeout", e))?;
    let mut buf = [0u8; 4];
    stream
        .read_exact(&mut buf)
        .map_err(|e| PlexusError::transport_with_source("read handshake", e))?;
    let peer = Rank::from_le_bytes(buf);
    stream
        .set_read_timeout(None)
        .map_err(|e| PlexusError::transport_with_source("clear handshake timeout", e))?;
    stream
        .set_nodelay(true)
        .map_err(|e| PlexusError::transport_with_source("set_nodelay", e))?;
    let slot = links
        .get_mut(peer as usize)
        .ok_or_else(|| PlexusError::transport(format!("handshake from unknown rank {peer}")))?;
    if slot.is_some() {
        return Err(PlexusError::transport(format!(
            "duplicate link from rank {peer}"
        )));
    }
    *slot = Some(Link {
        stream: Mutex::new(stream),
    });
    Ok(peer)
}

fn reader_loop(peer: Rank, mut stream: TcpStream, mailbox: Arc<Mailbox>, shutdown: Arc<AtomicBool>) {
    loop {
        let mut header = [0u8; HEADER_SIZE];
        if let Err(e) = stream.read_exact(&mut header) {
            if !shutdown.load(Ordering::Relaxed) {
                tracing::warn!(peer, error = %e, "peer link closed");
                mailbox.fail(peer, PlexusError::PeerDisconnected { rank: peer });
            }
            return;
        }
        let lane = header[0];
        let tag = Tag::from_le_bytes(header[1..5].try_into().expect("header slice"));
        let len = u64::from_le_bytes(header[5..13].try_into().expect("header slice"));
        if len > MAX_FRAME_BYTES {
            tracing::warn!(peer, len, "oversized frame announced");
            mailbox.fail(
                peer,
                PlexusError::transport(format!(
                    "rank {peer} announced an oversized frame ({len} bytes)"
                )),
            );
            return;
        }
        let mut payload = vec![0u8; len as usize];
        if let Err(e) = stream.read_exact(&mut payload) {
            if !shutdown.load(Ordering::Relaxed) {
                tracing::warn!(peer, error = %e, "peer link closed mid-frame");
                mailbox.fail(peer, PlexusError::PeerDisconnected { rank: peer });
            }
            return;
        }
        mailbox.push((peer, lane, tag), payload);
    }
}

struct UnboundState {
    send_outcome: Option<Result<()>>,
    pending_recv: Option<(Vec<Rank>, Tag)>,
    recv_outcome: Option<Result<Rank>>,
    src_rank: Option<Rank>,
}

/// A point-to-point staging region bound to caller memory.
///
/// Send outcomes and receive completions are captured so the owning work
/// can surface them from `wait()`.
pub(crate) struct UnboundBuffer {
    ctx: Arc<Context>,
    ptr: *mut u8,
    len: usize,
    state: Mutex<UnboundState>,
}

// The owning work item keeps the tensor behind `ptr` alive and is the only
// path to the pointer while the operation is in flight.
unsafe impl Send for UnboundBuffer {}
unsafe impl Sync for UnboundBuffer {}

impl UnboundBuffer {
    /// A staging region over caller-owned memory.
    ///
    /// # Safety
    /// `ptr` must stay valid for `len` bytes until the buffer is dropped;
    /// the owning work item guarantees this by capturing the tensor
    /// handle.
    pub unsafe fn new(ctx: Arc<Context>, ptr: *mut u8, len: usize) -> Self {
        Self {
            ctx,
            ptr,
            len,
            state: Mutex::new(UnboundState {
                send_outcome: None,
                pending_recv: None,
                recv_outcome: None,
                src_rank: None,
            }),
        }
    }

    /// Post the payload to `dst`. The outcome is captured for `wait_send`.
    pub fn send(&self, dst: Rank, tag: Tag) {
        let payload = unsafe { std::slice::from_raw_parts(self.ptr, self.len) };
        let outcome = self.ctx.send(dst, LANE_P2P, tag, payload);
        let mut state = self.state.lock().expect("unbound buffer lock poisoned");
        state.send_outcome = Some(outcome);
    }

    pub fn wait_send(&self) -> Result<()> {
        let state = self.state.lock().expect("unbound buffer lock poisoned");
        match &state.send_outcome {
            Some(outcome) => outcome.clone(),
            None => Err(PlexusError::transport("wait_send without a posted send")),
        }
    }

    /// Arm a receive from any of `srcs`. The blocking part happens in
    /// `wait_recv`.
    pub fn recv(&self, srcs: Vec<Rank>, tag: Tag) {
        let mut state = self.state.lock().expect("unbound buffer lock poisoned");
        state.pending_recv = Some((srcs, tag));
    }

    /// Block until a matching frame arrives, copy it into the bound
    /// memory, and return the source rank. Idempotent after completion.
    pub fn wait_recv(&self) -> Result<Rank> {
        let mut state = self.state.lock().expect("unbound buffer lock poisoned");
        if let Some(outcome) = &state.recv_outcome {
            return outcome.clone();
        }
        let Some((srcs, tag)) = state.pending_recv.take() else {
            return Err(PlexusError::transport("wait_recv without a posted recv"));
        };
        let outcome = self.ctx.recv_any(&srcs, LANE_P2P, tag).and_then(|(src, payload)| {
            if payload.len() != self.len {
                return Err(PlexusError::SizeMismatch {
                    expected: self.len,
                    actual: payload.len(),
                });
            }
            unsafe {
                std::ptr::copy_nonoverlapping(payload.as_ptr(), self.ptr, self.len);
            }
            Ok(src)
        });
        if let Ok(src) = &outcome {
            state.src_rank = Some(*src);
        }
        state.recv_outcome = Some(outcome.clone());
        outcome
    }

    pub fn source_rank(&self) -> Option<Rank> {
        self.state
            .lock()
            .expect("unbound buffer lock poisoned")
            .src_rank
    }
}
