//! Inbound endpoint registry with heartbeat-based failure detection.
//!
//! An [`EndpointProvider`] listens on one published address, adopts every
//! inbound connection as a client, and keeps a liveness verdict per
//! client: a heartbeat frame goes out every `heartbeat_interval_ms`, and
//! a client that stays silent for `heartbeat_timeout_ms` is declared
//! lost and disconnected. Any inbound traffic counts as liveness, and
//! heartbeat echoes additionally feed a smoothed round-trip estimate.
//!
//! Like the peer pool this is a single-threaded non-blocking reactor:
//! [`fd`](EndpointProvider::fd) is pollable, all socket and timer work
//! happens inside [`poll`](EndpointProvider::poll), and the mutating
//! calls are safe from any thread.

use {
    crate::{
        channel::{self, Channel, FillOutcome},
        config::EndpointConfig,
        error::{Result, TetherError},
        frame::{self, Frame},
        poller::{stream_interest, Poller, EVENT_BATCH},
        socket,
        timer::IntervalTimer,
    },
    bytes::Bytes,
    log::{debug, info, warn},
    nix::sys::epoll::{EpollEvent, EpollFlags},
    std::{
        collections::{BTreeSet, HashMap},
        fmt,
        net::{SocketAddr, TcpListener, TcpStream},
        os::fd::{AsFd, AsRawFd, RawFd},
        sync::{Mutex, MutexGuard},
        time::{Duration, Instant},
    },
};

/// Opaque identifier for an accepted client. Handles are assigned
/// monotonically and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientHandle(u64);

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Client lifecycle and inbound traffic, delivered synchronously from
/// within [`EndpointProvider::poll`].
#[derive(Debug)]
pub enum EndpointEvent {
    /// An inbound connection was accepted.
    NewClient(ClientHandle),
    /// A client disconnected, failed, or was evicted for heartbeat
    /// silence. Emitted exactly once per client; never for `shutdown`.
    LostClient(ClientHandle),
    /// A data frame arrived from the client.
    Message(ClientHandle, Bytes),
}

/// Point-in-time view of one client's connection.
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub addr: SocketAddr,
    /// Smoothed heartbeat round-trip time; `None` until the first echo.
    pub rtt_ms: Option<f64>,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

#[derive(Debug)]
struct ClientSlot {
    channel: Channel,
    addr: SocketAddr,
    /// Last time any frame arrived; initialised to the accept time so a
    /// silent client still times out.
    last_recv: Instant,
    /// Outstanding heartbeat send time; taken when the next frame
    /// arrives so each heartbeat yields at most one RTT sample.
    last_sent: Option<Instant>,
    rtt_ms: Option<f64>,
}

#[derive(Debug)]
struct ProviderState {
    listener: Option<TcpListener>,
    clients: HashMap<ClientHandle, ClientSlot>,
    by_fd: HashMap<RawFd, ClientHandle>,
    /// Connected descriptors in ascending order; broadcast walks this.
    broadcast_fds: BTreeSet<RawFd>,
    timer: IntervalTimer,
    next_id: u64,
    pending_events: Vec<EndpointEvent>,
    shut_down: bool,
}

impl ProviderState {
    fn alloc_handle(&mut self) -> ClientHandle {
        let handle = ClientHandle(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        handle
    }
}

/// Exponentially weighted moving average over heartbeat round trips.
fn update_rtt(prev_ms: Option<f64>, sample_ms: f64) -> f64 {
    const ALPHA: f64 = 0.3;
    match prev_ms {
        None => sample_ms,
        Some(prev) => ALPHA * sample_ms + (1.0 - ALPHA) * prev,
    }
}

/// Inbound endpoint registry. See the module docs for the liveness
/// model.
#[derive(Debug)]
pub struct EndpointProvider {
    name: String,
    config: EndpointConfig,
    poller: Poller,
    timer_fd: RawFd,
    state: Mutex<ProviderState>,
}

impl EndpointProvider {
    /// Create an unpublished provider; `name` labels it in logs. The
    /// heartbeat timer starts immediately.
    pub fn new(name: &str, config: EndpointConfig) -> Result<Self> {
        let poller = Poller::new()?;
        let mut timer = IntervalTimer::new()?;
        // timerfd treats a zero interval as disarm; a degenerate config
        // must still tick.
        timer.arm(Duration::from_millis(config.heartbeat_interval_ms.max(1)))?;
        poller.add(timer.as_fd(), EpollFlags::EPOLLIN)?;
        let timer_fd = timer.as_raw_fd();
        info!(
            "{name}: endpoint created, heartbeat {}ms / timeout {}ms",
            config.heartbeat_interval_ms, config.heartbeat_timeout_ms
        );
        Ok(Self {
            name: name.to_string(),
            config,
            poller,
            timer_fd,
            state: Mutex::new(ProviderState {
                listener: None,
                clients: HashMap::new(),
                by_fd: HashMap::new(),
                broadcast_fds: BTreeSet::new(),
                timer,
                next_id: 0,
                pending_events: Vec::new(),
                shut_down: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap()
    }

    // ── Publication ─────────────────────────────────────────────────────

    /// Bind and start listening. Returns the bound address, so callers
    /// publishing on port 0 learn the assigned port.
    pub fn publish(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let mut state = self.lock();
        if state.shut_down {
            return Err(TetherError::Shutdown);
        }
        if let Some(listener) = &state.listener {
            return Err(TetherError::AlreadyPublished(listener.local_addr()?));
        }
        let listener = socket::listen(addr, self.config.listen_backlog)?;
        let bound = listener.local_addr()?;
        self.poller.add(listener.as_fd(), EpollFlags::EPOLLIN)?;
        state.listener = Some(listener);
        info!("{}: published on {bound}", self.name);
        Ok(bound)
    }

    /// The bound address, once published.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock()
            .listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Frame and send `payload` to one client. Queued behind any
    /// unflushed bytes; per-client FIFO order is preserved.
    ///
    /// Fails with [`TetherError::NotConnected`] if the handle is unknown
    /// (or already swept). A write failure tears the client down and
    /// surfaces as `LostClient` on the next poll, not here.
    pub fn send(&self, handle: ClientHandle, payload: Bytes) -> Result<()> {
        let wire = Frame::Data(payload).encode(self.config.max_frame_bytes)?;
        let mut state = self.lock();
        self.send_frame(&mut state, handle, wire)
    }

    /// Send `payload` to every client, walking the snapshot of connected
    /// descriptors in ascending order.
    pub fn broadcast(&self, payload: Bytes) -> Result<()> {
        let wire = Frame::Data(payload).encode(self.config.max_frame_bytes)?;
        let mut state = self.lock();
        let targets: Vec<ClientHandle> = state
            .broadcast_fds
            .iter()
            .filter_map(|fd| state.by_fd.get(fd).copied())
            .collect();
        for handle in targets {
            // Ignore races with teardown; the affected client is already
            // on its way to a LostClient event.
            let _ = self.send_frame(&mut state, handle, wire.clone());
        }
        Ok(())
    }

    fn send_frame(
        &self,
        state: &mut ProviderState,
        handle: ClientHandle,
        wire: Bytes,
    ) -> Result<()> {
        let Some(slot) = state.clients.get_mut(&handle) else {
            return Err(TetherError::NotConnected);
        };
        match channel::send_on(&mut slot.channel, &self.poller, wire) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("{}: {handle} write failed: {e}", self.name);
                self.drop_client(state, handle, true);
                Ok(())
            }
        }
    }

    // ── Polling ─────────────────────────────────────────────────────────

    /// Drive the reactor: wait up to `timeout_ms` for readiness, process
    /// one batch of accept, socket, and timer events, and deliver the
    /// resulting events through `on_event`. Returns the number
    /// delivered.
    ///
    /// `on_event` runs on the calling thread with no internal lock held,
    /// so it may call back into the provider (except `poll` itself).
    pub fn poll(&self, timeout_ms: u64, mut on_event: impl FnMut(EndpointEvent)) -> Result<usize> {
        let wait_ms = {
            let state = self.lock();
            if state.shut_down {
                return Ok(0);
            }
            if state.pending_events.is_empty() {
                timeout_ms
            } else {
                0
            }
        };
        let mut ready = [EpollEvent::empty(); EVENT_BATCH];
        let batch = self.poller.wait(&mut ready, wait_ms)?;
        let events = {
            let mut state = self.lock();
            if state.shut_down {
                return Ok(0);
            }
            for ev in ready.iter().take(batch) {
                self.dispatch(&mut state, ev);
            }
            std::mem::take(&mut state.pending_events)
        };
        let delivered = events.len();
        for event in events {
            on_event(event);
        }
        Ok(delivered)
    }

    /// The provider's pollable descriptor: readable when `poll` has
    /// work.
    pub fn fd(&self) -> RawFd {
        self.poller.as_raw_fd()
    }

    fn dispatch(&self, state: &mut ProviderState, ev: &EpollEvent) {
        if ev.data() == self.timer_fd as u64 {
            self.on_tick(state);
            return;
        }
        let fd = ev.data() as RawFd;
        if state
            .listener
            .as_ref()
            .is_some_and(|listener| listener.as_raw_fd() == fd)
        {
            self.accept_clients(state);
            return;
        }
        let Some(&handle) = state.by_fd.get(&fd) else {
            // Stale readiness for a client torn down earlier in the
            // batch.
            return;
        };
        let flags = ev.events();
        if flags.intersects(EpollFlags::EPOLLOUT) {
            self.flush_client(state, handle);
        }
        if flags.intersects(
            EpollFlags::EPOLLIN
                | EpollFlags::EPOLLRDHUP
                | EpollFlags::EPOLLHUP
                | EpollFlags::EPOLLERR,
        ) {
            self.read_client(state, handle);
        }
    }

    // ── Accepting ───────────────────────────────────────────────────────

    fn accept_clients(&self, state: &mut ProviderState) {
        loop {
            let accepted = {
                let Some(listener) = state.listener.as_ref() else {
                    return;
                };
                socket::accept_nonblocking(listener)
            };
            match accepted {
                Ok(Some((stream, addr))) => {
                    if let Err(e) = self.adopt_client(state, stream, addr) {
                        warn!("{}: refusing {addr}: {e}", self.name);
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!("{}: accept failed: {e}", self.name);
                    return;
                }
            }
        }
    }

    fn adopt_client(
        &self,
        state: &mut ProviderState,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<()> {
        if state.clients.len() >= self.config.max_clients {
            return Err(TetherError::MaxClientsReached(self.config.max_clients));
        }
        let channel = Channel::new(stream, self.config.max_frame_bytes);
        let fd = channel.raw_fd();
        self.poller.add(channel.as_fd(), stream_interest(false))?;
        let handle = state.alloc_handle();
        state.by_fd.insert(fd, handle);
        state.broadcast_fds.insert(fd);
        state.clients.insert(
            handle,
            ClientSlot {
                channel,
                addr,
                last_recv: Instant::now(),
                last_sent: None,
                rtt_ms: None,
            },
        );
        state.pending_events.push(EndpointEvent::NewClient(handle));
        info!("{}: {handle} connected from {addr} (fd {fd})", self.name);
        Ok(())
    }

    // ── Heartbeats ──────────────────────────────────────────────────────

    fn on_tick(&self, state: &mut ProviderState) {
        if let Err(e) = state.timer.drain() {
            warn!("{}: heartbeat timer drain failed: {e}", self.name);
        }
        let now = Instant::now();
        // Sweep before sending so a dead client never gets one more
        // heartbeat queued onto a doomed socket.
        self.sweep_dead(state, now);
        self.send_heartbeats(state, now);
    }

    fn sweep_dead(&self, state: &mut ProviderState, now: Instant) {
        let timeout = Duration::from_millis(self.config.heartbeat_timeout_ms);
        let dead: Vec<ClientHandle> = state
            .clients
            .iter()
            .filter(|(_, slot)| now.saturating_duration_since(slot.last_recv) > timeout)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in dead {
            warn!("{}: {handle} heartbeat timed out", self.name);
            self.drop_client(state, handle, true);
        }
    }

    fn send_heartbeats(&self, state: &mut ProviderState, now: Instant) {
        let targets: Vec<ClientHandle> = state.clients.keys().copied().collect();
        for handle in targets {
            let _ = self.send_frame(state, handle, frame::heartbeat_frame());
            // The slot is gone if the send tore the client down.
            if let Some(slot) = state.clients.get_mut(&handle) {
                slot.last_sent = Some(now);
            }
        }
    }

    /// Any inbound frame proves liveness; a pending heartbeat also
    /// yields an RTT sample.
    fn note_liveness(&self, state: &mut ProviderState, handle: ClientHandle, now: Instant) {
        let Some(slot) = state.clients.get_mut(&handle) else {
            return;
        };
        slot.last_recv = now;
        if let Some(sent) = slot.last_sent.take() {
            let sample_ms = now.saturating_duration_since(sent).as_secs_f64() * 1_000.0;
            slot.rtt_ms = Some(update_rtt(slot.rtt_ms, sample_ms));
        }
    }

    // ── Client I/O ──────────────────────────────────────────────────────

    fn flush_client(&self, state: &mut ProviderState, handle: ClientHandle) {
        let result = {
            let Some(slot) = state.clients.get_mut(&handle) else {
                return;
            };
            channel::flush_on(&mut slot.channel, &self.poller)
        };
        if let Err(e) = result {
            warn!("{}: {handle} write failed: {e}", self.name);
            self.drop_client(state, handle, true);
        }
    }

    fn read_client(&self, state: &mut ProviderState, handle: ClientHandle) {
        let fill = {
            let Some(slot) = state.clients.get_mut(&handle) else {
                return;
            };
            slot.channel.fill()
        };
        let now = Instant::now();
        // Decode whatever arrived before acting on EOF or errors, so
        // frames that raced the close are not lost.
        loop {
            let decoded = {
                let Some(slot) = state.clients.get_mut(&handle) else {
                    return;
                };
                slot.channel.next_frame()
            };
            match decoded {
                Ok(Some(frame)) => {
                    debug!("{}: {handle} sent a {} frame", self.name, frame.kind());
                    self.note_liveness(state, handle, now);
                    if let Frame::Data(payload) = frame {
                        state
                            .pending_events
                            .push(EndpointEvent::Message(handle, payload));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("{}: {handle} protocol violation: {e}", self.name);
                    self.drop_client(state, handle, true);
                    return;
                }
            }
        }
        match fill {
            Ok(FillOutcome::Open) => {}
            Ok(FillOutcome::Closed) => {
                info!("{}: {handle} disconnected", self.name);
                self.drop_client(state, handle, true);
            }
            Err(e) => {
                warn!("{}: {handle} read failed: {e}", self.name);
                self.drop_client(state, handle, true);
            }
        }
    }

    fn drop_client(&self, state: &mut ProviderState, handle: ClientHandle, emit: bool) {
        let Some(slot) = state.clients.remove(&handle) else {
            return;
        };
        let fd = slot.channel.raw_fd();
        let _ = self.poller.delete(slot.channel.as_fd());
        drop(slot);
        state.by_fd.remove(&fd);
        state.broadcast_fds.remove(&fd);
        if emit {
            state.pending_events.push(EndpointEvent::LostClient(handle));
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Currently connected clients.
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Stats for one client; `None` if the handle is unknown.
    pub fn client_stats(&self, handle: ClientHandle) -> Option<ClientStats> {
        let state = self.lock();
        let slot = state.clients.get(&handle)?;
        Some(ClientStats {
            addr: slot.addr,
            rtt_ms: slot.rtt_ms,
            bytes_sent: slot.channel.bytes_sent(),
            bytes_recv: slot.channel.bytes_recv(),
        })
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Close the listener and every client, clear all state, and stop
    /// the heartbeat timer. Idempotent; emits no events. Afterwards
    /// `send` reports `NotConnected`, `publish` reports `Shutdown`, and
    /// `poll` is a no-op.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        let handles: Vec<ClientHandle> = state.clients.keys().copied().collect();
        for handle in handles {
            self.drop_client(&mut state, handle, false);
        }
        if let Some(listener) = state.listener.take() {
            let _ = self.poller.delete(listener.as_fd());
        }
        state.by_fd.clear();
        state.broadcast_fds.clear();
        state.pending_events.clear();
        if let Err(e) = state.timer.disarm() {
            warn!("{}: heartbeat timer disarm failed: {e}", self.name);
        }
        info!("{}: endpoint shut down", self.name);
    }
}

impl Drop for EndpointProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    #[test]
    fn test_update_rtt_first_sample_taken_whole() {
        let rtt = update_rtt(None, 4.0);
        assert!((rtt - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_update_rtt_blends_toward_new_samples() {
        let mut rtt = update_rtt(None, 10.0);
        rtt = update_rtt(Some(rtt), 20.0);
        // 0.3 * 20 + 0.7 * 10
        assert!((rtt - 13.0).abs() < 1e-9);
        // Repeated identical samples converge on the sample.
        for _ in 0..64 {
            rtt = update_rtt(Some(rtt), 20.0);
        }
        assert!((rtt - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_publish_returns_bound_addr() {
        let provider = EndpointProvider::new("t", EndpointConfig::dev_default()).unwrap();
        assert_eq!(provider.local_addr(), None);

        let bound = provider.publish("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(bound.port(), 0);
        assert_eq!(provider.local_addr(), Some(bound));

        assert_matches!(
            provider.publish("127.0.0.1:0".parse().unwrap()),
            Err(TetherError::AlreadyPublished(addr)) if addr == bound
        );
    }

    #[test]
    fn test_send_to_unknown_handle() {
        let provider = EndpointProvider::new("t", EndpointConfig::dev_default()).unwrap();
        assert_matches!(
            provider.send(ClientHandle(7), Bytes::from_static(b"x")),
            Err(TetherError::NotConnected)
        );
        // Broadcast over zero clients is a quiet no-op.
        provider.broadcast(Bytes::from_static(b"x")).unwrap();
    }

    #[test]
    fn test_zero_heartbeat_interval_still_sweeps() {
        let mut config = EndpointConfig::dev_default();
        config.heartbeat_interval_ms = 0;
        config.heartbeat_timeout_ms = 50;
        let provider = EndpointProvider::new("t", config).unwrap();
        let bound = provider.publish("127.0.0.1:0".parse().unwrap()).unwrap();
        let _silent = TcpStream::connect(bound).unwrap();

        // With the interval floored, the silent client must still be
        // noticed and then evicted by the timeout sweep.
        let mut events = Vec::new();
        let deadline = Instant::now().checked_add(Duration::from_secs(2)).unwrap();
        while events.len() < 2 && Instant::now() < deadline {
            provider.poll(10, |event| events.push(event)).unwrap();
        }
        assert_matches!(events.first(), Some(EndpointEvent::NewClient(_)));
        assert_matches!(events.get(1), Some(EndpointEvent::LostClient(_)));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let provider = EndpointProvider::new("t", EndpointConfig::dev_default()).unwrap();
        provider.publish("127.0.0.1:0".parse().unwrap()).unwrap();

        provider.shutdown();
        provider.shutdown();
        assert_eq!(provider.client_count(), 0);
        assert_eq!(provider.local_addr(), None);
        assert_matches!(
            provider.publish("127.0.0.1:0".parse().unwrap()),
            Err(TetherError::Shutdown)
        );
        assert_eq!(
            provider.poll(0, |_| panic!("no events after shutdown")).unwrap(),
            0
        );
    }
}
