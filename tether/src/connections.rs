//! Outbound peer pool with deadline-scheduled reconnection.
//!
//! A [`Connections`] instance owns a set of registered peers and keeps a
//! connection to each of them alive. Connection loss schedules a
//! jittered reconnect deadline; in [`Model::Rotate`] healthy connections
//! are additionally torn down and re-established once they reach the
//! configured period, so no link outlives roughly one period.
//!
//! The pool is a single-threaded non-blocking reactor: it exposes a
//! pollable descriptor via [`fd`](Connections::fd), and all socket and
//! timer work happens inside [`poll`](Connections::poll). Mutating calls
//! (`add`, `send`, `broadcast`, ...) are safe from any thread; they take
//! the internal state lock briefly and never block on the network.

use {
    crate::{
        channel::{self, Channel, FillOutcome},
        config::{Model, PoolConfig},
        deadline::DeadlineQueue,
        error::{Result, TetherError},
        frame::{self, Frame},
        poller::{connecting_interest, stream_interest, Poller, EVENT_BATCH},
        socket::{self, Connect},
        timer::IntervalTimer,
    },
    bytes::Bytes,
    log::{debug, info, warn},
    nix::sys::epoll::{EpollEvent, EpollFlags},
    rand::{rngs::SmallRng, Rng, SeedableRng},
    std::{
        collections::{BTreeSet, HashMap},
        fmt,
        net::{SocketAddr, TcpStream},
        os::fd::RawFd,
        sync::{Mutex, MutexGuard},
        time::{Duration, Instant},
    },
};

/// Opaque identifier for a registered peer. Ids are assigned
/// monotonically and never reused, so a stale id can at worst name a
/// peer that no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Connection lifecycle and inbound traffic, delivered synchronously
/// from within [`Connections::poll`].
#[derive(Debug)]
pub enum PoolEvent {
    /// A connect attempt completed; the peer is now sendable.
    Connected(PeerId),
    /// An established connection was lost. Not emitted for
    /// caller-initiated `remove` or `shutdown`.
    Disconnected(PeerId),
    /// A data frame arrived from the peer.
    Message(PeerId, Bytes),
}

#[derive(Debug)]
struct Link<D> {
    channel: Channel,
    data: D,
    /// False while the non-blocking connect is still in flight.
    ready: bool,
    connect_started: Instant,
}

#[derive(Debug)]
struct Peer<D> {
    addr: SocketAddr,
    link: Option<Link<D>>,
    /// Current backoff window (ms); zero after a successful connect.
    wait_ms: u64,
    /// Guards the one-pending-deadline-per-peer invariant.
    deadline_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStatus {
    Absent,
    Connecting,
    Ready,
}

#[derive(Debug)]
struct PoolState<D> {
    peers: HashMap<PeerId, Peer<D>>,
    by_fd: HashMap<RawFd, PeerId>,
    /// Connected descriptors in ascending order; broadcast walks this.
    broadcast_fds: BTreeSet<RawFd>,
    deadlines: DeadlineQueue,
    timer: IntervalTimer,
    rng: SmallRng,
    next_id: u64,
    period_ms: u64,
    pending_events: Vec<PoolEvent>,
    shut_down: bool,
}

impl<D> PoolState<D> {
    fn alloc_id(&mut self) -> PeerId {
        let id = PeerId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        id
    }

    fn link_mut(&mut self, id: PeerId) -> Option<&mut Link<D>> {
        self.peers.get_mut(&id)?.link.as_mut()
    }

    fn link_status(&self, id: PeerId) -> Option<LinkStatus> {
        let peer = self.peers.get(&id)?;
        Some(match &peer.link {
            None => LinkStatus::Absent,
            Some(link) if link.ready => LinkStatus::Ready,
            Some(_) => LinkStatus::Connecting,
        })
    }

    /// Register a deadline for `id` unless one is already pending.
    fn push_deadline(&mut self, id: PeerId, due: Instant) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if peer.deadline_pending {
            return;
        }
        peer.deadline_pending = true;
        self.deadlines.push(id, due);
    }

    /// Schedule the next reconnect attempt with doubled, jittered
    /// backoff.
    fn schedule_retry(&mut self, id: PeerId, now: Instant) {
        let period = self.period_ms;
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if peer.deadline_pending {
            return;
        }
        let wait = next_backoff(peer.wait_ms, period);
        peer.wait_ms = wait;
        peer.deadline_pending = true;
        let jittered = self.rng.random_range(wait / 2..=wait);
        let due = now
            .checked_add(Duration::from_millis(jittered))
            .unwrap_or(now);
        self.deadlines.push(id, due);
        debug!("{id} reconnect in {jittered}ms (backoff window {wait}ms)");
    }

    /// Schedule the rotation teardown for a freshly-connected peer:
    /// uniformly inside `[period/2, period]`, so rotations stagger while
    /// no connection outlives one period.
    fn schedule_rotation(&mut self, id: PeerId, now: Instant) {
        let period = self.period_ms.max(1);
        let wait = self.rng.random_range(period / 2..=period);
        let due = now.checked_add(Duration::from_millis(wait)).unwrap_or(now);
        self.push_deadline(id, due);
    }
}

/// Doubled backoff clamped to `[period/4, period*4]`.
fn next_backoff(wait_ms: u64, period_ms: u64) -> u64 {
    let period = period_ms.max(1);
    let floor = (period / 4).max(1);
    let ceil = period.saturating_mul(4).max(floor);
    wait_ms.saturating_mul(2).clamp(floor, ceil)
}

/// Tick rate the reconnect timer runs at. Deadlines fire with this
/// granularity.
fn tick_interval(period_ms: u64) -> Duration {
    Duration::from_millis((period_ms / 4).clamp(1, 250))
}

/// Outbound peer pool. See the module docs for the lifecycle model.
///
/// The `D` type parameter is an opaque per-connection payload,
/// default-constructed when a connection is established and dropped with
/// it; access it through [`with_data`](Connections::with_data).
#[derive(Debug)]
pub struct Connections<D: Default = ()> {
    config: PoolConfig,
    poller: Poller,
    timer_fd: RawFd,
    state: Mutex<PoolState<D>>,
}

impl<D: Default> Connections<D> {
    /// Create an empty pool; its tick timer starts immediately.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let poller = Poller::new()?;
        let mut timer = IntervalTimer::new()?;
        timer.arm(tick_interval(config.period_ms))?;
        poller.add(timer.as_fd(), EpollFlags::EPOLLIN)?;
        let timer_fd = timer.as_raw_fd();
        info!(
            "connection pool created: model {:?}, period {}ms",
            config.model, config.period_ms
        );
        Ok(Self {
            poller,
            timer_fd,
            state: Mutex::new(PoolState {
                peers: HashMap::new(),
                by_fd: HashMap::new(),
                broadcast_fds: BTreeSet::new(),
                deadlines: DeadlineQueue::default(),
                timer,
                rng: SmallRng::from_os_rng(),
                next_id: 0,
                period_ms: config.period_ms,
                pending_events: Vec::new(),
                shut_down: false,
            }),
            config,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<D>> {
        self.state.lock().unwrap()
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Register a peer for outbound connection. The first attempt fires
    /// on the next tick.
    pub fn add(&self, addr: SocketAddr) -> Result<PeerId> {
        let mut state = self.lock();
        if state.shut_down {
            return Err(TetherError::Shutdown);
        }
        let id = state.alloc_id();
        state.peers.insert(
            id,
            Peer {
                addr,
                link: None,
                wait_ms: 0,
                deadline_pending: true,
            },
        );
        state.deadlines.push(id, Instant::now());
        info!("{id} registered for {addr}");
        Ok(id)
    }

    /// Adopt an already-established stream as a live peer connection.
    /// `Connected` is delivered on the next poll.
    pub fn add_connected(&self, stream: TcpStream, addr: SocketAddr) -> Result<PeerId> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let mut state = self.lock();
        if state.shut_down {
            return Err(TetherError::Shutdown);
        }
        let channel = Channel::new(stream, self.config.max_frame_bytes);
        let fd = channel.raw_fd();
        self.poller.add(channel.as_fd(), stream_interest(false))?;
        let id = state.alloc_id();
        let now = Instant::now();
        state.by_fd.insert(fd, id);
        state.broadcast_fds.insert(fd);
        state.peers.insert(
            id,
            Peer {
                addr,
                link: Some(Link {
                    channel,
                    data: D::default(),
                    ready: true,
                    connect_started: now,
                }),
                wait_ms: 0,
                deadline_pending: false,
            },
        );
        state.pending_events.push(PoolEvent::Connected(id));
        if self.config.model == Model::Rotate {
            state.schedule_rotation(id, now);
        }
        info!("{id} adopted established connection to {addr} (fd {fd})");
        Ok(id)
    }

    /// Unregister a peer, closing any live connection and discarding its
    /// pending deadline. Idempotent; emits no event.
    pub fn remove(&self, id: PeerId) {
        let mut state = self.lock();
        self.drop_link(&mut state, id, false);
        if state.peers.remove(&id).is_some() {
            info!("{id} removed");
        }
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Frame and send `payload` to a connected peer. Queued behind any
    /// unflushed bytes; per-peer FIFO order is preserved.
    ///
    /// Fails with [`TetherError::NotConnected`] if the peer has no ready
    /// connection. A write failure tears the connection down and
    /// surfaces as `Disconnected` on the next poll, not here.
    pub fn send(&self, id: PeerId, payload: Bytes) -> Result<()> {
        let wire = Frame::Data(payload).encode(self.config.max_frame_bytes)?;
        let mut state = self.lock();
        self.send_frame(&mut state, id, wire)
    }

    /// Send `payload` to every connected peer, walking the snapshot of
    /// connected descriptors in ascending order.
    pub fn broadcast(&self, payload: Bytes) -> Result<()> {
        let wire = Frame::Data(payload).encode(self.config.max_frame_bytes)?;
        let mut state = self.lock();
        let targets: Vec<PeerId> = state
            .broadcast_fds
            .iter()
            .filter_map(|fd| state.by_fd.get(fd).copied())
            .collect();
        for id in targets {
            // Ignore races with teardown; the affected peer is already on
            // its way to a Disconnected event.
            let _ = self.send_frame(&mut state, id, wire.clone());
        }
        Ok(())
    }

    fn send_frame(&self, state: &mut PoolState<D>, id: PeerId, wire: Bytes) -> Result<()> {
        let Some(peer) = state.peers.get_mut(&id) else {
            return Err(TetherError::NotConnected);
        };
        let Some(link) = peer.link.as_mut() else {
            return Err(TetherError::NotConnected);
        };
        if !link.ready {
            return Err(TetherError::NotConnected);
        }
        match channel::send_on(&mut link.channel, &self.poller, wire) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("{id} write failed: {e}");
                self.drop_link(state, id, true);
                state.schedule_retry(id, Instant::now());
                Ok(())
            }
        }
    }

    // ── Polling ─────────────────────────────────────────────────────────

    /// Drive the reactor: wait up to `timeout_ms` for readiness, process
    /// one batch of socket and timer events, and deliver the resulting
    /// events through `on_event`. Returns the number delivered.
    ///
    /// `on_event` runs on the calling thread with no internal lock held,
    /// so it may call back into the pool (except `poll` itself).
    pub fn poll(&self, timeout_ms: u64, mut on_event: impl FnMut(PoolEvent)) -> Result<usize> {
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

    /// The pool's pollable descriptor: readable when `poll` has work.
    pub fn fd(&self) -> RawFd {
        self.poller.as_raw_fd()
    }

    fn dispatch(&self, state: &mut PoolState<D>, ev: &EpollEvent) {
        if ev.data() == self.timer_fd as u64 {
            self.on_tick(state);
            return;
        }
        let fd = ev.data() as RawFd;
        let Some(&id) = state.by_fd.get(&fd) else {
            // Stale readiness for a connection torn down earlier in the
            // batch.
            return;
        };
        let Some(status) = state.link_status(id) else {
            return;
        };
        if status == LinkStatus::Connecting {
            self.finish_connect(state, id, fd);
            return;
        }
        let flags = ev.events();
        if flags.intersects(EpollFlags::EPOLLOUT) {
            self.flush_link(state, id);
        }
        if flags.intersects(
            EpollFlags::EPOLLIN
                | EpollFlags::EPOLLRDHUP
                | EpollFlags::EPOLLHUP
                | EpollFlags::EPOLLERR,
        ) {
            self.read_link(state, id);
        }
    }

    fn on_tick(&self, state: &mut PoolState<D>) {
        if let Err(e) = state.timer.drain() {
            warn!("pool timer drain failed: {e}");
        }
        let now = Instant::now();
        if !state.deadlines.is_empty() {
            self.topup_connections(state, now);
        }
        self.sweep_connecting(state, now);
    }

    /// Pop every due deadline and act on it.
    fn topup_connections(&self, state: &mut PoolState<D>, now: Instant) {
        while let Some(deadline) = state.deadlines.pop_due(now) {
            let id = deadline.peer;
            let Some(peer) = state.peers.get_mut(&id) else {
                // Peer was removed; its deadline dies here.
                continue;
            };
            peer.deadline_pending = false;
            let status = match &peer.link {
                None => LinkStatus::Absent,
                Some(link) if link.ready => LinkStatus::Ready,
                Some(_) => LinkStatus::Connecting,
            };
            match (status, self.config.model) {
                (LinkStatus::Absent, _) => self.attempt_connect(state, id, now),
                (LinkStatus::Ready, Model::Rotate) => {
                    info!("{id} rotating connection");
                    self.drop_link(state, id, true);
                    self.attempt_connect(state, id, now);
                }
                // Stale deadline for an already-healthy persistent peer.
                (LinkStatus::Ready, Model::Persistent) => {}
                // A connect is in flight; epoll or the connect-timeout
                // sweep will resolve it.
                (LinkStatus::Connecting, _) => {}
            }
        }
    }

    /// Abort connects stuck in flight longer than the configured
    /// timeout and put them back on the schedule.
    fn sweep_connecting(&self, state: &mut PoolState<D>, now: Instant) {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stuck: Vec<PeerId> = state
            .peers
            .iter()
            .filter(|(_, peer)| {
                peer.link.as_ref().is_some_and(|link| {
                    !link.ready && now.saturating_duration_since(link.connect_started) > timeout
                })
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stuck {
            debug!("{id} connect timed out");
            self.drop_link(state, id, false);
            state.schedule_retry(id, now);
        }
    }

    fn attempt_connect(&self, state: &mut PoolState<D>, id: PeerId, now: Instant) {
        let Some(peer) = state.peers.get(&id) else {
            return;
        };
        let addr = peer.addr;
        match socket::connect_nonblocking(addr) {
            Ok(Connect::Ready(stream)) => self.install_link(state, id, stream, now, true),
            Ok(Connect::Pending(stream)) => self.install_link(state, id, stream, now, false),
            Err(e) => {
                debug!("{id} connect to {addr} failed: {e}");
                state.schedule_retry(id, now);
            }
        }
    }

    fn install_link(
        &self,
        state: &mut PoolState<D>,
        id: PeerId,
        stream: TcpStream,
        now: Instant,
        ready: bool,
    ) {
        let channel = Channel::new(stream, self.config.max_frame_bytes);
        let fd = channel.raw_fd();
        let interest = if ready {
            stream_interest(false)
        } else {
            connecting_interest()
        };
        if let Err(e) = self.poller.add(channel.as_fd(), interest) {
            warn!("{id} failed to register fd {fd}: {e}");
            state.schedule_retry(id, now);
            return;
        }
        state.by_fd.insert(fd, id);
        {
            let Some(peer) = state.peers.get_mut(&id) else {
                return;
            };
            peer.link = Some(Link {
                channel,
                data: D::default(),
                ready,
                connect_started: now,
            });
            if ready {
                peer.wait_ms = 0;
            }
        }
        if ready {
            state.broadcast_fds.insert(fd);
            state.pending_events.push(PoolEvent::Connected(id));
            info!("{id} connected (fd {fd})");
            if self.config.model == Model::Rotate {
                state.schedule_rotation(id, now);
            }
        }
    }

    /// Resolve an in-flight connect once epoll reports writability (or a
    /// hangup) on it.
    fn finish_connect(&self, state: &mut PoolState<D>, id: PeerId, fd: RawFd) {
        let now = Instant::now();
        let verdict = {
            let Some(link) = state.link_mut(id) else {
                return;
            };
            socket::connect_result(link.channel.stream())
        };
        match verdict {
            Ok(true) => {
                {
                    let Some(link) = state.link_mut(id) else {
                        return;
                    };
                    link.ready = true;
                    if let Err(e) = self.poller.modify(link.channel.as_fd(), stream_interest(false))
                    {
                        warn!("{id} failed to update interest: {e}");
                    }
                }
                if let Some(peer) = state.peers.get_mut(&id) {
                    peer.wait_ms = 0;
                }
                state.broadcast_fds.insert(fd);
                state.pending_events.push(PoolEvent::Connected(id));
                info!("{id} connected (fd {fd})");
                if self.config.model == Model::Rotate {
                    state.schedule_rotation(id, now);
                }
            }
            // A stale event for a recycled descriptor can land here
            // while the handshake is still in flight; the socket's own
            // completion event follows.
            Ok(false) => {}
            Err(e) => {
                debug!("{id} connect failed: {e}");
                self.drop_link(state, id, false);
                state.schedule_retry(id, now);
            }
        }
    }

    fn flush_link(&self, state: &mut PoolState<D>, id: PeerId) {
        let result = {
            let Some(link) = state.link_mut(id) else {
                return;
            };
            channel::flush_on(&mut link.channel, &self.poller)
        };
        if let Err(e) = result {
            warn!("{id} write failed: {e}");
            self.drop_link(state, id, true);
            state.schedule_retry(id, Instant::now());
        }
    }

    fn read_link(&self, state: &mut PoolState<D>, id: PeerId) {
        let fill = {
            let Some(link) = state.link_mut(id) else {
                return;
            };
            link.channel.fill()
        };
        // Decode whatever arrived before acting on EOF or errors, so
        // frames that raced the close are not lost.
        loop {
            let decoded = {
                let Some(link) = state.link_mut(id) else {
                    return;
                };
                link.channel.next_frame()
            };
            match decoded {
                Ok(Some(Frame::Data(payload))) => {
                    state.pending_events.push(PoolEvent::Message(id, payload));
                }
                Ok(Some(Frame::Heartbeat)) => self.echo_heartbeat(state, id),
                Ok(None) => break,
                Err(e) => {
                    warn!("{id} protocol violation: {e}");
                    self.drop_link(state, id, true);
                    state.schedule_retry(id, Instant::now());
                    return;
                }
            }
        }
        match fill {
            Ok(FillOutcome::Open) => {}
            Ok(FillOutcome::Closed) => {
                info!("{id} connection closed by peer");
                self.drop_link(state, id, true);
                state.schedule_retry(id, Instant::now());
            }
            Err(e) => {
                warn!("{id} read failed: {e}");
                self.drop_link(state, id, true);
                state.schedule_retry(id, Instant::now());
            }
        }
    }

    /// Every received heartbeat is answered with one heartbeat, which is
    /// what keeps this pool's liveness visible to the remote endpoint.
    fn echo_heartbeat(&self, state: &mut PoolState<D>, id: PeerId) {
        let _ = self.send_frame(state, id, frame::heartbeat_frame());
    }

    /// Tear down a peer's link, if any. Returns whether the link had
    /// reached the connected state.
    fn drop_link(&self, state: &mut PoolState<D>, id: PeerId, emit: bool) -> bool {
        let Some(peer) = state.peers.get_mut(&id) else {
            return false;
        };
        let Some(link) = peer.link.take() else {
            return false;
        };
        let fd = link.channel.raw_fd();
        let was_ready = link.ready;
        let _ = self.poller.delete(link.channel.as_fd());
        drop(link);
        state.by_fd.remove(&fd);
        state.broadcast_fds.remove(&fd);
        if emit && was_ready {
            state.pending_events.push(PoolEvent::Disconnected(id));
        }
        was_ready
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Total registered peers, connected or not.
    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    /// Peers with a ready connection.
    pub fn connected_count(&self) -> usize {
        self.lock().broadcast_fds.len()
    }

    /// Whether `id` currently has a ready connection.
    pub fn is_connected(&self, id: PeerId) -> bool {
        self.lock()
            .peers
            .get(&id)
            .and_then(|peer| peer.link.as_ref())
            .is_some_and(|link| link.ready)
    }

    /// The address a peer was registered with.
    pub fn peer_addr(&self, id: PeerId) -> Option<SocketAddr> {
        self.lock().peers.get(&id).map(|peer| peer.addr)
    }

    /// The configured reconnection model.
    pub fn model(&self) -> Model {
        self.config.model
    }

    /// Run `f` over the peer's connection payload. `None` if the peer
    /// has no connection (the payload lives and dies with one).
    pub fn with_data<R>(&self, id: PeerId, f: impl FnOnce(&mut D) -> R) -> Option<R> {
        let mut state = self.lock();
        state.link_mut(id).map(|link| f(&mut link.data))
    }

    /// Change the base period and re-arm the tick timer.
    pub fn set_period(&self, period_ms: u64) -> Result<()> {
        let mut state = self.lock();
        if state.shut_down {
            return Err(TetherError::Shutdown);
        }
        state.period_ms = period_ms;
        state.timer.arm(tick_interval(period_ms))?;
        info!("pool period set to {period_ms}ms");
        Ok(())
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Close every connection, drop all peers and deadlines, and stop
    /// the timer. Idempotent; emits no events. Afterwards `send` reports
    /// `NotConnected`, `add` reports `Shutdown`, and `poll` is a no-op.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        debug!(
            "dropping {} peers and {} pending deadlines",
            state.peers.len(),
            state.deadlines.len()
        );
        let ids: Vec<PeerId> = state.peers.keys().copied().collect();
        for id in ids {
            self.drop_link(&mut state, id, false);
        }
        state.peers.clear();
        state.by_fd.clear();
        state.broadcast_fds.clear();
        state.deadlines.clear();
        state.pending_events.clear();
        if let Err(e) = state.timer.disarm() {
            warn!("pool timer disarm failed: {e}");
        }
        info!("connection pool shut down");
    }
}

impl<D: Default> Drop for Connections<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
