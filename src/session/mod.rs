//! The session façade: lifecycle, shared state, and the single
//! state-keyed receive dispatcher that replaces the original's
//! handler-swapping between handshake phases.

pub mod delay;
pub mod frame_exchange;
pub mod handshake;
pub mod state;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn, Span};

use crate::{
    config::SessionConfig,
    endpoint::Endpoint,
    error::{Result, SessionError},
    protocol::{ControlMessage, Fingerprint, Payload},
    session::{
        delay::calculate_delay,
        frame_exchange::FrameExchange,
        handshake::CreateBookkeeping,
        state::{Roster, SessionState},
    },
    transport::{ErrorHandler, InboundHandler, Transport},
};

/// A host-supplied predicate comparing the local state fingerprint against
/// a peer's; `true` accepts the peer.
pub type StateCheck<F> = Arc<dyn Fn(&F, &F) -> bool + Send + Sync>;

enum HandshakeRole<F: Fingerprint> {
    Idle,
    Creator {
        players_needed: usize,
        local_state: F,
        state_check: StateCheck<F>,
        bookkeeping: CreateBookkeeping,
    },
    Joiner {
        host_ep: Endpoint,
        local_state: F,
        state_check: StateCheck<F>,
    },
}

struct Inner<T: Transport, P: Payload, F: Fingerprint> {
    transport: T,
    config: StdMutex<SessionConfig>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    roster: Mutex<Roster>,
    side: AtomicUsize,
    frame_exchange: FrameExchange<P>,
    handshake: Mutex<HandshakeRole<F>>,
    shutdown: AtomicBool,
    span: Span,
}

impl<T: Transport, P: Payload, F: Fingerprint> Inner<T, P, F> {
    fn set_state(&self, next: SessionState) {
        let prev = *self.state_tx.borrow();
        if prev == next {
            return;
        }
        info!(parent: &self.span, ?prev, ?next, "session state transition");
        let _ = self.state_tx.send(next);
    }

    fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    fn config(&self) -> SessionConfig {
        self.config.lock().unwrap().clone()
    }

    async fn send_control(&self, to: Endpoint, msg: ControlMessage<P, F>) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        self.transport.queue(to, buf.freeze());
        self.transport.send(to).await;
    }

    /// Queues and flushes `bytes`, applying the session's own jitter/loss
    /// knobs on every send, not only through the transport's test hook,
    /// mirroring the original's `session::send`.
    async fn send_with_jitter(&self, to: Endpoint, bytes: Bytes) {
        self.transport.queue(to, bytes);
        let cfg = self.config();
        let delay_ms = if cfg.send_delay_max_ms > cfg.send_delay_min_ms {
            rand::thread_rng().gen_range(cfg.send_delay_min_ms..=cfg.send_delay_max_ms)
        } else {
            cfg.send_delay_min_ms
        };
        self.transport
            .send_with_jitter(to, delay_ms, cfg.packet_loss_permille)
            .await;
    }

    async fn broadcast_with_jitter(&self, msg: ControlMessage<P, F>) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let bytes = buf.freeze();
        let eps = self.roster.lock().await.remote_endpoints();
        for ep in eps {
            self.send_with_jitter(ep, bytes.clone()).await;
        }
    }

    async fn handle_creator(&self, from: Endpoint, msg: ControlMessage<P, F>) {
        let now = Instant::now();
        let mut hs = self.handshake.lock().await;
        let HandshakeRole::Creator {
            players_needed,
            local_state,
            state_check,
            bookkeeping,
        } = &mut *hs
        else {
            return;
        };

        match msg {
            ControlMessage::Join { state, host_ep } => {
                if !(state_check)(local_state, &state) {
                    warn!(parent: &self.span, %from, "denying join: state mismatch");
                    self.send_control(
                        from,
                        ControlMessage::Deny {
                            state: local_state.clone(),
                        },
                    )
                    .await;
                    return;
                }
                bookkeeping.record_join(from, now);

                if self.state() != SessionState::Wait {
                    return;
                }
                let ttl = Duration::from_millis(self.config().peer_join_ttl_ms);
                let candidates = bookkeeping.candidate_roster(host_ep, ttl, now);
                if candidates.len() < *players_needed {
                    return;
                }

                let rand_seed = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as u32;
                let roster = Roster::build(candidates.clone(), 0);
                self.frame_exchange.initialize(candidates.len()).await;
                *self.roster.lock().await = roster;
                self.side.store(0, Ordering::Release);

                for (i, ep) in candidates.iter().enumerate() {
                    if i == 0 {
                        continue;
                    }
                    self.send_control(
                        *ep,
                        ControlMessage::Info {
                            rand_seed,
                            side: i as u8,
                            eps: candidates.clone(),
                            state: local_state.clone(),
                        },
                    )
                    .await;
                }
                info!(parent: &self.span, roster_len = candidates.len(), "roster filled, entering ping phase");
                self.set_state(SessionState::Ping);
            }
            ControlMessage::Ping => {
                self.send_control(from, ControlMessage::None).await;
            }
            ControlMessage::Delay { delay } => {
                bookkeeping.record_delay(from, delay, now);
                let quorum = players_needed.saturating_sub(1);
                if let Some(avg) = bookkeeping.average_delay(quorum) {
                    self.frame_exchange.set_delay(avg);
                    drop(hs);
                    self.broadcast_with_jitter(ControlMessage::Delay { delay: avg })
                        .await;
                    self.set_state(SessionState::Ready);
                }
            }
            _ => {}
        }
    }

    async fn handle_joiner(&self, from: Endpoint, msg: ControlMessage<P, F>) {
        let hs = self.handshake.lock().await;
        let HandshakeRole::Joiner {
            host_ep,
            local_state,
            state_check,
        } = &*hs
        else {
            return;
        };
        if from != *host_ep {
            return;
        }
        let state_now = self.state();

        match msg {
            ControlMessage::Deny { .. } => {
                warn!(parent: &self.span, %from, "join request denied by host");
                drop(hs);
                self.set_state(SessionState::Deny);
            }
            ControlMessage::Info {
                rand_seed: _,
                side,
                eps,
                state,
            } => {
                if state_now != SessionState::Join {
                    return;
                }
                // Ignored by design: only the creator's state_check gates
                // Deny; kept for compatibility with the original's behavior.
                let _ = (state_check)(local_state, &state);
                let roster = Roster::build(eps.clone(), side as usize);
                self.frame_exchange.initialize(eps.len()).await;
                *self.roster.lock().await = roster;
                self.side.store(side as usize, Ordering::Release);
                drop(hs);
                info!(parent: &self.span, side, roster_len = eps.len(), "roster assigned by host");
                self.set_state(SessionState::Info);
            }
            ControlMessage::Ping => {
                self.send_control(from, ControlMessage::None).await;
            }
            ControlMessage::Delay { delay } => {
                if state_now != SessionState::Delay {
                    return;
                }
                self.frame_exchange.set_delay(delay);
                drop(hs);
                self.set_state(SessionState::Ready);
                self.send_control(from, ControlMessage::Ready).await;
            }
            _ => {}
        }
    }

    async fn handle_ready(&self, from: Endpoint, msg: ControlMessage<P, F>) {
        let side = { self.roster.lock().await.side_of(from) };
        let Some(side) = side else {
            return;
        };
        match msg {
            ControlMessage::Frame { frame_id, payload } => {
                self.frame_exchange.record_remote(side, frame_id, payload).await;
                self.transport.send(from).await;
            }
            ControlMessage::Ready | ControlMessage::None => {}
            _ => {}
        }
    }
}

/// A [`SessionHandler`] is the single receive dispatcher installed on the
/// transport at `bind()` time; it routes every inbound datagram by the
/// session's *current* state rather than by swapping handlers between
/// handshake phases.
struct SessionHandler<T: Transport, P: Payload, F: Fingerprint>(Arc<Inner<T, P, F>>);

#[async_trait]
impl<T: Transport, P: Payload, F: Fingerprint> InboundHandler for SessionHandler<T, P, F> {
    async fn handle(&self, from: Endpoint, bytes: Bytes) {
        let msg = match ControlMessage::<P, F>::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(parent: &self.0.span, %from, error = %e, "dropping malformed datagram");
                return;
            }
        };
        let state = self.0.state();
        debug!(parent: &self.0.span, %from, ?state, ?msg, "inbound control message");
        match state {
            SessionState::Wait | SessionState::Ping => self.0.handle_creator(from, msg).await,
            SessionState::Join | SessionState::Info | SessionState::Delay => {
                self.0.handle_joiner(from, msg).await
            }
            SessionState::Ready => self.0.handle_ready(from, msg).await,
            SessionState::Deny | SessionState::None => {
                debug!(parent: &self.0.span, %from, "session inactive, dropping datagram");
            }
        }
    }
}

/// Peer-to-peer lockstep session: the host-facing façade over the
/// handshake engine, delay negotiator, and frame exchange, generic over a
/// [`Transport`], a frame [`Payload`] and a [`Fingerprint`].
pub struct Session<T: Transport, P: Payload, F: Fingerprint> {
    inner: Arc<Inner<T, P, F>>,
}

impl<T: Transport, P: Payload, F: Fingerprint> Clone for Session<T, P, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport, P: Payload, F: Fingerprint> Session<T, P, F> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::None);
        Self {
            inner: Arc::new(Inner {
                transport,
                config: StdMutex::new(config.normalized()),
                state_tx,
                state_rx: state_rx.clone(),
                roster: Mutex::new(Roster::default()),
                side: AtomicUsize::new(0),
                frame_exchange: FrameExchange::new(state_rx),
                handshake: Mutex::new(HandshakeRole::Idle),
                shutdown: AtomicBool::new(false),
                span: tracing::info_span!("lockstep_session"),
            }),
        }
    }

    /// Binds the transport and installs the single state-keyed dispatcher.
    /// Must be called before [`Self::create`]/[`Self::join`].
    pub async fn bind(&self, port: u16) -> Result<()> {
        let worker_count = self.inner.config().worker_count;
        self.inner.transport.start(port, worker_count).await?;
        self.inner
            .transport
            .set_receive_handler(Arc::new(SessionHandler(self.inner.clone())));
        let span = self.inner.span.clone();
        let handler: ErrorHandler = Arc::new(move |e| {
            error!(parent: &span, error = %e, "transport error");
        });
        self.inner.transport.set_error_handler(handler);
        Ok(())
    }

    pub async fn unbind(&self) {
        self.inner.transport.stop().await;
        self.inner.set_state(SessionState::None);
    }

    /// Becomes host of an `players_needed`-peer session.
    /// Returns `Ok(true)` once every peer is ready and the readiness
    /// barrier has drained, `Ok(false)` on timeout.
    pub async fn create(
        &self,
        players_needed: usize,
        state: F,
        state_check: impl Fn(&F, &F) -> bool + Send + Sync + 'static,
        timeout_ms: u64,
    ) -> Result<bool> {
        *self.inner.handshake.lock().await = HandshakeRole::Creator {
            players_needed,
            local_state: state,
            state_check: Arc::new(state_check),
            bookkeeping: CreateBookkeeping::new(players_needed),
        };
        self.inner.set_state(SessionState::Wait);

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        if !self.wait_for_ready(deadline).await {
            self.inner.set_state(SessionState::None);
            return Ok(false);
        }

        self.readiness_barrier(deadline).await;
        Ok(true)
    }

    /// Connects to an existing host at `host`. Returns
    /// `Ok(true)` once `Ready`, `Ok(false)` on `Deny` or timeout.
    pub async fn join(
        &self,
        host: Endpoint,
        state: F,
        state_check: impl Fn(&F, &F) -> bool + Send + Sync + 'static,
        timeout_ms: u64,
    ) -> Result<bool> {
        *self.inner.handshake.lock().await = HandshakeRole::Joiner {
            host_ep: host,
            local_state: state.clone(),
            state_check: Arc::new(state_check),
        };
        self.inner.set_state(SessionState::Join);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        // Step 2: retransmit Join until Info/Deny or timeout.
        loop {
            self.inner
                .send_control(
                    host,
                    ControlMessage::Join {
                        state: state.clone(),
                        host_ep: host,
                    },
                )
                .await;

            match self.await_state_change(deadline).await {
                Some(SessionState::Deny) => return Ok(false),
                Some(SessionState::Info) => break,
                Some(_) => continue,
                None => {
                    self.inner.set_state(SessionState::None);
                    return Ok(false);
                }
            }
        }

        // Step 3: ping phase.
        let remote_eps = self.inner.roster.lock().await.remote_endpoints();
        let ping_count = self.inner.config().ping_count;
        let ping_interval_ms = self.inner.config().ping_interval_ms;
        for _ in 0..ping_count {
            if self.inner.shutdown.load(Ordering::Acquire) {
                return Ok(false);
            }
            for ep in &remote_eps {
                self.inner.send_control(*ep, ControlMessage::Ping).await;
            }
            if Instant::now() >= deadline {
                self.inner.set_state(SessionState::None);
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(ping_interval_ms)).await;
        }

        // Step 4: propose a delay from the measured RTT.
        let rtt_max = remote_eps
            .iter()
            .map(|ep| self.inner.transport.peer_stats(*ep).rtt_avg_ms)
            .max()
            .unwrap_or(0);
        let proposed = calculate_delay((((rtt_max as f64) + (rtt_max as f64)) / 1.5) as u32);
        self.inner.set_state(SessionState::Delay);

        // Step 5: retransmit Delay until the host's echo lands and the
        // transport reports the datagram as delivered.
        loop {
            if self.inner.shutdown.load(Ordering::Acquire) {
                return Ok(false);
            }
            self.inner
                .send_control(host, ControlMessage::Delay { delay: proposed })
                .await;
            if self.inner.state() == SessionState::Ready
                && self.inner.transport.send(host).await == 0
            {
                break;
            }
            if Instant::now() >= deadline {
                self.inner.set_state(SessionState::None);
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(self.inner.config().delay_retry_interval_ms))
                .await;
        }

        // Step 7: retransmit Ready `delay` more times or until acked.
        let ready_retry_interval_ms = self.inner.config().ready_retry_interval_ms;
        let retries = self.inner.frame_exchange.delay().max(1);
        for _ in 0..retries {
            if self.inner.shutdown.load(Ordering::Acquire) {
                return Ok(false);
            }
            self.inner.send_control(host, ControlMessage::Ready).await;
            if self.inner.transport.send(host).await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(ready_retry_interval_ms)).await;
        }
        Ok(true)
    }

    /// Waits until the session reaches `Ready`, `deadline` passes, or
    /// `shutdown()` is called. A shutdown mid-wait must abort immediately
    /// rather than sleep out the rest of the caller's original timeout, so
    /// this is checked on every iteration in addition to racing the state
    /// watch and the deadline sleep.
    async fn wait_for_ready(&self, deadline: Instant) -> bool {
        let mut state_rx = self.inner.state_rx.clone();
        loop {
            if self.inner.shutdown.load(Ordering::Acquire) {
                return false;
            }
            if state_rx.borrow().is_ready() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining) => return false,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Waits for the next state change, or `None` on timeout or shutdown.
    async fn await_state_change(&self, deadline: Instant) -> Option<SessionState> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return None;
        }
        let mut state_rx = self.inner.state_rx.clone();
        let retry = Duration::from_millis(self.inner.config().join_retry_interval_ms);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let wait = remaining.min(retry);
        tokio::select! {
            _ = tokio::time::sleep(wait) => Some(self.inner.state()),
            changed = state_rx.changed() => {
                if changed.is_err() {
                    None
                } else {
                    Some(*state_rx.borrow())
                }
            }
        }
    }

    /// The post-handshake "all `Ready` acked" barrier: re-flushes every
    /// remote peer's queue on a fixed interval until every pending count
    /// reaches 0, `deadline` passes, or `shutdown()` is called.
    async fn readiness_barrier(&self, deadline: Instant) {
        let poll_interval = self.inner.config().readiness_poll_interval_ms;
        loop {
            if self.inner.shutdown.load(Ordering::Acquire) {
                return;
            }
            let eps = self.inner.roster.lock().await.remote_endpoints();
            let mut pending = 0usize;
            for ep in &eps {
                pending += self.inner.transport.send(*ep).await;
            }
            if pending == 0 || Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(poll_interval)).await;
        }
    }

    /// Stores `payload` for the current frame plus the negotiated delay,
    /// broadcasts it, and flushes.
    pub async fn set(&self, payload: P) -> Result<()> {
        if !self.inner.state().is_ready() {
            return Err(SessionError::InvalidState);
        }
        let side = self.side();
        let frame_id = self.inner.frame_exchange.record_local(side, payload.clone()).await;
        self.inner
            .broadcast_with_jitter(ControlMessage::Frame { frame_id, payload })
            .await;
        Ok(())
    }

    /// Returns `side`'s payload for the current frame.
    pub async fn get(&self, side: usize, timeout_ms: i64) -> Result<Option<P>> {
        self.inner.frame_exchange.get(side, timeout_ms).await
    }

    pub fn next_frame(&self) {
        self.inner.frame_exchange.next_frame();
    }

    pub fn frame(&self) -> i64 {
        self.inner.frame_exchange.frame()
    }

    pub fn set_frame(&self, frame: i64) {
        self.inner.frame_exchange.set_frame(frame);
    }

    pub fn delay(&self) -> u8 {
        self.inner.frame_exchange.delay()
    }

    pub fn set_delay(&self, delay: u8) {
        self.inner.frame_exchange.set_delay(delay);
    }

    pub fn side(&self) -> usize {
        self.inner.side.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.roster.lock().await.endpoints.clone()
    }

    pub async fn first_received_frame(&self) -> i64 {
        self.inner.frame_exchange.first_last_received_frame().await.0
    }

    pub async fn last_received_frame(&self) -> i64 {
        self.inner.frame_exchange.first_last_received_frame().await.1
    }

    /// Count of accepted inbound messages, mirroring the original's
    /// `_counter`.
    pub fn messages_received(&self) -> u64 {
        self.inner.frame_exchange.messages_received()
    }

    pub fn set_send_delay_range(&self, min_ms: u32, max_ms: u32) {
        let mut cfg = self.inner.config.lock().unwrap();
        cfg.send_delay_min_ms = min_ms;
        cfg.send_delay_max_ms = max_ms;
        *cfg = cfg.clone().normalized();
    }

    pub fn set_packet_loss(&self, permille: u32) {
        self.inner.config.lock().unwrap().packet_loss_permille = permille;
    }

    /// Idempotent. Flips the stop flag, wakes every blocked `get`,
    /// releases the handshake driver, and returns the session to `None`.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.set_state(SessionState::None);
        self.inner.frame_exchange.wake_all();
        self.inner.transport.stop().await;
    }
}
