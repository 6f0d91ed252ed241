//! The concurrent per-side frame buffer: a blocking `get` paired with a
//! broadcasting `set`, safe for one host thread and many transport tasks
//! to share.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering},
};

use tokio::sync::{watch, Mutex, Notify};

use crate::{
    error::{Result, SessionError},
    protocol::payload::Payload,
    session::state::SessionState,
};

struct TableState<P: Payload> {
    /// One map per side, `frame_id -> payload`. Write-once per key: a
    /// second write to an already-populated key is ignored rather than
    /// overwriting, so redelivery of the same frame never changes what a
    /// waiter observes.
    table: Vec<HashMap<i64, P>>,
    first_received_frame: i64,
    last_received_frame: i64,
}

impl<P: Payload> TableState<P> {
    fn new(sides: usize) -> Self {
        Self {
            table: (0..sides).map(|_| HashMap::new()).collect(),
            first_received_frame: -1,
            last_received_frame: -1,
        }
    }
}

/// Holds every side's input history for the current session and arbitrates
/// blocking `get` against concurrent `set`/receive-path writers.
///
/// `delay` and `current_frame` are not behind the table lock: `delay` is
/// fixed during handshake and is thereafter read-only once the simulation
/// thread observes `Ready`, and `current_frame` is touched only by the host
/// thread via `set`/`get`/`next_frame`. Both are plain atomics so the type
/// stays `Sync` without forcing every read through the table lock.
pub struct FrameExchange<P: Payload> {
    state: Mutex<TableState<P>>,
    notify: Notify,
    delay: AtomicU32,
    current_frame: AtomicI64,
    messages_received: AtomicU64,
    session_state: watch::Receiver<SessionState>,
}

impl<P: Payload> FrameExchange<P> {
    /// Sides are unknown until the roster is finalized during handshake,
    /// so this starts with an empty table; call [`Self::initialize`] once
    /// the roster size is known, mirroring the original's
    /// `connection_established` resizing `_frame_table` to `_eps.size() + 1`.
    pub fn new(session_state: watch::Receiver<SessionState>) -> Self {
        Self {
            state: Mutex::new(TableState::new(0)),
            notify: Notify::new(),
            delay: AtomicU32::new(0),
            current_frame: AtomicI64::new(0),
            messages_received: AtomicU64::new(0),
            session_state,
        }
    }

    /// Allocates `sides` empty per-side tables and resets the min/max
    /// counters. Called exactly once, right before the session becomes
    /// `Ready`.
    pub async fn initialize(&self, sides: usize) {
        let mut state = self.state.lock().await;
        *state = TableState::new(sides);
    }

    pub fn set_delay(&self, delay: u8) {
        self.delay.store(delay as u32, Ordering::Release);
    }

    pub fn delay(&self) -> u8 {
        self.delay.load(Ordering::Acquire) as u8
    }

    pub fn frame(&self) -> i64 {
        self.current_frame.load(Ordering::Acquire)
    }

    pub fn set_frame(&self, frame: i64) {
        self.current_frame.store(frame, Ordering::Release);
    }

    pub fn next_frame(&self) {
        self.current_frame.fetch_add(1, Ordering::AcqRel);
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub async fn first_last_received_frame(&self) -> (i64, i64) {
        let state = self.state.lock().await;
        (state.first_received_frame, state.last_received_frame)
    }

    /// Writes `payload` into the local side's table at `current_frame +
    /// delay` and returns the frame id it was stored under. The caller
    /// (the session façade) holds this write and the subsequent broadcast
    /// enqueue as one critical section, then releases before flushing.
    pub async fn record_local(&self, local_side: usize, payload: P) -> i64 {
        let frame_id = self.frame() + self.delay() as i64;
        let mut state = self.state.lock().await;
        state.table[local_side].insert(frame_id, payload);
        frame_id
    }

    /// The receive-path write: stores a remote peer's input, updates the
    /// min/max counters, and wakes every blocked `get`. Idempotent:
    /// re-delivery of the same `(side, frame_id)` leaves the stored
    /// payload unchanged, even if the redelivered datagram carries a
    /// different payload than what is already stored.
    pub async fn record_remote(&self, side: usize, frame_id: i64, payload: P) {
        {
            let mut state = self.state.lock().await;
            state.table[side].entry(frame_id).or_insert(payload);

            if state.first_received_frame < 0 || frame_id < state.first_received_frame {
                state.first_received_frame = frame_id;
            }
            if state.last_received_frame < 0 || frame_id > state.last_received_frame {
                state.last_received_frame = frame_id;
            }
        }
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    /// Unblocks every waiter in `get`; called by `shutdown()`.
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    /// Returns the payload for `(side, current_frame)`.
    ///
    /// - Before the delay has ramped up (`current_frame < delay`), always
    ///   succeeds with the default payload.
    /// - `timeout_ms == -1`: non-blocking. Returns the slot's payload if
    ///   present, otherwise `Ok(Some(default))` — this mirrors an
    ///   observed, possibly-unintentional behavior of the original
    ///   implementation rather than a non-blocking "miss"; a
    ///   default-constructed value is handed back instead of reporting
    ///   absence.
    /// - `timeout_ms == 0`: waits indefinitely for either the slot to fill
    ///   or the session to leave `Ready`.
    /// - `timeout_ms > 0`: waits up to that many milliseconds; returns
    ///   `Ok(None)` on timeout.
    ///
    /// Raises `InvalidState` if the session is not `Ready` when called, or
    /// leaves `Ready` while this call is waiting.
    pub async fn get(&self, side: usize, timeout_ms: i64) -> Result<Option<P>> {
        if !self.session_state.borrow().is_ready() {
            return Err(SessionError::InvalidState);
        }

        let current = self.frame();
        if current < self.delay() as i64 {
            return Ok(Some(P::default()));
        }

        if timeout_ms == -1 {
            let state = self.state.lock().await;
            return Ok(Some(
                state.table[side].get(&current).cloned().unwrap_or_default(),
            ));
        }

        let mut state_rx = self.session_state.clone();
        let wait = async {
            loop {
                // Register as a waiter *before* re-checking the slot, so a
                // write+notify that lands between the check and the await
                // below is never silently missed (spurious-wakeup safe in
                // the other direction too: the loop re-checks on wake).
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let state = self.state.lock().await;
                    if let Some(payload) = state.table[side].get(&current) {
                        return Some(payload.clone());
                    }
                }
                if !self.session_state.borrow().is_ready() {
                    return None;
                }

                tokio::select! {
                    _ = &mut notified => {}
                    _ = state_rx.changed() => {}
                }
            }
        };

        let outcome = if timeout_ms == 0 {
            wait.await
        } else {
            match tokio::time::timeout(
                std::time::Duration::from_millis(timeout_ms as u64),
                wait,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_elapsed) => return Ok(None),
            }
        };

        match outcome {
            Some(payload) => Ok(Some(payload)),
            None => Err(SessionError::InvalidState),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_exchange() -> (watch::Sender<SessionState>, FrameExchange<[u8; 1]>) {
        let (tx, rx) = watch::channel(SessionState::Ready);
        (tx, FrameExchange::new(rx))
    }

    #[tokio::test]
    async fn duplicate_frame_delivery_is_idempotent() {
        let (_tx, exchange) = ready_exchange();
        exchange.initialize(2).await;
        exchange.set_frame(5);

        exchange.record_remote(0, 5, [1]).await;
        exchange.record_remote(0, 5, [9]).await; // conflicting redelivery, must be ignored

        let got = exchange.get(0, -1).await.unwrap();
        assert_eq!(got, Some([1]));
    }

    #[tokio::test]
    async fn first_writer_wins_across_several_redeliveries() {
        let (_tx, exchange) = ready_exchange();
        exchange.initialize(1).await;
        exchange.set_frame(0);

        for payload in [[7u8], [8], [9], [7]] {
            exchange.record_remote(0, 0, payload).await;
        }

        let got = exchange.get(0, -1).await.unwrap();
        assert_eq!(got, Some([7]));
    }

    #[tokio::test]
    async fn distinct_frame_ids_are_all_stored() {
        let (_tx, exchange) = ready_exchange();
        exchange.initialize(1).await;

        exchange.record_remote(0, 3, [1]).await;
        exchange.record_remote(0, 7, [2]).await;

        let (first, last) = exchange.first_last_received_frame().await;
        assert_eq!(first, 3);
        assert_eq!(last, 7);
    }

    #[tokio::test]
    async fn get_before_delay_ramps_up_returns_the_default_payload() {
        let (_tx, exchange) = ready_exchange();
        exchange.initialize(1).await;
        exchange.set_delay(3);
        exchange.set_frame(0);

        let got = exchange.get(0, -1).await.unwrap();
        assert_eq!(got, Some([0u8; 1]));
    }

    #[tokio::test]
    async fn get_times_out_when_the_slot_is_never_filled() {
        let (_tx, exchange) = ready_exchange();
        exchange.initialize(1).await;
        exchange.set_frame(0);

        let got = exchange.get(0, 20).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn get_raises_invalid_state_once_the_session_leaves_ready() {
        let (tx, exchange) = ready_exchange();
        exchange.initialize(1).await;
        exchange.set_frame(0);

        let waiter = tokio::spawn(async move { exchange.get(0, 0).await });
        tokio::task::yield_now().await;
        tx.send(SessionState::None).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_millis(200), waiter)
            .await
            .expect("get did not unblock after the session left Ready")
            .expect("task panicked");
        assert!(matches!(result, Err(SessionError::InvalidState)));
    }
}
