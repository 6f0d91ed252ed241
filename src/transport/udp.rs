use std::{
    collections::{HashMap, VecDeque},
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::Instant,
};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::{net::UdpSocket, task::JoinHandle, time::Duration};
use tracing::{debug, error, warn, Span};

use super::{ErrorHandler, InboundHandler, PeerStats, Transport};
use crate::{
    endpoint::Endpoint,
    error::{Result, SessionError},
};

const RECV_BUF_LEN: usize = 2048;
/// Smoothing factor for the RTT exponential moving average.
const RTT_EMA_ALPHA: f64 = 0.2;

#[derive(Default)]
struct PeerState {
    rtt_avg_ms: u32,
    last_send: Option<Instant>,
}

fn record_rtt_sample(state: &mut PeerState) {
    if let Some(sent_at) = state.last_send.take() {
        let sample_ms = sent_at.elapsed().as_millis() as u32;
        state.rtt_avg_ms = if state.rtt_avg_ms == 0 {
            sample_ms
        } else {
            ((1.0 - RTT_EMA_ALPHA) * state.rtt_avg_ms as f64 + RTT_EMA_ALPHA * sample_ms as f64)
                as u32
        };
    }
}

struct Inner {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    outbound: Mutex<HashMap<Endpoint, VecDeque<Bytes>>>,
    peers: Mutex<HashMap<Endpoint, PeerState>>,
    receive_handler: Mutex<Option<Arc<dyn InboundHandler>>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    span: Span,
}

/// A [`Transport`] over a real `tokio::net::UdpSocket`.
///
/// The RTT estimate is intentionally simple: an EMA over the gap between
/// the last send to a peer and the next datagram received from it. The
/// session core only depends on the `Transport` trait, so a more
/// sophisticated estimator can replace this one without touching the
/// handshake or frame-exchange code.
pub struct UdpTransport {
    inner: Arc<Inner>,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                socket: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
                outbound: Mutex::new(HashMap::new()),
                peers: Mutex::new(HashMap::new()),
                receive_handler: Mutex::new(None),
                error_handler: Mutex::new(None),
                span: tracing::info_span!("udp_transport"),
            }),
        }
    }

    async fn flush(&self, to: Endpoint, extra_delay_ms: u32, loss_permille: u32) -> usize {
        let socket = self.inner.socket.lock().unwrap().clone();
        let Some(socket) = socket else {
            return self
                .inner
                .outbound
                .lock()
                .unwrap()
                .get(&to)
                .map_or(0, |q| q.len());
        };

        let drained: Vec<Bytes> = {
            let mut outbound = self.inner.outbound.lock().unwrap();
            outbound.remove(&to).map(Vec::from).unwrap_or_default()
        };

        if drained.is_empty() {
            return 0;
        }

        if extra_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(extra_delay_ms as u64)).await;
        }

        let mut still_pending = Vec::new();
        for datagram in drained {
            let dropped =
                loss_permille > 0 && rand::thread_rng().gen_range(0..1000) < loss_permille;
            if dropped {
                debug!(parent: &self.inner.span, %to, "dropped a datagram (loss injection)");
                continue;
            }
            match socket.send_to(&datagram, std::net::SocketAddr::from(to)).await {
                Ok(_) => {
                    let mut peers = self.inner.peers.lock().unwrap();
                    peers.entry(to).or_default().last_send = Some(Instant::now());
                }
                Err(e) => {
                    warn!(parent: &self.inner.span, %to, error = %e, "send_to failed, re-queueing");
                    still_pending.push(datagram);
                }
            }
        }

        if !still_pending.is_empty() {
            let mut outbound = self.inner.outbound.lock().unwrap();
            outbound.entry(to).or_default().extend(still_pending.clone());
        }
        still_pending.len()
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

async fn recv_loop(inner: Arc<Inner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let Ok(from_ep) = Endpoint::try_from(from) else {
                    continue;
                };
                let bytes = Bytes::copy_from_slice(&buf[..len]);

                {
                    let mut peers = inner.peers.lock().unwrap();
                    record_rtt_sample(peers.entry(from_ep).or_default());
                }

                let handler = inner.receive_handler.lock().unwrap().clone();
                if let Some(handler) = handler {
                    handler.handle(from_ep, bytes).await;
                } else {
                    debug!(parent: &inner.span, %from_ep, "dropped datagram: no receive handler installed");
                }
            }
            Err(e) => {
                error!(parent: &inner.span, error = %e, "recv_from failed");
                let handler = inner.error_handler.lock().unwrap().clone();
                if let Some(handler) = handler {
                    handler(anyhow::Error::new(e));
                }
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn start(&self, port: u16, worker_count: usize) -> Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|e| {
                error!(parent: &self.inner.span, port, error = %e, "failed to bind UDP transport");
                SessionError::BindFailed {
                    port,
                    source: e.into(),
                }
            })?;
        let socket = Arc::new(socket);
        *self.inner.socket.lock().unwrap() = Some(socket.clone());

        let mut workers = self.inner.workers.lock().unwrap();
        for _ in 0..worker_count.max(1) {
            let inner = self.inner.clone();
            let socket = socket.clone();
            workers.push(tokio::spawn(recv_loop(inner, socket)));
        }
        Ok(())
    }

    async fn stop(&self) {
        let workers: Vec<_> = self.inner.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            worker.abort();
        }
        *self.inner.socket.lock().unwrap() = None;
        self.inner.outbound.lock().unwrap().clear();
        self.inner.peers.lock().unwrap().clear();
    }

    fn queue(&self, to: Endpoint, bytes: Bytes) {
        let mut outbound = self.inner.outbound.lock().unwrap();
        outbound.entry(to).or_default().push_back(bytes);
    }

    async fn send(&self, to: Endpoint) -> usize {
        self.flush(to, 0, 0).await
    }

    async fn send_with_jitter(&self, to: Endpoint, delay_ms: u32, loss_permille: u32) -> usize {
        self.flush(to, delay_ms, loss_permille).await
    }

    fn peer_stats(&self, peer: Endpoint) -> PeerStats {
        let guard = self.inner.peers.lock().unwrap();
        PeerStats {
            rtt_avg_ms: guard.get(&peer).map(|s| s.rtt_avg_ms).unwrap_or(0),
        }
    }

    fn set_receive_handler(&self, handler: Arc<dyn InboundHandler>) {
        *self.inner.receive_handler.lock().unwrap() = Some(handler);
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        *self.inner.error_handler.lock().unwrap() = Some(handler);
    }
}
