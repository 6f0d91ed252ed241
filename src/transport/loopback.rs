//! An in-process [`Transport`] for tests that don't need a real socket:
//! several [`LoopbackTransport`]s bound in the same process deliver to
//! each other directly through a process-wide registry keyed by
//! endpoint, instead of going through the kernel.

use std::{
    collections::{HashMap, VecDeque},
    net::Ipv4Addr,
    sync::{Arc, Mutex, OnceLock},
};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::time::Duration;
use tracing::{debug, Span};

use super::{ErrorHandler, InboundHandler, PeerStats, Transport};
use crate::{endpoint::Endpoint, error::Result};

#[async_trait]
trait LoopbackNode: Send + Sync {
    async fn deliver(&self, from: Endpoint, bytes: Bytes);
}

fn registry() -> &'static Mutex<HashMap<Endpoint, Arc<dyn LoopbackNode>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<Endpoint, Arc<dyn LoopbackNode>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

struct Inner {
    endpoint: Mutex<Option<Endpoint>>,
    outbound: Mutex<HashMap<Endpoint, VecDeque<Bytes>>>,
    receive_handler: Mutex<Option<Arc<dyn InboundHandler>>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    span: Span,
}

#[async_trait]
impl LoopbackNode for Inner {
    async fn deliver(&self, from: Endpoint, bytes: Bytes) {
        let handler = self.receive_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler.handle(from, bytes).await;
        } else {
            debug!(parent: &self.span, %from, "dropped datagram: no receive handler installed");
        }
    }
}

/// A [`Transport`] that delivers directly to other bound
/// [`LoopbackTransport`]s in the same process, skipping the kernel.
/// Useful for timing-sensitive tests (e.g. shutdown-during-`get`) where a
/// real socket's scheduling jitter would make the test flaky.
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint: Mutex::new(None),
                outbound: Mutex::new(HashMap::new()),
                receive_handler: Mutex::new(None),
                error_handler: Mutex::new(None),
                span: tracing::info_span!("loopback_transport"),
            }),
        }
    }

    async fn flush(&self, to: Endpoint, extra_delay_ms: u32, loss_permille: u32) -> usize {
        let from = *self.inner.endpoint.lock().unwrap();
        let Some(from) = from else {
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

        let node = registry().lock().unwrap().get(&to).cloned();
        let Some(node) = node else {
            return 0;
        };
        for datagram in drained {
            let dropped =
                loss_permille > 0 && rand::thread_rng().gen_range(0..1000) < loss_permille;
            if dropped {
                continue;
            }
            node.deliver(from, datagram).await;
        }
        0
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn start(&self, port: u16, _worker_count: usize) -> Result<()> {
        let endpoint = Endpoint::new(Ipv4Addr::LOCALHOST, port);
        *self.inner.endpoint.lock().unwrap() = Some(endpoint);
        registry()
            .lock()
            .unwrap()
            .insert(endpoint, self.inner.clone());
        Ok(())
    }

    async fn stop(&self) {
        if let Some(endpoint) = self.inner.endpoint.lock().unwrap().take() {
            registry().lock().unwrap().remove(&endpoint);
        }
        self.inner.outbound.lock().unwrap().clear();
    }

    fn queue(&self, to: Endpoint, bytes: Bytes) {
        self.inner
            .outbound
            .lock()
            .unwrap()
            .entry(to)
            .or_default()
            .push_back(bytes);
    }

    async fn send(&self, to: Endpoint) -> usize {
        self.flush(to, 0, 0).await
    }

    async fn send_with_jitter(&self, to: Endpoint, delay_ms: u32, loss_permille: u32) -> usize {
        self.flush(to, delay_ms, loss_permille).await
    }

    fn peer_stats(&self, _peer: Endpoint) -> PeerStats {
        // No kernel round trip to measure; callers that need a non-zero
        // delay negotiation should drive it explicitly through the
        // session's own jitter knobs rather than rely on this transport's
        // (necessarily fictitious) RTT estimate.
        PeerStats { rtt_avg_ms: 0 }
    }

    fn set_receive_handler(&self, handler: Arc<dyn InboundHandler>) {
        *self.inner.receive_handler.lock().unwrap() = Some(handler);
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        *self.inner.error_handler.lock().unwrap() = Some(handler);
    }
}
