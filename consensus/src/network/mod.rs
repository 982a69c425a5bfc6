// In-process message fabric
//
// Delivers unicast and broadcast messages between named endpoints with
// per-delivery random drop and uniform-random latency. Used both by the
// test suite and by the bundled simulation binary; there is deliberately
// no FIFO guarantee between two messages on the same link, and concurrent
// broadcasts may interleave arbitrarily. Recovery from lost messages is
// the callers' problem (view timeouts).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time;
use tracing::debug;

pub mod types;

pub use types::Message;

/// Addressable in-process message bus.
///
/// Endpoints register an unbounded delivery sink under a name; the set of
/// registered endpoints forms the broadcast domain. Sends never fail:
/// a delivery is observed through the sink or not at all.
pub struct SimulatedNetwork {
    endpoints: Mutex<HashMap<String, UnboundedSender<Message>>>,
    drop_rate: f64,
    min_delay: Duration,
    max_delay: Duration,
}

impl SimulatedNetwork {
    pub fn new(drop_rate: f64, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            drop_rate,
            min_delay,
            max_delay,
        }
    }

    /// A lossless, zero-latency network
    pub fn instant() -> Self {
        Self::new(0.0, Duration::ZERO, Duration::ZERO)
    }

    /// Install the delivery sink for `id`. Re-registration replaces the
    /// previous sink.
    pub fn register(&self, id: &str, sink: UnboundedSender<Message>) {
        self.endpoints
            .lock()
            .unwrap()
            .insert(id.to_string(), sink);
    }

    /// Number of registered endpoints
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    /// Deliver `msg` to `dst`, subject to the configured drop probability
    /// and a uniform-random delay. Unknown destinations are dropped
    /// silently.
    pub async fn send(&self, src: &str, dst: &str, msg: Message) {
        let sink = match self.endpoints.lock().unwrap().get(dst) {
            Some(sink) => sink.clone(),
            None => return,
        };
        let (dropped, delay) = {
            let mut rng = rand::thread_rng();
            let dropped = rng.gen::<f64>() < self.drop_rate;
            let delay = rng.gen_range(self.min_delay.as_secs_f64()..=self.max_delay.as_secs_f64());
            (dropped, Duration::from_secs_f64(delay))
        };
        if dropped {
            debug!(src, dst, "dropping message");
            return;
        }
        time::sleep(delay).await;
        // A receiver torn down mid-flight is indistinguishable from a drop
        let _ = sink.send(msg);
    }

    /// Fan `msg` out to every registered endpoint, `src` included. Each
    /// delivery runs concurrently with its own drop roll and delay;
    /// returns once every delivery has resolved.
    pub async fn broadcast(self: &Arc<Self>, src: &str, msg: Message) {
        let ids: Vec<String> = self.endpoints.lock().unwrap().keys().cloned().collect();
        let mut deliveries = Vec::with_capacity(ids.len());
        for dst in ids {
            let network = Arc::clone(self);
            let src = src.to_string();
            let msg = msg.clone();
            deliveries.push(tokio::spawn(async move {
                network.send(&src, &dst, msg).await;
            }));
        }
        for delivery in deliveries {
            let _ = delivery.await;
        }
    }
}
