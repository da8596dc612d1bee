//! Per-deployment subscriber registry

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::debug;

use crate::stream::frame::StreamFrame;

pub type SubscriberId = u64;

/// An attached subscriber's end of the fan-out
pub struct Subscription {
    pub id: SubscriberId,
    pub deployment_id: String,
    pub frames: mpsc::UnboundedReceiver<StreamFrame>,
}

type Subscribers = HashMap<String, HashMap<SubscriberId, mpsc::UnboundedSender<StreamFrame>>>;

/// Fans coordinator events out to the live subscribers of each deployment
#[derive(Default)]
pub struct LogBroadcaster {
    next_id: AtomicU64,
    subscribers: RwLock<Subscribers>,
}

impl LogBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Frames published from now on are queued for it.
    pub fn attach(&self, deployment_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(deployment_id.to_string())
            .or_default()
            .insert(id, tx);
        debug!("Subscriber {} attached to {}", id, deployment_id);
        Subscription {
            id,
            deployment_id: deployment_id.to_string(),
            frames: rx,
        }
    }

    pub fn detach(&self, deployment_id: &str, subscriber: SubscriberId) {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = subscribers.get_mut(deployment_id) {
            set.remove(&subscriber);
            if set.is_empty() {
                subscribers.remove(deployment_id);
            }
        }
        debug!("Subscriber {} detached from {}", subscriber, deployment_id);
    }

    /// Send `frame` to every subscriber of `deployment_id`, pruning closed
    /// ones. Returns the number of subscribers reached.
    pub fn publish(&self, deployment_id: &str, frame: &StreamFrame) -> usize {
        let mut dead = Vec::new();
        let mut delivered = 0;
        {
            let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            let Some(set) = subscribers.get(deployment_id) else {
                return 0;
            };
            for (id, tx) in set {
                if tx.send(frame.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }

        for id in dead {
            self.detach(deployment_id, id);
        }
        delivered
    }

    pub fn subscriber_count(&self, deployment_id: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(deployment_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}
