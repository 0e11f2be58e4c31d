use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

use crate::mqtt::codec::{self, Packet, Publish};
use crate::mqtt::topic;

pub type ClientId = u64;

struct Subscriber {
    filters: Vec<String>,
    outbound: mpsc::Sender<Bytes>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub delivered: usize,
    /// Subscribers whose queue was full or gone
    pub dropped: usize,
}

/// Subscription registry and QoS 0 fan-out
#[derive(Default)]
pub struct Broker {
    subscribers: DashMap<ClientId, Subscriber>,
    next_id: AtomicU64,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_client_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add `filter` for `client`, returning how many filters it now holds
    pub fn subscribe(&self, client: ClientId, filter: &str, outbound: &mpsc::Sender<Bytes>) -> usize {
        let mut subscriber = self.subscribers.entry(client).or_insert_with(|| Subscriber {
            filters: Vec::new(),
            outbound: outbound.clone(),
        });
        if !subscriber.filters.iter().any(|f| f == filter) {
            subscriber.filters.push(filter.to_owned());
        }
        subscriber.filters.len()
    }

    /// Remove `filter` for `client`, returning how many filters remain
    pub fn unsubscribe(&self, client: ClientId, filter: &str) -> usize {
        let remaining = match self.subscribers.get_mut(&client) {
            Some(mut subscriber) => {
                subscriber.filters.retain(|f| f != filter);
                subscriber.filters.len()
            }
            None => 0,
        };
        if remaining == 0 {
            self.subscribers.remove(&client);
        }
        remaining
    }

    pub fn remove(&self, client: ClientId) {
        self.subscribers.remove(&client);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Encode once and hand the packet to every matching subscriber without
    /// waiting on any of them
    pub fn publish(&self, topic_name: &str, payload: Bytes) -> PublishStats {
        let packet = codec::to_bytes(&Packet::Publish(Publish::at_most_once(topic_name, payload)));
        let mut stats = PublishStats::default();

        for subscriber in self.subscribers.iter() {
            if !subscriber
                .filters
                .iter()
                .any(|filter| topic::matches(filter, topic_name))
            {
                continue;
            }
            match subscriber.outbound.try_send(packet.clone()) {
                Ok(()) => stats.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(client = *subscriber.key(), topic = topic_name, "outbound queue full, dropping");
                    stats.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => stats.dropped += 1,
            }
        }

        trace!(topic = topic_name, delivered = stats.delivered, "published");
        stats
    }
}
