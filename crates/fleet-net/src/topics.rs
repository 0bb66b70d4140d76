//! The topic table: one entry per bus topic, holding both faces of it —
//! the gossipsub topic handle used on the wire and the local broadcast
//! channel that fans decoded envelopes out to in-process subscribers.
//!
//! The swarm loop delivers into this table; the [`crate::GossipBus`]
//! subscribes out of it. Both sides share one `Arc<TopicTable>`, which is
//! also what makes publish loopback work for co-located components.

use std::collections::HashMap;
use std::sync::Mutex;

use libp2p::gossipsub::IdentTopic;
use tokio::sync::broadcast;

use fleet_state::bus::BusSubscription;
use fleet_state::envelope::Envelope;

/// Per-topic channel depth, matching the loopback bus.
const TOPIC_CAPACITY: usize = 256;

struct TopicEntry {
    wire: IdentTopic,
    local: broadcast::Sender<Envelope>,
}

impl TopicEntry {
    fn new(name: &str) -> Self {
        Self {
            wire: IdentTopic::new(name.to_string()),
            local: broadcast::channel(TOPIC_CAPACITY).0,
        }
    }
}

pub struct TopicTable {
    entries: Mutex<HashMap<String, TopicEntry>>,
}

impl TopicTable {
    pub fn new(names: &[String]) -> Self {
        let entries = names
            .iter()
            .map(|name| (name.clone(), TopicEntry::new(name)))
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Wire handles for every configured topic, for the swarm to join.
    pub fn gossip_topics(&self) -> Vec<IdentTopic> {
        self.entries
            .lock()
            .expect("topic table poisoned")
            .values()
            .map(|entry| entry.wire.clone())
            .collect()
    }

    pub fn gossip_topic(&self, name: &str) -> Option<IdentTopic> {
        self.entries
            .lock()
            .expect("topic table poisoned")
            .get(name)
            .map(|entry| entry.wire.clone())
    }

    /// Fan an envelope out to local subscribers of `name`.
    ///
    /// Returns false when the topic is not configured. A configured topic
    /// with no current subscribers swallows the envelope, which is normal
    /// on a broadcast bus.
    pub fn deliver(&self, name: &str, envelope: Envelope) -> bool {
        match self.entries.lock().expect("topic table poisoned").get(name) {
            Some(entry) => {
                let _ = entry.local.send(envelope);
                true
            }
            None => false,
        }
    }

    /// Open a local subscription on `name`, creating the entry on first
    /// use. Wire traffic for a topic created this way still needs the
    /// swarm to have joined it at startup.
    pub fn watch(&self, name: &str) -> BusSubscription {
        let mut entries = self.entries.lock().expect("topic table poisoned");
        let entry = entries
            .entry(name.to_string())
            .or_insert_with(|| TopicEntry::new(name));
        BusSubscription::new(name.to_string(), entry.local.subscribe())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(seq: u64) -> Envelope {
        Envelope::new("test", "sender-a", seq, &"payload").unwrap()
    }

    #[tokio::test]
    async fn deliver_reaches_watchers() {
        let table = TopicTable::new(&["topic.a".into()]);
        let mut sub_one = table.watch("topic.a");
        let mut sub_two = table.watch("topic.a");

        assert!(table.deliver("topic.a", envelope(1)));

        assert_eq!(sub_one.recv().await.unwrap().sequence, 1);
        assert_eq!(sub_two.recv().await.unwrap().sequence, 1);
    }

    #[test]
    fn unconfigured_topic_is_refused() {
        let table = TopicTable::new(&["topic.a".into()]);
        assert!(!table.deliver("topic.unknown", envelope(1)));
    }

    #[tokio::test]
    async fn topics_stay_isolated() {
        let table = TopicTable::new(&["topic.a".into(), "topic.b".into()]);
        let mut sub = table.watch("topic.a");

        table.deliver("topic.b", envelope(1));
        table.deliver("topic.a", envelope(2));

        assert_eq!(sub.recv().await.unwrap().sequence, 2);
    }

    #[test]
    fn watch_creates_missing_entries() {
        let table = TopicTable::new(&[]);
        let _sub = table.watch("topic.late");
        assert!(table.deliver("topic.late", envelope(1)));
        assert!(table.gossip_topic("topic.late").is_some());
    }
}
