//! Consumer queue allocation using consistent hashing
//!
//! Every consumer in a group runs the allocator against the same snapshot
//! of queues and consumers and keeps only what it is assigned, so no
//! coordinator is needed. Each consumer is hashed onto the ring at
//! `virtual_nodes` positions; each queue belongs to the first position at
//! or after its own hash, wrapping around.
//!
//! Removing a consumer only moves the queues it owned. Adding a consumer
//! only moves queues to the newcomer.

use crate::error::AllocationError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Default ring positions per consumer
pub const DEFAULT_VIRTUAL_NODES: usize = 3;

/// A consumable queue of a topic on one broker
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageQueue {
    pub topic: String,
    pub broker_name: String,
    pub queue_id: u32,
}

impl MessageQueue {
    pub fn new(topic: impl Into<String>, broker_name: impl Into<String>, queue_id: u32) -> Self {
        Self {
            topic: topic.into(),
            broker_name: broker_name.into(),
            queue_id,
        }
    }
}

impl fmt::Display for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}@{}", self.topic, self.broker_name, self.queue_id)
    }
}

/// Strategy that picks the queues a consumer owns
pub trait AllocationStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Queues owned by `consumer`, sorted. Empty when `consumer` is not in
    /// `consumers`.
    fn allocate(
        &self,
        consumer: &str,
        queues: &[MessageQueue],
        consumers: &[String],
    ) -> Result<Vec<MessageQueue>, AllocationError>;
}

/// Ring position of a consumer: hash first, then the position identity for
/// tie-breaking.
type RingKey = (u64, String, usize);

/// Consistent-hash allocation strategy
#[derive(Debug, Clone)]
pub struct ConsistentHashAllocator {
    virtual_nodes: usize,
}

impl Default for ConsistentHashAllocator {
    fn default() -> Self {
        Self {
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }
}

impl ConsistentHashAllocator {
    pub fn new(virtual_nodes: usize) -> Result<Self, AllocationError> {
        if virtual_nodes == 0 {
            return Err(AllocationError::InvalidArgument(
                "virtual_nodes must be at least 1".into(),
            ));
        }
        Ok(Self { virtual_nodes })
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    fn build_ring<'a>(&self, consumers: &[&'a str]) -> BTreeMap<RingKey, &'a str> {
        let mut ring = BTreeMap::new();
        for consumer in consumers {
            for vnode in 0..self.virtual_nodes {
                let hash = ring_hash(&format!("{}-{}", consumer, vnode));
                ring.insert((hash, consumer.to_string(), vnode), *consumer);
            }
        }
        ring
    }

    fn owner<'a>(ring: &BTreeMap<RingKey, &'a str>, queue: &MessageQueue) -> Option<&'a str> {
        let hash = ring_hash(&queue.to_string());
        ring.range((hash, String::new(), 0)..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, consumer)| *consumer)
    }
}

impl AllocationStrategy for ConsistentHashAllocator {
    fn name(&self) -> &str {
        "CONSISTENT_HASH"
    }

    fn allocate(
        &self,
        consumer: &str,
        queues: &[MessageQueue],
        consumers: &[String],
    ) -> Result<Vec<MessageQueue>, AllocationError> {
        if consumer.is_empty() {
            return Err(AllocationError::InvalidArgument(
                "consumer id is empty".into(),
            ));
        }
        if queues.is_empty() {
            return Err(AllocationError::InvalidArgument("queue set is empty".into()));
        }
        if consumers.is_empty() {
            return Err(AllocationError::InvalidArgument(
                "consumer set is empty".into(),
            ));
        }

        let mut members: Vec<&str> = consumers.iter().map(String::as_str).collect();
        members.sort_unstable();
        members.dedup();
        if members.binary_search(&consumer).is_err() {
            return Ok(Vec::new());
        }

        let ring = self.build_ring(&members);
        let mut owned: Vec<MessageQueue> = queues
            .iter()
            .filter(|queue| Self::owner(&ring, queue) == Some(consumer))
            .cloned()
            .collect();
        owned.sort();
        owned.dedup();
        Ok(owned)
    }
}

/// First 8 bytes of the SHA-256 digest, big-endian.
fn ring_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues(n: u32) -> Vec<MessageQueue> {
        (0..n).map(|i| MessageQueue::new("orders", "broker-a", i)).collect()
    }

    fn consumers(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("CID-{}", i)).collect()
    }

    #[test]
    fn test_two_consumers_cover_six_queues() {
        let allocator = ConsistentHashAllocator::default();
        let queues = queues(6);
        let consumers = consumers(2);

        let mut all = Vec::new();
        for consumer in &consumers {
            all.extend(allocator.allocate(consumer, &queues, &consumers).unwrap());
        }
        all.sort();
        assert_eq!(all, queues);
    }

    #[test]
    fn test_absent_consumer_gets_nothing() {
        let allocator = ConsistentHashAllocator::default();
        let owned = allocator
            .allocate("CID-9", &queues(4), &consumers(2))
            .unwrap();
        assert!(owned.is_empty());
    }

    #[test]
    fn test_invalid_arguments() {
        let allocator = ConsistentHashAllocator::default();
        assert!(allocator.allocate("", &queues(1), &consumers(1)).is_err());
        assert!(allocator.allocate("CID-0", &[], &consumers(1)).is_err());
        assert!(allocator.allocate("CID-0", &queues(1), &[]).is_err());
        assert!(ConsistentHashAllocator::new(0).is_err());
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let allocator = ConsistentHashAllocator::new(5).unwrap();
        let queues = queues(12);
        let consumers = consumers(4);

        let mut shuffled_queues = queues.clone();
        shuffled_queues.reverse();
        let mut shuffled_consumers = consumers.clone();
        shuffled_consumers.reverse();
        shuffled_consumers.push("CID-1".into());

        for consumer in &consumers {
            assert_eq!(
                allocator.allocate(consumer, &queues, &consumers).unwrap(),
                allocator
                    .allocate(consumer, &shuffled_queues, &shuffled_consumers)
                    .unwrap()
            );
        }
    }

    #[test]
    fn test_ring_hash_is_stable() {
        assert_eq!(ring_hash("CID-0-0"), ring_hash("CID-0-0"));
        assert_ne!(ring_hash("CID-0-0"), ring_hash("CID-0-1"));
    }
}
