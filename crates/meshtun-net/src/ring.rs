//! Bounded retry queue for packets that could not be sent yet

use bytes::Bytes;
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
    packet: Bytes,
    retries: u32,
    enqueued_at: Instant,
}

/// Byte-bounded FIFO of raw IP packets awaiting another send attempt.
///
/// Full rings evict their oldest entries. Entries older than `max_age` are
/// discarded without being attempted, on the next add or drain.
#[derive(Debug)]
pub struct RetryRing {
    entries: VecDeque<Entry>,
    total_bytes: usize,
    capacity: usize,
    max_age: Duration,
}

impl RetryRing {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            total_bytes: 0,
            capacity,
            max_age,
        }
    }

    /// Queue `packet`, evicting the oldest entries until it fits.
    ///
    /// Returns `false` if the packet alone exceeds the capacity.
    pub fn add(&mut self, packet: impl Into<Bytes>) -> bool {
        self.add_at(packet.into(), Instant::now())
    }

    pub(crate) fn add_at(&mut self, packet: Bytes, now: Instant) -> bool {
        self.expire(now);
        if packet.len() > self.capacity {
            debug!(len = packet.len(), capacity = self.capacity, "packet larger than retry ring");
            return false;
        }
        while self.total_bytes + packet.len() > self.capacity {
            match self.entries.pop_front() {
                Some(evicted) => self.total_bytes -= evicted.packet.len(),
                None => break,
            }
        }
        self.total_bytes += packet.len();
        self.entries.push_back(Entry {
            packet,
            retries: 0,
            enqueued_at: now,
        });
        true
    }

    /// Drop stale entries, then offer each remaining packet to `process`.
    ///
    /// Packets `process` accepts leave the ring; rejected ones stay in place
    /// with their retry count bumped. Returns how many were sent.
    pub async fn drain_and_retry<F, Fut, E>(&mut self, process: F) -> usize
    where
        F: FnMut(Bytes) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.drain_and_retry_at(Instant::now(), process).await
    }

    pub(crate) async fn drain_and_retry_at<F, Fut, E>(&mut self, now: Instant, mut process: F) -> usize
    where
        F: FnMut(Bytes) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.expire(now);

        let mut sent = 0;
        let mut kept = VecDeque::with_capacity(self.entries.len());
        while let Some(mut entry) = self.entries.pop_front() {
            match process(entry.packet.clone()).await {
                Ok(()) => {
                    self.total_bytes -= entry.packet.len();
                    sent += 1;
                }
                Err(_) => {
                    entry.retries += 1;
                    kept.push_back(entry);
                }
            }
        }
        self.entries = kept;
        sent
    }

    fn expire(&mut self, now: Instant) {
        let max_age = self.max_age;
        let mut freed = 0;
        self.entries.retain(|e| {
            let fresh = now.saturating_duration_since(e.enqueued_at) <= max_age;
            if !fresh {
                freed += e.packet.len();
            }
            fresh
        });
        self.total_bytes -= freed;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Retry counts in queue order
    pub fn retry_counts(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.retries).collect()
    }
}
