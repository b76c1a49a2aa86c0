//! Bounded [`SampleSink`] implementations.
//!
//! Both are safe to call from the notification path: neither ever blocks
//! or grows without bound.  They differ in what they give up when the
//! consumer falls behind.
//!
//! | Sink | When full |
//! |---|---|
//! | [`DisplayQueue`] | evicts the oldest sample |
//! | [`ChannelSink`] | drops the new sample |

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::warn;
use tokio::sync::mpsc;

use crate::router::SampleSink;
use crate::types::{Channel, ReconciledSample};

/// Capacity of a display queue when none is configured.
pub const DEFAULT_DISPLAY_CAPACITY: usize = 1500;

#[derive(Default)]
struct Ring {
    samples: VecDeque<ReconciledSample>,
    dropped: u64,
}

/// Per-channel queue for display consumers.
///
/// Only samples of its own channel are kept.  A slow reader sees the most
/// recent `capacity` samples.
pub struct DisplayQueue {
    channel: Channel,
    capacity: usize,
    ring: Mutex<Ring>,
}

impl DisplayQueue {
    pub fn new(channel: Channel, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            channel,
            capacity,
            ring: Mutex::new(Ring {
                samples: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
        }
    }

    fn ring(&self) -> std::sync::MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take every queued sample, oldest first.
    pub fn drain(&self) -> Vec<ReconciledSample> {
        self.ring().samples.drain(..).collect()
    }

    /// Most recent sample, left in place.
    pub fn latest(&self) -> Option<ReconciledSample> {
        self.ring().samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.ring().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples evicted to make room since creation.
    pub fn dropped(&self) -> u64 {
        self.ring().dropped
    }
}

impl SampleSink for DisplayQueue {
    fn accept(&self, sample: ReconciledSample) {
        if sample.channel != self.channel {
            return;
        }
        let mut ring = self.ring();
        if ring.samples.len() == self.capacity {
            ring.samples.pop_front();
            ring.dropped += 1;
        }
        ring.samples.push_back(sample);
    }
}

/// Forwards samples into a bounded tokio channel.
///
/// A full (or closed) channel drops the sample and counts it; the first
/// drop and every 1000th after it are logged.
pub struct ChannelSink {
    tx: mpsc::Sender<ReconciledSample>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ReconciledSample>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::from_sender(tx), rx)
    }

    pub fn from_sender(tx: mpsc::Sender<ReconciledSample>) -> Self {
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl SampleSink for ChannelSink {
    fn accept(&self, sample: ReconciledSample) {
        if self.tx.try_send(sample).is_err() {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n == 1 || n % 1000 == 0 {
                warn!("Sample consumer is behind, {n} samples dropped so far");
            }
        }
    }
}
