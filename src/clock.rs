//! Monotonic session clock reconstructed from the board's tick counter.
//!
//! The board stamps every sample with a free-running 32.768 kHz counter that
//! wraps, and BLE may deliver notifications late, twice, or out of order.
//! Trusting the raw counter would make time jump backwards.  Instead the
//! clock only ever advances:
//!
//! * a tick later than the previous one advances the clock by the difference
//!   and records that difference in a short history;
//! * any other tick (duplicate, reordered, or wrapped) advances the clock by
//!   the mean of that history, or not at all while the history is empty.
//!
//! The first sample anchors the clock at its own device time.

use std::collections::VecDeque;

use log::trace;

use crate::protocol::ticks_to_seconds;
use crate::types::{DecodedSample, ReconciledSample};

/// Number of recent positive deltas averaged to bridge a non-monotonic tick.
pub const DELTA_HISTORY: usize = 100;

/// Reconciliation state for one logical channel.
///
/// Lives as long as one notification subscription; a new subscription starts
/// a fresh clock.
#[derive(Debug, Clone, Default)]
pub struct SessionClock {
    /// Device time of the last sample, in seconds.  `None` until the first sample.
    previous: Option<f64>,
    /// Current session time in seconds.
    accumulator: f64,
    /// Most recent positive deltas in seconds, oldest first.
    deltas: VecDeque<f64>,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            previous: None,
            accumulator: 0.0,
            deltas: VecDeque::with_capacity(DELTA_HISTORY + 1),
        }
    }

    /// Place `sample` on the session clock.
    ///
    /// Must be called in arrival order; the result is never earlier than the
    /// previous result.
    pub fn reconcile(&mut self, sample: DecodedSample) -> ReconciledSample {
        let device_time = ticks_to_seconds(sample.device_time);

        match self.previous {
            None => {
                self.accumulator = device_time;
            }
            Some(previous) if device_time > previous => {
                let delta = device_time - previous;
                self.deltas.push_back(delta);
                if self.deltas.len() > DELTA_HISTORY {
                    self.deltas.pop_front();
                }
                self.accumulator += delta;
            }
            Some(_) => {
                if let Some(mean) = self.mean_delta() {
                    self.accumulator += mean;
                }
            }
        }
        self.previous = Some(device_time);

        trace!(
            "{} tick {} → {:.6} s",
            sample.channel,
            sample.device_time,
            self.accumulator
        );

        ReconciledSample {
            session_time: self.accumulator,
            channel: sample.channel,
            capacitance: sample.capacitance,
            imu: sample.imu,
        }
    }

    /// Mean of the recorded deltas in seconds.
    pub fn mean_delta(&self) -> Option<f64> {
        if self.deltas.is_empty() {
            return None;
        }
        Some(self.deltas.iter().sum::<f64>() / self.deltas.len() as f64)
    }

    /// Effective sampling rate in Hz, once more than two deltas are known.
    pub fn sample_rate(&self) -> Option<f64> {
        if self.deltas.len() <= 2 {
            return None;
        }
        self.mean_delta().map(|d| 1.0 / d)
    }

    /// Current session time in seconds, or `None` before the first sample.
    pub fn session_time(&self) -> Option<f64> {
        self.previous.map(|_| self.accumulator)
    }

    /// Number of deltas currently in the history.
    pub fn history_len(&self) -> usize {
        self.deltas.len()
    }
}
