//! Per-characteristic notification pipeline: decode → reconcile → fan out.

use std::sync::Arc;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SessionClock;
use crate::error::DecodeError;
use crate::parse::Decoder;
use crate::transport::PacketHandler;
use crate::types::{ChannelMap, RawPacket, ReconciledSample};

/// A consumer of reconciled samples (display queue, file exporter, …).
///
/// `accept` is called synchronously from the notification path, so it must
/// not block.  A sink that cannot keep up drops samples itself.
pub trait SampleSink: Send + Sync {
    fn accept(&self, sample: ReconciledSample);
}

/// Routes the notifications of one capacitance characteristic.
///
/// The router exclusively owns the session clocks for the samples it
/// decodes, one per logical channel; combined packets may carry both
/// channels, single-channel packets only ever touch one clock.  Samples
/// reach sinks in packet arrival order and, within a packet, slot order.
pub struct NotificationRouter {
    characteristic: Uuid,
    decoder: Decoder,
    clocks: ChannelMap<SessionClock>,
    sinks: Vec<Arc<dyn SampleSink>>,
    received: u64,
    dropped: u64,
}

impl NotificationRouter {
    pub fn new(characteristic: Uuid, decoder: Decoder) -> Self {
        Self {
            characteristic,
            decoder,
            clocks: ChannelMap::default(),
            sinks: Vec::new(),
            received: 0,
            dropped: 0,
        }
    }

    pub fn with_sinks(mut self, sinks: impl IntoIterator<Item = Arc<dyn SampleSink>>) -> Self {
        self.sinks.extend(sinks);
        self
    }

    /// Register a sink; sinks are fed in registration order.
    pub fn add_sink(&mut self, sink: Arc<dyn SampleSink>) {
        self.sinks.push(sink);
    }

    /// Decode, reconcile and fan out one packet.
    ///
    /// Returns the number of samples delivered.  On a decode error nothing
    /// reaches the sinks and the clocks are untouched.
    pub fn route(&mut self, packet: &RawPacket) -> Result<usize, DecodeError> {
        self.received += 1;
        if self.received <= 3 || self.received % 500 == 0 {
            info!(
                "{}: notification #{} len={}",
                self.characteristic,
                self.received,
                packet.data.len()
            );
        }

        let decoded = self.decoder.decode_packet(packet)?;
        let delivered = decoded.len();
        for sample in decoded {
            let clock = &mut self.clocks[sample.channel];
            let reconciled = clock.reconcile(sample);
            match clock.sample_rate() {
                Some(fs) => debug!("{reconciled} fs = {fs:.2}"),
                None => debug!("{reconciled}"),
            }
            for sink in &self.sinks {
                sink.accept(reconciled);
            }
        }
        Ok(delivered)
    }

    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    pub fn clocks(&self) -> &ChannelMap<SessionClock> {
        &self.clocks
    }

    /// Notifications seen, including dropped ones.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Notifications dropped because they failed to decode.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl PacketHandler for NotificationRouter {
    fn handle(&mut self, packet: RawPacket) {
        if let Err(e) = self.route(&packet) {
            self.dropped += 1;
            warn!("{}: dropping packet: {e}", self.characteristic);
        }
    }
}
