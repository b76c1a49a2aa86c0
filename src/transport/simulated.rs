//! A sensor board that lives in the process.
//!
//! Each subscribed characteristic gets its own tokio task emitting packets
//! of the configured layout every 10 ms, with a sine-wave capacitance and a
//! board lying flat (1 g on Z).  The tick counter advances by one sample
//! period and wraps the way the real firmware's counter does, so the clock
//! reconciler sees the same shapes it would see on hardware.

use std::collections::HashMap;
use std::f64::consts::TAU;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{PacketHandler, Transport};
use crate::error::TransportError;
use crate::parse::encode::{self, CombinedFrame};
use crate::parse::{Decoder, PacketLayout};
use crate::protocol::{
    channel_for_characteristic, ACC_FULL_SCALE, CAP_CHARACTERISTICS, CAP_MAX_CODE, CLK_FREQ,
    COMBINED_SLOTS, IMU_CODE_RANGE,
};
use crate::types::{Channel, RawPacket};

/// Default interval between packets on one characteristic.
pub const SAMPLE_PERIOD: Duration = Duration::from_millis(10);

/// Board ticks per sample period (32768 Hz × 10 ms, rounded down).
pub const TICK_STEP: u32 = (CLK_FREQ as u32) / 100;

/// Packet generator state for one subscription.
struct Generator {
    channel: Channel,
    decoder: Decoder,
    tick: u32,
    sample: u64,
}

impl Generator {
    fn new(channel: Channel, decoder: Decoder) -> Self {
        Self {
            channel,
            decoder,
            tick: 0,
            sample: 0,
        }
    }

    /// 24-bit capacitance code of a slow sine, one frequency per channel.
    fn reading(channel: Channel, sample: u64) -> u32 {
        let hz = match channel {
            Channel::Ch1 => 1.0,
            Channel::Ch2 => 0.5,
        };
        let t = sample as f64 * SAMPLE_PERIOD.as_secs_f64();
        let mid = CAP_MAX_CODE / 2.0;
        (mid + mid / 2.0 * (TAU * hz * t).sin()) as u32
    }

    fn imu() -> [i16; 9] {
        let one_g = (IMU_CODE_RANGE / ACC_FULL_SCALE) as i16;
        [0, 0, one_g, 0, 0, 0, 120, -40, 300]
    }

    fn next_packet(&mut self) -> Vec<u8> {
        let packet = match self.decoder.layout {
            PacketLayout::Capacitance => {
                encode::capacitance(self.tick as u16, Self::reading(self.channel, self.sample))
            }
            PacketLayout::CapacitanceImu => encode::capacitance_imu(
                self.tick as u16,
                Self::reading(self.channel, self.sample),
                Self::imu(),
            ),
            PacketLayout::Combined => return self.next_combined(),
        };
        self.tick = (self.tick + TICK_STEP) % (u16::MAX as u32 + 1);
        self.sample += 1;
        packet
    }

    /// Four slots alternating CH1, CH2, CH1, CH2, one sample period apart.
    fn next_combined(&mut self) -> Vec<u8> {
        let base = self.decoder.channel_tag_base;
        let mut readings = [0; COMBINED_SLOTS];
        let mut imu = vec![0i16; 36];
        let tags = [base, base + 1, base, base + 1];
        for (slot, &tag) in tags.iter().enumerate() {
            let channel = Channel::from_tag(tag, base).unwrap_or(self.channel);
            readings[slot] = Self::reading(channel, self.sample + slot as u64 / 2);
            for (i, v) in Self::imu().into_iter().enumerate() {
                imu[(i / 3) * 12 + (i % 3) * 4 + slot] = v;
            }
        }
        let step = TICK_STEP as u16;
        let frame = CombinedFrame {
            tick0: self.tick,
            deltas: [step, 2 * step, 3 * step],
            readings,
            imu,
            tags,
        };
        self.tick = self.tick.wrapping_add(COMBINED_SLOTS as u32 * TICK_STEP);
        self.sample += COMBINED_SLOTS as u64 / 2;
        frame.to_bytes()
    }
}

/// In-process [`Transport`] producing synthetic notifications.
pub struct SimulatedTransport {
    decoder: Decoder,
    period: Duration,
    address: Option<String>,
    streams: HashMap<Uuid, JoinHandle<()>>,
    registers: HashMap<Uuid, Vec<u8>>,
}

impl SimulatedTransport {
    pub fn new(decoder: Decoder) -> Self {
        Self {
            decoder,
            period: SAMPLE_PERIOD,
            address: None,
            streams: HashMap::new(),
            registers: HashMap::new(),
        }
    }

    /// Override the packet interval (the tick step stays one nominal period).
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Last value written to a register characteristic.
    pub fn register(&self, characteristic: Uuid) -> Option<&[u8]> {
        self.registers.get(&characteristic).map(Vec::as_slice)
    }

    /// Characteristics currently streaming.
    pub fn streaming(&self) -> impl Iterator<Item = &Uuid> {
        self.streams.keys()
    }

    /// Drop the link as if the board walked out of range.
    pub fn sever(&mut self) {
        for (_, task) in self.streams.drain() {
            task.abort();
        }
        self.address = None;
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        if address.trim().is_empty() {
            return Err(TransportError::DeviceNotFound(address.to_string()));
        }
        info!("Simulated board {address} connected ({} layout)", self.decoder.layout);
        self.address = Some(address.to_string());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.address.is_none() {
            return Err(TransportError::NotConnected);
        }
        self.sever();
        info!("Simulated board disconnected");
        Ok(())
    }

    async fn start_notify(
        &mut self,
        characteristic: Uuid,
        mut handler: Box<dyn PacketHandler>,
    ) -> Result<(), TransportError> {
        if self.address.is_none() {
            return Err(TransportError::NotConnected);
        }
        if !CAP_CHARACTERISTICS.iter().any(|(_, &c)| c == characteristic) {
            return Err(TransportError::CharacteristicNotFound(characteristic));
        }
        if let Some(previous) = self.streams.remove(&characteristic) {
            previous.abort();
        }

        let mut generator =
            Generator::new(channel_for_characteristic(characteristic), self.decoder);
        let period = self.period;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                handler.handle(RawPacket::new(characteristic, generator.next_packet()));
            }
        });
        debug!("Simulated notifications started on {characteristic}");
        self.streams.insert(characteristic, task);
        Ok(())
    }

    async fn stop_notify(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
        match self.streams.remove(&characteristic) {
            Some(task) => {
                task.abort();
                debug!("Simulated notifications stopped on {characteristic}");
                Ok(())
            }
            None => Err(TransportError::AlreadyUnsubscribed(characteristic)),
        }
    }

    async fn write_characteristic(
        &mut self,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if self.address.is_none() {
            return Err(TransportError::NotConnected);
        }
        self.registers.insert(characteristic, data.to_vec());
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.address.is_some()
    }
}
