//! Binary decoders for sensor-board BLE notification payloads.
//!
//! All functions here are pure: no I/O, no state, safe to call from any task.
//! Every field is little-endian and the structs are packed.
//!
//! | Layout | Length | Wire format |
//! |---|---|---|
//! | [`PacketLayout::Capacitance`] | 6 B | `u16 tick \| u32 reading` |
//! | [`PacketLayout::CapacitanceImu`] | 24 B | `u16 tick \| u32 reading \| i16 acc[3] \| i16 gyro[3] \| i16 mag[3]` |
//! | [`PacketLayout::Combined`] | 102 B | `u32 tick0 \| u16 delta[3] \| u32 reading[4] \| i16 acc[12] \| i16 gyro[12] \| i16 mag[12] \| u8 channel[4]` |
//!
//! A buffer whose length differs from its layout is rejected with
//! [`DecodeError::MalformedPacket`]; it is never truncated or padded.
//!
//! # Scaling
//!
//! | Quantity | Conversion |
//! |---|---|
//! | capacitance | `8 × raw / (2²⁴ − 1)` pF |
//! | accelerometer | `4 × raw / 2¹⁵` g |
//! | gyroscope | `7.6e-3 × raw / 2¹⁵` |
//! | magnetometer | `magnetometer_scale × raw` (default `1/16`, no 2¹⁵ normalisation) |

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DecodeError;
use crate::protocol::{
    channel_for_characteristic, ACC_FULL_SCALE, CAPACITANCE_IMU_PACKET_LEN,
    CAPACITANCE_PACKET_LEN, CAP_FULL_SCALE, CAP_MAX_CODE, COMBINED_PACKET_LEN, COMBINED_SLOTS,
    DEFAULT_CHANNEL_TAG_BASE, DEFAULT_MAGNETOMETER_SCALE, GYRO_FULL_SCALE, IMU_CODE_RANGE,
};
use crate::types::{Channel, DecodedSample, ImuReading, RawPacket, Vector3};

// ── Layout ────────────────────────────────────────────────────────────────────

/// Wire layout the board uses on its capacitance characteristics.
///
/// Firmware revisions differ, so this is chosen in configuration rather
/// than sniffed from packet lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PacketLayout {
    /// Bare capacitance reading.
    Capacitance,
    /// Capacitance plus one accelerometer/gyroscope/magnetometer triple.
    #[default]
    CapacitanceImu,
    /// Up to four batched readings for either channel.
    Combined,
}

impl PacketLayout {
    /// Exact packet length in bytes.
    pub const fn packet_len(self) -> usize {
        match self {
            PacketLayout::Capacitance => CAPACITANCE_PACKET_LEN,
            PacketLayout::CapacitanceImu => CAPACITANCE_IMU_PACKET_LEN,
            PacketLayout::Combined => COMBINED_PACKET_LEN,
        }
    }
}

impl fmt::Display for PacketLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PacketLayout::Capacitance => "capacitance",
            PacketLayout::CapacitanceImu => "capacitance-imu",
            PacketLayout::Combined => "combined",
        })
    }
}

// ── Scaling ───────────────────────────────────────────────────────────────────

/// Capacitance in pF from a raw conversion result.
pub fn capacitance_pf(raw: u32) -> f64 {
    CAP_FULL_SCALE * raw as f64 / CAP_MAX_CODE
}

/// Acceleration in g from a signed 16-bit code.
pub fn accelerometer_g(raw: i16) -> f64 {
    ACC_FULL_SCALE * raw as f64 / IMU_CODE_RANGE
}

/// Angular rate from a signed 16-bit code.
pub fn gyroscope_rate(raw: i16) -> f64 {
    GYRO_FULL_SCALE * raw as f64 / IMU_CODE_RANGE
}

fn axes(raw: [i16; 3], convert: impl Fn(i16) -> f64) -> Vector3 {
    Vector3 {
        x: convert(raw[0]),
        y: convert(raw[1]),
        z: convert(raw[2]),
    }
}

// ── Field readers ─────────────────────────────────────────────────────────────
//
// Callers check the packet length first; offsets are always in range.

fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_i16_le(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn expect_len(layout: PacketLayout, data: &[u8]) -> Result<(), DecodeError> {
    let expected = layout.packet_len();
    if data.len() != expected {
        return Err(DecodeError::MalformedPacket {
            layout,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

// ── Single-channel packets ────────────────────────────────────────────────────

/// Decode a 6-byte capacitance-only notification.
pub fn decode_capacitance(channel: Channel, data: &[u8]) -> Result<DecodedSample, DecodeError> {
    expect_len(PacketLayout::Capacitance, data)?;
    Ok(DecodedSample {
        device_time: read_u16_le(data, 0) as u32,
        channel,
        capacitance: capacitance_pf(read_u32_le(data, 2)),
        imu: None,
    })
}

/// Decode a 24-byte capacitance + IMU notification.
///
/// | Bytes | Field |
/// |---|---|
/// | 0–1 | tick |
/// | 2–5 | capacitance |
/// | 6–11 | accelerometer x, y, z |
/// | 12–17 | gyroscope x, y, z |
/// | 18–23 | magnetometer x, y, z |
pub fn decode_capacitance_imu(
    channel: Channel,
    data: &[u8],
    magnetometer_scale: f64,
) -> Result<DecodedSample, DecodeError> {
    expect_len(PacketLayout::CapacitanceImu, data)?;
    let triple = |off: usize| {
        [
            read_i16_le(data, off),
            read_i16_le(data, off + 2),
            read_i16_le(data, off + 4),
        ]
    };
    Ok(DecodedSample {
        device_time: read_u16_le(data, 0) as u32,
        channel,
        capacitance: capacitance_pf(read_u32_le(data, 2)),
        imu: Some(ImuReading {
            accelerometer: axes(triple(6), accelerometer_g),
            gyroscope: axes(triple(12), gyroscope_rate),
            magnetometer: axes(triple(18), |v| magnetometer_scale * v as f64),
        }),
    })
}

// ── Combined packets ──────────────────────────────────────────────────────────

const COMBINED_DELTAS: usize = 4;
const COMBINED_READINGS: usize = COMBINED_DELTAS + 3 * 2;
const COMBINED_IMU: usize = COMBINED_READINGS + COMBINED_SLOTS * 4;
const COMBINED_TAGS: usize = COMBINED_IMU + 36 * 2;

/// Decode a 102-byte combined notification into 1–4 samples.
///
/// Slot 0 carries the absolute tick; slots 1–3 carry tick deltas added to
/// it.  A zero delta marks an empty slot, which is dropped.  The IMU block is
/// axis-major: `acc[0..4]` are the x values of slots 0–3, `acc[4..8]` the y
/// values, and so on.  Each kept slot's channel byte is mapped through
/// `channel_tag_base` (see [`Channel::from_tag`]).
pub fn decode_combined(
    data: &[u8],
    magnetometer_scale: f64,
    channel_tag_base: u8,
) -> Result<Vec<DecodedSample>, DecodeError> {
    expect_len(PacketLayout::Combined, data)?;

    let tick0 = read_u32_le(data, 0);
    let imu = |block: usize, axis: usize, slot: usize| {
        read_i16_le(data, COMBINED_IMU + 2 * (block * 12 + axis * COMBINED_SLOTS + slot))
    };

    let mut samples = Vec::with_capacity(COMBINED_SLOTS);
    for slot in 0..COMBINED_SLOTS {
        let device_time = if slot == 0 {
            tick0
        } else {
            let delta = read_u16_le(data, COMBINED_DELTAS + 2 * (slot - 1));
            if delta == 0 {
                continue;
            }
            tick0.wrapping_add(delta as u32)
        };

        let tag = data[COMBINED_TAGS + slot];
        let channel = Channel::from_tag(tag, channel_tag_base)
            .ok_or(DecodeError::UnknownChannelTag { slot, tag })?;

        let block = |b: usize| [imu(b, 0, slot), imu(b, 1, slot), imu(b, 2, slot)];
        samples.push(DecodedSample {
            device_time,
            channel,
            capacitance: capacitance_pf(read_u32_le(data, COMBINED_READINGS + 4 * slot)),
            imu: Some(ImuReading {
                accelerometer: axes(block(0), accelerometer_g),
                gyroscope: axes(block(1), gyroscope_rate),
                magnetometer: axes(block(2), |v| magnetometer_scale * v as f64),
            }),
        });
    }
    Ok(samples)
}

// ── Decoder ───────────────────────────────────────────────────────────────────

/// Layout plus calibration: everything needed to turn a [`RawPacket`] into samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decoder {
    pub layout: PacketLayout,
    /// µT-equivalent per magnetometer LSB.
    pub magnetometer_scale: f64,
    /// Tag value that denotes CH1 in combined packets.
    pub channel_tag_base: u8,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(PacketLayout::default())
    }
}

impl Decoder {
    pub fn new(layout: PacketLayout) -> Self {
        Self {
            layout,
            magnetometer_scale: DEFAULT_MAGNETOMETER_SCALE,
            channel_tag_base: DEFAULT_CHANNEL_TAG_BASE,
        }
    }

    /// Decode one notification from `characteristic`.
    ///
    /// Single-channel layouts take their channel from the characteristic;
    /// combined packets carry it per slot.
    pub fn decode(
        &self,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<Vec<DecodedSample>, DecodeError> {
        match self.layout {
            PacketLayout::Capacitance => {
                decode_capacitance(channel_for_characteristic(characteristic), data)
                    .map(|s| vec![s])
            }
            PacketLayout::CapacitanceImu => decode_capacitance_imu(
                channel_for_characteristic(characteristic),
                data,
                self.magnetometer_scale,
            )
            .map(|s| vec![s]),
            PacketLayout::Combined => {
                decode_combined(data, self.magnetometer_scale, self.channel_tag_base)
            }
        }
    }

    pub fn decode_packet(&self, packet: &RawPacket) -> Result<Vec<DecodedSample>, DecodeError> {
        self.decode(packet.characteristic, &packet.data)
    }
}

// ── Encoders (simulator and tests) ────────────────────────────────────────────

/// Packet builders, the inverse of the decoders.  Used by the simulated
/// transport and by tests.
pub mod encode {
    use crate::protocol::COMBINED_SLOTS;

    pub fn capacitance(tick: u16, reading: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(6);
        out.extend_from_slice(&tick.to_le_bytes());
        out.extend_from_slice(&reading.to_le_bytes());
        out
    }

    pub fn capacitance_imu(tick: u16, reading: u32, imu: [i16; 9]) -> Vec<u8> {
        let mut out = capacitance(tick, reading);
        for v in imu {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Field-for-field image of a combined packet.
    #[derive(Debug, Clone, Default)]
    pub struct CombinedFrame {
        pub tick0: u32,
        pub deltas: [u16; 3],
        pub readings: [u32; COMBINED_SLOTS],
        /// acc[12] | gyro[12] | mag[12], axis-major within each block.
        pub imu: Vec<i16>,
        pub tags: [u8; COMBINED_SLOTS],
    }

    impl CombinedFrame {
        pub fn to_bytes(&self) -> Vec<u8> {
            let mut out = Vec::with_capacity(crate::protocol::COMBINED_PACKET_LEN);
            out.extend_from_slice(&self.tick0.to_le_bytes());
            for d in self.deltas {
                out.extend_from_slice(&d.to_le_bytes());
            }
            for r in self.readings {
                out.extend_from_slice(&r.to_le_bytes());
            }
            for i in 0..36 {
                let v = self.imu.get(i).copied().unwrap_or(0);
                out.extend_from_slice(&v.to_le_bytes());
            }
            out.extend_from_slice(&self.tags);
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::encode::{capacitance, capacitance_imu, CombinedFrame};
    use super::*;
    use crate::protocol::{CAP1_CHARACTERISTIC, CAP2_CHARACTERISTIC};

    #[test]
    fn short_capacitance_packet_is_malformed() {
        let err = decode_capacitance(Channel::Ch1, &[0u8; 5]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::MalformedPacket {
                layout: PacketLayout::Capacitance,
                expected: 6,
                actual: 5,
            }
        );
    }

    #[test]
    fn zeroed_capacitance_packet_decodes_to_zero() {
        let s = decode_capacitance(Channel::Ch1, &[0u8; 6]).unwrap();
        assert_eq!(s.device_time, 0);
        assert_eq!(s.capacitance, 0.0);
        assert!(s.imu.is_none());
    }

    #[test]
    fn capacitance_full_scale_is_eight_pf() {
        let s = decode_capacitance(Channel::Ch2, &capacitance(0xFFFF, (1 << 24) - 1)).unwrap();
        assert_eq!(s.device_time, 0xFFFF);
        assert_eq!(s.capacitance, 8.0);
    }

    #[test]
    fn long_packets_are_not_truncated() {
        let mut data = capacitance(1, 1);
        data.push(0);
        assert!(matches!(
            decode_capacitance(Channel::Ch1, &data),
            Err(DecodeError::MalformedPacket { actual: 7, .. })
        ));
    }

    #[test]
    fn capacitance_imu_packet_scales_each_sensor() {
        let data = capacitance_imu(
            100,
            0,
            [16384, -16384, 0, 32767, 0, -32768, 16, -32, 160],
        );
        let s = decode_capacitance_imu(Channel::Ch1, &data, 1.0 / 16.0).unwrap();
        let imu = s.imu.unwrap();
        assert_eq!(s.device_time, 100);
        assert_eq!(imu.accelerometer, Vector3 { x: 2.0, y: -2.0, z: 0.0 });
        assert_eq!(imu.gyroscope.x, 7.6e-3 * 32767.0 / 32768.0);
        assert_eq!(imu.gyroscope.z, -7.6e-3);
        assert_eq!(imu.magnetometer, Vector3 { x: 1.0, y: -2.0, z: 10.0 });
    }

    #[test]
    fn capacitance_imu_rejects_bare_capacitance_packet() {
        assert!(decode_capacitance_imu(Channel::Ch1, &capacitance(0, 0), 1.0).is_err());
    }

    #[test]
    fn combined_packet_masks_empty_slots() {
        let frame = CombinedFrame {
            tick0: 0,
            deltas: [5, 0, 0],
            readings: [0, (1 << 24) - 1, 7, 7],
            tags: [0, 1, 0, 1],
            ..Default::default()
        };
        let samples = decode_combined(&frame.to_bytes(), 1.0 / 16.0, 0).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].device_time, 0);
        assert_eq!(samples[0].channel, Channel::Ch1);
        assert_eq!(samples[1].device_time, 5);
        assert_eq!(samples[1].channel, Channel::Ch2);
        assert_eq!(samples[1].capacitance, 8.0);
    }

    #[test]
    fn combined_packet_offsets_deltas_from_first_tick() {
        let mut imu = vec![0i16; 36];
        // accelerometer y of slot 2, gyroscope z of slot 3, magnetometer x of slot 1
        imu[4 + 2] = 8192;
        imu[12 + 8 + 3] = -32768;
        imu[24 + 1] = 32;
        let frame = CombinedFrame {
            tick0: 1_000,
            deltas: [10, 20, 30],
            imu,
            tags: [0, 0, 1, 1],
            ..Default::default()
        };
        let samples = decode_combined(&frame.to_bytes(), 1.0 / 16.0, 0).unwrap();
        let times: Vec<u32> = samples.iter().map(|s| s.device_time).collect();
        assert_eq!(times, vec![1_000, 1_010, 1_020, 1_030]);
        assert_eq!(samples[2].imu.unwrap().accelerometer.y, 1.0);
        assert_eq!(samples[3].imu.unwrap().gyroscope.z, -7.6e-3);
        assert_eq!(samples[1].imu.unwrap().magnetometer.x, 2.0);
        assert_eq!(samples[0].imu.unwrap().magnetometer.x, 0.0);
    }

    #[test]
    fn combined_packet_with_unknown_tag_is_rejected() {
        let frame = CombinedFrame {
            deltas: [1, 0, 0],
            tags: [0, 7, 0, 0],
            ..Default::default()
        };
        assert_eq!(
            decode_combined(&frame.to_bytes(), 1.0, 0).unwrap_err(),
            DecodeError::UnknownChannelTag { slot: 1, tag: 7 }
        );
    }

    #[test]
    fn masked_slot_tags_are_ignored() {
        let frame = CombinedFrame {
            tags: [1, 0xFF, 0xFF, 0xFF],
            ..Default::default()
        };
        let samples = decode_combined(&frame.to_bytes(), 1.0, 0).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].channel, Channel::Ch2);
    }

    #[test]
    fn one_based_tag_convention() {
        let frame = CombinedFrame {
            deltas: [3, 0, 0],
            tags: [1, 2, 0, 0],
            ..Default::default()
        };
        let samples = decode_combined(&frame.to_bytes(), 1.0, 1).unwrap();
        assert_eq!(samples[0].channel, Channel::Ch1);
        assert_eq!(samples[1].channel, Channel::Ch2);
    }

    #[test]
    fn combined_packet_length_is_checked() {
        let bytes = CombinedFrame::default().to_bytes();
        assert!(matches!(
            decode_combined(&bytes[..101], 1.0, 0),
            Err(DecodeError::MalformedPacket { expected: 102, actual: 101, .. })
        ));
    }

    #[test]
    fn naturally_aligned_packets_are_malformed() {
        let padded_imu = vec![0u8; 26];
        assert!(matches!(
            decode_capacitance_imu(Channel::Ch1, &padded_imu, 1.0),
            Err(DecodeError::MalformedPacket { expected: 24, actual: 26, .. })
        ));
        let padded_combined = vec![0u8; 104];
        assert!(matches!(
            decode_combined(&padded_combined, 1.0, 0),
            Err(DecodeError::MalformedPacket { expected: 102, actual: 104, .. })
        ));
    }

    #[test]
    fn decoder_takes_channel_from_characteristic() {
        let decoder = Decoder::new(PacketLayout::Capacitance);
        let ch1 = decoder.decode(CAP1_CHARACTERISTIC, &capacitance(1, 0)).unwrap();
        let ch2 = decoder.decode(CAP2_CHARACTERISTIC, &capacitance(1, 0)).unwrap();
        assert_eq!(ch1[0].channel, Channel::Ch1);
        assert_eq!(ch2[0].channel, Channel::Ch2);
    }

    #[test]
    fn decoder_applies_configured_magnetometer_scale() {
        let mut decoder = Decoder::new(PacketLayout::CapacitanceImu);
        decoder.magnetometer_scale = 0.5;
        let packet = RawPacket::new(
            CAP1_CHARACTERISTIC,
            capacitance_imu(0, 0, [0, 0, 0, 0, 0, 0, 4, 0, 0]),
        );
        let s = decoder.decode_packet(&packet).unwrap();
        assert_eq!(s[0].imu.unwrap().magnetometer.x, 2.0);
    }
}
