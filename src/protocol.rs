//! GATT UUIDs, clock constants, packet layouts and calibration constants for
//! the capacitive blood-pressure sensor board.
//!
//! All characteristics belong to the vendor namespace
//! `71eeXXXX-1232-11ea-8d71-362b9e155667`.

use uuid::Uuid;

use crate::types::{Channel, ChannelMap};

// ── Characteristics ───────────────────────────────────────────────────────────

/// Channel-1 capacitance notifications.
pub const CAP1_CHARACTERISTIC: Uuid = Uuid::from_u128(0x71ee1401_1232_11ea_8d71_362b9e155667);

/// Channel-2 capacitance notifications.
pub const CAP2_CHARACTERISTIC: Uuid = Uuid::from_u128(0x71ee1402_1232_11ea_8d71_362b9e155667);

/// Stand-alone accelerometer notifications.
///
/// Current firmware also folds the IMU into the capacitance packets, which is
/// what this crate decodes.
pub const ACCELEROMETER_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x71ee1403_1232_11ea_8d71_362b9e155667);

/// Stand-alone gyroscope notifications.
pub const GYROSCOPE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x71ee1404_1232_11ea_8d71_362b9e155667);

/// Stand-alone magnetometer notifications.
pub const MAGNETOMETER_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x71ee1405_1232_11ea_8d71_362b9e155667);

/// DAC-1 output register (write, no notify).
pub const DAC1_CHARACTERISTIC: Uuid = Uuid::from_u128(0x71ee1406_1232_11ea_8d71_362b9e155667);

/// DAC-2 output register (write, no notify).
pub const DAC2_CHARACTERISTIC: Uuid = Uuid::from_u128(0x71ee1407_1232_11ea_8d71_362b9e155667);

/// Capacitance characteristic per physical channel.
pub const CAP_CHARACTERISTICS: ChannelMap<Uuid> =
    ChannelMap::new([CAP1_CHARACTERISTIC, CAP2_CHARACTERISTIC]);

/// DAC register characteristic per physical channel.
pub const DAC_CHARACTERISTICS: ChannelMap<Uuid> =
    ChannelMap::new([DAC1_CHARACTERISTIC, DAC2_CHARACTERISTIC]);

/// Channel a single-channel packet belongs to, derived from its source
/// characteristic: CH1 for the channel-1 UUID, CH2 for anything else.
pub fn channel_for_characteristic(characteristic: Uuid) -> Channel {
    if characteristic == CAP1_CHARACTERISTIC {
        Channel::Ch1
    } else {
        Channel::Ch2
    }
}

// ── Device clock ──────────────────────────────────────────────────────────────

/// Frequency of the board's free-running tick counter (32.768 kHz crystal).
pub const CLK_FREQ: f64 = 32_768.0;

/// Seconds per device tick.
pub const CLK_PERIOD: f64 = 1.0 / CLK_FREQ;

/// Convert a raw device tick count into seconds.
pub fn ticks_to_seconds(ticks: u32) -> f64 {
    ticks as f64 * CLK_PERIOD
}

// ── Packet layouts ────────────────────────────────────────────────────────────

/// `u16 tick | u32 reading`.
pub const CAPACITANCE_PACKET_LEN: usize = 6;

/// `u16 tick | u32 reading | i16 acc[3] | i16 gyro[3] | i16 mag[3]`.
///
/// Packed.  Firmware that sends the C struct with natural alignment pads
/// two bytes after `tick` and produces 26 bytes; such packets are rejected
/// as malformed rather than decoded at shifted offsets.
pub const CAPACITANCE_IMU_PACKET_LEN: usize = 24;

/// Sample slots carried by one combined packet.
pub const COMBINED_SLOTS: usize = 4;

/// `u32 tick0 | u16 delta[3] | u32 reading[4] | i16 acc[12] | i16 gyro[12] | i16 mag[12] | u8 channel[4]`.
///
/// The board packs the struct without padding.  A naturally aligned build
/// of the same struct is 104 bytes (two after `delta`, two trailing) and
/// is rejected as malformed.
pub const COMBINED_PACKET_LEN: usize = 4 + 3 * 2 + COMBINED_SLOTS * 4 + 36 * 2 + COMBINED_SLOTS;

// ── Calibration ───────────────────────────────────────────────────────────────

/// Capacitance full scale in pF.
pub const CAP_FULL_SCALE: f64 = 8.0;

/// Largest 24-bit conversion result; the capacitance divisor.
pub const CAP_MAX_CODE: f64 = ((1u32 << 24) - 1) as f64;

/// Accelerometer full scale in g.
pub const ACC_FULL_SCALE: f64 = 4.0;

/// Gyroscope full scale in the board's dps-equivalent unit.
pub const GYRO_FULL_SCALE: f64 = 7.6e-3;

/// Normalisation for signed 16-bit accelerometer and gyroscope codes.
pub const IMU_CODE_RANGE: f64 = 32_768.0;

/// Default magnetometer scale: µT-equivalent per LSB, applied without
/// 16-bit normalisation.
pub const DEFAULT_MAGNETOMETER_SCALE: f64 = 1.0 / 16.0;

/// Default channel-tag numbering for combined packets: tag `0` is CH1 and
/// tag `1` is CH2.
pub const DEFAULT_CHANNEL_TAG_BASE: u8 = 0;

// ── DAC ───────────────────────────────────────────────────────────────────────

/// Highest value accepted by a DAC register (7-bit).
pub const DAC_MAX: u8 = 0x7F;
