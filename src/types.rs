use std::fmt;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the two physical capacitance channels on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Ch1,
    Ch2,
}

impl Channel {
    /// Both channels in index order.
    pub const ALL: [Channel; 2] = [Channel::Ch1, Channel::Ch2];

    /// Zero-based index into a [`ChannelMap`].
    pub const fn index(self) -> usize {
        match self {
            Channel::Ch1 => 0,
            Channel::Ch2 => 1,
        }
    }

    /// One-based channel number as printed on the board (`1` or `2`).
    pub const fn number(self) -> u8 {
        self.index() as u8 + 1
    }

    /// Look up a channel by its one-based number.
    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Channel::Ch1),
            2 => Some(Channel::Ch2),
            _ => None,
        }
    }

    /// Map a combined-packet channel tag to a channel, given the firmware's
    /// numbering base (`tag - base` is the zero-based index).
    pub fn from_tag(tag: u8, base: u8) -> Option<Self> {
        match tag.checked_sub(base)? {
            0 => Some(Channel::Ch1),
            1 => Some(Channel::Ch2),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CH{}", self.number())
    }
}

/// A fixed-size map with one slot per [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelMap<T>([T; 2]);

impl<T> ChannelMap<T> {
    pub const fn new(values: [T; 2]) -> Self {
        Self(values)
    }

    pub fn from_fn(mut f: impl FnMut(Channel) -> T) -> Self {
        Self([f(Channel::Ch1), f(Channel::Ch2)])
    }

    /// Iterate `(channel, &value)` pairs in channel order.
    pub fn iter(&self) -> impl Iterator<Item = (Channel, &T)> {
        Channel::ALL.into_iter().zip(self.0.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Channel, &mut T)> {
        Channel::ALL.into_iter().zip(self.0.iter_mut())
    }
}

impl<T> Index<Channel> for ChannelMap<T> {
    type Output = T;

    fn index(&self, channel: Channel) -> &T {
        &self.0[channel.index()]
    }
}

impl<T> IndexMut<Channel> for ChannelMap<T> {
    fn index_mut(&mut self, channel: Channel) -> &mut T {
        &mut self.0[channel.index()]
    }
}

/// A single 3-axis measurement in physical units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Inertial readings carried alongside a capacitance sample.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ImuReading {
    /// Accelerometer in g.
    pub accelerometer: Vector3,
    /// Gyroscope in the board's dps-equivalent unit.
    pub gyroscope: Vector3,
    /// Magnetometer in µT-equivalent units.
    pub magnetometer: Vector3,
}

/// One BLE notification exactly as the transport delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// Characteristic the notification arrived on.
    pub characteristic: Uuid,
    pub data: Vec<u8>,
}

impl RawPacket {
    pub fn new(characteristic: Uuid, data: impl Into<Vec<u8>>) -> Self {
        Self {
            characteristic,
            data: data.into(),
        }
    }
}

/// A sample straight out of the packet decoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedSample {
    /// Raw on-device tick count.  Wraps at 2¹⁶ for single-channel packets
    /// and 2³² for combined packets.
    pub device_time: u32,
    pub channel: Channel,
    /// Capacitance in pF.
    pub capacitance: f64,
    /// Present for every layout except the bare capacitance packet.
    pub imu: Option<ImuReading>,
}

/// A decoded sample placed on the monotonic session clock.
///
/// Immutable once produced; sinks receive copies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReconciledSample {
    /// Seconds on the reconciled, non-decreasing session clock.  The IMU
    /// reading, if any, shares this timestamp.
    pub session_time: f64,
    pub channel: Channel,
    /// Capacitance in pF.
    pub capacitance: f64,
    pub imu: Option<ImuReading>,
}

impl fmt::Display for ReconciledSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.3} pF @ {:.2} ms",
            self.channel,
            self.capacitance,
            1000.0 * self.session_time
        )
    }
}

/// Acknowledgements and notices emitted by [`crate::session::Session`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// CONNECT completed: the link is up, pending DAC values were written and
    /// every enabled channel is subscribed.  Callers wait for this before
    /// sending further commands.
    Connected { address: String },
    /// All notifications stopped; the link stays up.
    Paused,
    /// Notifications restarted after a pause.
    Resumed,
    /// A channel's notification subscription changed mid-session.
    ChannelChanged { channel: Channel, active: bool },
    /// A DAC register was written on the device.
    DacWritten { channel: Channel, value: u8 },
    /// The transport reports the link as down.  Not retried.
    LinkLost,
    /// A control message was rejected; the session state is unchanged.
    Rejected { command: String, reason: String },
    /// STOP completed, or the control channel closed.  No further events follow.
    Disconnected,
}
