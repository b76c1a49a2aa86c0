//! The BLE link as seen by the session: connect, subscribe per
//! characteristic, write registers.
//!
//! [`ble::BleTransport`] talks to real hardware through btleplug;
//! [`simulated::SimulatedTransport`] generates packets locally.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::TransportError;
use crate::types::RawPacket;

pub mod ble;
pub mod simulated;

/// Receives the notifications of one subscribed characteristic.
///
/// Called from the transport's delivery task, one packet at a time and in
/// the order the link delivered them.  Implementations must not block.
pub trait PacketHandler: Send + 'static {
    fn handle(&mut self, packet: RawPacket);
}

impl<F> PacketHandler for F
where
    F: FnMut(RawPacket) + Send + 'static,
{
    fn handle(&mut self, packet: RawPacket) {
        self(packet)
    }
}

/// Connection to one sensor board.
///
/// Dropping a subscription's handler (on `stop_notify` or `disconnect`)
/// discards whatever state it owns.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the board at `address` (MAC on Linux/Windows, platform id on macOS).
    async fn connect(&mut self, address: &str) -> Result<(), TransportError>;

    /// Drop the link and every subscription on it.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Subscribe to `characteristic`, delivering each notification to `handler`.
    async fn start_notify(
        &mut self,
        characteristic: Uuid,
        handler: Box<dyn PacketHandler>,
    ) -> Result<(), TransportError>;

    /// Stop notifications on `characteristic`.
    ///
    /// Returns [`TransportError::AlreadyUnsubscribed`] when there is no live
    /// subscription to stop, including after the link went away.
    async fn stop_notify(&mut self, characteristic: Uuid) -> Result<(), TransportError>;

    /// Write `data` to a register characteristic.
    async fn write_characteristic(
        &mut self,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Whether the link is still up.
    async fn is_connected(&self) -> bool;
}
