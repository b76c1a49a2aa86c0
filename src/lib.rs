//! # cbp-rs
//!
//! Async Rust library and CLI for streaming capacitive biopotential data
//! from a two-channel BLE sensor board.
//!
//! ## Data path
//!
//! ```text
//! BLE notification ─▶ Decoder ─▶ SessionClock ─▶ SampleSink …
//!     (RawPacket)    (parse)      (clock)         (sink, export)
//!                   └──────── NotificationRouter ────────┘
//! ```
//!
//! One [`router::NotificationRouter`] is created per subscribed capacitance
//! characteristic.  It decodes each packet, places every sample on a
//! monotonic session clock and hands it to each registered sink in order.
//! A [`session::Session`] owns the transport and drives subscriptions from
//! control messages (`MAC`, `CH1`/`CH2`, `DAC1`/`DAC2`, `CONNECT`, `PAUSE`,
//! `START`, `STOP`).
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use cbp_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let (event_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//!     let (control, control_rx) = tokio::sync::mpsc::channel(16);
//!
//!     let display = Arc::new(DisplayQueue::new(Channel::Ch1, 1500));
//!     let mut session = Session::new(BleTransport::new(config.ble.clone()), &config, event_tx);
//!     session.add_sink(display.clone());
//!     tokio::spawn(session.run(control_rx));
//!
//!     control.send(ControlMessage::bare("CONNECT")).await?;
//!     while let Some(event) = events.recv().await {
//!         if let SessionEvent::Connected { .. } = event {
//!             break;
//!         }
//!     }
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!     for sample in display.drain() {
//!         println!("{sample}");
//!     }
//!     control.send(ControlMessage::bare("STOP")).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`session`] | Control messages and the connection state machine |
//! | [`transport`] | The [`transport::Transport`] trait, btleplug and simulated backends |
//! | [`router`] | Decode → reconcile → fan-out pipeline and the [`router::SampleSink`] trait |
//! | [`clock`] | Monotonic session clock from the board's wrapping tick counter |
//! | [`parse`] | Byte-to-sample decoders for every packet layout |
//! | [`sink`] | Bounded sinks for display consumers |
//! | [`export`] | Tab-separated session recorder |
//! | [`protocol`] | GATT UUIDs, clock and calibration constants |
//! | [`types`] | Channels, samples and session events |
//! | [`config`] | TOML configuration |
//! | [`error`] | Error types |

pub mod clock;
pub mod config;
pub mod error;
pub mod export;
pub mod parse;
pub mod protocol;
pub mod router;
pub mod session;
pub mod sink;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Session ───────────────────────────────────────────────────────────────
    pub use crate::config::Config;
    pub use crate::session::{Command, ControlMessage, Session, SessionStatus};

    // ── Transports ────────────────────────────────────────────────────────────
    pub use crate::transport::ble::{scan, BleTransport, DiscoveredDevice};
    pub use crate::transport::simulated::SimulatedTransport;
    pub use crate::transport::{PacketHandler, Transport};

    // ── Pipeline ──────────────────────────────────────────────────────────────
    pub use crate::export::FileExporter;
    pub use crate::parse::{Decoder, PacketLayout};
    pub use crate::router::{NotificationRouter, SampleSink};
    pub use crate::sink::{ChannelSink, DisplayQueue};

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::types::{
        Channel, ChannelMap, DecodedSample, ImuReading, RawPacket, ReconciledSample,
        SessionEvent, Vector3,
    };

    // ── Errors ────────────────────────────────────────────────────────────────
    pub use crate::error::{ConfigError, DecodeError, ExportError, SessionError, TransportError};
}
