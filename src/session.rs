//! Session state machine driven by control messages.
//!
//! ```text
//! DISCONNECTED ──CONNECT──▶ CONNECTING ──▶ ACTIVE ◀──START── PAUSED
//!      ▲                        │            │ └────PAUSE────▶  │
//!      └──────── failure ───────┘            └──STOP──┬─────────┘
//!      ▲                                              │
//!      └──────────────────────────────────────────────┘
//! ```
//!
//! Messages are handled one at a time, in arrival order, by [`Session::run`].
//! Invalid messages are logged and answered with
//! [`SessionEvent::Rejected`]; they never end the loop.  Only `STOP` (or
//! the control channel closing) does.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{SessionError, TransportError};
use crate::parse::{Decoder, PacketLayout};
use crate::protocol::{CAP_CHARACTERISTICS, DAC_CHARACTERISTICS, DAC_MAX};
use crate::router::{NotificationRouter, SampleSink};
use crate::transport::Transport;
use crate::types::{Channel, ChannelMap, SessionEvent};

// ── Control messages ──────────────────────────────────────────────────────────

/// One `(name, payload)` message on the control channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub name: String,
    pub payload: Value,
}

impl ControlMessage {
    pub fn new(name: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }

    /// A message without payload (`CONNECT`, `PAUSE`, `START`, `STOP`).
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, Value::Null)
    }

    /// Parse a `NAME [payload]` line.
    ///
    /// The name is upper-cased.  The payload is read as JSON when it parses
    /// (`CH1 true`, `DAC1 42`) and kept as a plain string otherwise
    /// (`MAC DC:4E:6D:9F:E3:BA`).  Blank lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        let payload = if rest.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(rest).unwrap_or_else(|_| Value::String(rest.to_string()))
        };
        Some(Self::new(name.to_ascii_uppercase(), payload))
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Value::Null => f.write_str(&self.name),
            payload => write!(f, "{} {payload}", self.name),
        }
    }
}

/// A validated control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetAddress(String),
    SetChannelEnabled(Channel, bool),
    SetDac(Channel, u8),
    Connect,
    Pause,
    Start,
    Stop,
}

fn channel_suffix(name: &str, prefix: &str) -> Option<Channel> {
    match name.strip_prefix(prefix)? {
        "1" => Some(Channel::Ch1),
        "2" => Some(Channel::Ch2),
        _ => None,
    }
}

impl TryFrom<&ControlMessage> for Command {
    type Error = SessionError;

    fn try_from(message: &ControlMessage) -> Result<Self, Self::Error> {
        let name = message.name.as_str();
        let payload = &message.payload;
        match name {
            "MAC" => match payload.as_str().map(str::trim) {
                Some(address) if !address.is_empty() => {
                    Ok(Command::SetAddress(address.to_string()))
                }
                _ => Err(SessionError::invalid(name, "expected a device address")),
            },
            "CONNECT" => Ok(Command::Connect),
            "PAUSE" => Ok(Command::Pause),
            "START" => Ok(Command::Start),
            "STOP" => Ok(Command::Stop),
            _ => {
                if let Some(channel) = channel_suffix(name, "CH") {
                    let enabled = match payload {
                        Value::Bool(b) => *b,
                        Value::Number(n) if n.as_u64() == Some(0) => false,
                        Value::Number(n) if n.as_u64() == Some(1) => true,
                        _ => return Err(SessionError::invalid(name, "expected true or false")),
                    };
                    return Ok(Command::SetChannelEnabled(channel, enabled));
                }
                if let Some(channel) = channel_suffix(name, "DAC") {
                    return match payload.as_u64() {
                        Some(v) if v <= DAC_MAX as u64 => Ok(Command::SetDac(channel, v as u8)),
                        _ => Err(SessionError::invalid(
                            name,
                            format!("expected an integer 0-{DAC_MAX}"),
                        )),
                    };
                }
                Err(SessionError::invalid(name, "unknown command"))
            }
        }
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    /// Connected, notifications flowing on every enabled channel.
    Active,
    /// Connected, no notifications.
    Paused,
}

impl SessionStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Paused)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelState {
    /// Requested by the user.
    pub enabled: bool,
    /// A notification subscription is live.
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub status: SessionStatus,
    pub address: String,
    pub channels: ChannelMap<ChannelState>,
    /// Pending (or last written) DAC register values.
    pub dac: ChannelMap<u8>,
}

impl SessionState {
    pub fn from_config(config: &Config) -> Self {
        let enabled = config.channels.enabled();
        Self {
            status: SessionStatus::Disconnected,
            address: config.board.address.clone(),
            channels: ChannelMap::from_fn(|ch| ChannelState {
                enabled: enabled[ch],
                active: false,
            }),
            dac: config.board.dac(),
        }
    }
}

/// What the control loop does after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Owns the transport and the per-channel subscriptions for one board.
pub struct Session<T: Transport> {
    transport: T,
    state: SessionState,
    decoder: Decoder,
    sinks: Vec<Arc<dyn SampleSink>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    poll_interval: Duration,
    link_lost_reported: bool,
}

impl<T: Transport> Session<T> {
    pub fn new(
        transport: T,
        config: &Config,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            transport,
            state: SessionState::from_config(config),
            decoder: config.decoder.decoder(),
            sinks: Vec::new(),
            events,
            poll_interval: config.session.poll_interval(),
            link_lost_reported: false,
        }
    }

    /// Register a sink with every router created from now on.
    pub fn add_sink(&mut self, sink: Arc<dyn SampleSink>) {
        self.sinks.push(sink);
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Process control messages until `STOP` or until every sender is gone.
    ///
    /// Waits at most one poll interval for a message; an idle interval
    /// while connected checks the link.  Returns the transport.
    pub async fn run(mut self, mut control: mpsc::Receiver<ControlMessage>) -> T {
        loop {
            match tokio::time::timeout(self.poll_interval, control.recv()).await {
                Ok(Some(message)) => {
                    if self.handle_message(&message).await == Flow::Exit {
                        break;
                    }
                }
                Ok(None) => {
                    info!("Control channel closed");
                    self.stop().await;
                    break;
                }
                Err(_) => self.check_link().await,
            }
        }
        info!("Session ended");
        self.transport
    }

    /// Validate and execute one message.  Failures are logged and reported
    /// as [`SessionEvent::Rejected`].
    pub async fn handle_message(&mut self, message: &ControlMessage) -> Flow {
        debug!("Control message: {message}");
        let result = match Command::try_from(message) {
            Ok(command) => self.execute(command).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(flow) => flow,
            Err(e) => {
                warn!("{} ignored: {e}", message.name);
                self.emit(SessionEvent::Rejected {
                    command: message.name.clone(),
                    reason: e.to_string(),
                });
                Flow::Continue
            }
        }
    }

    /// Apply `command`.  On error the session keeps its prior state.
    pub async fn execute(&mut self, command: Command) -> Result<Flow, SessionError> {
        match command {
            Command::SetAddress(address) => self.set_address(address)?,
            Command::SetChannelEnabled(channel, enabled) => {
                self.set_channel_enabled(channel, enabled).await?
            }
            Command::SetDac(channel, value) => self.set_dac(channel, value).await?,
            Command::Connect => self.connect().await?,
            Command::Pause => self.pause().await?,
            Command::Start => self.start().await?,
            Command::Stop => {
                self.stop().await;
                return Ok(Flow::Exit);
            }
        }
        Ok(Flow::Continue)
    }

    fn emit(&self, event: SessionEvent) {
        self.events.send(event).ok();
    }

    fn require(&self, command: &str, status: SessionStatus) -> Result<(), SessionError> {
        if self.state.status == status {
            Ok(())
        } else {
            Err(SessionError::invalid(
                command,
                format!("requires {status} session, session is {}", self.state.status),
            ))
        }
    }

    /// The enabled flags must name something to stream, and at most one
    /// characteristic under the combined layout, whose packets already carry
    /// both channels.
    fn check_channels(&self) -> Result<(), SessionError> {
        let enabled = self.state.channels.iter().filter(|(_, c)| c.enabled).count();
        if enabled == 0 {
            return Err(SessionError::InvalidConfiguration(
                "no channel is enabled".to_string(),
            ));
        }
        if self.decoder.layout == PacketLayout::Combined && enabled > 1 {
            return Err(SessionError::InvalidConfiguration(
                "the combined layout streams both channels from one characteristic; \
                 enable only one"
                    .to_string(),
            ));
        }
        Ok(())
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    fn set_address(&mut self, address: String) -> Result<(), SessionError> {
        self.require("MAC", SessionStatus::Disconnected)?;
        info!("Target address set to {address}");
        self.state.address = address;
        Ok(())
    }

    async fn set_channel_enabled(
        &mut self,
        channel: Channel,
        enabled: bool,
    ) -> Result<(), SessionError> {
        let previous = self.state.channels[channel].enabled;
        self.state.channels[channel].enabled = enabled;
        if self.state.status != SessionStatus::Active
            || self.state.channels[channel].active == enabled
        {
            return Ok(());
        }

        if enabled {
            let subscribed = match self.check_channels() {
                Ok(()) => self.subscribe(channel).await.map_err(SessionError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = subscribed {
                self.state.channels[channel].enabled = previous;
                return Err(e);
            }
        } else {
            self.unsubscribe(channel).await;
        }
        self.emit(SessionEvent::ChannelChanged {
            channel,
            active: enabled,
        });

        // Disabling the last live channel leaves nothing to stream.
        if !self.state.channels.iter().any(|(_, c)| c.active) {
            self.state.status = SessionStatus::Paused;
            info!("No channel left active, session paused");
            self.emit(SessionEvent::Paused);
        }
        Ok(())
    }

    async fn set_dac(&mut self, channel: Channel, value: u8) -> Result<(), SessionError> {
        if value > DAC_MAX {
            return Err(SessionError::invalid(
                format!("DAC{}", channel.number()),
                format!("{value} exceeds {DAC_MAX}"),
            ));
        }
        let previous = self.state.dac[channel];
        self.state.dac[channel] = value;
        if !self.state.status.is_connected() {
            return Ok(());
        }
        if let Err(e) = self.write_dac(channel).await {
            self.state.dac[channel] = previous;
            return Err(e.into());
        }
        self.emit(SessionEvent::DacWritten { channel, value });
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        self.require("CONNECT", SessionStatus::Disconnected)?;
        self.check_channels()?;
        if self.state.address.trim().is_empty() {
            return Err(SessionError::InvalidConfiguration(
                "no device address set".to_string(),
            ));
        }

        self.state.status = SessionStatus::Connecting;
        let address = self.state.address.clone();
        info!("Connecting to {address} …");
        if let Err(e) = self.transport.connect(&address).await {
            self.state.status = SessionStatus::Disconnected;
            return Err(e.into());
        }

        if let Err(e) = self.bring_up().await {
            self.teardown().await;
            return Err(e.into());
        }

        self.state.status = SessionStatus::Active;
        self.link_lost_reported = false;
        info!("Session active on {address}");
        self.emit(SessionEvent::Connected { address });
        Ok(())
    }

    /// Write pending DAC values, then subscribe every enabled channel.
    async fn bring_up(&mut self) -> Result<(), TransportError> {
        for channel in Channel::ALL {
            self.write_dac(channel).await?;
        }
        for channel in Channel::ALL {
            if self.state.channels[channel].enabled {
                self.subscribe(channel).await?;
            }
        }
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), SessionError> {
        self.require("PAUSE", SessionStatus::Active)?;
        self.unsubscribe_all().await;
        self.state.status = SessionStatus::Paused;
        info!("Session paused");
        self.emit(SessionEvent::Paused);
        Ok(())
    }

    async fn start(&mut self) -> Result<(), SessionError> {
        self.require("START", SessionStatus::Paused)?;
        self.check_channels()?;
        for channel in Channel::ALL {
            if !self.state.channels[channel].enabled {
                continue;
            }
            if let Err(e) = self.subscribe(channel).await {
                self.unsubscribe_all().await;
                return Err(e.into());
            }
        }
        self.state.status = SessionStatus::Active;
        info!("Session resumed");
        self.emit(SessionEvent::Resumed);
        Ok(())
    }

    /// Always ends disconnected, whatever the transport says on the way.
    async fn stop(&mut self) {
        if self.state.status != SessionStatus::Disconnected {
            self.teardown().await;
        }
        info!("Session stopped");
        self.emit(SessionEvent::Disconnected);
    }

    /// Report a dead link once per connection.
    async fn check_link(&mut self) {
        if !self.state.status.is_connected() || self.link_lost_reported {
            return;
        }
        if !self.transport.is_connected().await {
            warn!("Link to {} lost", self.state.address);
            self.link_lost_reported = true;
            self.emit(SessionEvent::LinkLost);
        }
    }

    // ── Transport plumbing ────────────────────────────────────────────────────

    async fn write_dac(&mut self, channel: Channel) -> Result<(), TransportError> {
        let value = self.state.dac[channel];
        self.transport
            .write_characteristic(DAC_CHARACTERISTICS[channel], &[value])
            .await?;
        debug!("DAC{} = {value}", channel.number());
        Ok(())
    }

    async fn subscribe(&mut self, channel: Channel) -> Result<(), TransportError> {
        let characteristic = CAP_CHARACTERISTICS[channel];
        let router = NotificationRouter::new(characteristic, self.decoder)
            .with_sinks(self.sinks.iter().cloned());
        self.transport
            .start_notify(characteristic, Box::new(router))
            .await?;
        self.state.channels[channel].active = true;
        info!("{channel} subscribed");
        Ok(())
    }

    /// Best effort; the channel is inactive afterwards either way.
    async fn unsubscribe(&mut self, channel: Channel) {
        match self
            .transport
            .stop_notify(CAP_CHARACTERISTICS[channel])
            .await
        {
            Ok(()) => info!("{channel} unsubscribed"),
            Err(TransportError::AlreadyUnsubscribed(_)) => {
                debug!("{channel} was already unsubscribed")
            }
            Err(e) => warn!("{channel}: stop_notify failed: {e}"),
        }
        self.state.channels[channel].active = false;
    }

    async fn unsubscribe_all(&mut self) {
        for channel in Channel::ALL {
            if self.state.channels[channel].active {
                self.unsubscribe(channel).await;
            }
        }
    }

    async fn teardown(&mut self) {
        self.unsubscribe_all().await;
        if let Err(e) = self.transport.disconnect().await {
            warn!("disconnect failed: {e}");
        }
        self.state.status = SessionStatus::Disconnected;
    }
}
