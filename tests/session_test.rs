use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use cbp_rs::config::Config;
use cbp_rs::error::{SessionError, TransportError};
use cbp_rs::parse::{encode, PacketLayout};
use cbp_rs::protocol::{
    CAP1_CHARACTERISTIC, CAP2_CHARACTERISTIC, DAC1_CHARACTERISTIC, DAC2_CHARACTERISTIC,
};
use cbp_rs::session::{Command, ControlMessage, Flow, Session, SessionStatus};
use cbp_rs::sink::DisplayQueue;
use cbp_rs::transport::{PacketHandler, Transport};
use cbp_rs::types::{Channel, RawPacket, SessionEvent};

// ── Recording transport ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Connect(String),
    Disconnect,
    StartNotify(Uuid),
    StopNotify(Uuid),
    Write(Uuid, Vec<u8>),
}

#[derive(Default)]
struct RecordingTransport {
    calls: Vec<Call>,
    handlers: Mutex<HashMap<Uuid, Box<dyn PacketHandler>>>,
    connected: bool,
    fail_connect: bool,
    fail_subscribe: Option<Uuid>,
    fail_write: bool,
    link_down: Arc<AtomicBool>,
}

impl RecordingTransport {
    fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    fn starts(&self) -> Vec<Uuid> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::StartNotify(u) => Some(*u),
                _ => None,
            })
            .collect()
    }

    fn stops(&self) -> Vec<Uuid> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::StopNotify(u) => Some(*u),
                _ => None,
            })
            .collect()
    }

    /// Feed a notification to the handler subscribed on `characteristic`.
    fn deliver(&self, characteristic: Uuid, data: Vec<u8>) -> bool {
        match self.handlers.lock().unwrap().get_mut(&characteristic) {
            Some(handler) => {
                handler.handle(RawPacket::new(characteristic, data));
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        self.calls.push(Call::Connect(address.to_string()));
        if self.fail_connect {
            return Err(TransportError::DeviceNotFound(address.to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.calls.push(Call::Disconnect);
        self.handlers.lock().unwrap().clear();
        self.connected = false;
        Ok(())
    }

    async fn start_notify(
        &mut self,
        characteristic: Uuid,
        handler: Box<dyn PacketHandler>,
    ) -> Result<(), TransportError> {
        self.calls.push(Call::StartNotify(characteristic));
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.fail_subscribe == Some(characteristic) {
            return Err(TransportError::CharacteristicNotFound(characteristic));
        }
        self.handlers.lock().unwrap().insert(characteristic, handler);
        Ok(())
    }

    async fn stop_notify(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
        self.calls.push(Call::StopNotify(characteristic));
        let removed = self.handlers.lock().unwrap().remove(&characteristic);
        if removed.is_none() || self.link_down.load(Ordering::SeqCst) {
            return Err(TransportError::AlreadyUnsubscribed(characteristic));
        }
        Ok(())
    }

    async fn write_characteristic(
        &mut self,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.calls.push(Call::Write(characteristic, data.to_vec()));
        if self.fail_write {
            return Err(TransportError::Timeout {
                operation: "write",
                secs: 1,
            });
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected && !self.link_down.load(Ordering::SeqCst)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

type Events = mpsc::UnboundedReceiver<SessionEvent>;

fn session_with(config: &Config) -> (Session<RecordingTransport>, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Session::new(RecordingTransport::default(), config, tx), rx)
}

fn session() -> (Session<RecordingTransport>, Events) {
    session_with(&Config::default())
}

fn drain(events: &mut Events) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(e) = events.try_recv() {
        out.push(e);
    }
    out
}

fn msg(name: &str, payload: impl Into<Value>) -> ControlMessage {
    ControlMessage::new(name, payload)
}

fn bare(name: &str) -> ControlMessage {
    ControlMessage::bare(name)
}

fn rejected(events: &[SessionEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Rejected { command, .. } => Some(command.as_str()),
            _ => None,
        })
        .collect()
}

// ── Transitions ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_channel_session_lifecycle() {
    let (mut s, mut events) = session();

    s.handle_message(&msg("CH1", true)).await;
    s.handle_message(&msg("CH2", false)).await;
    s.handle_message(&bare("CONNECT")).await;
    assert_eq!(s.status(), SessionStatus::Active);
    assert_eq!(s.transport().starts(), vec![CAP1_CHARACTERISTIC]);
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Connected {
            address: Config::default().board.address
        }]
    );

    s.handle_message(&bare("PAUSE")).await;
    assert_eq!(s.status(), SessionStatus::Paused);
    assert_eq!(s.transport().stops(), vec![CAP1_CHARACTERISTIC]);

    s.handle_message(&bare("START")).await;
    assert_eq!(s.status(), SessionStatus::Active);
    assert_eq!(
        s.transport().starts(),
        vec![CAP1_CHARACTERISTIC, CAP1_CHARACTERISTIC]
    );

    let flow = s.handle_message(&bare("STOP")).await;
    assert_eq!(flow, Flow::Exit);
    assert_eq!(s.status(), SessionStatus::Disconnected);
    assert_eq!(
        s.transport().stops(),
        vec![CAP1_CHARACTERISTIC, CAP1_CHARACTERISTIC]
    );
    assert_eq!(s.transport().calls.last(), Some(&Call::Disconnect));
    assert_eq!(
        drain(&mut events),
        vec![
            SessionEvent::Paused,
            SessionEvent::Resumed,
            SessionEvent::Disconnected
        ]
    );
}

#[tokio::test]
async fn connect_writes_dacs_before_subscribing() {
    let mut config = Config::default();
    config.board.dac1 = 5;
    config.board.dac2 = 9;
    let (mut s, _events) = session_with(&config);
    s.handle_message(&bare("CONNECT")).await;

    assert_eq!(
        s.transport().calls,
        vec![
            Call::Connect(config.board.address.clone()),
            Call::Write(DAC1_CHARACTERISTIC, vec![5]),
            Call::Write(DAC2_CHARACTERISTIC, vec![9]),
            Call::StartNotify(CAP1_CHARACTERISTIC),
            Call::StartNotify(CAP2_CHARACTERISTIC),
        ]
    );
}

#[tokio::test]
async fn disabling_a_disabled_channel_is_a_no_op() {
    let (mut s, mut events) = session();
    s.handle_message(&msg("CH2", false)).await;
    s.handle_message(&bare("CONNECT")).await;
    drain(&mut events);

    s.handle_message(&msg("CH2", false)).await;
    assert!(s.transport().stops().is_empty());
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn toggling_channels_while_active_resubscribes_immediately() {
    let (mut s, mut events) = session();
    s.handle_message(&msg("CH2", false)).await;
    s.handle_message(&bare("CONNECT")).await;
    drain(&mut events);

    s.handle_message(&msg("CH2", true)).await;
    s.handle_message(&msg("CH1", false)).await;
    assert_eq!(
        s.transport().starts(),
        vec![CAP1_CHARACTERISTIC, CAP2_CHARACTERISTIC]
    );
    assert_eq!(s.transport().stops(), vec![CAP1_CHARACTERISTIC]);
    assert!(s.state().channels[Channel::Ch2].active);
    assert!(!s.state().channels[Channel::Ch1].active);
    assert_eq!(
        drain(&mut events),
        vec![
            SessionEvent::ChannelChanged {
                channel: Channel::Ch2,
                active: true
            },
            SessionEvent::ChannelChanged {
                channel: Channel::Ch1,
                active: false
            },
        ]
    );
}

#[tokio::test]
async fn channel_flags_set_while_paused_apply_on_start() {
    let (mut s, _events) = session();
    s.handle_message(&bare("CONNECT")).await;
    s.handle_message(&bare("PAUSE")).await;
    let calls_before = s.transport().calls.len();

    s.handle_message(&msg("CH2", false)).await;
    assert_eq!(s.transport().calls.len(), calls_before);

    s.handle_message(&bare("START")).await;
    assert_eq!(
        s.transport().calls[calls_before..],
        [Call::StartNotify(CAP1_CHARACTERISTIC)]
    );
}

#[tokio::test]
async fn disabling_the_last_active_channel_pauses_the_session() {
    let (mut s, mut events) = session();
    s.handle_message(&bare("CONNECT")).await;
    drain(&mut events);

    s.handle_message(&msg("CH1", false)).await;
    assert_eq!(s.status(), SessionStatus::Active);
    s.handle_message(&msg("CH2", false)).await;
    assert_eq!(s.status(), SessionStatus::Paused);
    assert!(s.state().channels.iter().all(|(_, c)| !c.active));
    assert_eq!(
        drain(&mut events),
        vec![
            SessionEvent::ChannelChanged {
                channel: Channel::Ch1,
                active: false
            },
            SessionEvent::ChannelChanged {
                channel: Channel::Ch2,
                active: false
            },
            SessionEvent::Paused,
        ]
    );

    // Paused, so the flag is recorded and START brings the channel back.
    s.handle_message(&msg("CH1", true)).await;
    s.handle_message(&bare("START")).await;
    assert_eq!(s.status(), SessionStatus::Active);
    assert!(s.state().channels[Channel::Ch1].active);
    assert_eq!(
        s.transport().starts(),
        vec![CAP1_CHARACTERISTIC, CAP2_CHARACTERISTIC, CAP1_CHARACTERISTIC]
    );
    assert_eq!(drain(&mut events), vec![SessionEvent::Resumed]);
}

#[tokio::test]
async fn start_without_enabled_channels_stays_paused() {
    let (mut s, mut events) = session();
    s.handle_message(&bare("CONNECT")).await;
    s.handle_message(&bare("PAUSE")).await;
    s.handle_message(&msg("CH1", false)).await;
    s.handle_message(&msg("CH2", false)).await;
    drain(&mut events);
    let calls_before = s.transport().calls.len();

    let result = s.execute(Command::Start).await;
    assert!(matches!(result, Err(SessionError::InvalidConfiguration(_))));
    assert_eq!(s.status(), SessionStatus::Paused);
    assert_eq!(s.transport().calls.len(), calls_before);

    s.handle_message(&bare("START")).await;
    assert_eq!(rejected(&drain(&mut events)), vec!["START"]);
}

#[tokio::test]
async fn out_of_state_commands_are_rejected_and_ignored() {
    let (mut s, mut events) = session();
    for name in ["PAUSE", "START"] {
        assert_eq!(s.handle_message(&bare(name)).await, Flow::Continue);
    }
    assert!(s.transport().calls.is_empty());
    assert_eq!(s.status(), SessionStatus::Disconnected);

    s.handle_message(&bare("CONNECT")).await;
    drain(&mut events);
    s.handle_message(&bare("START")).await;
    s.handle_message(&bare("CONNECT")).await;
    s.handle_message(&msg("MAC", "AA:BB:CC:DD:EE:FF")).await;
    assert_eq!(s.status(), SessionStatus::Active);
    assert_ne!(s.state().address, "AA:BB:CC:DD:EE:FF");
    assert_eq!(rejected(&drain(&mut events)), vec!["START", "CONNECT", "MAC"]);
}

#[tokio::test]
async fn unknown_and_malformed_messages_are_rejected() {
    let (mut s, mut events) = session();
    assert_eq!(s.handle_message(&bare("RESET")).await, Flow::Continue);
    assert_eq!(s.handle_message(&msg("DAC1", 300)).await, Flow::Continue);
    assert_eq!(s.handle_message(&msg("CH1", "maybe")).await, Flow::Continue);
    assert_eq!(rejected(&drain(&mut events)), vec!["RESET", "DAC1", "CH1"]);
    assert!(s.state().channels[Channel::Ch1].enabled);
    assert_eq!(s.state().dac[Channel::Ch1], 0);
}

#[tokio::test]
async fn address_is_used_for_the_next_connect() {
    let (mut s, _events) = session();
    s.handle_message(&msg("MAC", "AA:BB:CC:DD:EE:FF")).await;
    s.handle_message(&bare("CONNECT")).await;
    assert_eq!(
        s.transport().calls[0],
        Call::Connect("AA:BB:CC:DD:EE:FF".into())
    );
}

// ── Failures ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn connect_without_channels_fails_before_touching_the_transport() {
    let (mut s, _events) = session();
    s.handle_message(&msg("CH1", false)).await;
    s.handle_message(&msg("CH2", false)).await;

    let result = s.execute(Command::Connect).await;
    assert!(matches!(result, Err(SessionError::InvalidConfiguration(_))));
    assert!(s.transport().calls.is_empty());
    assert_eq!(s.status(), SessionStatus::Disconnected);
}

#[tokio::test]
async fn combined_layout_subscribes_a_single_characteristic() {
    let mut config = Config::default();
    config.decoder.layout = PacketLayout::Combined;
    let (mut s, mut events) = session_with(&config);

    // Both flags are on by default; two routers would interleave two clocks.
    let result = s.execute(Command::Connect).await;
    assert!(matches!(result, Err(SessionError::InvalidConfiguration(_))));
    assert!(s.transport().calls.is_empty());

    s.handle_message(&msg("CH2", false)).await;
    s.handle_message(&bare("CONNECT")).await;
    assert_eq!(s.status(), SessionStatus::Active);
    assert_eq!(s.transport().starts(), vec![CAP1_CHARACTERISTIC]);
    drain(&mut events);

    s.handle_message(&msg("CH2", true)).await;
    assert_eq!(rejected(&drain(&mut events)), vec!["CH2"]);
    assert!(!s.state().channels[Channel::Ch2].enabled);
    assert_eq!(s.transport().starts(), vec![CAP1_CHARACTERISTIC]);

    s.handle_message(&bare("PAUSE")).await;
    s.handle_message(&msg("CH2", true)).await;
    let result = s.execute(Command::Start).await;
    assert!(matches!(result, Err(SessionError::InvalidConfiguration(_))));
    assert_eq!(s.status(), SessionStatus::Paused);
}

#[tokio::test]
async fn failed_connect_leaves_session_disconnected_and_retryable() {
    let (mut s, mut events) = session();
    s.transport_mut().fail_connect = true;

    let result = s.execute(Command::Connect).await;
    assert!(matches!(
        result,
        Err(SessionError::Transport(TransportError::DeviceNotFound(_)))
    ));
    assert_eq!(s.status(), SessionStatus::Disconnected);
    assert!(drain(&mut events).is_empty());

    s.transport_mut().fail_connect = false;
    assert_eq!(s.execute(Command::Connect).await.unwrap(), Flow::Continue);
    assert_eq!(s.status(), SessionStatus::Active);
}

#[tokio::test]
async fn failed_subscribe_during_connect_tears_the_link_down() {
    let (mut s, _events) = session();
    s.transport_mut().fail_subscribe = Some(CAP2_CHARACTERISTIC);

    assert!(s.execute(Command::Connect).await.is_err());
    assert_eq!(s.status(), SessionStatus::Disconnected);
    assert_eq!(s.transport().stops(), vec![CAP1_CHARACTERISTIC]);
    assert_eq!(s.transport().calls.last(), Some(&Call::Disconnect));
    assert!(s.state().channels.iter().all(|(_, c)| !c.active));
}

#[tokio::test]
async fn failed_resubscribe_keeps_the_channel_disabled() {
    let (mut s, mut events) = session();
    s.handle_message(&msg("CH2", false)).await;
    s.handle_message(&bare("CONNECT")).await;
    drain(&mut events);
    s.transport_mut().fail_subscribe = Some(CAP2_CHARACTERISTIC);

    s.handle_message(&msg("CH2", true)).await;
    assert!(!s.state().channels[Channel::Ch2].enabled);
    assert!(!s.state().channels[Channel::Ch2].active);
    assert_eq!(rejected(&drain(&mut events)), vec!["CH2"]);
}

#[tokio::test]
async fn stop_succeeds_when_the_link_is_already_gone() {
    let (mut s, mut events) = session();
    s.handle_message(&bare("CONNECT")).await;
    s.transport().link_down.store(true, Ordering::SeqCst);

    assert_eq!(s.execute(Command::Stop).await.unwrap(), Flow::Exit);
    assert_eq!(s.status(), SessionStatus::Disconnected);
    assert_eq!(
        s.transport().stops(),
        vec![CAP1_CHARACTERISTIC, CAP2_CHARACTERISTIC]
    );
    assert_eq!(s.transport().count(&Call::Disconnect), 1);
    assert_eq!(drain(&mut events).last(), Some(&SessionEvent::Disconnected));
}

// ── DAC registers ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn dac_values_are_pending_until_connected() {
    let (mut s, mut events) = session();
    s.handle_message(&msg("DAC1", 42)).await;
    assert!(s.transport().calls.is_empty());
    assert_eq!(s.state().dac[Channel::Ch1], 42);

    s.handle_message(&bare("CONNECT")).await;
    assert_eq!(
        s.transport()
            .count(&Call::Write(DAC1_CHARACTERISTIC, vec![42])),
        1
    );
    drain(&mut events);

    s.handle_message(&msg("DAC2", 7)).await;
    assert_eq!(
        s.transport().calls.last(),
        Some(&Call::Write(DAC2_CHARACTERISTIC, vec![7]))
    );
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::DacWritten {
            channel: Channel::Ch2,
            value: 7
        }]
    );
}

#[tokio::test]
async fn failed_dac_write_keeps_the_previous_value() {
    let (mut s, mut events) = session();
    s.handle_message(&bare("CONNECT")).await;
    drain(&mut events);
    s.transport_mut().fail_write = true;

    s.handle_message(&msg("DAC2", 100)).await;
    assert_eq!(s.state().dac[Channel::Ch2], 0);
    assert_eq!(rejected(&drain(&mut events)), vec!["DAC2"]);
}

// ── Data path ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn notifications_reach_session_sinks() {
    let (mut s, _events) = session();
    let ch1 = Arc::new(DisplayQueue::new(Channel::Ch1, 16));
    let ch2 = Arc::new(DisplayQueue::new(Channel::Ch2, 16));
    s.add_sink(ch1.clone());
    s.add_sink(ch2.clone());
    s.handle_message(&bare("CONNECT")).await;

    let imu = [0, 0, 8192, 0, 0, 0, 0, 0, 0];
    let t = s.transport();
    assert!(t.deliver(CAP1_CHARACTERISTIC, encode::capacitance_imu(100, 0, imu)));
    assert!(t.deliver(CAP1_CHARACTERISTIC, vec![0; 5]));
    assert!(t.deliver(CAP1_CHARACTERISTIC, encode::capacitance_imu(200, 0, imu)));
    assert!(t.deliver(CAP2_CHARACTERISTIC, encode::capacitance_imu(7, 0, imu)));

    let samples = ch1.drain();
    assert_eq!(samples.len(), 2);
    assert!(samples[1].session_time > samples[0].session_time);
    assert_eq!(samples[0].imu.unwrap().accelerometer.z, 1.0);
    assert_eq!(ch2.len(), 1);
}

#[tokio::test]
async fn resubscribing_starts_a_fresh_clock() {
    let (mut s, _events) = session();
    let ch1 = Arc::new(DisplayQueue::new(Channel::Ch1, 16));
    s.add_sink(ch1.clone());
    s.handle_message(&msg("CH2", false)).await;
    s.handle_message(&bare("CONNECT")).await;

    let imu = [0; 9];
    s.transport()
        .deliver(CAP1_CHARACTERISTIC, encode::capacitance_imu(1000, 0, imu));
    s.handle_message(&bare("PAUSE")).await;
    assert!(!s
        .transport()
        .deliver(CAP1_CHARACTERISTIC, encode::capacitance_imu(2000, 0, imu)));
    s.handle_message(&bare("START")).await;
    s.transport()
        .deliver(CAP1_CHARACTERISTIC, encode::capacitance_imu(10, 0, imu));

    let times: Vec<f64> = ch1.drain().iter().map(|s| s.session_time).collect();
    assert_eq!(times, vec![1000.0 / 32_768.0, 10.0 / 32_768.0]);
}

// ── Control loop ──────────────────────────────────────────────────────────────

fn fast_config() -> Config {
    let mut config = Config::default();
    config.session.poll_interval_ms = 20;
    config
}

#[tokio::test]
async fn run_processes_messages_in_order_until_stop() {
    let (s, mut events) = session_with(&fast_config());
    let (control, rx) = mpsc::channel(16);
    let task = tokio::spawn(s.run(rx));

    for m in [
        msg("CH2", false),
        bare("CONNECT"),
        bare("PAUSE"),
        bare("START"),
        bare("STOP"),
        bare("CONNECT"),
    ] {
        control.send(m).await.unwrap();
    }
    let transport = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        transport.starts(),
        vec![CAP1_CHARACTERISTIC, CAP1_CHARACTERISTIC]
    );
    assert_eq!(transport.count(&Call::Disconnect), 1);
    let events = drain(&mut events);
    assert!(matches!(events[0], SessionEvent::Connected { .. }));
    assert_eq!(
        events[1..],
        [
            SessionEvent::Paused,
            SessionEvent::Resumed,
            SessionEvent::Disconnected
        ]
    );
}

#[tokio::test]
async fn closing_the_control_channel_disconnects() {
    let (s, mut events) = session_with(&fast_config());
    let (control, rx) = mpsc::channel(4);
    let task = tokio::spawn(s.run(rx));
    control.send(bare("CONNECT")).await.unwrap();
    drop(control);

    let transport = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transport.calls.last(), Some(&Call::Disconnect));
    assert_eq!(drain(&mut events).last(), Some(&SessionEvent::Disconnected));
}

#[tokio::test]
async fn idle_poll_reports_a_lost_link_once() {
    let (s, mut events) = session_with(&fast_config());
    let link_down = s.transport().link_down.clone();
    let (control, rx) = mpsc::channel(4);
    let task = tokio::spawn(s.run(rx));

    control.send(bare("CONNECT")).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap();
    assert!(matches!(first, Some(SessionEvent::Connected { .. })));

    link_down.store(true, Ordering::SeqCst);
    let lost = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap();
    assert_eq!(lost, Some(SessionEvent::LinkLost));

    // Several more idle polls, no repeat.
    tokio::time::sleep(Duration::from_millis(100)).await;
    control.send(bare("STOP")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(drain(&mut events), vec![SessionEvent::Disconnected]);
}
