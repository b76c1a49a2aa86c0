use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use tokio::sync::mpsc;

use cbp_rs::config::Config;
use cbp_rs::export::FileExporter;
use cbp_rs::router::SampleSink;
use cbp_rs::session::{ControlMessage, Session};
use cbp_rs::sink::DisplayQueue;
use cbp_rs::transport::ble::{self, BleTransport};
use cbp_rs::transport::simulated::SimulatedTransport;
use cbp_rs::transport::Transport;
use cbp_rs::types::{Channel, ChannelMap, SessionEvent};

/// Samples buffered between the routers and the file writer.
const EXPORT_BUFFER: usize = 4096;

/// How often drained display samples are summarised.
const DISPLAY_PERIOD: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "cbp", version, about = "Stream capacitance data from a CBP sensor board")]
struct Cli {
    /// Config file (default: <config dir>/cbp/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of RUST_LOG.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List nearby BLE peripherals.
    Scan {
        /// Scan duration in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Connect and stream until STOP (or `q`, or Ctrl-C).
    Stream(StreamArgs),
    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
struct StreamArgs {
    /// Board address; overrides `board.address`.
    #[arg(long)]
    addr: Option<String>,
    #[arg(long)]
    no_ch1: bool,
    #[arg(long)]
    no_ch2: bool,
    #[arg(long)]
    dac1: Option<u8>,
    #[arg(long)]
    dac2: Option<u8>,
    /// Use the in-process simulated board instead of Bluetooth.
    #[arg(long)]
    simulate: bool,
    /// Record the session under this directory; overrides `export.directory`.
    #[arg(long)]
    export: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging ───────────────────────────────────────────────────────────────
    // RUST_LOG=cbp_rs=trace shows every reconciled tick.
    let env = env_logger::Env::default().default_filter_or("info");
    let mut logger = env_logger::Builder::from_env(env);
    if cli.debug {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    match cli.command {
        Cmd::InitConfig { force } => {
            if config_path.exists() && !force {
                bail!("{} exists (use --force to overwrite)", config_path.display());
            }
            Config::default().save(&config_path)?;
            println!("Wrote {}", config_path.display());
            Ok(())
        }
        Cmd::Scan { timeout } => {
            let mut settings = Config::load_or_default(&config_path)?.ble;
            if let Some(secs) = timeout {
                settings.scan_timeout_secs = secs;
            }
            for device in ble::scan(&settings).await? {
                println!(
                    "{:<24} {}  ({})",
                    device.name.as_deref().unwrap_or("<unnamed>"),
                    device.address,
                    device.id
                );
            }
            Ok(())
        }
        Cmd::Stream(args) => {
            let mut config = Config::load_or_default(&config_path)?;
            apply_overrides(&mut config, &args);
            config.validate()?;
            if args.simulate {
                let transport = SimulatedTransport::new(config.decoder.decoder());
                stream(transport, config).await
            } else {
                let transport = BleTransport::new(config.ble.clone());
                stream(transport, config).await
            }
        }
    }
}

fn apply_overrides(config: &mut Config, args: &StreamArgs) {
    if let Some(addr) = &args.addr {
        config.board.address = addr.clone();
    }
    config.channels.ch1 &= !args.no_ch1;
    config.channels.ch2 &= !args.no_ch2;
    if let Some(v) = args.dac1 {
        config.board.dac1 = v;
    }
    if let Some(v) = args.dac2 {
        config.board.dac2 = v;
    }
    if let Some(dir) = &args.export {
        config.export.directory = Some(dir.clone());
    }
}

async fn stream<T: Transport + 'static>(transport: T, config: Config) -> Result<()> {
    let displays = ChannelMap::from_fn(|ch| {
        Arc::new(DisplayQueue::new(ch, config.session.display_queue_capacity))
    });
    let exporter = match &config.export.directory {
        Some(dir) => Some(FileExporter::start(dir, EXPORT_BUFFER)?),
        None => None,
    };

    // ── Session ───────────────────────────────────────────────────────────────
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (control, control_rx) = mpsc::channel::<ControlMessage>(64);
    let mut session = Session::new(transport, &config, event_tx);
    for (_, display) in displays.iter() {
        session.add_sink(display.clone() as Arc<dyn SampleSink>);
    }
    if let Some(exporter) = &exporter {
        session.add_sink(exporter.sink());
    }
    let session_task = tokio::spawn(session.run(control_rx));

    let enabled = config.channels.enabled();
    let dac = config.board.dac();
    for message in [
        ControlMessage::new("MAC", config.board.address.as_str()),
        ControlMessage::new("CH1", enabled[Channel::Ch1]),
        ControlMessage::new("CH2", enabled[Channel::Ch2]),
        ControlMessage::new("DAC1", dac[Channel::Ch1]),
        ControlMessage::new("DAC2", dac[Channel::Ch2]),
        ControlMessage::bare("CONNECT"),
    ] {
        control.send(message).await.context("session ended early")?;
    }

    // ── Main event loop ───────────────────────────────────────────────────────
    let mut connected = false;
    let mut failure = None;
    let mut ticker = tokio::time::interval(DISPLAY_PERIOD);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Connected { address }) => {
                    info!("✅  Connected to: {address}");
                    if !connected {
                        connected = true;
                        spawn_stdin_relay(control.clone());
                    }
                }
                Some(SessionEvent::Rejected { command, reason }) => {
                    error!("{command} rejected: {reason}");
                    if !connected && command == "CONNECT" {
                        failure = Some(reason);
                        control.send(ControlMessage::bare("STOP")).await.ok();
                    }
                }
                Some(SessionEvent::LinkLost) => {
                    warn!("Link lost; type STOP (or q) to exit");
                }
                Some(SessionEvent::Disconnected) | None => {
                    info!("❌  Disconnected from device.");
                    break;
                }
                Some(other) => info!("{other:?}"),
            },
            _ = ticker.tick() => print_summary(&displays),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping …");
                control.send(ControlMessage::bare("STOP")).await.ok();
            }
        }
    }
    print_summary(&displays);

    session_task.await.context("session task failed")?;
    if let Some(exporter) = exporter {
        let rows = exporter.finish().await?;
        info!("Recorded {rows} samples");
    }
    if let Some(reason) = failure {
        bail!("connection failed: {reason}");
    }
    info!("Event loop finished – exiting.");
    Ok(())
}

/// Read control lines on a dedicated OS thread (stdin locking is blocking)
/// and forward them to the session.  `q` is shorthand for `STOP`.
fn spawn_stdin_relay(control: mpsc::Sender<ControlMessage>) {
    info!("Commands (type + Enter): MAC <addr> | CH1/CH2 <true|false> | DAC1/DAC2 <0-127>");
    info!("                         PAUSE | START | STOP (or q)");
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let message = match line.trim() {
                "q" => Some(ControlMessage::bare("STOP")),
                other => ControlMessage::parse_line(other),
            };
            if let Some(message) = message {
                if control.blocking_send(message).is_err() {
                    break;
                }
            }
        }
    });
}

fn print_summary(displays: &ChannelMap<Arc<DisplayQueue>>) {
    for (channel, display) in displays.iter() {
        let samples = display.drain();
        let Some(last) = samples.last() else { continue };
        match last.imu {
            Some(imu) => {
                let a = imu.accelerometer;
                println!(
                    "[{channel}] n={:3}  {last}  acc=({:+.3}, {:+.3}, {:+.3}) g",
                    samples.len(),
                    a.x,
                    a.y,
                    a.z
                );
            }
            None => println!("[{channel}] n={:3}  {last}", samples.len()),
        }
    }
}
