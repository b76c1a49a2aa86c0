//! Tab-separated session recorder.
//!
//! ```text
//! <dir>/session_10_16_2026_14_03_59/record.tsv
//! time  wall_clock  cap1  cap2  accx  accy  accz  gyrox  gyroy  gyroz  magx  magy  magz
//! ```
//!
//! One row per reconciled sample.  Only the capacitance column of the
//! sample's channel is filled, and the IMU columns stay empty for layouts
//! without IMU data.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use log::{debug, info};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ExportError;
use crate::router::SampleSink;
use crate::sink::ChannelSink;
use crate::types::{Channel, ReconciledSample};

/// Rows written between explicit flushes.
pub const FLUSH_EVERY: u64 = 100;

pub const RECORD_FILE: &str = "record.tsv";

const HEADER: [&str; 13] = [
    "time",
    "wall_clock",
    "cap1",
    "cap2",
    "accx",
    "accy",
    "accz",
    "gyrox",
    "gyroy",
    "gyroz",
    "magx",
    "magy",
    "magz",
];

#[derive(Debug, Serialize)]
struct Row {
    time: f64,
    wall_clock: String,
    cap1: Option<f64>,
    cap2: Option<f64>,
    accx: Option<f64>,
    accy: Option<f64>,
    accz: Option<f64>,
    gyrox: Option<f64>,
    gyroy: Option<f64>,
    gyroz: Option<f64>,
    magx: Option<f64>,
    magy: Option<f64>,
    magz: Option<f64>,
}

impl From<&ReconciledSample> for Row {
    fn from(s: &ReconciledSample) -> Self {
        let cap = |channel: Channel| (s.channel == channel).then_some(s.capacitance);
        let imu = s.imu;
        Row {
            time: s.session_time,
            wall_clock: Local::now().format("%H:%M:%S%.3f").to_string(),
            cap1: cap(Channel::Ch1),
            cap2: cap(Channel::Ch2),
            accx: imu.map(|i| i.accelerometer.x),
            accy: imu.map(|i| i.accelerometer.y),
            accz: imu.map(|i| i.accelerometer.z),
            gyrox: imu.map(|i| i.gyroscope.x),
            gyroy: imu.map(|i| i.gyroscope.y),
            gyroz: imu.map(|i| i.gyroscope.z),
            magx: imu.map(|i| i.magnetometer.x),
            magy: imu.map(|i| i.magnetometer.y),
            magz: imu.map(|i| i.magnetometer.z),
        }
    }
}

/// Records every sample it is fed into a fresh session directory.
///
/// The router side only enqueues; a blocking task owns the file.  Must be
/// started from within a tokio runtime.
pub struct FileExporter {
    path: PathBuf,
    sink: Arc<ChannelSink>,
    writer: JoinHandle<Result<u64, ExportError>>,
}

impl FileExporter {
    /// Create `<directory>/session_<timestamp>/record.tsv`, write the
    /// header and start the writer task.
    pub fn start(directory: &Path, capacity: usize) -> Result<Self, ExportError> {
        let stamp = Local::now().format("session_%m_%d_%Y_%H_%M_%S");
        let session_dir = directory.join(stamp.to_string());
        fs::create_dir_all(&session_dir).map_err(|source| ExportError::Io {
            path: session_dir.clone(),
            source,
        })?;
        let path = session_dir.join(RECORD_FILE);

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_path(&path)?;
        writer.write_record(HEADER)?;
        writer.flush().map_err(|source| ExportError::Io {
            path: path.clone(),
            source,
        })?;
        info!("Recording to {}", path.display());

        let (sink, rx) = ChannelSink::new(capacity);
        let writer_path = path.clone();
        let writer = tokio::task::spawn_blocking(move || write_rows(writer, rx, writer_path));

        Ok(Self {
            path,
            sink: Arc::new(sink),
            writer,
        })
    }

    /// The sink to register with the routers.
    pub fn sink(&self) -> Arc<dyn SampleSink> {
        self.sink.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Samples dropped because the writer fell behind.
    pub fn dropped(&self) -> u64 {
        self.sink.dropped()
    }

    /// Wait for every queued sample to reach the file.
    ///
    /// Completes once all handed-out sinks are dropped, i.e. after the
    /// session unsubscribed.  Returns the number of rows written.
    pub async fn finish(self) -> Result<u64, ExportError> {
        let dropped = self.sink.dropped();
        drop(self.sink);
        let rows = self.writer.await??;
        info!(
            "{} rows written to {} ({dropped} dropped)",
            rows,
            self.path.display()
        );
        Ok(rows)
    }
}

fn write_rows(
    mut writer: csv::Writer<fs::File>,
    mut rx: mpsc::Receiver<ReconciledSample>,
    path: PathBuf,
) -> Result<u64, ExportError> {
    let io = |source| ExportError::Io {
        path: path.clone(),
        source,
    };
    let mut rows = 0u64;
    while let Some(sample) = rx.blocking_recv() {
        writer.serialize(Row::from(&sample))?;
        rows += 1;
        if rows % FLUSH_EVERY == 0 {
            writer.flush().map_err(io)?;
            debug!("export: {rows} rows flushed");
        }
    }
    writer.flush().map_err(io)?;
    Ok(rows)
}
