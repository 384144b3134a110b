//! The companion side of the exchange: starts sampling sensors on
//! `RecordingStarted`, and on `RecordingStopped` streams the recording back
//! to the node that asked for it.
//!
//! While recording, the companion also reports how many sensors it samples
//! and pushes an activity prediction at a fixed interval.

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::networking::{CompanionTransport, MessageEvent};
use crate::protocol::{CompanionReport, ControlMessage, CHANNEL_PATH_SENSOR_READING};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(20);
pub const DEFAULT_PREDICTION_INTERVAL: Duration = Duration::from_secs(1);

/// Readings are grouped into buckets of this many milliseconds.
const TIMESTAMP_RESOLUTION_MS: i64 = 20;

const CSV_HEADER: &str = "Timestamp,uacc_x,uacc_y,uacc_z,grav_y,grav_x,grav_z,gyr_x,gyr_y,gyr_z";
const MISSING_VALUES: &str = "NaN,NaN,NaN";

/// Accelerometer values are scaled by this before they leave the device.
const ACCELEROMETER_SCALE: f64 = -0.1;

const STANDARD_GRAVITY: f32 = 9.81;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SensorKind {
    Accelerometer,
    Gravity,
    Gyroscope,
}

const SENSORS: [SensorKind; 3] = [SensorKind::Accelerometer, SensorKind::Gravity, SensorKind::Gyroscope];

impl SensorKind {
    fn column(self) -> usize {
        match self {
            SensorKind::Accelerometer => 0,
            SensorKind::Gravity => 1,
            SensorKind::Gyroscope => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SensorReading {
    timestamp_ms: i64,
    sensor: SensorKind,
    values: [f32; 3],
}

fn synthetic_values(sensor: SensorKind, tick: u64) -> [f32; 3] {
    let phase = tick as f32 * 0.05 + sensor.column() as f32;
    match sensor {
        SensorKind::Accelerometer => [phase.sin() * 2.0, phase.cos() * 2.0, STANDARD_GRAVITY + phase.sin()],
        SensorKind::Gravity => [0.0, 0.0, STANDARD_GRAVITY],
        SensorKind::Gyroscope => [phase.cos() * 0.1, phase.sin() * 0.1, 0.0],
    }
}

fn join_values(values: &[f32; 3], scale: Option<f64>) -> String {
    values
        .iter()
        .map(|v| match scale {
            Some(scale) => (*v as f64 * scale).to_string(),
            None => v.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Lays the readings out one row per timestamp bucket, columns in
/// accelerometer, gravity, gyroscope order. A sensor without a reading in a
/// bucket is written as NaN; a later reading in the same bucket wins.
fn recording_csv(readings: &[SensorReading]) -> String {
    let mut buckets: BTreeMap<i64, [Option<[f32; 3]>; 3]> = BTreeMap::new();
    for reading in readings {
        let bucket = reading.timestamp_ms.div_euclid(TIMESTAMP_RESOLUTION_MS);
        buckets.entry(bucket).or_default()[reading.sensor.column()] = Some(reading.values);
    }

    let mut csv = format!("{}\n", CSV_HEADER);
    for (bucket, columns) in &buckets {
        let cells: Vec<String> = SENSORS
            .iter()
            .map(|sensor| match &columns[sensor.column()] {
                Some(values) if *sensor == SensorKind::Accelerometer => {
                    join_values(values, Some(ACCELEROMETER_SCALE))
                }
                Some(values) => join_values(values, None),
                None => MISSING_VALUES.to_string(),
            })
            .collect();
        let _ = writeln!(csv, "{},{}", bucket, cells.join(","));
    }
    csv
}

/// Labels the latest accelerometer reading by how far it strays from gravity.
fn predict_activity(readings: &[SensorReading]) -> String {
    let latest = readings
        .iter()
        .rev()
        .find(|reading| reading.sensor == SensorKind::Accelerometer);
    let Some(reading) = latest else {
        return "unknown".to_string();
    };

    let magnitude = reading.values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if (magnitude - STANDARD_GRAVITY).abs() > 1.0 {
        "moving".to_string()
    } else {
        "still".to_string()
    }
}

type Readings = Arc<Mutex<Vec<SensorReading>>>;

fn lock(readings: &Readings) -> MutexGuard<'_, Vec<SensorReading>> {
    readings.lock().unwrap_or_else(|e| e.into_inner())
}

async fn sample(readings: Readings, interval: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    let mut tick = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = chrono::Utc::now().timestamp_millis();
                let mut readings = lock(&readings);
                for sensor in SENSORS {
                    readings.push(SensorReading {
                        timestamp_ms: now,
                        sensor,
                        values: synthetic_values(sensor, tick),
                    });
                }
                tick += 1;
            }
            _ = stop.changed() => break,
        }
    }
}

async fn send_predictions(
    transport: Arc<CompanionTransport>,
    phone_node_id: String,
    readings: Readings,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let prediction = predict_activity(&lock(&readings));
                debug!("Send prediction to phone: {}", prediction);
                let report = CompanionReport::Prediction(prediction);
                if let Err(e) = transport.send_report(&phone_node_id, &report).await {
                    warn!("Failed to send prediction: {}", e);
                }
            }
            _ = stop.changed() => break,
        }
    }
}

struct ActiveRecording {
    phone_node_id: String,
    readings: Readings,
    stop: watch::Sender<bool>,
    sampler: JoinHandle<()>,
    predictor: JoinHandle<()>,
}

/// Simulated wearable reacting to the phone's control messages.
pub struct CompanionPeer {
    transport: Arc<CompanionTransport>,
    recording_dir: PathBuf,
    sample_interval: Duration,
    prediction_interval: Duration,
    active: Option<ActiveRecording>,
}

impl CompanionPeer {
    pub fn new(transport: Arc<CompanionTransport>, recording_dir: PathBuf, sample_interval: Duration) -> Self {
        Self {
            transport,
            recording_dir,
            sample_interval,
            prediction_interval: DEFAULT_PREDICTION_INTERVAL,
            active: None,
        }
    }

    pub fn with_prediction_interval(mut self, interval: Duration) -> Self {
        self.prediction_interval = interval;
        self
    }

    /// Routes the transport's incoming messages into a queue so they are
    /// handled one at a time, in arrival order.
    pub fn attach(transport: &CompanionTransport) -> mpsc::UnboundedReceiver<MessageEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.set_message_handler(Arc::new(move |event| {
            if tx.send(event).is_err() {
                debug!("Companion peer is gone, dropping message");
            }
        }));
        rx
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<MessageEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(event).await {
                error!("{:#}", e);
            }
        }
    }

    pub async fn handle(&mut self, event: MessageEvent) -> Result<()> {
        info!("Message received: {} from {}", event.path, event.source_node_id);
        match ControlMessage::from_path(&event.path) {
            Some(ControlMessage::RecordingStarted) => self.start(event.source_node_id).await,
            Some(ControlMessage::RecordingStopped) => self.stop().await.map(|_| ()),
            None => {
                warn!("Unrecognized message path: {}", event.path);
                Ok(())
            }
        }
    }

    async fn start(&mut self, phone_node_id: String) -> Result<()> {
        if self.active.is_some() {
            warn!("Already recording, ignoring start from {}", phone_node_id);
            return Ok(());
        }

        let count = CompanionReport::SensorCount(SENSORS.len());
        match self.transport.send_report(&phone_node_id, &count).await {
            Ok(()) => info!("Number of sensors {} has been sent.", SENSORS.len()),
            Err(e) => warn!("Failed to send sensor number: {}", e),
        }

        let readings: Readings = Arc::new(Mutex::new(Vec::new()));
        let (stop, stopped) = watch::channel(false);
        let sampler = tokio::spawn(sample(readings.clone(), self.sample_interval, stopped.clone()));
        let predictor = tokio::spawn(send_predictions(
            self.transport.clone(),
            phone_node_id.clone(),
            readings.clone(),
            self.prediction_interval,
            stopped,
        ));

        info!("Recording sensors for {}", phone_node_id);
        self.active = Some(ActiveRecording {
            phone_node_id,
            readings,
            stop,
            sampler,
            predictor,
        });
        Ok(())
    }

    /// Ends the recording and sends it back. Returns the bytes sent.
    async fn stop(&mut self) -> Result<u64> {
        let Some(recording) = self.active.take() else {
            warn!("Stop received while not recording");
            return Ok(0);
        };

        let _ = recording.stop.send(true);
        recording.sampler.await.context("Sensor sampling panicked")?;
        recording.predictor.await.context("Prediction task panicked")?;

        let csv = {
            let readings = lock(&recording.readings);
            info!("Writing {} records to file.", readings.len());
            recording_csv(&readings)
        };

        tokio::fs::create_dir_all(&self.recording_dir)
            .await
            .context("Failed to create recording directory")?;
        let path = self.recording_dir.join(format!("recording_{}.csv", Uuid::new_v4()));
        tokio::fs::write(&path, csv)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        let sent = self.send_back(&recording.phone_node_id, &path).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("Failed to remove {}: {}", path.display(), e);
        }
        sent
    }

    async fn send_back(&self, phone_node_id: &str, path: &Path) -> Result<u64> {
        info!("Opening channel to {}", phone_node_id);
        let bytes = self
            .transport
            .send_file(phone_node_id, CHANNEL_PATH_SENSOR_READING, path)
            .await
            .map_err(|e| anyhow!("Failed to send recorded data: {}", e))?;
        info!("Successfully sent recorded data ({} bytes).", bytes);
        Ok(bytes)
    }
}
