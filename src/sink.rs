//! Consumers of the acquisition snapshot.
//!
//! Sinks are polled on their own schedule and never feed back into the
//! acquisition. A failing sink is logged and retried on the next round.

use crate::{
    supervisor::{Snapshot, SnapshotSource},
    Result,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    time::Duration,
};
use stream_cancel::Tripwire;

/// Append-only store of observations.
pub trait Recorder: Send {
    fn record(&mut self, tag: &str, value: f64, timestamp: DateTime<Utc>) -> Result<()>;
}

/// Server that exposes the latest value of every tag.
pub trait Publisher: Send {
    /// `None` means the tag currently has no valid value.
    fn publish(&mut self, tag: &str, value: Option<f64>) -> Result<()>;
}

#[async_trait]
pub trait Sink: Send {
    fn name(&self) -> &str;

    async fn consume(&mut self, snapshot: &Snapshot) -> Result<()>;
}

/// Forwards every new numeric observation to a [`Recorder`] exactly once.
pub struct RecordingSink<R> {
    recorder: R,
    last_recorded: HashMap<String, DateTime<Utc>>,
}

impl<R: Recorder> RecordingSink<R> {
    pub fn new(recorder: R) -> Self {
        Self {
            recorder,
            last_recorded: HashMap::new(),
        }
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }
}

#[async_trait]
impl<R: Recorder> Sink for RecordingSink<R> {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn consume(&mut self, snapshot: &Snapshot) -> Result<()> {
        for (tag, status) in snapshot {
            let Some(value) = status.value() else {
                continue;
            };
            let observed_at = status.last_updated();
            if self.last_recorded.get(tag) == Some(&observed_at) {
                continue;
            }
            self.recorder.record(tag, value, observed_at)?;
            self.last_recorded.insert(tag.clone(), observed_at);
        }
        Ok(())
    }
}

/// Pushes the whole snapshot to a [`Publisher`] on every round.
pub struct PublishingSink<P> {
    publisher: P,
}

impl<P: Publisher> PublishingSink<P> {
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }
}

#[async_trait]
impl<P: Publisher> Sink for PublishingSink<P> {
    fn name(&self) -> &str {
        "publisher"
    }

    async fn consume(&mut self, snapshot: &Snapshot) -> Result<()> {
        for (tag, status) in snapshot {
            self.publisher.publish(tag, status.value())?;
        }
        Ok(())
    }
}

/// Writes observations to the log.
#[derive(Debug, Default)]
pub struct LogRecorder;

impl Recorder for LogRecorder {
    fn record(&mut self, tag: &str, value: f64, timestamp: DateTime<Utc>) -> Result<()> {
        log::info!("{} {} = {}", timestamp.to_rfc3339(), tag, value);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SnapshotEntry {
    value: Option<f64>,
    last_updated: DateTime<Utc>,
    connected: bool,
}

/// Keeps a JSON file with the latest value of every tag.
#[derive(Debug)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

pub fn snapshot_to_json(snapshot: &Snapshot) -> Result<String> {
    let entries: BTreeMap<&str, SnapshotEntry> = snapshot
        .iter()
        .map(|(tag, status)| {
            (
                tag.as_str(),
                SnapshotEntry {
                    value: status.value(),
                    last_updated: status.last_updated(),
                    connected: status.connected,
                },
            )
        })
        .collect();
    Ok(serde_json::to_string_pretty(&entries)?)
}

#[async_trait]
impl Sink for JsonFileSink {
    fn name(&self) -> &str {
        "json-file"
    }

    async fn consume(&mut self, snapshot: &Snapshot) -> Result<()> {
        let json = snapshot_to_json(snapshot)?;
        // Replace atomically so readers never see a truncated file
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Feed the snapshot to every sink once per `interval` until the
/// tripwire fires. A final round runs on shutdown.
pub async fn run_sinks(
    source: SnapshotSource,
    mut sinks: Vec<Box<dyn Sink>>,
    interval: Duration,
    tripwire: Tripwire,
) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let stopping = tokio::select! {
            _ = tripwire.clone() => true,
            _ = ticks.tick() => false,
        };
        let snapshot = source.snapshot();
        for sink in sinks.iter_mut() {
            if let Err(err) = sink.consume(&snapshot).await {
                log::warn!("Sink {} failed: {}", sink.name(), err);
            }
        }
        if stopping {
            break;
        }
    }
    log::info!("Stopped {} sink(s)", sinks.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{Reading, ReadingFault},
        supervisor::{AcquisitionSupervisor, SensorStatus},
        Error,
    };

    #[derive(Default)]
    struct VecRecorder(Vec<(String, f64)>);

    impl Recorder for VecRecorder {
        fn record(&mut self, tag: &str, value: f64, _timestamp: DateTime<Utc>) -> Result<()> {
            self.0.push((tag.to_owned(), value));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MapPublisher(BTreeMap<String, Option<f64>>);

    impl Publisher for MapPublisher {
        fn publish(&mut self, tag: &str, value: Option<f64>) -> Result<()> {
            self.0.insert(tag.to_owned(), value);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn consume(&mut self, _snapshot: &Snapshot) -> Result<()> {
            Err(Error::configuration("unavailable"))
        }
    }

    fn snapshot_of(entries: &[(&str, Reading, bool)]) -> Snapshot {
        entries
            .iter()
            .map(|(tag, reading, connected)| {
                let mut status = SensorStatus::new(*tag);
                status.record(*reading, *connected);
                (tag.to_string(), status)
            })
            .collect()
    }

    #[tokio::test]
    async fn records_each_observation_once() {
        let mut sink = RecordingSink::new(VecRecorder::default());
        let snapshot = snapshot_of(&[
            ("pH", Reading::Value(7.0), true),
            ("O2", Reading::Value(0.0), true),
            ("NH4", Reading::Error(ReadingFault::Decode), true),
            ("NO3", Reading::NoData, false),
        ]);
        sink.consume(&snapshot).await.unwrap();
        sink.consume(&snapshot).await.unwrap();
        let mut recorded = sink.recorder().0.clone();
        recorded.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            vec![("O2".to_owned(), 0.0), ("pH".to_owned(), 7.0)],
            recorded
        );
    }

    #[tokio::test]
    async fn publishes_absent_values_as_none() {
        let mut sink = PublishingSink::new(MapPublisher::default());
        let snapshot = snapshot_of(&[
            ("O2", Reading::Value(0.0), true),
            ("pH", Reading::Error(ReadingFault::Offline), false),
            ("NO3", Reading::NoData, false),
        ]);
        sink.consume(&snapshot).await.unwrap();
        let published = &sink.publisher().0;
        assert_eq!(Some(&Some(0.0)), published.get("O2"));
        assert_eq!(Some(&None), published.get("pH"));
        assert_eq!(Some(&None), published.get("NO3"));
    }

    #[tokio::test]
    async fn writes_json_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensor_data.json");
        let mut sink = JsonFileSink::new(&path);
        let snapshot = snapshot_of(&[
            ("O2", Reading::Value(12.5), true),
            ("pH", Reading::Error(ReadingFault::Decode), true),
        ]);
        sink.consume(&snapshot).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(serde_json::json!(12.5), written["O2"]["value"]);
        assert_eq!(serde_json::json!(true), written["O2"]["connected"]);
        assert!(written["pH"]["value"].is_null());
        assert!(written["pH"]["last_updated"].is_string());
        assert!(!dir.path().join("sensor_data.json.tmp").exists());
    }

    #[tokio::test]
    async fn pump_survives_failing_sink_and_flushes_on_shutdown() {
        let supervisor = AcquisitionSupervisor::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");

        let sinks: Vec<Box<dyn Sink>> =
            vec![Box::new(FailingSink), Box::new(JsonFileSink::new(&path))];
        let pump = tokio::spawn(run_sinks(
            supervisor.snapshot_source(),
            sinks,
            Duration::from_secs(3600),
            supervisor.tripwire(),
        ));
        // The first tick fires immediately
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();

        supervisor.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), pump)
            .await
            .unwrap()
            .unwrap();
        // Final round on shutdown
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(written.as_object().unwrap().is_empty());
    }
}
