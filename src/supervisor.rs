//! Lifecycle of all sensor readers and the shared tag registry.

use crate::{
    config::SensorConfig,
    core::{Reading, ReadingFault, SensorReading},
    reader::SensorReader,
    Error, Result,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock},
};
use stream_cancel::{Trigger, Tripwire};
use tokio::task::JoinHandle;

/// Latest state of one tag as seen by the sinks.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SensorStatus {
    pub reading: SensorReading,
    pub connected: bool,
    pub last_fault: Option<DateTime<Utc>>,
}

impl SensorStatus {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            reading: SensorReading::new(tag, Reading::NoData),
            connected: false,
            last_fault: None,
        }
    }

    /// `None` for "no data yet" and for errored readings alike.
    pub fn value(&self) -> Option<f64> {
        self.reading.value()
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.reading.observed_at
    }

    /// Replace the reading with a fresh observation.
    pub fn record(&mut self, reading: Reading, connected: bool) {
        self.reading = SensorReading::new(self.reading.tag.clone(), reading);
        self.connected = connected;
    }

    /// Record a fault that took the link down.
    pub fn fault(&mut self, reading: ReadingFault, at: Option<DateTime<Utc>>) {
        self.record(Reading::Error(reading), false);
        self.last_fault = Some(at.unwrap_or(self.reading.observed_at));
    }

    /// The link could not be opened. A sensor that never delivered
    /// anything keeps showing no data, a live value is invalidated.
    pub fn unreachable(&mut self) {
        if let Reading::Value(_) = self.reading.reading {
            self.record(Reading::Error(ReadingFault::Offline), false);
        } else {
            self.connected = false;
        }
    }
}

/// Point-in-time copy of all tags.
pub type Snapshot = BTreeMap<String, SensorStatus>;

/// Tag-keyed store of the latest readings.
///
/// Every write replaces the entry of a single tag under the lock, so a
/// reader of the registry never sees a partially updated entry.
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, SensorStatus>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tag in the "no data" state. Returns `false` if the tag exists.
    pub fn insert(&self, tag: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(tag) {
            return false;
        }
        entries.insert(tag.to_owned(), SensorStatus::new(tag));
        true
    }

    pub fn get(&self, tag: &str) -> Option<SensorStatus> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(tag).cloned()
    }

    pub fn update<F>(&self, tag: &str, update: F)
    where
        F: FnOnce(&mut SensorStatus),
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let status = entries
            .entry(tag.to_owned())
            .or_insert_with(|| SensorStatus::new(tag));
        update(status);
    }

    pub fn snapshot(&self) -> Snapshot {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .map(|(tag, status)| (tag.clone(), status.clone()))
            .collect()
    }
}

/// Read-only access to the registry for sinks.
#[derive(Clone, Debug)]
pub struct SnapshotSource {
    registry: Arc<Registry>,
}

impl SnapshotSource {
    pub fn snapshot(&self) -> Snapshot {
        self.registry.snapshot()
    }
}

/// A running reader task.
#[derive(Debug)]
pub struct ReaderHandle {
    tag: String,
    registry: Arc<Registry>,
    task: JoinHandle<()>,
}

impl ReaderHandle {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The last decoded reading. Never waits for I/O.
    pub fn current_value(&self) -> SensorReading {
        self.registry
            .get(&self.tag)
            .map(|status| status.reading)
            .unwrap_or_else(|| SensorReading::new(self.tag.clone(), Reading::NoData))
    }

    pub fn is_connected(&self) -> bool {
        self.registry
            .get(&self.tag)
            .map_or(false, |status| status.connected)
    }
}

/// Owns every reader task and the registry they write to.
pub struct AcquisitionSupervisor {
    registry: Arc<Registry>,
    trigger: Trigger,
    tripwire: Tripwire,
    readers: Vec<ReaderHandle>,
}

impl Default for AcquisitionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionSupervisor {
    pub fn new() -> Self {
        let (trigger, tripwire) = Tripwire::new();
        Self {
            registry: Arc::new(Registry::new()),
            trigger,
            tripwire,
            readers: Vec::new(),
        }
    }

    /// Build a reader from its configuration and start polling.
    ///
    /// A malformed configuration is returned as an error and nothing is
    /// started for this sensor. Must be called within a Tokio runtime.
    pub fn register(&mut self, config: &SensorConfig) -> Result<()> {
        let reader = config.build_reader()?;
        self.start(reader)
    }

    /// Start polling with an already constructed reader.
    pub fn start(&mut self, reader: SensorReader) -> Result<()> {
        let tag = reader.tag().to_owned();
        if !self.registry.insert(&tag) {
            return Err(Error::configuration(format!(
                "Sensor tag '{}' is registered twice",
                tag
            )));
        }
        log::info!("Starting reader for {}", tag);
        let registry = Arc::clone(&self.registry);
        let tripwire = self.tripwire.clone();
        let task = tokio::spawn(reader.run(registry, tripwire));
        self.readers.push(ReaderHandle {
            tag,
            registry: Arc::clone(&self.registry),
            task,
        });
        Ok(())
    }

    pub fn readers(&self) -> &[ReaderHandle] {
        &self.readers
    }

    pub fn reader(&self, tag: &str) -> Option<&ReaderHandle> {
        self.readers.iter().find(|handle| handle.tag == tag)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.registry.snapshot()
    }

    pub fn snapshot_source(&self) -> SnapshotSource {
        SnapshotSource {
            registry: Arc::clone(&self.registry),
        }
    }

    /// Fires when the supervisor shuts down.
    pub fn tripwire(&self) -> Tripwire {
        self.tripwire.clone()
    }

    /// Stop every reader loop and wait until all channels are closed.
    pub async fn shutdown(self) {
        log::info!("Shutting down {} reader(s)", self.readers.len());
        self.trigger.cancel();
        for handle in self.readers {
            if let Err(err) = handle.task.await {
                log::error!("Reader for {} terminated abnormally: {}", handle.tag, err);
            }
        }
    }
}
