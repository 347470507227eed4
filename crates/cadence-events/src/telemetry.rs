//! Append-only telemetry stream.
//!
//! The core writes one [`TelemetryRecord`] per published event and per
//! reported fault. Where the records go is decided by a [`TelemetrySink`];
//! the stream itself never aggregates anything.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use cadence_types::{Event, Fault, TelemetryRecord};
use tracing::warn;

use crate::error::TelemetryError;

/// Destination of telemetry records.
pub trait TelemetrySink: fmt::Debug + Send + Sync {
    /// Append one record.
    fn append(&self, record: &TelemetryRecord) -> Result<(), TelemetryError>;

    /// Flush buffered records, if the sink buffers.
    fn flush(&self) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn append(&self, _record: &TelemetryRecord) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl MemoryTelemetry {
    /// Create an empty in-memory sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record so far.
    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.lock().clone()
    }

    /// Records of events with the given name.
    pub fn events_named(&self, name: &str) -> Vec<TelemetryRecord> {
        self.lock()
            .iter()
            .filter(|record| !record.is_error() && record.event_name == name)
            .cloned()
            .collect()
    }

    /// Records tagged as errors.
    pub fn errors(&self) -> Vec<TelemetryRecord> {
        self.lock()
            .iter()
            .filter(|record| record.is_error())
            .cloned()
            .collect()
    }

    /// Number of records so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TelemetryRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn append(&self, record: &TelemetryRecord) -> Result<(), TelemetryError> {
        self.lock().push(record.clone());
        Ok(())
    }
}

/// Writes one JSON object per line to a file, appending.
#[derive(Debug)]
pub struct JsonLinesTelemetry {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesTelemetry {
    /// Open (or create) `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TelemetryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// The file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for JsonLinesTelemetry {
    fn append(&self, record: &TelemetryRecord) -> Result<(), TelemetryError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<(), TelemetryError> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        Ok(())
    }
}

/// Cloneable handle that numbers records and forwards them to a sink.
///
/// Sink failures are logged and swallowed: losing a telemetry line must
/// never stop the simulation.
#[derive(Debug, Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
    seq: Arc<AtomicU64>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::null()
    }
}

impl Telemetry {
    /// Forward records to `sink`.
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            sink,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A handle that discards everything.
    pub fn null() -> Self {
        Self::new(Arc::new(NullTelemetry))
    }

    /// Record a published event.
    pub fn event(&self, tick: u64, event: &Event) {
        let record = TelemetryRecord::event(self.next_seq(), tick, event);
        self.append(&record);
    }

    /// Record a reported fault.
    pub fn fault(&self, fault: &Fault) {
        let record = TelemetryRecord::fault(self.next_seq(), fault);
        self.append(&record);
    }

    /// Flush the underlying sink.
    pub fn flush(&self) -> Result<(), TelemetryError> {
        self.sink.flush()
    }

    /// Number of records emitted through this handle and its clones.
    pub fn emitted(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn append(&self, record: &TelemetryRecord) {
        if let Err(e) = self.sink.append(record) {
            warn!(error = %e, event = %record.event_name, "Failed to append telemetry record");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cadence_types::{EntityId, data_from};
    use serde_json::json;

    use super::*;

    #[test]
    fn memory_sink_separates_events_and_errors() {
        let sink = Arc::new(MemoryTelemetry::new());
        let telemetry = Telemetry::new(sink.clone());
        telemetry.event(3, &Event::new("tick_started", data_from(json!({}))));
        telemetry.fault(&Fault::UnitTimeout {
            unit: "oracle".to_owned(),
            tick: 3,
            timeout_ms: 50,
        });

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events_named("tick_started").len(), 1);
        let errors = sink.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.first().map(|r| r.event_name.as_str()), Some("unit_timeout"));
        assert_eq!(telemetry.emitted(), 2);
    }

    #[test]
    fn sequence_numbers_are_shared_between_clones() {
        let sink = Arc::new(MemoryTelemetry::new());
        let a = Telemetry::new(sink.clone());
        let b = a.clone();
        a.event(0, &Event::new("x", data_from(json!({}))));
        b.event(0, &Event::new("y", data_from(json!({}))));
        let seqs: Vec<u64> = sink.records().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn json_lines_sink_appends_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry").join("run.jsonl");
        let sink = Arc::new(JsonLinesTelemetry::open(&path).unwrap());
        let telemetry = Telemetry::new(sink);
        telemetry.event(
            1,
            &Event::new("action_resolved", data_from(json!({"entity_id": 4}))),
        );
        telemetry.event(2, &Event::new("tick_ended", data_from(json!({}))));
        telemetry.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: TelemetryRecord = serde_json::from_str(lines.first().unwrap()).unwrap();
        assert_eq!(first.entity_id, Some(EntityId::new(4)));
        assert_eq!(first.tick, 1);
    }
}
