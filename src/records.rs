//! Transfer records and where they go.
//!
//! The router emits one [`TransferRecord`] per delivery leg. What happens to it is up to the
//! [`RecordSink`] the router was built with: drop it, keep it in memory, or stream it as JSON
//! lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use tracing::warn;

/// One completed delivery leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Station the liquid came from
    pub source: String,
    /// Station the liquid went to
    pub station: String,
    /// Volume moved, after step rounding
    pub volume: f64,
    /// Completion time
    pub timestamp: DateTime<Utc>,
}

impl TransferRecord {
    /// Record stamped with the current time.
    pub fn now(source: impl Into<String>, station: impl Into<String>, volume: f64) -> Self {
        Self {
            source: source.into(),
            station: station.into(),
            volume,
            timestamp: Utc::now(),
        }
    }
}

/// Consumer of transfer records.
pub trait RecordSink {
    /// Accept one record. Sinks must not fail the transfer that produced it.
    fn record(&mut self, record: TransferRecord);
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn record(&mut self, _record: TransferRecord) {}
}

impl RecordSink for Vec<TransferRecord> {
    fn record(&mut self, record: TransferRecord) {
        self.push(record);
    }
}

/// In-memory log that stays readable after the router takes ownership of a clone.
#[derive(Debug, Default, Clone)]
pub struct SharedRecords(Rc<RefCell<Vec<TransferRecord>>>);

impl SharedRecords {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record so far.
    pub fn snapshot(&self) -> Vec<TransferRecord> {
        self.0.borrow().clone()
    }

    /// Number of records so far.
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    /// No records yet.
    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Sum of recorded volumes.
    pub fn total_volume(&self) -> f64 {
        self.0.borrow().iter().map(|r| r.volume).sum()
    }
}

impl RecordSink for SharedRecords {
    fn record(&mut self, record: TransferRecord) {
        self.0.borrow_mut().push(record);
    }
}

/// Writes each record as one JSON line.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    /// Stream records to `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RecordSink for JsonLinesSink<W> {
    fn record(&mut self, record: TransferRecord) {
        let written = serde_json::to_writer(&mut self.writer, &record)
            .map_err(std::io::Error::from)
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush());
        if let Err(error) = written {
            warn!(%error, "Failed to write transfer record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_records_are_visible_through_clones() {
        let records = SharedRecords::new();
        let mut sink = records.clone();
        sink.record(TransferRecord::now("naoh", "cell", 2.0));
        sink.record(TransferRecord::now("air", "cell", 1.0));
        assert_eq!(records.len(), 2);
        assert!((records.total_volume() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn json_lines_sink_writes_one_object_per_line() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.record(TransferRecord::now("naoh", "cell", 2.5));
        sink.record(TransferRecord::now("cell", "waste", 7.5));
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: TransferRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.source, "naoh");
        assert_eq!(first.station, "cell");
        assert!((first.volume - 2.5).abs() < 1e-12);
    }
}
