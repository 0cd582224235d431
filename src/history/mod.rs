// src/history/mod.rs

use anyhow::{anyhow, Context, Result};
use arrow::array::{Array, ArrayRef, StringArray, TimestampMicrosecondArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use glob::glob;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::{
    collections::HashSet,
    fmt, fs,
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    Processed,
    Failed,
}

impl FileEvent {
    fn as_str(self) -> &'static str {
        match self {
            FileEvent::Processed => "processed",
            FileEvent::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "processed" => Ok(FileEvent::Processed),
            "failed" => Ok(FileEvent::Failed),
            other => Err(anyhow!("unknown ledger event `{}`", other)),
        }
    }
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one batch file.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    /// `<process type>/<file name>`, e.g. `address/Address_3.csv`.
    pub key: String,
    pub event: FileEvent,
    pub rows: u64,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(process_type: &str, file: &Path, event: FileEvent, rows: u64) -> Self {
        Self {
            key: Self::key_for(process_type, file),
            event,
            rows,
            recorded_at: Utc::now(),
        }
    }

    pub fn key_for(process_type: &str, file: &Path) -> String {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}/{}", process_type, name)
    }
}

/// Per-run ledger of batch files, one small Parquet file per event so that
/// concurrent workers never share a writer.
pub struct RunLedger {
    dir: PathBuf,
}

fn schema() -> Schema {
    Schema::new(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("event", DataType::Utf8, false),
        Field::new("rows", DataType::UInt64, false),
        Field::new(
            "recorded_at",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        ),
    ])
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, idx: usize, name: &str) -> Result<&'a T> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("ledger column `{}` has an unexpected type", name))
}

impl RunLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating ledger directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn record(&self, entry: &LedgerEntry) -> Result<()> {
        let ts = entry.recorded_at.timestamp_micros();
        let stem = entry.key.replace(['/', '\\'], "__");
        let path = self.dir.join(format!("{}_{}_{}.parquet", stem, entry.event, ts));

        let schema = Arc::new(schema());
        let arrays: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(vec![entry.key.clone()])),
            Arc::new(StringArray::from(vec![entry.event.as_str()])),
            Arc::new(UInt64Array::from(vec![entry.rows])),
            Arc::new(TimestampMicrosecondArray::from(vec![ts])),
        ];
        let batch = RecordBatch::try_new(schema.clone(), arrays).context("building ledger record batch")?;

        let file = File::create(&path).with_context(|| format!("creating ledger file {}", path.display()))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer =
            ArrowWriter::try_new(file, schema, Some(props)).context("creating Arrow writer for ledger")?;
        writer.write(&batch).context("writing ledger batch")?;
        writer.close().context("closing ledger writer")?;
        debug!(key = %entry.key, event = %entry.event, "ledger entry recorded");
        Ok(())
    }

    /// Every recorded entry, oldest first.
    pub fn load(&self) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        let pattern = format!("{}/*.parquet", self.dir.display());
        for path in glob(&pattern)? {
            let path = path?;
            let file = File::open(&path).with_context(|| format!("opening ledger file {}", path.display()))?;
            let mut reader = ParquetRecordBatchReaderBuilder::try_new(file)?
                .with_batch_size(1024)
                .build()?;
            while let Some(batch) = reader.next().transpose()? {
                let keys = column::<StringArray>(&batch, 0, "key")?;
                let events = column::<StringArray>(&batch, 1, "event")?;
                let rows = column::<UInt64Array>(&batch, 2, "rows")?;
                let times = column::<TimestampMicrosecondArray>(&batch, 3, "recorded_at")?;
                for i in 0..batch.num_rows() {
                    let recorded_at = DateTime::from_timestamp_micros(times.value(i))
                        .ok_or_else(|| anyhow!("ledger timestamp out of range in {}", path.display()))?;
                    entries.push(LedgerEntry {
                        key: keys.value(i).to_string(),
                        event: FileEvent::parse(events.value(i))?,
                        rows: rows.value(i),
                        recorded_at,
                    });
                }
            }
        }
        entries.sort_by_key(|e| e.recorded_at);
        Ok(entries)
    }

    /// Keys whose latest event is `Processed`.
    pub fn completed(&self) -> Result<HashSet<String>> {
        let mut done = HashSet::new();
        for entry in self.load()? {
            match entry.event {
                FileEvent::Processed => done.insert(entry.key),
                FileEvent::Failed => done.remove(&entry.key),
            };
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    #[test]
    fn entries_round_trip_and_latest_event_wins() -> Result<()> {
        let dir = tempdir()?;
        let ledger = RunLedger::new(dir.path().join("ledger"))?;
        let t0 = Utc::now();

        let mut a = LedgerEntry::new("address", Path::new("/x/Address_1.csv"), FileEvent::Failed, 0);
        a.recorded_at = t0;
        let mut a2 = LedgerEntry::new("address", Path::new("/x/Address_1.csv"), FileEvent::Processed, 12);
        a2.recorded_at = t0 + Duration::seconds(1);
        let mut b = LedgerEntry::new("latlong", Path::new("Latlong_1.csv"), FileEvent::Processed, 7);
        b.recorded_at = t0 + Duration::seconds(2);
        let mut b2 = LedgerEntry::new("latlong", Path::new("Latlong_1.csv"), FileEvent::Failed, 0);
        b2.recorded_at = t0 + Duration::seconds(3);
        for e in [&a, &a2, &b, &b2] {
            ledger.record(e)?;
        }

        let loaded = ledger.load()?;
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded[1].key, "address/Address_1.csv");
        assert_eq!(loaded[1].rows, 12);
        assert_eq!(loaded[1].event, FileEvent::Processed);

        let done = ledger.completed()?;
        assert!(done.contains("address/Address_1.csv"));
        assert!(!done.contains("latlong/Latlong_1.csv"));
        Ok(())
    }

    #[test]
    fn empty_ledger() -> Result<()> {
        let dir = tempdir()?;
        let ledger = RunLedger::new(dir.path())?;
        assert!(ledger.load()?.is_empty());
        assert!(ledger.completed()?.is_empty());
        Ok(())
    }
}
