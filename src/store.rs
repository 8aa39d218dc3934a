use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::path_record::{ObservationKey, RawPathRecord};
use crate::shared::StoreError;

enum Source {
    Lines(Box<dyn BufRead>),
    Array(std::vec::IntoIter<RawPathRecord>),
}

/// Sequential reader over a raw path-record store.
///
/// JSON-lines stores are read one record at a time. A legacy store holding a
/// single JSON array is loaded whole. Files ending in `.bz2` are decompressed
/// on the fly.
pub struct RecordStream {
    source: Source,
    path: PathBuf,
    line_no: usize,
    malformed: usize,
    truncated: bool,
    done: bool,
}

impl RecordStream {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
        let reader: Box<dyn Read> = if path.extension().map_or(false, |ext| ext == "bz2") {
            Box::new(BzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Self::from_reader(BufReader::new(reader), path)
    }

    pub fn from_reader<R: BufRead + 'static>(mut reader: R, path: &Path) -> Result<Self, StoreError> {
        let is_array = loop {
            let buf = reader.fill_buf().map_err(|e| StoreError::io(path, e))?;
            match buf.iter().position(|b| !b.is_ascii_whitespace()) {
                Some(i) => {
                    let first = buf[i];
                    reader.consume(i);
                    break first == b'[';
                }
                None if buf.is_empty() => break false,
                None => {
                    let len = buf.len();
                    reader.consume(len);
                }
            }
        };

        let source = if is_array {
            debug!(path = %path.display(), "reading legacy JSON array store");
            let records: Vec<RawPathRecord> =
                serde_json::from_reader(reader).map_err(|e| StoreError::json(path, e))?;
            Source::Array(records.into_iter())
        } else {
            Source::Lines(Box::new(reader))
        };

        Ok(RecordStream {
            source,
            path: path.to_path_buf(),
            line_no: 0,
            malformed: 0,
            truncated: false,
            done: false,
        })
    }

    /// Lines that could not be parsed and were skipped.
    pub fn malformed(&self) -> usize {
        self.malformed
    }

    /// Whether the stream ended in a partial record.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl Iterator for RecordStream {
    type Item = RawPathRecord;

    fn next(&mut self) -> Option<RawPathRecord> {
        if self.done {
            return None;
        }
        let reader = match &mut self.source {
            Source::Array(records) => return records.next(),
            Source::Lines(reader) => reader,
        };

        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "stopping record stream on read error");
                    self.done = true;
                    return None;
                }
            }
            self.line_no += 1;

            let complete = line.ends_with('\n');
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            match serde_json::from_str::<RawPathRecord>(text) {
                Ok(record) => return Some(record),
                Err(_) if !complete => {
                    warn!(path = %self.path.display(), line = self.line_no, "ignoring truncated final record");
                    self.truncated = true;
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.malformed += 1;
                    warn!(path = %self.path.display(), line = self.line_no, error = %e, "skipping malformed record");
                }
            }
        }
    }
}

/// Append-only JSON-lines writer for the raw store.
///
/// Records go to `<path>.partial` and the file is renamed into place by
/// [`RecordWriter::finish`], so an interrupted fetch never replaces a complete store.
pub struct RecordWriter {
    final_path: PathBuf,
    partial_path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl RecordWriter {
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let partial_path = partial_path(path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&partial_path)
            .map_err(|e| StoreError::io(&partial_path, e))?;
        Ok(RecordWriter {
            final_path: path.to_path_buf(),
            partial_path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn write_all(&mut self, records: &[RawPathRecord]) -> Result<(), StoreError> {
        for record in records {
            serde_json::to_writer(&mut self.writer, record)
                .map_err(|e| StoreError::json(&self.partial_path, e))?;
            self.writer
                .write_all(b"\n")
                .map_err(|e| StoreError::io(&self.partial_path, e))?;
            self.written += 1;
        }
        // Each wave lands on disk whole before the next one starts.
        self.writer
            .flush()
            .map_err(|e| StoreError::io(&self.partial_path, e))
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(mut self) -> Result<PathBuf, StoreError> {
        self.writer
            .flush()
            .map_err(|e| StoreError::io(&self.partial_path, e))?;
        fs::rename(&self.partial_path, &self.final_path)
            .map_err(|e| StoreError::io(&self.final_path, e))?;
        Ok(self.final_path)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub records_read: u64,
    pub records_written: u64,
    pub duplicates: u64,
    pub unkeyed: u64,
}

/// Collapses a raw store so each observation key appears once, annotated with
/// how many times it occurred. Records without a key are carried over untouched.
pub fn dedup_record_store(input: &Path, output: &Path) -> Result<DedupReport, StoreError> {
    let mut report = DedupReport::default();
    let mut order: Vec<ObservationKey> = Vec::new();
    let mut kept: HashMap<ObservationKey, RawPathRecord> = HashMap::new();
    let mut unkeyed: Vec<RawPathRecord> = Vec::new();

    for record in RecordStream::open(input)? {
        report.records_read += 1;
        let occurrences = record.count.unwrap_or(1);
        match record.key() {
            Some(key) => match kept.get_mut(&key) {
                Some(existing) => {
                    existing.count = Some(existing.count.unwrap_or(1) + occurrences);
                    report.duplicates += 1;
                }
                None => {
                    let mut first = record;
                    first.count = Some(occurrences);
                    order.push(key.clone());
                    kept.insert(key, first);
                }
            },
            None => {
                report.unkeyed += 1;
                unkeyed.push(record);
            }
        }
    }

    let mut writer = RecordWriter::create(output)?;
    let mut batch = Vec::with_capacity(1024);
    for key in order {
        if let Some(record) = kept.remove(&key) {
            batch.push(record);
        }
        if batch.len() == 1024 {
            writer.write_all(&batch)?;
            batch.clear();
        }
    }
    batch.extend(unkeyed);
    writer.write_all(&batch)?;
    report.records_written = writer.written();
    writer.finish()?;

    info!(
        read = report.records_read,
        written = report.records_written,
        duplicates = report.duplicates,
        "deduplicated raw store"
    );
    Ok(report)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| StoreError::json(path, e))
}

/// Writes pretty JSON to a sibling temp file and renames it over `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let tmp = partial_path(path);
    {
        let file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value).map_err(|e| StoreError::json(&tmp, e))?;
        writer.flush().map_err(|e| StoreError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}
