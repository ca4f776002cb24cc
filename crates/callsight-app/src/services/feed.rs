use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::services::store::RecordKey;

// Source record feed.
//
// The feed is re-derived from the CSV on every call; nothing is cached
// between passes, so the CSV itself stays the single source of truth. Keys
// are positional (`video_{row}`) and therefore stable across repeated loads
// of the same file, which is what makes reconciliation deterministic.

const STORE_NAME_COLUMN: &str = "Store Name";
const RECORDING_URL_COLUMN: &str = "Recording URL";
const DURATION_COLUMN: &str = "Duration";
const CONVERTED_COLUMN: &str = "is_converted";
const DATE_COLUMN: &str = "Date";

/// One call record read from the feed. Immutable once read for a given pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub key: RecordKey,
    pub store_name: String,
    pub recording_url: String,
    pub duration: Option<String>,
    pub is_converted: bool,
    pub call_date: Option<String>,
}

impl SourceRecord {
    /// Whether the record carries the locator required for analysis.
    pub fn has_locator(&self) -> bool {
        !self.recording_url.trim().is_empty()
    }
}

/// Errors emitted while loading the feed.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to read feed {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse feed {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Ordered, finite, restartable sequence of source records. The engine never
/// mutates the feed.
pub trait CallFeed: Send + Sync {
    fn records(&self) -> Result<Vec<SourceRecord>, FeedError>;

    fn find(&self, key: &str) -> Result<Option<SourceRecord>, FeedError> {
        Ok(self.records()?.into_iter().find(|record| record.key == key))
    }
}

/// CSV-backed feed. Column lookups are by header name; optional columns that
/// are absent simply default, mirroring how the upstream dataset is consumed.
#[derive(Debug, Clone)]
pub struct CsvCallFeed {
    path: PathBuf,
}

impl CsvCallFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        debug_assert!(!path.as_os_str().is_empty());
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CallFeed for CsvCallFeed {
    fn records(&self) -> Result<Vec<SourceRecord>, FeedError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .map_err(|source| csv_error(&self.path, source))?;

        let headers = reader
            .headers()
            .map_err(|source| csv_error(&self.path, source))?
            .clone();
        let columns = ColumnIndex::from_headers(&headers);

        let mut records = Vec::new();
        for (idx, row) in reader.records().enumerate() {
            let row = row.map_err(|source| csv_error(&self.path, source))?;
            records.push(columns.record(idx, &row));
        }

        debug_assert!(records.iter().enumerate().all(|(idx, r)| r.key == format!("video_{idx}")));
        Ok(records)
    }
}

fn csv_error(path: &Path, source: csv::Error) -> FeedError {
    if let csv::ErrorKind::Io(_) = source.kind() {
        // Unwrap the IO error so missing files surface as such.
        if let csv::ErrorKind::Io(io) = source.into_kind() {
            return FeedError::Io {
                path: path.to_path_buf(),
                source: io,
            };
        }
        unreachable!("kind checked above");
    }
    FeedError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy)]
struct ColumnIndex {
    store_name: Option<usize>,
    recording_url: Option<usize>,
    duration: Option<usize>,
    is_converted: Option<usize>,
    call_date: Option<usize>,
}

impl ColumnIndex {
    fn from_headers(headers: &csv::StringRecord) -> Self {
        let position = |name: &str| headers.iter().position(|header| header.trim() == name);
        Self {
            store_name: position(STORE_NAME_COLUMN),
            recording_url: position(RECORDING_URL_COLUMN),
            duration: position(DURATION_COLUMN),
            is_converted: position(CONVERTED_COLUMN),
            call_date: position(DATE_COLUMN),
        }
    }

    fn record(&self, idx: usize, row: &csv::StringRecord) -> SourceRecord {
        let field = |column: Option<usize>| {
            column
                .and_then(|position| row.get(position))
                .map(str::trim)
                .unwrap_or_default()
        };

        let store_name = {
            let raw = field(self.store_name);
            if raw.is_empty() {
                format!("Store {idx}")
            } else {
                raw.to_string()
            }
        };

        SourceRecord {
            key: format!("video_{idx}"),
            store_name,
            recording_url: field(self.recording_url).to_string(),
            duration: non_empty(field(self.duration)),
            is_converted: parse_flag(field(self.is_converted)),
            call_date: non_empty(field(self.call_date)),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_flag(value: &str) -> bool {
    match value {
        "" | "0" => false,
        "1" => true,
        other => other.eq_ignore_ascii_case("true") || other.parse::<f64>().is_ok_and(|n| n != 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn feed_from(contents: &str) -> (NamedTempFile, CsvCallFeed) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        let feed = CsvCallFeed::new(file.path());
        (file, feed)
    }

    const SAMPLE: &str = "\
Store Name,Recording URL,Duration,is_converted,Date
Indiranagar,https://example.com/a.mp4,312,1,2025-10-21
Koramangala,,198,0,2025-10-22
HSR Layout,https://example.com/c.mp4,,true,
";

    #[test]
    fn keys_are_positional_and_stable() {
        let (_file, feed) = feed_from(SAMPLE);

        let first = feed.records().unwrap();
        let second = feed.records().unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(first[0].key, "video_0");
        assert_eq!(first[2].key, "video_2");
        assert_eq!(first, second, "repeated loads must derive identical records");
    }

    #[test]
    fn fields_parse_with_defaults() {
        let (_file, feed) = feed_from(SAMPLE);
        let records = feed.records().unwrap();

        assert_eq!(records[0].store_name, "Indiranagar");
        assert!(records[0].is_converted);
        assert_eq!(records[0].duration.as_deref(), Some("312"));

        assert!(!records[1].has_locator());
        assert!(!records[1].is_converted);

        assert!(records[2].is_converted, "`true` counts as converted");
        assert_eq!(records[2].duration, None);
        assert_eq!(records[2].call_date, None);
    }

    #[test]
    fn missing_columns_are_tolerated() {
        let (_file, feed) = feed_from("Recording URL\nhttps://example.com/a.mp4\n");
        let records = feed.records().unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].store_name, "Store 0");
        assert!(records[0].has_locator());
    }

    #[test]
    fn find_locates_by_key() {
        let (_file, feed) = feed_from(SAMPLE);

        let found = feed.find("video_1").unwrap().expect("known key");
        assert_eq!(found.store_name, "Koramangala");
        assert!(feed.find("video_9").unwrap().is_none());
    }

    #[test]
    fn missing_file_surfaces_io_error() {
        let feed = CsvCallFeed::new("/nonexistent/calls.csv");
        let error = feed.records().expect_err("missing file must error");
        assert!(matches!(error, FeedError::Io { .. }));
    }
}
