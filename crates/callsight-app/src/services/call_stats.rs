use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Value, json};

use crate::services::feed::FeedError;

// Enriched call-report projections.
//
// A separate, wider CSV carries per-call metadata plus the serialized
// analysis document produced offline. Rows with an unparseable analysis
// column are kept, with the raw text preserved under an error marker, so a
// few bad rows never hide the rest of the dataset.

const ANALYSIS_COLUMN: &str = "call_analysis_json";

/// One enriched call report row.
#[derive(Debug, Clone, Serialize)]
pub struct CallReport {
    pub call_id: String,
    pub store_name: String,
    pub locality: String,
    pub city: String,
    pub state: String,
    pub region: String,
    pub recording_url: String,
    pub duration_seconds: String,
    pub call_date: String,
    pub month: String,
    pub is_converted: bool,
    pub analysis: Value,
}

/// Aggregate statistics over the whole report set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallStats {
    pub total_calls: usize,
    pub converted_calls: usize,
    pub conversion_rate: f64,
    pub regions: BTreeMap<String, usize>,
}

pub struct CallReportSet {
    path: PathBuf,
}

impl CallReportSet {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every report. A missing file is an empty dataset, logged once
    /// per load rather than failing the request.
    pub fn all(&self) -> Result<Vec<CallReport>, FeedError> {
        let mut reader = match csv::ReaderBuilder::new().flexible(true).from_path(&self.path) {
            Ok(reader) => reader,
            Err(error) => {
                if let csv::ErrorKind::Io(io) = error.kind()
                    && io.kind() == std::io::ErrorKind::NotFound
                {
                    tracing::warn!(
                        event = "call_reports.missing_dataset",
                        path = %self.path.display(),
                    );
                    return Ok(Vec::new());
                }
                return Err(csv_error(&self.path, error));
            }
        };

        let headers = reader
            .headers()
            .map_err(|source| csv_error(&self.path, source))?
            .clone();

        let mut reports = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|source| csv_error(&self.path, source))?;
            reports.push(parse_row(&headers, &row));
        }
        Ok(reports)
    }

    pub fn by_id(&self, call_id: &str) -> Result<Option<CallReport>, FeedError> {
        Ok(self.all()?.into_iter().find(|report| report.call_id == call_id))
    }

    pub fn stats(&self) -> Result<CallStats, FeedError> {
        let reports = self.all()?;
        Ok(compute_stats(&reports))
    }
}

fn csv_error(path: &Path, source: csv::Error) -> FeedError {
    if let csv::ErrorKind::Io(_) = source.kind() {
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

fn parse_row(headers: &csv::StringRecord, row: &csv::StringRecord) -> CallReport {
    let field = |name: &str| {
        headers
            .iter()
            .position(|header| header.trim() == name)
            .and_then(|position| row.get(position))
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    };

    let raw_analysis = field(ANALYSIS_COLUMN);
    let analysis = match serde_json::from_str::<Value>(&raw_analysis) {
        Ok(value @ Value::Object(_)) => value,
        // A bare JSON string or invalid JSON alike: preserve, do not drop.
        Ok(Value::String(text)) => json!({ "error": text }),
        _ => json!({ "error": raw_analysis }),
    };

    CallReport {
        call_id: field("CleanNumber"),
        store_name: field("Store Name"),
        locality: field("Locality"),
        city: field("City"),
        state: field("State"),
        region: field("Region"),
        recording_url: field("Recording URL"),
        duration_seconds: field("Duration"),
        call_date: field("Date"),
        month: field("Month"),
        is_converted: parse_converted(&field("is_converted")),
        analysis,
    }
}

fn parse_converted(value: &str) -> bool {
    match value {
        "" | "0" => false,
        "1" => true,
        other => other.eq_ignore_ascii_case("true") || other.parse::<f64>().is_ok_and(|n| n != 0.0),
    }
}

fn compute_stats(reports: &[CallReport]) -> CallStats {
    let total_calls = reports.len();
    let converted_calls = reports.iter().filter(|r| r.is_converted).count();
    let conversion_rate = if total_calls > 0 {
        (converted_calls as f64 / total_calls as f64 * 1000.0).round() / 10.0
    } else {
        0.0
    };

    let mut regions = BTreeMap::new();
    for report in reports {
        let region = if report.region.is_empty() {
            "Unknown".to_string()
        } else {
            report.region.clone()
        };
        *regions.entry(region).or_insert(0) += 1;
    }

    CallStats {
        total_calls,
        converted_calls,
        conversion_rate,
        regions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn dataset(contents: &str) -> (NamedTempFile, CallReportSet) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        let set = CallReportSet::new(file.path());
        (file, set)
    }

    const SAMPLE: &str = "\
CleanNumber,Store Name,Locality,City,State,Region,Recording URL,Duration,Date,Month,is_converted,call_analysis_json
9001,Indiranagar,Indiranagar,Bengaluru,Karnataka,South,https://example.com/a.mp4,312,2025-10-21,October,1,\"{\"\"Scoring\"\": {\"\"Overall\"\": {\"\"score\"\": 7}}}\"
9002,Andheri,Andheri West,Mumbai,Maharashtra,West,https://example.com/b.mp4,198,2025-10-22,October,0,not valid json
9003,Salt Lake,Sector V,Kolkata,West Bengal,East,https://example.com/c.mp4,240,2025-10-23,October,1,\"{\"\"Scoring\"\": {\"\"Overall\"\": {\"\"score\"\": 4}}}\"
";

    #[test]
    fn rows_parse_with_analysis_documents() {
        let (_file, set) = dataset(SAMPLE);
        let reports = set.all().unwrap();

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].call_id, "9001");
        assert_eq!(reports[0].region, "South");
        assert!(reports[0].is_converted);
        assert_eq!(reports[0].analysis["Scoring"]["Overall"]["score"], 7);
    }

    #[test]
    fn unparseable_analysis_is_preserved_not_dropped() {
        let (_file, set) = dataset(SAMPLE);
        let reports = set.all().unwrap();

        assert_eq!(reports[1].analysis["error"], "not valid json");
        assert!(!reports[1].is_converted);
    }

    #[test]
    fn by_id_finds_exact_match() {
        let (_file, set) = dataset(SAMPLE);

        assert_eq!(set.by_id("9002").unwrap().unwrap().city, "Mumbai");
        assert!(set.by_id("9999").unwrap().is_none());
    }

    #[test]
    fn stats_aggregate_with_one_decimal_rate() {
        let (_file, set) = dataset(SAMPLE);
        let stats = set.stats().unwrap();

        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.converted_calls, 2);
        assert_eq!(stats.conversion_rate, 66.7);
        assert_eq!(stats.regions.get("South"), Some(&1));
        assert_eq!(stats.regions.get("West"), Some(&1));
        assert_eq!(stats.regions.get("East"), Some(&1));
    }

    #[test]
    fn missing_dataset_is_empty_not_fatal() {
        let set = CallReportSet::new("/nonexistent/reports.csv");

        assert!(set.all().unwrap().is_empty());
        let stats = set.stats().unwrap();
        assert_eq!(stats.total_calls, 0);
        assert_eq!(stats.conversion_rate, 0.0);
    }

    #[test]
    fn empty_region_counts_as_unknown() {
        let (_file, set) = dataset(
            "CleanNumber,Store Name,Region,is_converted,call_analysis_json\n9001,X,,0,{}\n",
        );
        let stats = set.stats().unwrap();
        assert_eq!(stats.regions.get("Unknown"), Some(&1));
    }
}
