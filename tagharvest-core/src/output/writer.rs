use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use super::record::{RESULT_HEADER, ResultRecord, UNRESOLVED_HEADER, UnresolvedRecord};
use crate::error::{HarvestError, Result};
use crate::harvest::config::OutputConfig;

/// Durable append-only destination for one run's rows.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn append_records(&self, records: &[ResultRecord]) -> Result<()>;

    async fn append_unresolved(&self, records: &[UnresolvedRecord]) -> Result<()>;

    /// Path of the result file, when the sink writes one.
    fn location(&self) -> Option<PathBuf> {
        None
    }
}

/// Opens a fresh [`ResultSink`] for every run.
pub trait ResultSinkFactory: Send + Sync {
    fn open(&self, started_at: DateTime<Utc>) -> Arc<dyn ResultSink>;
}

/// Name of a file stamped with the run start, e.g.
/// `TagValues_2024_03_01_14_05_09.csv`.
pub fn stamped_file_name(prefix: &str, started_at: DateTime<Utc>) -> String {
    format!("{prefix}{}.csv", started_at.format("%Y_%m_%d_%H_%M_%S"))
}

#[derive(Default)]
struct HeaderState {
    results_ready: bool,
    unresolved_ready: bool,
}

/// CSV result and unresolved files in the configured folder.
///
/// Files are created on first append, header first. Appends are serialized
/// so rows from concurrent callers never interleave.
pub struct CsvResultFiles {
    result_path: PathBuf,
    unresolved_path: PathBuf,
    headers: tokio::sync::Mutex<HeaderState>,
}

impl fmt::Debug for CsvResultFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsvResultFiles")
            .field("result_path", &self.result_path)
            .field("unresolved_path", &self.unresolved_path)
            .finish()
    }
}

impl CsvResultFiles {
    pub fn new(config: &OutputConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            result_path: config
                .result_folder
                .join(stamped_file_name(&config.result_prefix, started_at)),
            unresolved_path: config
                .result_folder
                .join(stamped_file_name(&config.unresolved_prefix, started_at)),
            headers: tokio::sync::Mutex::new(HeaderState::default()),
        }
    }

    pub fn result_path(&self) -> &Path {
        &self.result_path
    }

    pub fn unresolved_path(&self) -> &Path {
        &self.unresolved_path
    }
}

async fn append_rows(
    path: &Path,
    header: &str,
    header_written: &mut bool,
    rows: impl Iterator<Item = String>,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|err| {
            HarvestError::Sink(format!("failed to create output dir {parent:?}: {err}"))
        })?;
    }

    let mut buffer = String::new();
    if !*header_written {
        let existing = tokio::fs::metadata(path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        if existing == 0 {
            buffer.push_str(header);
            buffer.push('\n');
        }
    }
    for row in rows {
        buffer.push_str(&row);
        buffer.push('\n');
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|err| HarvestError::Sink(format!("failed to open {path:?}: {err}")))?;
    file.write_all(buffer.as_bytes())
        .await
        .map_err(|err| HarvestError::Sink(format!("failed to append to {path:?}: {err}")))?;
    file.flush()
        .await
        .map_err(|err| HarvestError::Sink(format!("failed to flush {path:?}: {err}")))?;

    *header_written = true;
    Ok(())
}

#[async_trait]
impl ResultSink for CsvResultFiles {
    async fn append_records(&self, records: &[ResultRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut headers = self.headers.lock().await;
        append_rows(
            &self.result_path,
            RESULT_HEADER,
            &mut headers.results_ready,
            records.iter().map(ResultRecord::to_row),
        )
        .await?;
        tracing::debug!(
            target: "harvest::output",
            rows = records.len(),
            path = %self.result_path.display(),
            "appended result rows"
        );
        Ok(())
    }

    async fn append_unresolved(&self, records: &[UnresolvedRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut headers = self.headers.lock().await;
        append_rows(
            &self.unresolved_path,
            UNRESOLVED_HEADER,
            &mut headers.unresolved_ready,
            records.iter().map(UnresolvedRecord::to_row),
        )
        .await?;
        tracing::debug!(
            target: "harvest::output",
            rows = records.len(),
            path = %self.unresolved_path.display(),
            "appended unresolved rows"
        );
        Ok(())
    }

    fn location(&self) -> Option<PathBuf> {
        Some(self.result_path.clone())
    }
}

/// Factory writing one pair of CSV files per run.
#[derive(Clone, Debug)]
pub struct CsvOutput {
    config: OutputConfig,
}

impl CsvOutput {
    pub fn new(config: OutputConfig) -> Self {
        Self { config }
    }
}

impl ResultSinkFactory for CsvOutput {
    fn open(&self, started_at: DateTime<Utc>) -> Arc<dyn ResultSink> {
        Arc::new(CsvResultFiles::new(&self.config, started_at))
    }
}

#[derive(Default)]
struct MemoryRows {
    records: Vec<ResultRecord>,
    unresolved: Vec<UnresolvedRecord>,
}

/// Keeps rows in memory. Clones share the same rows, so a test can hold
/// one clone while the processor writes through another.
#[derive(Clone, Default)]
pub struct MemoryResultSink {
    rows: Arc<parking_lot::Mutex<MemoryRows>>,
}

impl fmt::Debug for MemoryResultSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = self.rows.lock();
        f.debug_struct("MemoryResultSink")
            .field("records", &rows.records.len())
            .field("unresolved", &rows.unresolved.len())
            .finish()
    }
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ResultRecord> {
        self.rows.lock().records.clone()
    }

    pub fn unresolved(&self) -> Vec<UnresolvedRecord> {
        self.rows.lock().unresolved.clone()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn append_records(&self, records: &[ResultRecord]) -> Result<()> {
        self.rows.lock().records.extend_from_slice(records);
        Ok(())
    }

    async fn append_unresolved(&self, records: &[UnresolvedRecord]) -> Result<()> {
        self.rows.lock().unresolved.extend_from_slice(records);
        Ok(())
    }
}

impl ResultSinkFactory for MemoryResultSink {
    fn open(&self, _started_at: DateTime<Utc>) -> Arc<dyn ResultSink> {
        Arc::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;
    use crate::types::{DataValue, StatusCode};

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 14, 5, 9).single().expect("valid date")
    }

    fn output_in(dir: &TempDir) -> OutputConfig {
        OutputConfig {
            result_folder: dir.path().join("nested").join("results"),
            ..OutputConfig::default()
        }
    }

    #[test]
    fn file_names_carry_the_run_start() {
        assert_eq!(
            stamped_file_name("TagValues_", started()),
            "TagValues_2024_03_01_14_05_09.csv"
        );
    }

    #[tokio::test]
    async fn header_is_written_once_and_rows_append() {
        let dir = TempDir::new().expect("tempdir");
        let files = CsvResultFiles::new(&output_in(&dir), started());

        let record = |tag: &str, value: DataValue| ResultRecord {
            tag: tag.into(),
            value,
            status: StatusCode::GOOD,
            timestamp: started(),
        };
        files
            .append_records(&[record("A", DataValue::Float(1.5))])
            .await
            .expect("first append");
        files
            .append_records(&[record("B", DataValue::from("x,y"))])
            .await
            .expect("second append");

        let contents = tokio::fs::read_to_string(files.result_path())
            .await
            .expect("read result file");
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], RESULT_HEADER);
        assert!(lines[1].starts_with("A,1.5,Good,2024-03-01T14:05:09"));
        assert!(lines[2].starts_with("B,\"x,y\",Good,"));
    }

    #[tokio::test]
    async fn nothing_is_created_until_a_row_arrives() {
        let dir = TempDir::new().expect("tempdir");
        let files = CsvResultFiles::new(&output_in(&dir), started());
        files.append_records(&[]).await.expect("empty append");
        assert!(!files.result_path().exists());
        assert!(!files.unresolved_path().exists());
    }

    #[tokio::test]
    async fn unresolved_rows_go_to_their_own_file() {
        let dir = TempDir::new().expect("tempdir");
        let files = CsvResultFiles::new(&output_in(&dir), started());
        files
            .append_unresolved(&[UnresolvedRecord::new("ghost".into(), "BadNodeIdUnknown")])
            .await
            .expect("append unresolved");

        let contents = tokio::fs::read_to_string(files.unresolved_path())
            .await
            .expect("read unresolved file");
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some(UNRESOLVED_HEADER));
        assert!(
            lines
                .next()
                .is_some_and(|line| line.starts_with("ghost,BadNodeIdUnknown,"))
        );
        assert!(!files.result_path().exists());
    }
}
