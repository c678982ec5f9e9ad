//! Print job collaborators: program loading and job record persistence

use super::program::GcodeProgram;
use async_trait::async_trait;
use parking_lot::Mutex;
use printlink_core::{JobError, PrintJobRecord};
use std::path::{Path, PathBuf};

/// Loads the program for a print
#[async_trait]
pub trait ProgramLoader: Send + Sync {
    /// Load the program at `path`
    async fn load(&self, path: &Path) -> Result<GcodeProgram, JobError>;
}

/// Reads G-code files from disk
#[derive(Debug, Clone, Copy, Default)]
pub struct FileProgramLoader;

#[async_trait]
impl ProgramLoader for FileProgramLoader {
    async fn load(&self, path: &Path) -> Result<GcodeProgram, JobError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| JobError::NoProgramLoaded {
                reason: format!("{}: {}", path.display(), e),
            })?;
        let program = GcodeProgram::parse(&text);
        if program.is_empty() {
            return Err(JobError::NoProgramLoaded {
                reason: format!("{} is empty", path.display()),
            });
        }
        Ok(program)
    }
}

/// Persists one record per print attempt
///
/// `commit` is an upsert keyed by the record id: it is called when the job
/// starts and again when it is closed.
pub trait JobStore: Send + Sync {
    /// Insert or replace `record`
    fn commit(&self, record: &PrintJobRecord) -> Result<(), JobError>;

    /// Every stored record, oldest first
    fn records(&self) -> Vec<PrintJobRecord>;
}

fn commit_failure(e: impl std::fmt::Display) -> JobError {
    JobError::JobRecordCommitFailure {
        reason: e.to_string(),
    }
}

fn upsert(records: &mut Vec<PrintJobRecord>, record: &PrintJobRecord) {
    match records.iter_mut().find(|r| r.id == record.id) {
        Some(existing) => *existing = record.clone(),
        None => records.push(record.clone()),
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: Mutex<Vec<PrintJobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn commit(&self, record: &PrintJobRecord) -> Result<(), JobError> {
        upsert(&mut self.records.lock(), record);
        Ok(())
    }

    fn records(&self) -> Vec<PrintJobRecord> {
        self.records.lock().clone()
    }
}

/// Keeps records in a JSON file, rewritten through a temporary file and a
/// rename so a crash never leaves it half written
#[derive(Debug)]
pub struct JsonJobStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Vec<PrintJobRecord>, JobError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(JobError::JobRecordCommitFailure {
                    reason: format!("Failed to read {}: {}", self.path.display(), e),
                })
            }
        };
        serde_json::from_str(&content).map_err(|e| JobError::JobRecordCommitFailure {
            reason: format!("Invalid job history {}: {}", self.path.display(), e),
        })
    }
}

impl JobStore for JsonJobStore {
    fn commit(&self, record: &PrintJobRecord) -> Result<(), JobError> {
        let _guard = self.lock.lock();
        let mut records = self.read()?;
        upsert(&mut records, record);

        let content = serde_json::to_string_pretty(&records).map_err(commit_failure)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(commit_failure)?;
        }
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, content).map_err(commit_failure)?;
        std::fs::rename(&staging, &self.path).map_err(commit_failure)?;
        Ok(())
    }

    fn records(&self) -> Vec<PrintJobRecord> {
        let _guard = self.lock.lock();
        match self.read() {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("{}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_file_loader() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "G28\nG1 X10 F600\nM105").expect("write");

        let program = FileProgramLoader.load(file.path()).await.expect("load");
        assert_eq!(program.len(), 3);
        assert_eq!(program.text(1), Some("G1 X10 F600"));
    }

    #[tokio::test]
    async fn test_file_loader_failures() {
        let missing = FileProgramLoader
            .load(Path::new("/definitely/not/here.gcode"))
            .await;
        assert!(matches!(missing, Err(JobError::NoProgramLoaded { .. })));

        let empty = tempfile::NamedTempFile::new().expect("temp file");
        let result = FileProgramLoader.load(empty.path()).await;
        assert!(matches!(result, Err(JobError::NoProgramLoaded { .. })));
    }

    #[test]
    fn test_memory_store_upserts() {
        let store = MemoryJobStore::new();
        let mut record = PrintJobRecord::start("cube", None);
        store.commit(&record).expect("commit");
        record.finish(true);
        store.commit(&record).expect("commit");

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].print_complete);
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = JsonJobStore::new(dir.path().join("history").join("jobs.json"));

        let mut first = PrintJobRecord::start("first", None);
        store.commit(&first).expect("commit");
        first.finish(false);
        store.commit(&first).expect("commit");
        store
            .commit(&PrintJobRecord::start("second", None))
            .expect("commit");

        let reopened = JsonJobStore::new(store.path());
        let records = reopened.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "first");
        assert!(records[0].is_closed());
        assert!(!records[0].print_complete);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "not json").expect("write");

        let store = JsonJobStore::new(&path);
        let result = store.commit(&PrintJobRecord::start("cube", None));
        assert!(matches!(result, Err(JobError::JobRecordCommitFailure { .. })));
        assert!(store.records().is_empty());
    }
}
