//! Append-only result sink and job progress log.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::warn;

use crate::outcome::{FailingTest, TESTS_TIMEOUT_RESULT, TestOutcome};

/// Progress reason marking a job whose sink covers every requested mutant.
pub const REASON_ALL_TREATED: &str = "has_treated_all_mutants";

const SINK_HEADER: &str = "id,compilable,broken_tests,broken_tests_reason";

/// Sink/progress I/O failures. Fatal: the orchestrator dumps full state
/// before propagating one.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Underlying filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One recorded mutant execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRow {
    /// Mutant id.
    pub id: u64,
    /// Whether the mutant compiled.
    pub compilable: bool,
    /// JSON list of broken `Class.method` names, the timeout sentinel, or
    /// empty when the mutant never ran tests.
    pub broken_tests: Option<String>,
    /// JSON dump of the full failing-test records.
    pub broken_tests_reason: Option<String>,
}

impl ResultRow {
    /// Row for a mutant that did not compile.
    pub fn compile_failed(id: u64) -> Self {
        Self {
            id,
            compilable: false,
            broken_tests: None,
            broken_tests_reason: None,
        }
    }

    /// Row for a compiled mutant's test outcome.
    pub fn from_outcome(id: u64, outcome: &TestOutcome) -> Self {
        let (broken_tests, broken_tests_reason) = match outcome {
            TestOutcome::Passed => (Some("[]".to_string()), Some("[]".to_string())),
            TestOutcome::TimedOut => (Some(TESTS_TIMEOUT_RESULT.to_string()), None),
            TestOutcome::Failed(tests) => {
                let names: Vec<String> = tests.iter().map(FailingTest::qualified_name).collect();
                let records: Vec<&FailingTest> = tests.iter().collect();
                (
                    Some(serde_json::to_string(&names).expect("test names should serialize")),
                    Some(serde_json::to_string(&records).expect("test records should serialize")),
                )
            }
        };
        Self {
            id,
            compilable: true,
            broken_tests,
            broken_tests_reason,
        }
    }

    fn to_csv_line(&self) -> String {
        [
            self.id.to_string(),
            self.compilable.to_string(),
            self.broken_tests.clone().unwrap_or_default(),
            self.broken_tests_reason.clone().unwrap_or_default(),
        ]
        .iter()
        .map(|field| csv_escape(field))
        .collect::<Vec<_>>()
        .join(",")
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_first_field(line: &str) -> &str {
    // Ids are written unquoted; everything up to the first comma.
    line.split(',').next().unwrap_or(line)
}

/// Append-only CSV of per-mutant results. The single internal lock serializes
/// writes from all workers and is distinct from every replica lock.
pub struct ResultSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl ResultSink {
    /// Open the sink, writing the header when the file is new.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let is_new = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if is_new {
            writeln!(file, "{SINK_HEADER}")?;
            file.flush()?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Sink file path; also the job's progress-log key.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize one row under the sink lock.
    pub fn append(&self, row: &ResultRow) -> Result<(), SinkError> {
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        writeln!(file, "{}", row.to_csv_line())?;
        file.flush()?;
        Ok(())
    }

    /// Ids already recorded, re-read from disk. This is the resumability
    /// source of truth, independent of any in-memory state.
    pub fn executed_ids(&self) -> Result<BTreeSet<u64>, SinkError> {
        let text = std::fs::read_to_string(&self.path)?;
        let mut ids = BTreeSet::new();
        for line in text.lines().skip(1) {
            match csv_first_field(line).parse() {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(_) => warn!(line, "skipping malformed result row"),
            }
        }
        Ok(ids)
    }
}

/// Append-only `key,status,reason` log used to detect prior full completion
/// of a job across restarts.
pub struct ProgressLog {
    path: PathBuf,
    key: String,
}

impl ProgressLog {
    /// Create a progress log keyed by `key` (conventionally the sink path).
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
        }
    }

    /// Append one `key,status,reason` line.
    pub fn record(&self, status: &str, reason: &str) -> Result<(), SinkError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{},{status},{reason}", self.key)?;
        file.flush()?;
        Ok(())
    }

    /// Whether a prior job run recorded full completion under this key.
    pub fn has_completed(&self) -> bool {
        let done = format!("{},exit,{REASON_ALL_TREATED}", self.key);
        std::fs::read_to_string(&self.path)
            .map(|text| text.lines().any(|line| line == done))
            .unwrap_or(false)
    }
}
