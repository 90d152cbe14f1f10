//! Mutant execution orchestration: scheduling, retry, resumability.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::mutant::Mutant;
use crate::outcome::TestOutcome;
use crate::parser::{ParseError, parse_test_output};
use crate::pool::{Replica, ReplicaPool};
use crate::project::{BuildProject, ProjectError, TestRun};
use crate::sink::{ProgressLog, REASON_ALL_TREATED, ResultRow, ResultSink, SinkError};

/// Default sink file name inside the job output directory.
pub const MUTANTS_OUTPUT_CSV: &str = "mutants_test_results.csv";

const PROGRESS_FILE: &str = "p_log.out";

/// Job-level failures. Parser and project errors fail the mutant whose worker
/// raised them and, uncaught, abort the remaining batch.
#[derive(Debug, Error)]
pub enum JobError {
    /// Build-output parsing fault.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    /// Project compile/test/replication fault.
    #[error("project error: {0}")]
    Project(#[from] ProjectError),
    /// Result sink or progress log write failure.
    #[error("result sink error: {0}")]
    Sink(#[from] SinkError),
    /// Filesystem failure while applying or restoring a mutant.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The mutant's byte span does not apply to the target file.
    #[error("mutant {id}: span {start}..{end} does not apply to {file}")]
    MutantSpan {
        /// Mutant id.
        id: u64,
        /// Span start offset.
        start: usize,
        /// Span end offset.
        end: usize,
        /// Target file in replica path space.
        file: String,
    },
    /// A worker thread panicked; the batch was aborted.
    #[error("worker thread panicked")]
    WorkerPanic,
}

/// Knobs for one execution job.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Upper bound on parallel workers (and replicas). Zero means serial.
    pub max_workers: usize,
    /// Global target tests, `pkg.Cls#method` comma list.
    pub tests: Option<String>,
    /// Per-file target tests, keyed by path relative to the base working
    /// directory. Overrides `tests` for mutants of that file.
    pub file_tests: BTreeMap<String, String>,
    /// Remove the base project's working directory when the job ends.
    /// Replica copies are always removed.
    pub remove_project_on_exit: bool,
}

impl JobOptions {
    /// Set the worker bound.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the global target tests.
    pub fn with_tests(mut self, tests: impl Into<String>) -> Self {
        self.tests = Some(tests.into());
        self
    }

    /// Set target tests for one file.
    pub fn with_file_tests(mut self, file: impl Into<String>, tests: impl Into<String>) -> Self {
        self.file_tests.insert(file.into(), tests.into());
        self
    }

    /// Remove the base working directory on exit.
    pub fn with_remove_project_on_exit(mut self, remove: bool) -> Self {
        self.remove_project_on_exit = remove;
        self
    }
}

/// Tallies for one `process_mutants` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobSummary {
    /// Mutants requested.
    pub requested: usize,
    /// Mutants skipped because the sink already recorded their id.
    pub skipped: usize,
    /// Mutants executed and recorded in this call.
    pub processed: usize,
    /// Mutants that failed to compile.
    pub compile_failed: usize,
    /// Compiled mutants whose suite passed (survivors).
    pub passed: usize,
    /// Compiled mutants that broke at least one test.
    pub failed: usize,
    /// Compiled mutants whose test run timed out.
    pub timed_out: usize,
}

impl JobSummary {
    fn count(&mut self, outcome: &MutantOutcome) {
        self.processed += 1;
        match outcome {
            MutantOutcome::CompileFailed => self.compile_failed += 1,
            MutantOutcome::Tested(TestOutcome::Passed) => self.passed += 1,
            MutantOutcome::Tested(TestOutcome::Failed(_)) => self.failed += 1,
            MutantOutcome::Tested(TestOutcome::TimedOut) => self.timed_out += 1,
        }
    }

    fn merge(&mut self, other: &JobSummary) {
        self.processed += other.processed;
        self.compile_failed += other.compile_failed;
        self.passed += other.passed;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
    }
}

enum MutantOutcome {
    CompileFailed,
    Tested(TestOutcome),
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Drives a set of mutants through compile/test across a replica pool and
/// records one result row per mutant.
pub struct ExecutionJob {
    pool: ReplicaPool,
    base_dir: PathBuf,
    sink: ResultSink,
    progress: ProgressLog,
    options: JobOptions,
}

impl ExecutionJob {
    /// Build a job around a base project, persisting results and progress
    /// under `output_dir`.
    pub fn new(
        base: Box<dyn BuildProject>,
        output_dir: &Path,
        options: JobOptions,
    ) -> Result<Self, JobError> {
        fs::create_dir_all(output_dir)?;
        let sink_path = output_dir.join(MUTANTS_OUTPUT_CSV);
        let sink = ResultSink::open(&sink_path)?;
        let progress = ProgressLog::new(
            output_dir.join(PROGRESS_FILE),
            sink_path.to_string_lossy().into_owned(),
        );
        let base_dir = base.working_dir().to_path_buf();
        Ok(Self {
            pool: ReplicaPool::new(base),
            base_dir,
            sink,
            progress,
            options,
        })
    }

    /// The job's result sink.
    pub fn sink(&self) -> &ResultSink {
        &self.sink
    }

    /// Whether a prior run of this job already treated every mutant,
    /// according to the progress log alone.
    pub fn has_executed(&self) -> bool {
        self.progress.has_completed()
    }

    fn target_tests_for(&self, mutant: &Mutant) -> Option<String> {
        let relative = mutant
            .file_path
            .strip_prefix(&self.base_dir)
            .unwrap_or(&mutant.file_path)
            .to_string_lossy()
            .into_owned();
        self.options
            .file_tests
            .get(&relative)
            .cloned()
            .or_else(|| self.options.tests.clone())
    }

    fn compile_and_test(
        &self,
        replica: &mut Replica,
        mutant: &Mutant,
    ) -> Result<MutantOutcome, JobError> {
        if !replica.project.compile()? {
            debug!(mutant = mutant.id, "mutant does not compile");
            return Ok(MutantOutcome::CompileFailed);
        }

        let target = self.target_tests_for(mutant);
        let run = match replica
            .project
            .test(target.as_deref(), replica.relevant_tests_only)
        {
            Ok(run) => run,
            Err(ProjectError::TestInfra(reason)) if replica.relevant_tests_only => {
                warn!(
                    mutant = mutant.id,
                    %reason,
                    "transient test-infrastructure failure; retrying with the full suite"
                );
                replica.degrade_to_full_suite();
                replica.project.test(target.as_deref(), false)?
            }
            Err(err) => return Err(err.into()),
        };

        let outcome = match run {
            TestRun::TimedOut => TestOutcome::TimedOut,
            TestRun::Completed { raw_output } => {
                let broken = parse_test_output(&raw_output)?;
                if broken.is_empty() {
                    TestOutcome::Passed
                } else {
                    TestOutcome::Failed(broken)
                }
            }
        };
        Ok(MutantOutcome::Tested(outcome))
    }

    /// Apply the mutant inside the replica's tree, compile and test, and put
    /// the original file content back on every exit path.
    fn run_on_replica(
        &self,
        replica: &mut Replica,
        mutant: &Mutant,
    ) -> Result<MutantOutcome, JobError> {
        let path = replica
            .project
            .translate_path(&self.base_dir, &mutant.file_path);
        let original = fs::read_to_string(&path)?;
        let Some(mutated) = mutant.apply_to(&original) else {
            return Err(JobError::MutantSpan {
                id: mutant.id,
                start: mutant.start,
                end: mutant.end,
                file: path.display().to_string(),
            });
        };
        fs::write(&path, mutated)?;

        let outcome = self.compile_and_test(replica, mutant);
        let restored = fs::write(&path, original);

        let outcome = outcome?;
        restored?;
        Ok(outcome)
    }

    fn process_one(&self, mutant: &Mutant) -> Result<MutantOutcome, JobError> {
        let mut replica = self.pool.acquire_any_spin();
        debug!(
            mutant = mutant.id,
            repo = %replica.project.working_dir().display(),
            "mutant assigned to replica"
        );
        let outcome = self.run_on_replica(&mut replica, mutant);
        // Replica goes back to the pool before the sink write.
        drop(replica);
        let outcome = outcome?;

        let row = match &outcome {
            MutantOutcome::CompileFailed => ResultRow::compile_failed(mutant.id),
            MutantOutcome::Tested(tested) => ResultRow::from_outcome(mutant.id, tested),
        };
        if let Err(err) = self.sink.append(&row) {
            error!(%err, ?mutant, ?row, "failed to write mutant result row");
            return Err(err.into());
        }
        info!(mutant = mutant.id, "recorded");
        Ok(outcome)
    }

    fn dispose_replicas(&mut self) {
        self.pool.dispose_all(!self.options.remove_project_on_exit);
    }

    /// Execute every mutant not already present in the sink, in parallel up
    /// to the worker bound. The first worker error aborts the remaining
    /// batch; rows already written stay valid and the job can be resumed.
    pub fn process_mutants(&mut self, mutants: Vec<Mutant>) -> Result<JobSummary, JobError> {
        let requested = mutants.len();
        let requested_ids: Vec<u64> = mutants.iter().map(|m| m.id).collect();

        let executed = self.sink.executed_ids()?;
        let pending: Vec<Mutant> = mutants
            .into_iter()
            .filter(|m| !executed.contains(&m.id))
            .collect();

        let mut summary = JobSummary {
            requested,
            skipped: requested - pending.len(),
            ..JobSummary::default()
        };

        if pending.is_empty() {
            info!("all requested mutants already treated");
            self.progress.record("exit", REASON_ALL_TREATED)?;
            self.dispose_replicas();
            return Ok(summary);
        }

        self.progress.record("info", "call")?;

        if pending.len() > self.options.max_workers {
            self.pool.grow_to(self.options.max_workers);
        }
        let workers = self.pool.len().min(pending.len()).max(1);
        info!(pending = pending.len(), workers, "processing mutants");

        let queue = Mutex::new(VecDeque::from(pending));
        let abort = AtomicBool::new(false);
        let failure: Mutex<Option<JobError>> = Mutex::new(None);

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(|| {
                        let mut tally = JobSummary::default();
                        loop {
                            if abort.load(Ordering::SeqCst) {
                                break;
                            }
                            let Some(mutant) = lock_or_recover(&queue).pop_front() else {
                                break;
                            };
                            match self.process_one(&mutant) {
                                Ok(outcome) => tally.count(&outcome),
                                Err(err) => {
                                    error!(
                                        %err,
                                        mutant = mutant.id,
                                        "mutant processing failed; aborting remaining batch"
                                    );
                                    abort.store(true, Ordering::SeqCst);
                                    lock_or_recover(&failure).get_or_insert(err);
                                    break;
                                }
                            }
                        }
                        tally
                    })
                })
                .collect();

            for handle in handles {
                match handle.join() {
                    Ok(tally) => summary.merge(&tally),
                    Err(_) => {
                        abort.store(true, Ordering::SeqCst);
                        lock_or_recover(&failure).get_or_insert(JobError::WorkerPanic);
                    }
                }
            }
        });

        let failure = match failure.into_inner() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(err) = failure {
            if let Err(log_err) = self.progress.record("failed", "mutants_exec") {
                warn!(%log_err, "could not record job failure in progress log");
            }
            self.dispose_replicas();
            return Err(err);
        }

        self.progress.record("exit", "done")?;
        let executed = self.sink.executed_ids()?;
        if requested_ids.iter().all(|id| executed.contains(id)) {
            self.progress.record("exit", REASON_ALL_TREATED)?;
        }
        self.dispose_replicas();
        Ok(summary)
    }
}
