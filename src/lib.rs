//! # mutant-runner
//!
//! `mutant-runner` executes pre-generated source mutants against a Maven
//! project: each mutant is patched into a working copy, compiled, and run
//! through the test suite, and the set of tests it breaks is recorded in an
//! append-only CSV. The moving parts:
//! - `mutant`: mutant descriptors and byte-span patching
//! - `parser`: Maven/JUnit/Surefire build-output reconciliation
//! - `project` / `maven`: the buildable-project capability set and its
//!   Maven-backed implementation
//! - `pool`: a bounded pool of mutually exclusive project replicas
//! - `sink`: the result CSV and the job progress log
//! - `runner`: the parallel execution job tying it all together
//!
//! Jobs are resumable: mutant ids already present in the sink are skipped on
//! the next run, and a progress-log marker records full completion.

#![warn(missing_docs)]

pub mod maven;
pub mod mutant;
pub mod outcome;
pub mod parser;
pub mod pool;
pub mod project;
pub mod runner;
pub mod sink;

pub use maven::{MavenConfig, MavenProject};
pub use mutant::Mutant;
pub use outcome::{FailCategory, FailingTest, TestOutcome, TestSummary};
pub use parser::{ParseError, parse_test_output};
pub use project::{BuildProject, ProjectError, TestRun};
pub use runner::{ExecutionJob, JobError, JobOptions, JobSummary};
pub use sink::{ProgressLog, ResultRow, ResultSink};
