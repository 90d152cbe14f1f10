//! The buildable-project capability set the orchestrator is polymorphic over.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Project-level failures.
#[derive(Debug, Error)]
pub enum ProjectError {
    /// Filesystem or subprocess I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The test infrastructure itself misbehaved (e.g. selective test
    /// execution unsupported). Transient: the orchestrator downgrades the
    /// replica and retries the full suite once.
    #[error("test infrastructure failure: {0}")]
    TestInfra(String),
    /// A working copy could not be materialized. Non-fatal at pool level;
    /// achievable parallelism degrades instead.
    #[error("replica creation failed: {0}")]
    ReplicaCreation(String),
}

/// Result of one bounded test invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestRun {
    /// The build tool ran to completion; the raw text goes to the parser.
    Completed {
        /// Combined stdout/stderr of the invocation.
        raw_output: String,
    },
    /// The invocation exceeded its time budget and was killed.
    TimedOut,
}

/// A working directory that can compile and test itself end-to-end.
///
/// Concrete variants (Maven-backed, Defects4J-backed) differ in command
/// construction; the orchestrator only depends on this capability set.
pub trait BuildProject: Send {
    /// Root of this project's working tree.
    fn working_dir(&self) -> &Path;

    /// Compile the tree. `Ok(false)` means the mutant does not compile, which
    /// is an expected outcome rather than an error.
    fn compile(&self) -> Result<bool, ProjectError>;

    /// Run the test suite with a bounded timeout. `target_tests` narrows the
    /// run when `relevant_only` is in effect; implementations fall back to
    /// the full suite when it is not.
    fn test(&self, target_tests: Option<&str>, relevant_only: bool)
    -> Result<TestRun, ProjectError>;

    /// Materialize an independent working copy of this project (checkout or
    /// file-tree copy) for parallel mutant execution.
    fn replicate(&self, index: usize) -> Result<Box<dyn BuildProject>, ProjectError>;

    /// Remove this project's working directory.
    fn remove(&self) -> Result<(), ProjectError>;

    /// Translate a path from `base_dir`'s path space into this project's, by
    /// substituting the working-directory prefix.
    fn translate_path(&self, base_dir: &Path, path: &Path) -> PathBuf {
        let base = base_dir.to_string_lossy();
        let own = self.working_dir().to_string_lossy();
        PathBuf::from(path.to_string_lossy().replacen(base.as_ref(), own.as_ref(), 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(PathBuf);

    impl BuildProject for Fixed {
        fn working_dir(&self) -> &Path {
            &self.0
        }
        fn compile(&self) -> Result<bool, ProjectError> {
            Ok(true)
        }
        fn test(&self, _: Option<&str>, _: bool) -> Result<TestRun, ProjectError> {
            Ok(TestRun::Completed {
                raw_output: String::new(),
            })
        }
        fn replicate(&self, _: usize) -> Result<Box<dyn BuildProject>, ProjectError> {
            Err(ProjectError::ReplicaCreation("fixed".to_string()))
        }
        fn remove(&self) -> Result<(), ProjectError> {
            Ok(())
        }
    }

    #[test]
    fn translate_path_substitutes_base_prefix() {
        let replica = Fixed(PathBuf::from("/repos/c_1/demo"));
        let translated = replica.translate_path(
            Path::new("/repos/demo"),
            Path::new("/repos/demo/src/main/java/A.java"),
        );
        assert_eq!(translated, PathBuf::from("/repos/c_1/demo/src/main/java/A.java"));
    }

    #[test]
    fn translate_path_only_touches_first_occurrence() {
        let replica = Fixed(PathBuf::from("/r/c_0/demo"));
        let translated =
            replica.translate_path(Path::new("/r/demo"), Path::new("/r/demo/src/r/demo/A.java"));
        assert_eq!(translated, PathBuf::from("/r/c_0/demo/src/r/demo/A.java"));
    }
}
