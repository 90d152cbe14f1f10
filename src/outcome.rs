//! Failing-test records, test-run summaries and the per-mutant outcome type.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Sentinel recorded in the result sink's `broken_tests` column when a test run
/// exceeded its time budget.
pub const TESTS_TIMEOUT_RESULT: &str = "timed_out";

/// How a failing test was classified by the report it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailCategory {
    /// Assertion failure.
    Fail,
    /// Unexpected exception during the test.
    Error,
    /// Matched by the generic report template; may be reclassified by
    /// elimination after reconciliation.
    Unknown,
}

/// One failing test parsed from build-tool output.
///
/// Identity is `(class_name, method_name, reason)`. The category is
/// deliberately excluded so that a record matched twice by different report
/// templates collapses to a single set entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailingTest {
    /// Test method name.
    pub method_name: String,
    /// Fully qualified test class name.
    pub class_name: String,
    /// Free-text failure reason, when the report carried one.
    pub reason: Option<String>,
    /// Failure classification.
    pub category: FailCategory,
}

impl FailingTest {
    /// Construct a record.
    pub fn new(
        method_name: impl Into<String>,
        class_name: impl Into<String>,
        reason: Option<String>,
        category: FailCategory,
    ) -> Self {
        Self {
            method_name: method_name.into(),
            class_name: class_name.into(),
            reason,
            category,
        }
    }

    /// `Class.method` display name used in the sink's `broken_tests` column.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.class_name, self.method_name)
    }

    fn identity(&self) -> (&str, &str, Option<&str>) {
        (
            self.class_name.as_str(),
            self.method_name.as_str(),
            self.reason.as_deref(),
        )
    }
}

impl PartialEq for FailingTest {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for FailingTest {}

impl PartialOrd for FailingTest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FailingTest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

/// The `Tests run: R, Failures: F, Errors: E, Skipped: S` counts reported by
/// the build tool, parsed once per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    /// Number of tests executed.
    pub run: u32,
    /// Assertion failures.
    pub failures: u32,
    /// Errored tests.
    pub errors: u32,
    /// Skipped tests.
    pub skipped: u32,
}

impl TestSummary {
    /// Total number of failing-test records the report must contain.
    pub fn broken_count(&self) -> u32 {
        self.failures + self.errors
    }
}

/// Outcome of running the test suite against one compiled mutant.
///
/// Timeouts are an expected outcome and travel as data; raised errors are
/// reserved for genuine faults (parse inconsistency, I/O failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    /// Every test passed; the mutant survived.
    Passed,
    /// At least one test broke; the mutant was killed by these tests.
    Failed(BTreeSet<FailingTest>),
    /// The run exceeded its time budget.
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_ignores_category() {
        let fail = FailingTest::new("m", "C", Some("boom".to_string()), FailCategory::Fail);
        let unknown = FailingTest::new("m", "C", Some("boom".to_string()), FailCategory::Unknown);
        assert_eq!(fail, unknown);

        let mut set = BTreeSet::new();
        set.insert(fail);
        assert!(!set.insert(unknown), "same identity must collapse");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn identity_distinguishes_reason() {
        let a = FailingTest::new("m", "C", Some("boom".to_string()), FailCategory::Fail);
        let b = FailingTest::new("m", "C", None, FailCategory::Fail);
        assert_ne!(a, b);
    }

    #[test]
    fn qualified_name_joins_class_and_method() {
        let t = FailingTest::new("addCalc", "example.DummyClassTest", None, FailCategory::Fail);
        assert_eq!(t.qualified_name(), "example.DummyClassTest.addCalc");
    }
}
