//! Build-output parsing and reconciliation.
//!
//! Turns the raw stdout/stderr of one test invocation into a validated set of
//! [`FailingTest`] records. The contract the orchestrator relies on: the number
//! of parsed records always equals the `Failures + Errors` counts of the
//! tool's own summary line, or parsing fails loudly. Silent misattribution is
//! treated as data corruption, never tolerated.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{error, warn};

use crate::outcome::{FailCategory, FailingTest, TestSummary};

/// Fatal conditions raised while parsing one build invocation's output.
#[derive(Debug, Error)]
pub enum ParseError {
    /// No summary line of any known shape was found.
    #[error("no test summary line found in build output")]
    SummaryNotFound,
    /// More than one summary line was found and they disagree.
    #[error("ambiguous test summary: {0} distinct summaries in one test exec")]
    AmbiguousSummary(usize),
    /// The summary reports zero executed tests; compilation or test selection
    /// is broken.
    #[error("0 tests run!")]
    ZeroTestsRun,
    /// Parsed failing-test records do not sum to the summary counts.
    #[error("wrong tests parsing: parsed {parsed} failing tests, summary expects {expected}")]
    ReconciliationMismatch {
        /// Number of records extracted from the report body.
        parsed: usize,
        /// `Failures + Errors` from the summary line.
        expected: u32,
    },
    /// Per-class report shape ran out of method names while attributing
    /// failures/errors to a class.
    #[error("cannot attribute {needed} more {kind} method(s) to class {class_name}")]
    MethodAttribution {
        /// Class whose counts could not be satisfied.
        class_name: String,
        /// Records still owed to that class.
        needed: u32,
        /// `"failing"` or `"erroring"`.
        kind: &'static str,
    },
}

const LEVEL_PREFIXES: &[&str] = &["[INFO] ", "[ERROR] ", "[WARNING] "];

fn strip_level_prefix(line: &str) -> &str {
    for prefix in LEVEL_PREFIXES {
        if let Some(rest) = line.strip_prefix(prefix) {
            return rest;
        }
    }
    line
}

fn take_number<'a>(input: &'a str, label: &str) -> Option<(u32, &'a str)> {
    let rest = input.trim_start().strip_prefix(label)?;
    let rest = rest.trim_start();
    let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    let value = rest[..digits].parse().ok()?;
    Some((value, &rest[digits..]))
}

/// Parse `Tests run: R, Failures: F, Errors: E, Skipped: S` and hand back
/// whatever trails the skip count.
fn parse_counts(line: &str) -> Option<(TestSummary, &str)> {
    let (run, rest) = take_number(line, "Tests run:")?;
    let (failures, rest) = take_number(rest.strip_prefix(',')?, "Failures:")?;
    let (errors, rest) = take_number(rest.strip_prefix(',')?, "Errors:")?;
    let (skipped, rest) = take_number(rest.strip_prefix(',')?, "Skipped:")?;
    Some((
        TestSummary {
            run,
            failures,
            errors,
            skipped,
        },
        rest,
    ))
}

/// Extract the run summary from raw output.
///
/// A line is a candidate only when nothing follows the skip count, which keeps
/// per-class `, Time elapsed: ...` lines out. Multiple candidates must agree
/// exactly; disagreement is fatal.
pub fn parse_summary(text: &str) -> Result<TestSummary, ParseError> {
    let mut candidates: Vec<TestSummary> = Vec::new();
    for line in text.lines() {
        let line = strip_level_prefix(line.trim());
        if let Some((summary, rest)) = parse_counts(line) {
            if rest.trim().is_empty() {
                candidates.push(summary);
            }
        }
    }

    let first = *candidates.first().ok_or(ParseError::SummaryNotFound)?;
    if candidates.len() > 1 {
        warn!(count = candidates.len(), "multiple summaries for test exec");
        let mut distinct = candidates.clone();
        distinct.sort_by_key(|s| (s.run, s.failures, s.errors, s.skipped));
        distinct.dedup();
        if distinct.len() != 1 {
            return Err(ParseError::AmbiguousSummary(distinct.len()));
        }
    }
    Ok(first)
}

fn is_method_name(token: &str) -> bool {
    let mut chars = token.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

fn is_class_name(token: &str) -> bool {
    let mut chars = token.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.')
}

/// Parse one `method(Class)` or `method(Class): reason` entry. The method must
/// be an identifier immediately followed by the parenthesis, which keeps build
/// noise like download progress lines from matching.
fn parse_entry(text: &str) -> Option<(String, String, Option<String>)> {
    let text = text.trim();
    let open = text.find('(')?;
    let method = &text[..open];
    if !is_method_name(method) {
        return None;
    }
    let rest = &text[open + 1..];
    let close = rest.find(')')?;
    let class_name = &rest[..close];
    if !is_class_name(class_name) {
        return None;
    }
    let after = &rest[close + 1..];
    let reason = if after.is_empty() {
        None
    } else {
        let reason = after.strip_prefix(':')?.trim();
        (!reason.is_empty()).then(|| reason.to_string())
    };
    Some((method.to_string(), class_name.to_string(), reason))
}

/// Aggregated report shape: the runner lists each broken test on its own line
/// with name, class and optional reason.
fn parse_aggregated(lines: &[&str]) -> Vec<FailingTest> {
    let mut records = Vec::new();
    // `Tests in error:` may carry its entry on the immediately following line.
    let mut expect_error_entry = false;

    for line in lines {
        let trimmed = strip_level_prefix(line.trim());
        if let Some(rest) = trimmed.strip_prefix("Failed tests:") {
            expect_error_entry = false;
            if let Some((method, class, reason)) = parse_entry(rest) {
                records.push(FailingTest::new(method, class, reason, FailCategory::Fail));
            }
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("Tests in error:") {
            match parse_entry(rest) {
                Some((method, class, reason)) => {
                    records.push(FailingTest::new(method, class, reason, FailCategory::Error));
                    expect_error_entry = false;
                }
                None => expect_error_entry = true,
            }
            continue;
        }
        if let Some((method, class, reason)) = parse_entry(trimmed) {
            let category = if expect_error_entry {
                FailCategory::Error
            } else {
                FailCategory::Unknown
            };
            records.push(FailingTest::new(method, class, reason, category));
        }
        expect_error_entry = false;
    }
    records
}

struct ClassCounts {
    class_name: String,
    failures: u32,
    errors: u32,
}

fn parse_class_line(line: &str) -> Option<ClassCounts> {
    let (summary, rest) = parse_counts(strip_level_prefix(line.trim()))?;
    let marker = rest.find("! - in ")?;
    let before = &rest[..marker];
    if !(before.ends_with("FAILURE") || before.ends_with("ERROR")) {
        return None;
    }
    let class_name = rest[marker + "! - in ".len()..].trim();
    if !is_class_name(class_name) {
        return None;
    }
    Some(ClassCounts {
        class_name: class_name.to_string(),
        failures: summary.failures,
        errors: summary.errors,
    })
}

fn parse_method_line(line: &str) -> Option<(String, FailCategory)> {
    let trimmed = strip_level_prefix(line.trim());
    if trimmed.starts_with("Tests run:") || !trimmed.contains("Time elapsed:") {
        return None;
    }
    let method = trimmed.split_whitespace().next()?;
    if !is_method_name(method) {
        return None;
    }
    if trimmed.ends_with("FAILURE!") {
        Some((method.to_string(), FailCategory::Fail))
    } else if trimmed.ends_with("ERROR!") {
        Some((method.to_string(), FailCategory::Error))
    } else {
        None
    }
}

fn attribute_methods(
    classes: &[ClassCounts],
    methods: &[String],
    category: FailCategory,
    kind: &'static str,
) -> Result<Vec<FailingTest>, ParseError> {
    let mut records = Vec::new();
    let mut cursor = 0usize;
    for class in classes {
        let count = match category {
            FailCategory::Fail => class.failures,
            _ => class.errors,
        };
        for consumed in 0..count {
            let Some(method) = methods.get(cursor) else {
                return Err(ParseError::MethodAttribution {
                    class_name: class.class_name.clone(),
                    needed: count - consumed,
                    kind,
                });
            };
            records.push(FailingTest::new(
                method.clone(),
                class.class_name.clone(),
                None,
                category,
            ));
            cursor += 1;
        }
    }
    Ok(records)
}

/// Per-class report shape: the fixture reports failure/error counts per class
/// plus bare method names with no direct method-to-class linkage. Correlation
/// is positional — method list order matches class emission order — and a
/// shortfall is fatal rather than silently misattributed.
fn parse_per_class(lines: &[&str]) -> Option<Result<Vec<FailingTest>, ParseError>> {
    let classes: Vec<ClassCounts> = lines.iter().filter_map(|l| parse_class_line(l)).collect();
    if classes.is_empty() {
        return None;
    }

    let mut fail_methods = Vec::new();
    let mut error_methods = Vec::new();
    for line in lines {
        if let Some((method, category)) = parse_method_line(line) {
            match category {
                FailCategory::Fail => fail_methods.push(method),
                _ => error_methods.push(method),
            }
        }
    }

    let result = attribute_methods(&classes, &fail_methods, FailCategory::Fail, "failing")
        .and_then(|mut records| {
            let errors =
                attribute_methods(&classes, &error_methods, FailCategory::Error, "erroring")?;
            records.extend(errors);
            Ok(records)
        });
    Some(result)
}

/// Merge records into an identity-keyed set. Confident categories win over
/// `Unknown` when the same test was matched by more than one template.
fn dedup_by_identity(records: Vec<FailingTest>) -> BTreeSet<FailingTest> {
    let mut set = BTreeSet::new();
    for category in [FailCategory::Fail, FailCategory::Error, FailCategory::Unknown] {
        for record in records.iter().filter(|r| r.category == category) {
            // insert keeps the earlier, more confident entry.
            set.insert(record.clone());
        }
    }
    set
}

/// Extract failing-test records from raw output, without reconciliation.
pub fn parse_broken_tests(text: &str) -> Result<BTreeSet<FailingTest>, ParseError> {
    let lines: Vec<&str> = text.lines().collect();
    let records = match parse_per_class(&lines) {
        Some(result) => result?,
        None => parse_aggregated(&lines),
    };
    Ok(dedup_by_identity(records))
}

fn backfill_unknown(set: BTreeSet<FailingTest>, summary: &TestSummary) -> BTreeSet<FailingTest> {
    let unknown = set
        .iter()
        .filter(|t| t.category == FailCategory::Unknown)
        .count();
    if unknown == 0 {
        return set;
    }
    let confident_fail = set
        .iter()
        .filter(|t| t.category == FailCategory::Fail)
        .count();
    let confident_error = set
        .iter()
        .filter(|t| t.category == FailCategory::Error)
        .count();

    // Reclassify by elimination: when one side's quota is already met, every
    // remaining Unknown belongs to the other side.
    let reclassified = if summary.failures == 0 || confident_fail == summary.failures as usize {
        FailCategory::Error
    } else if summary.errors == 0 || confident_error == summary.errors as usize {
        FailCategory::Fail
    } else {
        return set;
    };

    set.into_iter()
        .map(|mut t| {
            if t.category == FailCategory::Unknown {
                t.category = reclassified;
            }
            t
        })
        .collect()
}

/// Parse one test invocation's raw output into the set of broken tests.
///
/// Pure function over the text: re-running it on identical input yields an
/// identical set. See the module docs for the reconciliation contract.
pub fn parse_test_output(text: &str) -> Result<BTreeSet<FailingTest>, ParseError> {
    let summary = parse_summary(text)?;
    if summary.run == 0 {
        return Err(ParseError::ZeroTestsRun);
    }
    if summary.broken_count() == 0 {
        return Ok(BTreeSet::new());
    }

    let parsed = parse_broken_tests(text)?;
    if parsed.len() != summary.broken_count() as usize {
        error!(
            parsed = parsed.len(),
            expected = summary.broken_count(),
            "wrong tests parsing: record count differs from summary"
        );
        for test in &parsed {
            error!(
                record = %serde_json::to_string(test).unwrap_or_default(),
                "parsed failing test"
            );
        }
        error!(?summary, "summary for failed reconciliation");
        error!(raw = %text, "data to parse");
        return Err(ParseError::ReconciliationMismatch {
            parsed: parsed.len(),
            expected: summary.broken_count(),
        });
    }

    Ok(backfill_unknown(parsed, &summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PASS_SUMMARY: &str = "Tests run: 4, Failures: 0, Errors: 0, Skipped: 0";

    fn fail_only_report() -> String {
        [
            "[INFO] Surefire report directory: /tmp/DummyProject/target/surefire-reports",
            "Running example.DummyClassTest",
            "Tests run: 4, Failures: 2, Errors: 0, Skipped: 0, Time elapsed: 0.04 sec <<< FAILURE!",
            "",
            "Results :",
            "",
            "Failed tests:   parseStringToInt_int(example.DummyClassTest): expected:<4> but was:<1>",
            "  addCalc(example.DummyClassTest): expected:<6> but was:<5>",
            "",
            "Tests run: 4, Failures: 2, Errors: 0, Skipped: 0",
            "",
            "[INFO] BUILD FAILURE",
        ]
        .join("\n")
    }

    fn fail_and_error_report() -> String {
        [
            "Running example.DummyClassTest",
            "Results :",
            "",
            "Failed tests:   parseStringToInt_int(example.DummyClassTest): expected:<4> but was:<1>",
            "  addCalc(example.DummyClassTest): expected:<6> but was:<5>",
            "",
            "Tests in error: ",
            "  parseStringToInt_str(example.DummyClassTest)",
            "",
            "Tests run: 4, Failures: 2, Errors: 1, Skipped: 0",
        ]
        .join("\n")
    }

    #[test]
    fn summary_is_extracted_with_any_level_prefix() {
        for prefix in ["", "[INFO] ", "[ERROR] ", "[WARNING] "] {
            let text = format!("noise\n{prefix}Tests run: 7, Failures: 1, Errors: 2, Skipped: 3\n");
            let summary = parse_summary(&text).unwrap();
            assert_eq!(
                summary,
                TestSummary {
                    run: 7,
                    failures: 1,
                    errors: 2,
                    skipped: 3
                }
            );
        }
    }

    #[test]
    fn per_class_timing_lines_are_not_summary_candidates() {
        let text = "Tests run: 4, Failures: 0, Errors: 0, Skipped: 0, Time elapsed: 0.003 sec\n\
                    Tests run: 4, Failures: 0, Errors: 0, Skipped: 0\n";
        let summary = parse_summary(text).unwrap();
        assert_eq!(summary.run, 4);
    }

    #[test]
    fn agreeing_duplicate_summaries_are_accepted() {
        let text = "Tests run: 3, Failures: 0, Errors: 0, Skipped: 0\n\
                    [INFO] Tests run: 3, Failures: 0, Errors: 0, Skipped: 0\n";
        assert!(parse_summary(text).is_ok());
    }

    #[test]
    fn disagreeing_summaries_are_ambiguous() {
        let text = "Tests run: 3, Failures: 0, Errors: 0, Skipped: 0\n\
                    Tests run: 5, Failures: 1, Errors: 0, Skipped: 0\n";
        assert!(matches!(
            parse_summary(text),
            Err(ParseError::AmbiguousSummary(2))
        ));
    }

    #[test]
    fn missing_summary_is_an_error() {
        assert!(matches!(
            parse_test_output("BUILD FAILURE\n"),
            Err(ParseError::SummaryNotFound)
        ));
    }

    #[test]
    fn zero_tests_run_is_fatal() {
        let text = "Tests run: 0, Failures: 0, Errors: 0, Skipped: 0\n";
        assert!(matches!(
            parse_test_output(text),
            Err(ParseError::ZeroTestsRun)
        ));
    }

    #[test]
    fn all_green_returns_empty_set() {
        let text = format!("Running example.DummyClassTest\n{PASS_SUMMARY}\n");
        assert!(parse_test_output(&text).unwrap().is_empty());
    }

    #[test]
    fn single_failure_with_reason() {
        let text = "Failed tests: parseStringToInt_int(example.DummyClassTest): expected:<4> but was:<1>\n\
                    \n\
                    Tests run: 4, Failures: 1, Errors: 0, Skipped: 0\n";
        let parsed = parse_test_output(text).unwrap();
        assert_eq!(parsed.len(), 1);
        let test = parsed.first().unwrap();
        assert_eq!(test.method_name, "parseStringToInt_int");
        assert_eq!(test.class_name, "example.DummyClassTest");
        assert_eq!(test.reason.as_deref(), Some("expected:<4> but was:<1>"));
        assert_eq!(test.category, FailCategory::Fail);
    }

    #[test]
    fn continuation_lines_are_backfilled_to_fail() {
        let parsed = parse_test_output(&fail_only_report()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.iter().all(|t| t.category == FailCategory::Fail));
        let names: Vec<&str> = parsed.iter().map(|t| t.method_name.as_str()).collect();
        assert_eq!(names, vec!["addCalc", "parseStringToInt_int"]);
    }

    #[test]
    fn mixed_failures_and_errors_are_classified() {
        let parsed = parse_test_output(&fail_and_error_report()).unwrap();
        assert_eq!(parsed.len(), 3);
        let errored: Vec<&FailingTest> = parsed
            .iter()
            .filter(|t| t.category == FailCategory::Error)
            .collect();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].method_name, "parseStringToInt_str");
        assert!(errored[0].reason.is_none());
        assert_eq!(
            parsed
                .iter()
                .filter(|t| t.category == FailCategory::Fail)
                .count(),
            2
        );
    }

    #[test]
    fn build_noise_never_matches_entries() {
        let noise = [
            "Downloaded from central: https://repo.maven.apache.org/x.pom (3.7 kB at 8.7 kB/s)",
            "Progress (1): 2.7/3.7 kB",
            "[INFO] --- maven-compiler-plugin:3.1:compile (default-compile) @ DummyProject ---",
        ];
        assert!(parse_aggregated(&noise).is_empty());
    }

    #[test]
    fn per_class_shape_attributes_positionally() {
        let text = [
            "[ERROR] Tests run: 3, Failures: 2, Errors: 0, Skipped: 0, Time elapsed: 0.02 s <<< FAILURE! - in example.AlphaTest",
            "[ERROR] alphaOne  Time elapsed: 0.003 s  <<< FAILURE!",
            "[ERROR] alphaTwo  Time elapsed: 0.001 s  <<< FAILURE!",
            "[ERROR] Tests run: 2, Failures: 1, Errors: 1, Skipped: 0, Time elapsed: 0.01 s <<< FAILURE! - in example.BetaTest",
            "[ERROR] betaFail  Time elapsed: 0.002 s  <<< FAILURE!",
            "[ERROR] betaErr  Time elapsed: 0.002 s  <<< ERROR!",
            "",
            "[ERROR] Tests run: 5, Failures: 3, Errors: 1, Skipped: 0",
        ]
        .join("\n");
        let parsed = parse_test_output(&text).unwrap();
        assert_eq!(parsed.len(), 4);

        let find = |m: &str| parsed.iter().find(|t| t.method_name == m).unwrap();
        assert_eq!(find("alphaOne").class_name, "example.AlphaTest");
        assert_eq!(find("alphaTwo").class_name, "example.AlphaTest");
        assert_eq!(find("betaFail").class_name, "example.BetaTest");
        assert_eq!(find("betaFail").category, FailCategory::Fail);
        assert_eq!(find("betaErr").class_name, "example.BetaTest");
        assert_eq!(find("betaErr").category, FailCategory::Error);
    }

    #[test]
    fn per_class_method_shortfall_is_fatal() {
        let text = [
            "[ERROR] Tests run: 3, Failures: 2, Errors: 0, Skipped: 0, Time elapsed: 0.02 s <<< FAILURE! - in example.AlphaTest",
            "[ERROR] alphaOne  Time elapsed: 0.003 s  <<< FAILURE!",
            "",
            "[ERROR] Tests run: 3, Failures: 2, Errors: 0, Skipped: 0",
        ]
        .join("\n");
        assert!(matches!(
            parse_test_output(&text),
            Err(ParseError::MethodAttribution { needed: 1, .. })
        ));
    }

    #[test]
    fn reconciliation_mismatch_is_fatal() {
        // Summary promises two broken tests, report names one.
        let text = "Failed tests: only(example.DummyClassTest): boom\n\
                    Tests run: 4, Failures: 2, Errors: 0, Skipped: 0\n";
        assert!(matches!(
            parse_test_output(text),
            Err(ParseError::ReconciliationMismatch {
                parsed: 1,
                expected: 2
            })
        ));
    }

    #[test]
    fn parsing_is_idempotent() {
        let text = fail_and_error_report();
        assert_eq!(
            parse_test_output(&text).unwrap(),
            parse_test_output(&text).unwrap()
        );
    }

    proptest! {
        // A generator of well-formed aggregated reports must never trip the
        // reconciliation invariant.
        #[test]
        fn synthetic_reports_always_reconcile(
            n_fail in 0u32..5,
            n_err in 0u32..5,
            n_pass in 1u32..10,
            prefix in prop::sample::select(vec!["", "[INFO] ", "[ERROR] ", "[WARNING] "]),
        ) {
            let mut text = String::from("Running example.GenTest\n");
            for i in 0..n_fail {
                text.push_str(&format!(
                    "Failed tests:   fail{i}(example.GenTest): expected:<{i}> but was:<0>\n"
                ));
            }
            if n_err > 0 {
                text.push_str("Tests in error: \n");
                for i in 0..n_err {
                    text.push_str(&format!("  err{i}(example.GenTest)\n"));
                }
            }
            let run = n_fail + n_err + n_pass;
            text.push_str(&format!(
                "\n{prefix}Tests run: {run}, Failures: {n_fail}, Errors: {n_err}, Skipped: 0\n"
            ));

            let parsed = parse_test_output(&text).expect("well-formed report must parse");
            prop_assert_eq!(parsed.len() as u32, n_fail + n_err);
            prop_assert_eq!(
                parsed.iter().filter(|t| t.category == FailCategory::Fail).count() as u32,
                n_fail
            );
            prop_assert_eq!(
                parsed.iter().filter(|t| t.category == FailCategory::Error).count() as u32,
                n_err
            );
        }
    }
}
