//! Turning a run's output into an [`ErrorMap`].
//!
//! Line mode is parsed straight from the console output. Every other mode
//! reads the JUnit report pytest wrote and runs the mode's grammar over each
//! failing testcase's body.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::ExtractError;
use crate::paths::resolve_frame_path;
use crate::report::{JunitReport, Outcome, TestCase};
use crate::traceback::{self, ErrorMap, Traceback, TracebackMode, matchers};

const XPASS_MARKER: &str = "XPASS";
const OUTPUT_SEPARATOR: &str = "------ Output ------";
/// Start of a `____ test_name ____` header line.
const SECTION_BOUNDARY: &str = "\n_";

/// Result of one extraction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub errors: ErrorMap,
    /// At least one test unexpectedly passed.
    pub xpassed: bool,
    /// Parsed from incomplete output; a later pass may revise it.
    pub intermediate: bool,
}

/// Batch entry point, run once the process has exited.
pub fn extract_run(
    output: &str,
    report_path: &Path,
    mode: TracebackMode,
    base_dir: &Path,
) -> Result<Extraction, ExtractError> {
    if mode.uses_report() {
        let report = JunitReport::load(report_path)?;
        Ok(extract_report(&report, mode, base_dir))
    } else {
        Ok(Extraction {
            errors: parse_output(output, mode, base_dir),
            ..Extraction::default()
        })
    }
}

/// Best-effort parsing of a still-growing console buffer.
///
/// Output before the last section boundary is parsed once and kept; only the
/// unfinished tail is parsed again on the next call. In line mode the boundary
/// is the last newline, in the other modes it is the last `____` section
/// header pytest prints before each failure.
#[derive(Debug)]
pub struct PartialParser {
    mode: TracebackMode,
    base_dir: PathBuf,
    settled: ErrorMap,
    settled_upto: usize,
}

impl PartialParser {
    pub fn new(mode: TracebackMode, base_dir: &Path) -> Self {
        Self {
            mode,
            base_dir: base_dir.to_path_buf(),
            settled: ErrorMap::new(),
            settled_upto: 0,
        }
    }

    /// Parse what `buffer` gained since the last call. `buffer` must extend
    /// the one passed before.
    pub fn feed(&mut self, buffer: &str) -> Extraction {
        let unsettled = buffer.get(self.settled_upto..).unwrap_or_default();
        let boundary = match self.mode {
            TracebackMode::Line => unsettled.rfind('\n').map(|i| i + 1),
            _ => unsettled.rfind(SECTION_BOUNDARY).map(|i| i + 1),
        };
        let (finished, tail) = unsettled.split_at(boundary.unwrap_or(0));
        if !finished.is_empty() {
            let text = normalize_newlines(finished);
            traceback::group_by_file(
                &mut self.settled,
                frames_to_tracebacks(&text, self.mode, &self.base_dir, None),
            );
        }
        self.settled_upto += finished.len();

        let mut errors = self.settled.clone();
        // A line-mode tail is an unfinished line and can only produce a truncated frame.
        if self.mode != TracebackMode::Line && !tail.is_empty() {
            let text = normalize_newlines(tail);
            traceback::group_by_file(
                &mut errors,
                frames_to_tracebacks(&text, self.mode, &self.base_dir, None),
            );
        }
        Extraction {
            errors,
            xpassed: false,
            intermediate: true,
        }
    }
}

/// Run `mode`'s grammar over console text.
pub fn parse_output(text: &str, mode: TracebackMode, base_dir: &Path) -> ErrorMap {
    let text = normalize_newlines(text);
    let mut errors = ErrorMap::new();
    traceback::group_by_file(&mut errors, frames_to_tracebacks(&text, mode, base_dir, None));
    errors
}

pub fn extract_report(report: &JunitReport, mode: TracebackMode, base_dir: &Path) -> Extraction {
    let mut extraction = Extraction::default();
    for tc in report.failing() {
        let (tracebacks, xpassed) = testcase_tracebacks(tc, mode, base_dir);
        extraction.xpassed |= xpassed;
        traceback::group_by_file(&mut extraction.errors, tracebacks);
    }
    debug!(
        mode = %mode,
        tracebacks = traceback::count(&extraction.errors),
        files = extraction.errors.len(),
        "extracted tracebacks from report"
    );
    extraction
}

/// Tracebacks for one failing testcase. Never fails: a body we can't make
/// sense of just contributes nothing.
fn testcase_tracebacks(
    tc: &TestCase,
    mode: TracebackMode,
    base_dir: &Path,
) -> (Vec<Traceback>, bool) {
    let file = tc.file.as_deref().map(|f| resolve_frame_path(base_dir, f));
    let testcase = file.as_deref().and_then(|f| testcase_id(tc, f));
    // pytest writes 0-based definition lines.
    let declared = tc.line.map(|line| line + 1);
    let marker = |text: String| match (&file, declared) {
        (Some(file), Some(line)) => {
            Some(Traceback::new(file.clone(), line, text).with_testcase(testcase.clone()))
        }
        _ => {
            debug!(test = %tc.name, "no declared location for synthetic traceback");
            None
        }
    };

    let mut tracebacks = Vec::new();
    let mut xpassed = false;

    if let Some(failure) = &tc.failure {
        if failure.message.contains(XPASS_MARKER) {
            xpassed = true;
            tracebacks.extend(marker(failure.message.clone()));
        } else {
            let mut frames = body_tracebacks(failure, mode, base_dir, testcase.as_deref());
            place_culprit(&mut frames, Some(&failure.message));
            tracebacks.extend(frames);
        }
    }

    if let Some(error) = &tc.error {
        let mut frames = body_tracebacks(error, mode, base_dir, testcase.as_deref());
        let culprit = place_culprit(&mut frames, None);
        // Fixture errors ("at setup", "at teardown") get a marker on the test itself.
        tracebacks.extend(marker(format!("{}:\n{culprit}", error.message)));
        tracebacks.extend(frames);
    }

    if let (Some(output), Some(head)) = (&tc.system_out, tracebacks.first_mut()) {
        head.text = format!("{}\n{OUTPUT_SEPARATOR}\n{output}", head.text);
    }

    (tracebacks, xpassed)
}

fn body_tracebacks(
    outcome: &Outcome,
    mode: TracebackMode,
    base_dir: &Path,
    testcase: Option<&str>,
) -> Vec<Traceback> {
    let body = normalize_newlines(&outcome.body);
    let frames = frames_to_tracebacks(&body, mode, base_dir, testcase);
    if frames.is_empty() && !body.trim().is_empty() {
        debug!(mode = %mode, "no traceback frames matched a non-empty body");
    }
    frames
}

fn frames_to_tracebacks(
    text: &str,
    mode: TracebackMode,
    base_dir: &Path,
    testcase: Option<&str>,
) -> Vec<Traceback> {
    mode.frames(text)
        .into_iter()
        .map(|frame| {
            Traceback::new(resolve_frame_path(base_dir, &frame.file), frame.line, frame.text)
                .with_testcase(testcase.map(String::from))
        })
        .collect()
}

/// Put the summary line on the topmost frame, the one visible at the point
/// of editing. Returns the culprit found in the last frame.
fn place_culprit(frames: &mut [Traceback], fallback: Option<&str>) -> String {
    let culprit = frames
        .last()
        .map(|last| matchers::culprit(&last.text))
        .unwrap_or_default();
    let summary = match fallback {
        Some(message) if culprit.is_empty() => message.to_string(),
        _ => culprit.clone(),
    };

    if !summary.is_empty() && frames.len() > 1 {
        let head = &mut frames[0];
        head.text = format!("{summary}\n{}", head.text);
    }
    culprit
}

/// Node id for a testcase, built from its `classname` and `name`.
///
/// `classname` starts with the dotted module path of `tc.file`; whatever
/// follows is the class nesting.
fn testcase_id(tc: &TestCase, file: &Path) -> Option<String> {
    let rel_file = tc.file.as_deref()?;
    let module = Path::new(rel_file).with_extension("");
    let dotted = module.to_string_lossy().replace(['/', '\\'], ".");

    let Some(rest) = tc.classname.strip_prefix(dotted.as_str()) else {
        debug!(
            classname = %tc.classname,
            module = %dotted,
            "testcase classname does not start with its module path"
        );
        return None;
    };
    let classes = rest
        .get(1..)
        .unwrap_or_default()
        .split('.')
        .map(|part| part.trim_end_matches("()"))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("::");

    let file = file.display();
    Some(if classes.is_empty() {
        format!("{file}::{}", tc.name)
    } else {
        format!("{file}::{classes}::{}", tc.name)
    })
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_FIXTURE: &str = include_str!("../tests/fixtures/long_three_failures.txt");
    const TEARDOWN_REPORT: &str = include_str!("../tests/fixtures/errors_at_teardown.xml");

    fn project() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("tests")).unwrap();
        std::fs::write(tmp.path().join("tests").join("test_foo.py"), "").unwrap();
        std::fs::write(tmp.path().join("test_sample.py"), "").unwrap();
        tmp
    }

    fn case(classname: &str, name: &str, line: u32) -> TestCase {
        TestCase {
            classname: classname.to_string(),
            name: name.to_string(),
            file: Some("tests/test_foo.py".to_string()),
            line: Some(line),
            ..TestCase::default()
        }
    }

    #[test]
    fn long_fixture_yields_every_frame() {
        let tmp = project();
        let errors = parse_output(LONG_FIXTURE, TracebackMode::Long, tmp.path());
        assert_eq!(traceback::count(&errors), 7);

        let frames = &errors[&tmp.path().join("test_sample.py")];
        assert_eq!(frames.len(), 7);
        assert!(frames.iter().all(|tb| tb.testcase.is_none()));
    }

    #[test]
    fn teardown_report_yields_bodies_and_marker() {
        let tmp = project();
        let report = JunitReport::parse(TEARDOWN_REPORT).unwrap();
        let extraction = extract_report(&report, TracebackMode::Long, tmp.path());
        assert_eq!(traceback::count(&extraction.errors), 3);
        assert!(!extraction.xpassed);

        let file = tmp.path().join("tests").join("test_foo.py");
        let tbs = &extraction.errors[&file];
        // The teardown marker sits on the test definition, before its frames.
        let marker = tbs
            .iter()
            .find(|tb| tb.text.starts_with("failed on teardown"))
            .unwrap();
        assert_eq!(marker.line, 15);
        assert!(marker.text.ends_with("E       ValueError: boom"));
    }

    #[test]
    fn xpass_yields_one_synthetic_traceback() {
        let tmp = project();
        let mut tc = case("tests.test_foo", "test_xpass", 4);
        tc.failure = Some(Outcome {
            message: "[XPASS(strict)] should fail".to_string(),
            body: "tests/test_foo.py:9: in test_xpass\n    x()\nE   boom\n".to_string(),
        });
        let report = JunitReport { testcases: vec![tc] };

        let extraction = extract_report(&report, TracebackMode::Short, tmp.path());
        assert!(extraction.xpassed);
        assert_eq!(traceback::count(&extraction.errors), 1);
        let tb = &extraction.errors[&tmp.path().join("tests/test_foo.py")][0];
        assert_eq!(tb.line, 5);
        assert_eq!(tb.text, "[XPASS(strict)] should fail");
    }

    #[test]
    fn culprit_goes_on_top_of_multi_frame_failures() {
        let tmp = project();
        let mut tc = case("tests.test_foo", "test_nested", 8);
        tc.failure = Some(Outcome {
            message: "assert 1 == 2".to_string(),
            body: "\
tests/test_foo.py:10: in test_nested
    helper(1)
tests/test_foo.py:6: in helper
    assert x == 2
E   assert 1 == 2"
                .to_string(),
        });
        let report = JunitReport { testcases: vec![tc] };

        let extraction = extract_report(&report, TracebackMode::Short, tmp.path());
        let tbs = &extraction.errors[&tmp.path().join("tests/test_foo.py")];
        assert_eq!(tbs.len(), 2);
        assert_eq!(tbs[0].line, 10);
        assert!(tbs[0].text.starts_with("E   assert 1 == 2"));
        assert_eq!(tbs[1].text, "E   assert 1 == 2");
    }

    #[test]
    fn message_is_the_fallback_culprit() {
        let tmp = project();
        let mut tc = case("tests.test_foo", "test_nested", 8);
        tc.failure = Some(Outcome {
            message: "Failed: explicit".to_string(),
            body: "\
tests/test_foo.py:10: in test_nested
    helper(1)
tests/test_foo.py:6: in helper
    pytest.fail('explicit')
"
            .to_string(),
        });
        let report = JunitReport { testcases: vec![tc] };

        let extraction = extract_report(&report, TracebackMode::Short, tmp.path());
        let tbs = &extraction.errors[&tmp.path().join("tests/test_foo.py")];
        assert_eq!(tbs.len(), 2);
        assert!(tbs[0].text.starts_with("Failed: explicit"));
    }

    #[test]
    fn single_frame_is_left_untouched() {
        let tmp = project();
        let mut tc = case("tests.test_foo", "test_foo", 2);
        tc.failure = Some(Outcome {
            message: "assert 1 == 2".to_string(),
            body: "tests/test_foo.py:3: in test_foo\n    assert 1 == 2\nE   assert 1 == 2\n"
                .to_string(),
        });
        let report = JunitReport { testcases: vec![tc] };

        let extraction = extract_report(&report, TracebackMode::Short, tmp.path());
        let tbs = &extraction.errors[&tmp.path().join("tests/test_foo.py")];
        assert_eq!(tbs.len(), 1);
        assert_eq!(tbs[0].text, "E   assert 1 == 2\n");
    }

    #[test]
    fn unmatched_body_contributes_nothing() {
        let tmp = project();
        let mut broken = case("tests.test_foo", "test_broken", 2);
        broken.failure = Some(Outcome {
            message: "weird".to_string(),
            body: "something pytest never prints".to_string(),
        });
        let mut fine = case("tests.test_foo", "test_fine", 10);
        fine.failure = Some(Outcome {
            message: "assert 0".to_string(),
            body: "tests/test_foo.py:11: in test_fine\n    assert 0\nE   assert 0\n".to_string(),
        });
        let report = JunitReport {
            testcases: vec![broken, fine],
        };

        let extraction = extract_report(&report, TracebackMode::Short, tmp.path());
        assert_eq!(traceback::count(&extraction.errors), 1);
    }

    #[test]
    fn system_out_is_appended_to_first_traceback() {
        let tmp = project();
        let mut tc = case("tests.test_foo", "test_foo", 2);
        tc.failure = Some(Outcome {
            message: "assert 1 == 2".to_string(),
            body: "tests/test_foo.py:3: in test_foo\n    assert 1 == 2\nE   assert 1 == 2".to_string(),
        });
        tc.system_out = Some("printed".to_string());
        let report = JunitReport { testcases: vec![tc] };

        let extraction = extract_report(&report, TracebackMode::Short, tmp.path());
        let tb = &extraction.errors[&tmp.path().join("tests/test_foo.py")][0];
        assert_eq!(tb.text, "E   assert 1 == 2\n------ Output ------\nprinted");
    }

    #[test]
    fn testcase_ids_follow_class_nesting() {
        let file = Path::new("/work/tests/test_foo.py");
        assert_eq!(
            testcase_id(&case("tests.test_foo", "test_a", 0), file).as_deref(),
            Some("/work/tests/test_foo.py::test_a")
        );
        assert_eq!(
            testcase_id(&case("tests.test_foo.TestOuter.TestInner", "test_b", 0), file).as_deref(),
            Some("/work/tests/test_foo.py::TestOuter::TestInner::test_b")
        );
        assert_eq!(
            testcase_id(&case("tests.test_foo.TestOld.()", "test_c", 0), file).as_deref(),
            Some("/work/tests/test_foo.py::TestOld::test_c")
        );
        assert_eq!(testcase_id(&case("elsewhere", "test_d", 0), file), None);
    }

    #[test]
    fn line_mode_reads_console_output() {
        let tmp = project();
        let output = "\
============================= FAILURES =============================
tests/test_foo.py:3: assert 1 == 2
test_sample.py:8: ZeroDivisionError: division by zero
===================== 2 failed in 0.03s =====================
";
        let missing_report = tmp.path().join("never-written.xml");
        let extraction =
            extract_run(output, &missing_report, TracebackMode::Line, tmp.path()).unwrap();
        assert_eq!(traceback::count(&extraction.errors), 2);
        let tb = &extraction.errors[&tmp.path().join("tests/test_foo.py")][0];
        assert_eq!(tb.line, 3);
        assert_eq!(tb.text, "assert 1 == 2");
    }

    #[test]
    fn report_modes_fail_loudly_without_report() {
        let tmp = project();
        let err = extract_run("", &tmp.path().join("missing.xml"), TracebackMode::Auto, tmp.path())
            .unwrap_err();
        assert!(matches!(err, ExtractError::ReportMissing { .. }));
    }

    #[test]
    fn partial_extraction_is_marked_intermediate() {
        let tmp = project();
        let mut parser = PartialParser::new(TracebackMode::Line, tmp.path());
        let extraction = parser.feed("tests/test_foo.py:3: assert 1 == 2\ntests/test_fo");
        assert!(extraction.intermediate);
        assert_eq!(traceback::count(&extraction.errors), 1);
    }

    #[test]
    fn partial_line_mode_parses_each_line_once() {
        let tmp = project();
        let mut parser = PartialParser::new(TracebackMode::Line, tmp.path());
        let mut buffer = String::from("tests/test_foo.py:3: assert 1");
        assert!(parser.feed(&buffer).errors.is_empty());

        buffer.push_str(" == 2\ntests/test_foo.py:8: assert 0\n");
        let extraction = parser.feed(&buffer);
        let tbs = &extraction.errors[&tmp.path().join("tests/test_foo.py")];
        assert_eq!(tbs.len(), 2);
        assert_eq!(tbs[0].text, "assert 1 == 2");
        assert_eq!(parser.settled_upto, buffer.len());

        buffer.push_str("==== 2 failed ====\n");
        assert_eq!(traceback::count(&parser.feed(&buffer).errors), 2);
    }

    #[test]
    fn partial_short_mode_matches_a_full_parse() {
        let tmp = project();
        let output = "\
tests/test_foo.py FF
=================== FAILURES ===================
___________________ test_one ___________________
tests/test_foo.py:3: in test_one
    assert 1 == 2
E   assert 1 == 2
___________________ test_two ___________________
tests/test_foo.py:7: in test_two
    assert 3 == 4
E   assert 3 == 4
";
        let mut parser = PartialParser::new(TracebackMode::Short, tmp.path());
        let mut fed = String::new();
        let mut last = Extraction::default();
        for line in output.split_inclusive('\n') {
            fed.push_str(line);
            last = parser.feed(&fed);
        }
        assert_eq!(last.errors, parse_output(output, TracebackMode::Short, tmp.path()));
        assert_eq!(traceback::count(&last.errors), 2);
    }

    #[test]
    fn crlf_output_is_normalized() {
        let tmp = project();
        let body = "tests/test_foo.py:3: in test_foo\r\n    assert 1 == 2\r\nE   assert 1 == 2\r\n";
        let errors = parse_output(body, TracebackMode::Short, tmp.path());
        assert_eq!(traceback::count(&errors), 1);
    }
}
