//! A whole session against a fake pytest: command line, progress, report,
//! tracebacks, console output and the execution log.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use redgreen::config::ProjectConfig;
use redgreen::console::{ConsoleNotifier, OutputFormat};
use redgreen::errors::RunError;
use redgreen::exec::ProcessRunner;
use redgreen::log::ExecutionLog;
use redgreen::paths::session_log_file;
use redgreen::session::{RunOutcome, Session, SessionSettings};

const REPORT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<testsuites><testsuite name="pytest" errors="0" failures="1" tests="2">
<testcase classname="tests.test_foo" file="tests/test_foo.py" line="8" name="test_nested">
<failure message="assert 1 == 2">tests/test_foo.py:10: in test_nested
    helper(1)
tests/test_foo.py:6: in helper
    assert x == 2
E   assert 1 == 2</failure>
</testcase>
<testcase classname="tests.test_foo" file="tests/test_foo.py" line="12" name="test_ok"/>
</testsuite></testsuites>"#;

/// Plays back a red pytest run and writes the report it was asked for.
#[derive(Default)]
struct FakePytest {
    calls: Vec<Vec<String>>,
}

impl ProcessRunner for FakePytest {
    fn execute(
        &mut self,
        cmd: &[String],
        _cwd: &Path,
        _env: &BTreeMap<String, String>,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<Option<i32>, RunError> {
        self.calls.push(cmd.to_vec());
        if let Some(path) = cmd.iter().find_map(|arg| arg.strip_prefix("--junit-xml=")) {
            std::fs::write(path, REPORT).unwrap();
        }
        for chunk in ["tests/test_foo.py ", "F", ".", "\n", "==== 1 failed, 1 passed in 0.02s ====\n"] {
            on_chunk(chunk);
        }
        Ok(Some(1))
    }
}

#[derive(Clone, Default)]
struct Screen(Rc<RefCell<Vec<u8>>>);

impl Write for Screen {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Screen {
    fn text(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

fn project() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("tests")).unwrap();
    std::fs::write(
        tmp.path().join("tests").join("test_foo.py"),
        "import pytest\n\n\n\ndef helper(x):\n    assert x == 2\n\n\ndef test_nested():\n    helper(1)\n",
    )
    .unwrap();
    tmp
}

#[test]
fn short_mode_run_end_to_end() {
    let tmp = project();
    let root = tmp.path();
    let mut settings = SessionSettings::from_config(&ProjectConfig::default(), root);
    settings.options = vec!["--tb=short".to_string()];

    let log = Arc::new(ExecutionLog::new(&session_log_file(&settings.cache_dir)).unwrap());
    let screen = Screen::default();
    let mut session = Session::new(settings, FakePytest::default());
    session.add_notifier(Box::new(ConsoleNotifier::new(
        screen.clone(),
        OutputFormat::Plain,
        root.to_path_buf(),
    )));
    session.add_notifier(Box::new(Arc::clone(&log)));

    let test_file = root.join("tests").join("test_foo.py");
    session.focus(Some(test_file.clone()));
    let target = session.next_target();
    assert_eq!(target, vec!["tests/test_foo.py"]);

    let outcome = session.run(target, vec!["--tb=short".to_string()]).unwrap();
    assert_eq!(outcome, RunOutcome::Red { tracebacks: 2 });

    let call = &session.runner().calls[0];
    assert_eq!(&call[..3], ["pytest", "--tb=short", "tests/test_foo.py"]);
    assert!(call.iter().any(|arg| arg.starts_with("--junit-xml=")));

    let state = session.state();
    assert!(state.has_failures());
    assert!(!state.is_running());
    assert_eq!(state.summary(), "Ran 2 tests. 1 failed, 1 passed in 0.02s");
    let tbs = &state.errors()[&test_file];
    assert_eq!(tbs.len(), 2);
    assert_eq!(tbs[0].line, 10);
    assert!(tbs[0].text.starts_with("E   assert 1 == 2"));
    assert_eq!(tbs[1].line, 6);

    let shown = screen.text();
    assert!(shown.contains("[redgreen] running pytest --tb=short tests/test_foo.py"));
    assert!(shown.contains("[redgreen] red\n"));
    assert!(shown.contains("[redgreen] red: Ran 2 tests. 1 failed, 1 passed in 0.02s\n"));
    assert!(shown.contains("tests/test_foo.py:10: E   assert 1 == 2\n"));

    let logged = std::fs::read_to_string(log.path()).unwrap();
    let events: Vec<String> = logged
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["event"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(
        events,
        ["run_started", "will_fail", "run_finished", "errors_updated"]
    );
}

#[test]
fn red_run_keeps_the_focused_file_as_target() {
    let tmp = project();
    let root = tmp.path();
    let settings = SessionSettings::from_config(&ProjectConfig::default(), root);
    let mut session = Session::new(settings, FakePytest::default());

    let test_file = root.join("tests").join("test_foo.py");
    session.focus(Some(test_file));
    session.run_next().unwrap();
    assert!(session.state().has_failures());

    // Still red and nothing saved: rerun the focused file.
    assert_eq!(session.next_target(), vec!["tests/test_foo.py"]);

    // Leaving the test file falls back to the whole suite.
    session.focus(Some(root.join("pkg").join("mod.py")));
    assert_eq!(session.next_target(), vec!["."]);

    session.run_next().unwrap();
    assert_eq!(session.runs(), 2);
    assert!(session.runner().calls[1].contains(&".".to_string()));
}
