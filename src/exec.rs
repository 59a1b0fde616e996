//! Running the test command.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::sync::mpsc;
use std::thread;

use regex::Regex;
use tracing::{debug, warn};

use crate::errors::RunError;

/// Spawns a command and streams its console output back.
pub trait ProcessRunner {
    /// Run `cmd` to completion, handing every piece of stdout/stderr text
    /// to `on_chunk` as it arrives. Returns the exit code, `None` when the
    /// process was killed by a signal.
    fn execute(
        &mut self,
        cmd: &[String],
        cwd: &Path,
        env: &BTreeMap<String, String>,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<Option<i32>, RunError>;
}

/// [`ProcessRunner`] backed by `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn execute(
        &mut self,
        cmd: &[String],
        cwd: &Path,
        env: &BTreeMap<String, String>,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<Option<i32>, RunError> {
        let (program, args) = cmd.split_first().ok_or(RunError::EmptyCommand)?;
        debug!(program = %program, args = ?args, cwd = %cwd.display(), "spawning test command");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: program.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_pipe_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_pipe_reader(stderr, tx.clone()));
        }
        drop(tx);

        // Ends once both pipes hit EOF.
        for chunk in rx {
            on_chunk(&chunk);
        }
        for reader in readers {
            if reader.join().is_err() {
                warn!(program = %program, "output reader thread panicked");
            }
        }

        let status = child.wait().map_err(|source| RunError::Wait {
            program: program.clone(),
            source,
        })?;
        Ok(status.code())
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(
    mut reader: R,
    tx: mpsc::Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut decoder = Utf8Decoder::default();
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    if !text.is_empty() && tx.send(text).is_err() {
                        return;
                    }
                }
            }
        }
        let rest = decoder.finish();
        if !rest.is_empty() {
            let _ = tx.send(rest);
        }
    })
}

/// Incremental UTF-8 decoding across read boundaries.
///
/// A multi-byte character split between two reads is held back until its
/// remaining bytes arrive; invalid sequences become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let remaining = rest.to_vec();
        self.pending = remaining;
        out
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

static COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" (\d+) ").unwrap());

/// One-line summary from pytest's closing `=== 1 failed, 2 passed ... ===`.
pub fn run_summary(output: &str) -> String {
    let last_line = output.trim().lines().last().unwrap_or_default();
    let total: u64 = COUNT
        .captures_iter(last_line)
        .filter_map(|caps| caps[1].parse::<u64>().ok())
        .sum();
    format!("Ran {total} tests. {}", last_line.replace('=', "").trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_every_number_on_the_last_line() {
        let output = "\
test_foo.py F..
=================== FAILURES ===================
...
========= 1 failed, 2 passed in 0.12s =========
";
        assert_eq!(run_summary(output), "Ran 3 tests. 1 failed, 2 passed in 0.12s");
    }

    #[test]
    fn summary_of_empty_output() {
        assert_eq!(run_summary(""), "Ran 0 tests. ");
    }

    #[test]
    fn summary_ignores_numbers_in_durations() {
        assert_eq!(
            run_summary("==== 4 passed, 1 xfailed in 3.50s ===="),
            "Ran 5 tests. 4 passed, 1 xfailed in 3.50s"
        );
    }

    #[test]
    fn decoder_holds_back_split_characters() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "ä ok".as_bytes();
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..]), "ä ok");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
        assert_eq!(decoder.decode(b"\xe2\x82"), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn empty_command_is_rejected() {
        let mut on_chunk = |_: &str| {};
        let err = SystemRunner
            .execute(&[], Path::new("."), &BTreeMap::new(), &mut on_chunk)
            .unwrap_err();
        assert!(matches!(err, RunError::EmptyCommand));
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let mut on_chunk = |_: &str| {};
        let cmd = vec!["redgreen-no-such-program-xyz".to_string()];
        let err = SystemRunner
            .execute(&cmd, Path::new("."), &BTreeMap::new(), &mut on_chunk)
            .unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn streams_both_pipes_and_reports_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let cmd: Vec<String> = ["sh", "-c", "printf out; printf \"$GREETING\" >&2; exit 3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let env = BTreeMap::from([("GREETING".to_string(), "err".to_string())]);

        let mut output = String::new();
        let mut on_chunk = |chunk: &str| output.push_str(chunk);
        let code = SystemRunner
            .execute(&cmd, tmp.path(), &env, &mut on_chunk)
            .unwrap();

        assert_eq!(code, Some(3));
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }
}
