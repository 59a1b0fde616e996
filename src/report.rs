//! Reading pytest's JUnit XML report.
//!
//! Only the parts the extractor needs are kept: the `testcase` elements with
//! their location attributes and their `failure`, `error` and `system-out`
//! children. Both a bare `<testsuite>` root and the `<testsuites>` wrapper
//! newer pytest versions emit are accepted.

use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::debug;

use crate::errors::ExtractError;

/// The `message` attribute and body text of a `failure` or `error` element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub message: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestCase {
    pub classname: String,
    pub name: String,
    /// Path of the test module, relative to pytest's rootdir.
    pub file: Option<String>,
    /// 0-based line of the test definition, as pytest writes it.
    pub line: Option<u32>,
    pub failure: Option<Outcome>,
    pub error: Option<Outcome>,
    pub system_out: Option<String>,
}

impl TestCase {
    pub fn is_failing(&self) -> bool {
        self.failure.is_some() || self.error.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JunitReport {
    pub testcases: Vec<TestCase>,
}

impl JunitReport {
    pub fn failing(&self) -> impl Iterator<Item = &TestCase> {
        self.testcases.iter().filter(|tc| tc.is_failing())
    }

    pub fn load(path: &Path) -> Result<Self, ExtractError> {
        let xml = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ExtractError::ReportMissing {
                    path: path.to_path_buf(),
                }
            } else {
                ExtractError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::parse(&xml)
    }

    pub fn parse(xml: &str) -> Result<Self, ExtractError> {
        let mut reader = Reader::from_str(xml);
        let mut parser = ReportParser::default();

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    parser.depth += 1;
                    parser.open(&e)?;
                }
                Event::Empty(e) => {
                    parser.open(&e)?;
                    parser.close(e.name().as_ref());
                }
                Event::End(e) => {
                    parser.depth = parser.depth.saturating_sub(1);
                    parser.close(e.name().as_ref());
                }
                Event::Text(t) => {
                    if let Some(buf) = parser.text.as_mut() {
                        buf.push_str(&t.unescape()?);
                    }
                }
                Event::CData(c) => {
                    if let Some(buf) = parser.text.as_mut() {
                        buf.push_str(&String::from_utf8_lossy(&c.into_inner()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if parser.depth != 0 {
            return Err(ExtractError::Truncated { open: parser.depth });
        }
        if !parser.saw_suite {
            return Err(ExtractError::NotAReport);
        }

        debug!(testcases = parser.testcases.len(), "parsed JUnit report");
        Ok(Self {
            testcases: parser.testcases,
        })
    }
}

/// Which child of the current testcase is collecting text.
#[derive(Debug, Clone, Copy)]
enum Child {
    Failure,
    Error,
    SystemOut,
}

#[derive(Default)]
struct ReportParser {
    depth: usize,
    saw_suite: bool,
    testcases: Vec<TestCase>,
    current: Option<TestCase>,
    child: Option<Child>,
    message: String,
    text: Option<String>,
}

impl ReportParser {
    fn open(&mut self, e: &BytesStart<'_>) -> Result<(), ExtractError> {
        match e.name().as_ref() {
            b"testsuite" | b"testsuites" => self.saw_suite = true,
            b"testcase" => self.current = Some(read_testcase(e)?),
            name if self.current.is_some() && self.child.is_none() => {
                let child = match name {
                    b"failure" => Child::Failure,
                    b"error" => Child::Error,
                    b"system-out" => Child::SystemOut,
                    _ => return Ok(()),
                };
                self.message = attribute(e, b"message")?.unwrap_or_default();
                self.child = Some(child);
                self.text = Some(String::new());
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, name: &[u8]) {
        match name {
            b"testcase" => {
                if let Some(tc) = self.current.take() {
                    self.testcases.push(tc);
                }
                self.child = None;
                self.text = None;
            }
            b"failure" | b"error" | b"system-out" => self.finish_child(name),
            _ => {}
        }
    }

    fn finish_child(&mut self, name: &[u8]) {
        let (Some(child), Some(tc)) = (self.child, self.current.as_mut()) else {
            return;
        };
        let matches = matches!(
            (child, name),
            (Child::Failure, b"failure") | (Child::Error, b"error") | (Child::SystemOut, b"system-out")
        );
        if !matches {
            return;
        }

        let body = self.text.take().unwrap_or_default();
        let message = std::mem::take(&mut self.message);
        match child {
            Child::Failure => tc.failure = Some(Outcome { message, body }),
            Child::Error => tc.error = Some(Outcome { message, body }),
            Child::SystemOut => tc.system_out = Some(body),
        }
        self.child = None;
    }
}

fn read_testcase(e: &BytesStart<'_>) -> Result<TestCase, ExtractError> {
    let line = attribute(e, b"line")?.and_then(|raw| match raw.parse() {
        Ok(line) => Some(line),
        Err(_) => {
            debug!(line = %raw, "ignoring unparsable testcase line attribute");
            None
        }
    });
    Ok(TestCase {
        classname: attribute(e, b"classname")?.unwrap_or_default(),
        name: attribute(e, b"name")?.unwrap_or_default(),
        file: attribute(e, b"file")?,
        line,
        ..TestCase::default()
    })
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, ExtractError> {
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}
