//! Transformer backed by a warm helper process.
//!
//! The helper is started on first use and then kept running for the rest of
//! the session. Each conversion is one line each way:
//!
//! ```text
//! stdin:  <lat> <lon> <obstime>\n
//! stdout: <x>, <y>\n
//! ```
//!
//! If the helper exits or the pipe breaks it is dropped and the next
//! conversion starts a new one.

use super::{Point, TransformError, Transformer};
use crate::protocol;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, warn};

/// Transformer that forwards conversions to an external program.
pub struct ProcessTransformer {
    command: String,
    args: Vec<String>,
    helper: Option<Helper>,
}

impl ProcessTransformer {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            helper: None,
        }
    }
}

impl Transformer for ProcessTransformer {
    fn convert(&mut self, lat: f64, lon: f64, obstime: &str) -> Result<Point, TransformError> {
        let mut helper = match self.helper.take() {
            Some(helper) => helper,
            None => Helper::spawn(&self.command, &self.args)?,
        };

        let result = helper.exchange(lat, lon, obstime);
        match &result {
            Err(e) if e.is_fatal() => {
                warn!(pid = helper.child.id(), error = %e, "Dropping transformer helper");
            }
            _ => self.helper = Some(helper),
        }
        result
    }
}

/// A running helper process and its pipes.
struct Helper {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    line: String,
}

impl Helper {
    fn spawn(command: &str, args: &[String]) -> Result<Self, TransformError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| TransformError::Spawn(command.to_string(), e))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TransformError::Exited);
        };

        debug!(pid = child.id(), command, "Started transformer helper");

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            line: String::with_capacity(64),
        })
    }

    fn exchange(&mut self, lat: f64, lon: f64, obstime: &str) -> Result<Point, TransformError> {
        writeln!(self.stdin, "{lat} {lon} {obstime}")?;
        self.stdin.flush()?;

        self.line.clear();
        if self.stdout.read_line(&mut self.line)? == 0 {
            return Err(TransformError::Exited);
        }

        protocol::parse_point(&self.line)
            .map_err(|_| TransformError::InvalidOutput(self.line.trim_end().to_string()))
    }
}

impl Drop for Helper {
    fn drop(&mut self) {
        // The helper may already be gone; reaping is all that matters here.
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
