//! Subprocess invocation layer
//!
//! Runs a named external command with arguments, a hard timeout, and optional
//! working-directory/environment control, capturing exit code and both output
//! streams. This layer does NOT reinterpret results: a non-zero exit from the
//! callee is reported as data, never as an invoker failure - the bridge
//! decides policy.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Maximum captured bytes per output stream
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// A request to run one external command
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Program followed by its arguments; must be non-empty
    pub argv: Vec<String>,
    /// Hard deadline; the child is killed on expiry
    pub timeout: Duration,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl InvokeRequest {
    pub fn new<S: Into<String>>(argv: impl IntoIterator<Item = S>, timeout: Duration) -> Self {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            timeout,
            cwd: None,
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Rendering used in logs
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Completed invocation. Present even for non-zero exits.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub exit_code: i32,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
    pub duration: Duration,
}

impl Invocation {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Failures of the invoker itself, as opposed to the invoked program
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    #[error("binary not found: {0}")]
    NotFound(String),

    #[error("timed out after {0:?}: {1}")]
    Timeout(Duration, String),

    #[error("empty command")]
    EmptyCommand,

    #[error("io error running {0}: {1}")]
    Io(String, String),
}

/// The seam between the bridge and the operating system. Implemented by
/// [`ProcessInvoker`] in production and [`FakeInvoker`] in tests.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn run(&self, request: InvokeRequest) -> Result<Invocation, InvokeError>;
}

/// Real invoker backed by `tokio::process`
#[derive(Debug, Default)]
pub struct ProcessInvoker;

impl ProcessInvoker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Invoker for ProcessInvoker {
    async fn run(&self, request: InvokeRequest) -> Result<Invocation, InvokeError> {
        let (program, args) = request
            .argv
            .split_first()
            .ok_or(InvokeError::EmptyCommand)?;

        debug!("invoking: {}", request.display());

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &request.env {
            command.env(key, value);
        }

        let start = Instant::now();
        let output = match tokio::time::timeout(request.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(InvokeError::NotFound(program.clone()));
            }
            Ok(Err(e)) => {
                return Err(InvokeError::Io(program.clone(), e.to_string()));
            }
            Err(_) => {
                // kill_on_drop reaps the child when the future is dropped
                return Err(InvokeError::Timeout(request.timeout, request.display()));
            }
        };

        let (stdout, stdout_truncated) = truncate_output(&output.stdout);
        let (stderr, stderr_truncated) = truncate_output(&output.stderr);

        Ok(Invocation {
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stdout_truncated,
            stderr,
            stderr_truncated,
            duration: start.elapsed(),
        })
    }
}

/// Truncate captured output to the per-stream cap
fn truncate_output(bytes: &[u8]) -> (String, bool) {
    let truncated = bytes.len() > MAX_OUTPUT_BYTES;
    let slice = if truncated {
        &bytes[..MAX_OUTPUT_BYTES]
    } else {
        bytes
    };
    (String::from_utf8_lossy(slice).to_string(), truncated)
}

/// Scripted invoker for tests: returns pre-defined outcomes in order and
/// records every request it receives.
pub struct FakeInvoker {
    outcomes: std::sync::Mutex<Vec<Result<Invocation, InvokeError>>>,
    requests: std::sync::Mutex<Vec<InvokeRequest>>,
}

impl FakeInvoker {
    /// Create a fake with a script of outcomes. Once the script is exhausted,
    /// the last outcome repeats.
    pub fn new(outcomes: Vec<Result<Invocation, InvokeError>>) -> Self {
        Self {
            outcomes: std::sync::Mutex::new(outcomes),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// A fake that always succeeds with the given stdout
    pub fn always_stdout(stdout: impl Into<String>) -> Self {
        Self::new(vec![Ok(ok_invocation(stdout))])
    }

    /// A fake that always fails with the given error
    pub fn always_error(error: InvokeError) -> Self {
        Self::new(vec![Err(error)])
    }

    /// A fake that always exits non-zero with the given stderr
    pub fn always_nonzero(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self::new(vec![Ok(Invocation {
            exit_code,
            stdout: String::new(),
            stdout_truncated: false,
            stderr: stderr.into(),
            stderr_truncated: false,
            duration: Duration::from_millis(1),
        })])
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// All argv vectors seen so far
    pub fn seen_argv(&self) -> Vec<Vec<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.argv.clone())
            .collect()
    }

    /// Env maps seen so far
    pub fn seen_env(&self) -> Vec<HashMap<String, String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.env.clone())
            .collect()
    }
}

/// Helper for building a successful invocation in tests
pub fn ok_invocation(stdout: impl Into<String>) -> Invocation {
    Invocation {
        exit_code: 0,
        stdout: stdout.into(),
        stdout_truncated: false,
        stderr: String::new(),
        stderr_truncated: false,
        duration: Duration::from_millis(1),
    }
}

#[async_trait]
impl Invoker for FakeInvoker {
    async fn run(&self, request: InvokeRequest) -> Result<Invocation, InvokeError> {
        self.requests.lock().unwrap().push(request);

        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            return Err(InvokeError::EmptyCommand);
        }
        if outcomes.len() == 1 {
            outcomes[0].clone()
        } else {
            outcomes.remove(0)
        }
    }
}
