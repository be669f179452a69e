use crate::compiler::{CompilationError, Compiler};
use crate::coverage::CoverageGoal;
use crate::harness;
use crate::sandbox::{self, SandboxSettings};
use crate::vector::TestVector;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// A single test's outcome relative to the suite's goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    /// Ran to completion with no goal sought (or goal not yet decided).
    Unknown,
    /// Killed by timeout, signal or resource limit; excluded from coverage.
    Aborted,
    /// The run could not be performed at all (e.g. executable missing).
    Error,
    /// The sought coverage goal was reached by this test.
    Covers,
}

/// Captured outcome of one run. Owned by the run that produced it and never
/// mutated after the sandbox wrapper's measurements (if any) are applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub wall_time: Duration,
    pub cpu_time: Option<Duration>,
    pub peak_memory: Option<u64>,
    pub aborted: bool,
    pub verdict: Verdict,
}

impl ExecutionResult {
    /// A result for a run that could not be performed at all.
    pub fn failed_to_run() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            wall_time: Duration::ZERO,
            cpu_time: None,
            peak_memory: None,
            aborted: false,
            verdict: Verdict::Error,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Compile(#[from] CompilationError),
    #[error("Failed to read program source {path:?}: {source}")]
    ReadProgram {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write harness {path:?}: {source}")]
    WriteHarness {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Executes compiled harnesses against test vectors.
///
/// The harness is synthesized and compiled lazily, exactly once per distinct
/// program path, and the compiled executable is reused for every subsequent
/// run. The cache is keyed by the original program path and lives for this
/// runner instance (one suite run); the compiled binary is read-only shared
/// state across runs.
pub struct ProcessRunner {
    compiler: Compiler,
    goal: Option<CoverageGoal>,
    timeout: Duration,
    work_dir: PathBuf,
    harness_file: String,
    sandbox: Option<SandboxSettings>,
    compiled: HashMap<PathBuf, PathBuf>,
}

impl ProcessRunner {
    pub fn new(
        compiler: Compiler,
        goal: Option<CoverageGoal>,
        timeout: Duration,
        work_dir: PathBuf,
        harness_file: String,
        sandbox: Option<SandboxSettings>,
    ) -> Self {
        Self {
            compiler,
            goal,
            timeout,
            work_dir,
            harness_file,
            sandbox,
            compiled: HashMap::new(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn harness_file(&self) -> &str {
        &self.harness_file
    }

    /// Whether a program has already been compiled by this runner.
    pub fn is_compiled(&self, program: &Path) -> bool {
        self.compiled.contains_key(program)
    }

    /// The compiled executable for `program`, compiling harness + program on
    /// the first request and reusing the cached path afterwards.
    ///
    /// The harness is always synthesized in its stdin-sourced form here; the
    /// embedded-vector form would tie the binary to one test and defeat the
    /// compile-once cache.
    pub fn executable_for(&mut self, program: &Path) -> Result<PathBuf, ExecutorError> {
        if let Some(executable) = self.compiled.get(program) {
            return Ok(executable.clone());
        }

        let source = fs::read_to_string(program).map_err(|source| ExecutorError::ReadProgram {
            path: program.to_path_buf(),
            source,
        })?;
        let harness_source = harness::synthesize(&source, None);
        let harness_path = self.work_dir.join(&self.harness_file);
        fs::write(&harness_path, harness_source).map_err(|source| {
            ExecutorError::WriteHarness {
                path: harness_path.clone(),
                source,
            }
        })?;

        let stem = program
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("target");
        let executable = self.work_dir.join(format!("{stem}.out"));
        self.compiler.compile(
            program,
            &harness_path,
            &executable,
            self.goal.as_ref(),
            &self.work_dir,
        )?;
        self.compiled
            .insert(program.to_path_buf(), executable.clone());
        Ok(executable)
    }

    /// Runs `program` against `vector`, feeding the vector's newline-joined
    /// values on standard input (independent of how the harness sources its
    /// inputs). A missing executable yields a result with verdict `Error`
    /// rather than an error; a timeout kill yields `Aborted`.
    pub fn run(
        &mut self,
        program: &Path,
        vector: Option<&TestVector>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let executable = self.executable_for(program)?;
        if !executable.is_file() {
            warn!(executable = %executable.display(), "compiled executable missing, cannot run");
            return Ok(ExecutionResult::failed_to_run());
        }

        let stdin_payload = vector.map(|v| v.stdin_payload());
        let target_argv = vec![executable.to_string_lossy().into_owned()];
        let argv = match &self.sandbox {
            Some(sandbox) => sandbox.wrap_command(&target_argv, &self.work_dir),
            None => target_argv,
        };

        let mut result = self.execute_raw(&argv, stdin_payload.as_deref());

        if let Some(sandbox) = &self.sandbox {
            let log_path = self.work_dir.join(&sandbox.log_file);
            let log_text = fs::read_to_string(&log_path).ok();
            let diagnostics =
                format!("{}\n{}", result.stdout, log_text.as_deref().unwrap_or(""));
            if !sandbox::apply_wrapper_measurements(&diagnostics, &mut result) {
                warn!("sandbox wrapper produced no diagnostics, keeping runner measurements");
            }
            // The wrapper's own chatter is not the target's output; the
            // captured log is, so stdout means the same thing with and
            // without isolation.
            if let Some(log_text) = log_text {
                result.stdout = log_text;
            }
        }
        Ok(result)
    }

    /// Spawns `argv` with piped stdio, enforcing the wall-clock timeout.
    /// Spawn-level failures degrade to a verdict-`Error` result; nonzero
    /// exit is informational only, never a failure by itself.
    pub fn execute_raw(&self, argv: &[String], stdin_payload: Option<&str>) -> ExecutionResult {
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let started = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %argv[0], error = %e, "failed to spawn target");
                return ExecutionResult::failed_to_run();
            }
        };

        if let Some(mut child_stdin) = child.stdin.take() {
            if let Some(payload) = stdin_payload {
                // A target that never reads its input may already have
                // exited; a broken pipe here is not a failure.
                let _ = child_stdin.write_all(payload.as_bytes());
            }
            drop(child_stdin);
        }

        let stdout_reader = spawn_pipe_reader(child.stdout.take());
        let stderr_reader = spawn_pipe_reader(child.stderr.take());

        let deadline = (self.timeout > Duration::ZERO).then(|| started + self.timeout);
        let wait_outcome = wait_with_timeout(&mut child, deadline);
        let wall_time = started.elapsed();

        // Killing the direct child leaves forked descendants alive, and they
        // hold the inherited pipe write ends open. The readers are bounded
        // by the deadline so an orphan cannot stall the run.
        let grace = deadline
            .map(|d| d.saturating_duration_since(Instant::now()).max(PIPE_READER_GRACE));
        let stdout = collect_pipe_output(stdout_reader, grace);
        let stderr = collect_pipe_output(stderr_reader, grace);

        match wait_outcome {
            WaitOutcome::Exited(status) => {
                let exit_code = status.code();
                // No code on Unix means the process was killed by a signal.
                let signaled = exit_code.is_none();
                if let Some(code) = exit_code
                    && code != 0
                {
                    // Nonzero exit is expected for many negative tests.
                    info!(code, "target exited nonzero");
                }
                ExecutionResult {
                    stdout,
                    stderr,
                    exit_code,
                    wall_time,
                    cpu_time: None,
                    peak_memory: None,
                    aborted: signaled,
                    verdict: if signaled {
                        Verdict::Aborted
                    } else {
                        Verdict::Unknown
                    },
                }
            }
            WaitOutcome::TimedOut => {
                info!(timeout = ?self.timeout, "target exceeded wall-clock timeout, killed");
                ExecutionResult {
                    stdout,
                    stderr,
                    exit_code: None,
                    wall_time,
                    cpu_time: None,
                    peak_memory: None,
                    aborted: true,
                    verdict: Verdict::Aborted,
                }
            }
            WaitOutcome::WaitFailed => ExecutionResult::failed_to_run(),
        }
    }

}

enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
    WaitFailed,
}

/// How long the pipe readers may keep draining once the deadline has passed.
const PIPE_READER_GRACE: Duration = Duration::from_millis(200);

fn wait_with_timeout(child: &mut Child, deadline: Option<Instant>) -> WaitOutcome {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return WaitOutcome::Exited(status),
            Ok(None) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    if let Err(e) = child.kill() {
                        warn!(error = %e, "failed to kill timed-out target");
                        return WaitOutcome::WaitFailed;
                    }
                    let _ = child.wait();
                    return WaitOutcome::TimedOut;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                warn!(error = %e, "error waiting for target");
                return WaitOutcome::WaitFailed;
            }
        }
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<mpsc::Receiver<String>> {
    pipe.map(|mut reader| {
        let (sender, receiver) = mpsc::channel();
        std::thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = reader.read_to_end(&mut bytes);
            let _ = sender.send(String::from_utf8_lossy(&bytes).into_owned());
        });
        receiver
    })
}

/// Collects one reader's output, waiting at most `grace` when a deadline is
/// in force. An abandoned reader thread finishes on its own once the last
/// pipe holder exits.
fn collect_pipe_output(
    receiver: Option<mpsc::Receiver<String>>,
    grace: Option<Duration>,
) -> String {
    let Some(receiver) = receiver else {
        return String::new();
    };
    match grace {
        Some(grace) => receiver.recv_timeout(grace).unwrap_or_default(),
        None => receiver.recv().unwrap_or_default(),
    }
}
