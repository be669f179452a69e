use crate::coverage::{self, CoverageGoal, CoverageSnapshot};
use crate::executor::{ExecutionResult, ExecutorError, ProcessRunner, Verdict};
use crate::vector::TestVector;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

/// One measured test execution: the run outcome plus the coverage delta the
/// run produced, when coverage could be extracted.
#[derive(Debug, Clone)]
pub struct MeasuredRun {
    pub result: ExecutionResult,
    pub coverage: Option<CoverageSnapshot>,
}

/// Fatal measurement failures. Coverage-extraction problems are *not* here:
/// they degrade to a missing snapshot with a warning, per the suite's
/// failure semantics. Only compilation and unrecoverable I/O propagate.
#[derive(Error, Debug)]
pub enum MeasureError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("Failed to prepare instrumented source for {path:?}: {source}")]
    Instrument {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Wraps a `ProcessRunner::run` call with before/after coverage bookkeeping.
pub trait Measurer {
    fn name(&self) -> &'static str;

    fn measure(
        &mut self,
        program: &Path,
        vector: &TestVector,
    ) -> Result<MeasuredRun, MeasureError>;
}

/// Execution without any coverage bookkeeping.
pub struct PlainMeasurer {
    runner: ProcessRunner,
}

impl PlainMeasurer {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }
}

impl Measurer for PlainMeasurer {
    fn name(&self) -> &'static str {
        "PlainMeasurer"
    }

    fn measure(
        &mut self,
        program: &Path,
        vector: &TestVector,
    ) -> Result<MeasuredRun, MeasureError> {
        let result = self.runner.run(program, Some(vector))?;
        Ok(MeasuredRun {
            result,
            coverage: None,
        })
    }
}

/// gcov-only measurement: after each non-aborted run, locate the single
/// coverage-data file the toolchain wrote, dump it with the external gcov
/// tool and parse the text against the goal.
pub struct GcovMeasurer {
    runner: ProcessRunner,
    goal: CoverageGoal,
    gcov_tool: String,
    /// Label-line map for instrumented sources, set by the lcov layer.
    label_lines: Option<HashMap<String, usize>>,
}

impl GcovMeasurer {
    pub fn new(runner: ProcessRunner, goal: CoverageGoal, gcov_tool: String) -> Self {
        Self {
            runner,
            goal,
            gcov_tool,
            label_lines: None,
        }
    }

    /// Finds the single `.gcda` candidate for the last run. The build
    /// output directory is checked first; some gcc versions ignore output
    /// redirection and drop the file in the process working directory, so
    /// that is the documented fallback. Zero candidates means no coverage
    /// is available; more than one is ambiguous. Both degrade, never fail.
    fn locate_data_file(&self) -> Option<PathBuf> {
        let candidates = gcda_candidates(self.runner.work_dir());
        let candidates = if candidates.is_empty() {
            let cwd = std::env::current_dir().ok()?;
            gcda_candidates(&cwd)
        } else {
            candidates
        };
        match candidates.len() {
            0 => {
                debug!("no coverage-data file produced by this run");
                None
            }
            1 => Some(candidates.into_iter().next().unwrap_or_default()),
            n => {
                warn!(count = n, "ambiguous coverage-data files, skipping extraction");
                None
            }
        }
    }

    /// Dumps and parses coverage for the last run. All failures degrade to
    /// `None` with a warning.
    fn extract_coverage(&self) -> Option<CoverageSnapshot> {
        let data_file = self.locate_data_file()?;
        let dump = Command::new(&self.gcov_tool)
            .arg("-t")
            .arg(&data_file)
            .current_dir(self.runner.work_dir())
            .output();
        let dump = match dump {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            Ok(output) => {
                warn!(code = ?output.status.code(), "gcov dump tool failed, no coverage for this run");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "could not invoke gcov dump tool");
                return None;
            }
        };
        let mut snapshot = coverage::parse_gcov(&dump, &self.goal, self.label_lines.as_ref());
        snapshot.label = data_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| snapshot.label.clone());
        Some(snapshot)
    }
}

impl Measurer for GcovMeasurer {
    fn name(&self) -> &'static str {
        "GcovMeasurer"
    }

    fn measure(
        &mut self,
        program: &Path,
        vector: &TestVector,
    ) -> Result<MeasuredRun, MeasureError> {
        let result = self.runner.run(program, Some(vector))?;
        if result.aborted || result.verdict == Verdict::Error {
            // Aborted runs are excluded from coverage computation.
            return Ok(MeasuredRun {
                result,
                coverage: None,
            });
        }
        let coverage = self.extract_coverage();
        Ok(MeasuredRun { result, coverage })
    }
}

/// lcov-mode measurement: gcov extraction plus a cumulative `.info`-format
/// history file per harness, source pre-instrumentation for branch-style
/// goals, and optional per-test isolation of the coverage-data file.
pub struct LcovMeasurer {
    inner: GcovMeasurer,
    lcov_tool: String,
    info_dir: PathBuf,
    /// Deletes the per-test data file right after extraction so each test's
    /// coverage is measured in isolation rather than cumulatively.
    individual_runs: bool,
    /// Instrumented copies, keyed by the original (uninstrumented) program
    /// path. Owned by this measurer, so unrelated suite runs never share it.
    instrumented: HashMap<PathBuf, (PathBuf, HashMap<String, usize>)>,
}

impl LcovMeasurer {
    pub fn new(
        inner: GcovMeasurer,
        lcov_tool: String,
        individual_runs: bool,
    ) -> Self {
        let info_dir = inner.runner.work_dir().join("info_files");
        Self {
            inner,
            lcov_tool,
            info_dir,
            individual_runs,
            instrumented: HashMap::new(),
        }
    }

    /// The program path to actually compile and run: the memoized
    /// instrumented copy for goals that need labeled markers, the original
    /// otherwise. Instrumentation happens exactly once per distinct source.
    fn effective_program(&mut self, program: &Path) -> Result<PathBuf, MeasureError> {
        if !self.inner.goal.requires_instrumentation() {
            return Ok(program.to_path_buf());
        }
        if let Some((instrumented_path, labels)) = self.instrumented.get(program) {
            self.inner.label_lines = Some(labels.clone());
            return Ok(instrumented_path.clone());
        }

        let source = fs::read_to_string(program).map_err(|source| MeasureError::Instrument {
            path: program.to_path_buf(),
            source,
        })?;
        let (instrumented_source, labels) = coverage::instrument(&source);
        let stem = program
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("program");
        let instrumented_path = self
            .inner
            .runner
            .work_dir()
            .join(format!("{stem}.instrumented.c"));
        fs::write(&instrumented_path, instrumented_source).map_err(|source| {
            MeasureError::Instrument {
                path: instrumented_path.clone(),
                source,
            }
        })?;

        self.inner.label_lines = Some(labels.clone());
        self.instrumented
            .insert(program.to_path_buf(), (instrumented_path.clone(), labels));
        Ok(instrumented_path)
    }

    /// Captures the cumulative coverage history into a per-test `.info`
    /// file. History failures degrade with a warning.
    fn record_info_file(&self, test_name: &str) {
        if let Err(e) = fs::create_dir_all(&self.info_dir) {
            warn!(error = %e, "could not create info_files directory");
            return;
        }
        let info_file = self.info_dir.join(format!("{test_name}.info"));
        let captured = Command::new(&self.lcov_tool)
            .arg("--capture")
            .arg("--directory")
            .arg(self.inner.runner.work_dir())
            .arg("--output-file")
            .arg(&info_file)
            .output();
        match captured {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                warn!(code = ?output.status.code(), "lcov capture failed, no history for this test");
            }
            Err(e) => warn!(error = %e, "could not invoke lcov tool"),
        }
    }

    fn discard_data_file(&self) {
        if let Some(data_file) = self.inner.locate_data_file()
            && let Err(e) = fs::remove_file(&data_file)
        {
            warn!(file = %data_file.display(), error = %e, "could not remove per-test coverage data");
        }
    }
}

impl Measurer for LcovMeasurer {
    fn name(&self) -> &'static str {
        "LcovMeasurer"
    }

    fn measure(
        &mut self,
        program: &Path,
        vector: &TestVector,
    ) -> Result<MeasuredRun, MeasureError> {
        let effective = self.effective_program(program)?;
        let mut measured = self.inner.measure(&effective, vector)?;

        if !measured.result.aborted && measured.result.verdict != Verdict::Error {
            self.record_info_file(&vector.name);
        }

        // A function goal is decided per test: at least one recorded hit of
        // the target with a nonzero target count marks this run COVERS.
        if self.inner.goal.target_function().is_some()
            && let Some(snapshot) = &measured.coverage
            && snapshot.total > 0
            && snapshot.hits > 0
        {
            measured.result.verdict = Verdict::Covers;
        }

        if self.individual_runs {
            self.discard_data_file();
        }
        Ok(measured)
    }
}

/// Builds the one measurer instance for a whole suite run, encoding the
/// legal flag combinations in one place: gcov-only measurement excludes
/// test isolation, and the sandbox requires it.
pub fn build_measurer(
    config: &crate::config::SuiteConfig,
    machine_model: crate::compiler::MachineModel,
) -> Result<Box<dyn Measurer>, crate::config::ConfigError> {
    config.validate()?;

    let goal = config
        .coverage
        .enabled
        .then(|| config.coverage.goal.to_goal());
    let runner = ProcessRunner::new(
        crate::compiler::Compiler::new(config.compiler.clone(), machine_model),
        goal.clone(),
        std::time::Duration::from_millis(config.execution.timeout_ms),
        config.execution.output_dir.clone(),
        config.execution.harness_file.clone(),
        config.sandbox.clone(),
    );

    let Some(goal) = goal else {
        return Ok(Box::new(PlainMeasurer::new(runner)));
    };
    let gcov = GcovMeasurer::new(runner, goal, config.coverage.gcov_tool.clone());
    if config.coverage.use_gcov_only {
        return Ok(Box::new(gcov));
    }
    Ok(Box::new(LcovMeasurer::new(
        gcov,
        config.coverage.lcov_tool.clone(),
        config.execution.isolate_tests,
    )))
}

fn gcda_candidates(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "gcda"))
        .collect();
    candidates.sort();
    candidates
}
