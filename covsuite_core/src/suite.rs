use crate::compiler::MachineModel;
use crate::config::{ConfigError, SuiteConfig};
use crate::coverage::CoverageSnapshot;
use crate::executor::{ExecutionResult, Verdict};
use crate::measure::{Measurer, MeasureError, build_measurer};
use crate::vector::{SuiteError, TestVector, parse_suite};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Fatal, suite-level failures: these unwind out of [`SuiteExecutor::run`]
/// untouched. Everything else is degraded inside the measurer and the loop
/// continues to the next test.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error(transparent)]
    Suite(#[from] SuiteError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Measure(#[from] MeasureError),
    #[error("Failed to prepare output directory {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The aggregate state of one full suite run.
///
/// Mutated incrementally by the orchestrator while tests execute, read-only
/// to callers once `run` returns. Vectors, results and per-test snapshots
/// share one ordering: index `i` everywhere refers to the i-th executed
/// test.
#[derive(Debug, Default, Serialize)]
pub struct SuiteExecutionResult {
    pub vectors: Vec<TestVector>,
    pub results: Vec<ExecutionResult>,
    /// Per-test snapshots, kept only when individual test coverage was
    /// requested in the configuration.
    pub per_test_coverage: Option<Vec<Option<CoverageSnapshot>>>,
    pub total_coverage: CoverageSnapshot,
    /// Cumulative coverage percentage after each test, in execution order.
    pub coverage_series: Vec<f64>,
    /// Indices of the tests classified successful.
    pub successful: Vec<usize>,
}

impl SuiteExecutionResult {
    pub fn successful_tests(&self) -> impl Iterator<Item = &TestVector> {
        self.successful.iter().map(|&index| &self.vectors[index])
    }
}

/// Top-level orchestrator: parses the suite archive, builds exactly one
/// measurer for the run, iterates test vectors in archive order and applies
/// the early-stop policies.
pub struct SuiteExecutor {
    config: SuiteConfig,
    /// Injected measurer for the next run, used by tests; a fresh measurer
    /// is built per run otherwise.
    injected: Option<Box<dyn Measurer>>,
}

impl SuiteExecutor {
    /// Validates the configuration eagerly; incompatible flag combinations
    /// fail here, before any test is executed.
    pub fn new(config: SuiteConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            injected: None,
        })
    }

    /// An executor that uses `measurer` for its next run instead of
    /// building one from the configuration.
    pub fn with_measurer(
        config: SuiteConfig,
        measurer: Box<dyn Measurer>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            injected: Some(measurer),
        })
    }

    /// Executes the whole suite against `program`.
    ///
    /// One test vector is compiled/run/measured fully before the next
    /// begins; coverage-data files are write-once-per-run artifacts and must
    /// not be clobbered by overlapping runs.
    pub fn run(
        &mut self,
        program: &Path,
        suite_archive: &Path,
        machine_model: MachineModel,
    ) -> Result<SuiteExecutionResult, ExecutionError> {
        let output_dir = self.config.execution.output_dir.clone();
        fs::create_dir_all(&output_dir).map_err(|source| ExecutionError::OutputDir {
            path: output_dir.clone(),
            source,
        })?;

        let mut measurer = match self.injected.take() {
            Some(measurer) => measurer,
            None => build_measurer(&self.config, machine_model)?,
        };

        let suite = parse_suite(suite_archive)?;
        if let Some(bitness) = suite.metadata.bitness()
            && bitness != machine_model.bitness()
        {
            warn!(
                suite_bitness = bitness,
                requested_bitness = machine_model.bitness(),
                "suite metadata architecture does not match the requested machine model"
            );
        }

        let seeking = self.config.coverage.enabled && self.config.coverage.goal.is_seeking();
        let stop_on_success = self.config.execution.stop_on_success;

        let mut accumulator = SuiteExecutionResult {
            per_test_coverage: self
                .config
                .execution
                .individual_test_coverage
                .then(Vec::new),
            total_coverage: CoverageSnapshot::new("total", 0, 0),
            ..Default::default()
        };

        for vector in suite.vectors {
            let measured = measurer.measure(program, &vector)?;
            let covers = measured.result.verdict == Verdict::Covers;

            if let Some(snapshot) = &measured.coverage {
                accumulator.total_coverage.merge(snapshot);
            }
            if let Some(per_test) = accumulator.per_test_coverage.as_mut() {
                per_test.push(measured.coverage.clone());
            }
            accumulator
                .coverage_series
                .push(accumulator.total_coverage.percent());

            let index = accumulator.vectors.len();
            info!(
                test = %vector.name,
                verdict = ?measured.result.verdict,
                cumulative_percent = accumulator.total_coverage.percent(),
                "test recorded"
            );
            accumulator.vectors.push(vector);
            accumulator.results.push(measured.result);

            // Without a specific goal every executed test counts as
            // successful; with one, only tests that cover it do.
            if !seeking || covers {
                accumulator.successful.push(index);
            }

            if stop_on_success && seeking && covers {
                info!("goal covered, stopping early");
                break;
            }
            if stop_on_success && accumulator.total_coverage.is_full() {
                info!("full coverage reached, stopping early");
                break;
            }
        }

        Ok(accumulator)
    }
}
