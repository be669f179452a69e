pub mod compiler;
pub mod config;
pub mod coverage;
pub mod executor;
pub mod harness;
pub mod measure;
pub mod sandbox;
pub mod suite;
pub mod vector;

pub use compiler::{CompilationError, Compiler, CompilerErrorKind, CompilerSettings, MachineModel};
pub use config::{ConfigError, GoalSetting, SuiteConfig};
pub use coverage::{CoverageGoal, CoverageSnapshot};
pub use executor::{ExecutionResult, ExecutorError, ProcessRunner, Verdict};
pub use measure::{MeasureError, MeasuredRun, Measurer, build_measurer};
pub use sandbox::SandboxSettings;
pub use suite::{ExecutionError, SuiteExecutionResult, SuiteExecutor};
pub use vector::{ParsedSuite, SuiteError, SuiteMetadata, TestVector, parse_suite};
