use crate::compiler::CompilerSettings;
use crate::coverage::CoverageGoal;
use crate::sandbox::SandboxSettings;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration conflicts, raised eagerly before any execution.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("gcov-only measurement and test isolation are mutually exclusive")]
    GcovOnlyWithIsolation,
    #[error("sandbox-based isolation requires test isolation to be enabled")]
    SandboxWithoutIsolation,
}

/// Which coverage target a suite run seeks.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GoalSetting {
    #[default]
    Line,
    Branch,
    Condition,
    Function {
        name: String,
    },
}

impl GoalSetting {
    pub fn to_goal(&self) -> CoverageGoal {
        match self {
            GoalSetting::Line => CoverageGoal::CoverLine,
            GoalSetting::Branch => CoverageGoal::CoverBranch,
            GoalSetting::Condition => CoverageGoal::CoverCondition,
            GoalSetting::Function { name } => CoverageGoal::CoverFunction(name.clone()),
        }
    }

    /// Whether this goal seeks a specific target, as opposed to measuring
    /// overall coverage. Only function goals decide per-test success.
    pub fn is_seeking(&self) -> bool {
        matches!(self, GoalSetting::Function { .. })
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoverageSettings {
    /// Disable to run the suite without any coverage bookkeeping.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Plain gcov extraction only: no `.info` history, no instrumentation,
    /// no per-test isolation.
    #[serde(default)]
    pub use_gcov_only: bool,
    #[serde(default)]
    pub goal: GoalSetting,
    #[serde(default = "default_gcov_tool")]
    pub gcov_tool: String,
    #[serde(default = "default_lcov_tool")]
    pub lcov_tool: String,
}

fn default_true() -> bool {
    true
}

fn default_gcov_tool() -> String {
    "gcov".to_string()
}

fn default_lcov_tool() -> String {
    "lcov".to_string()
}

impl Default for CoverageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            use_gcov_only: false,
            goal: GoalSetting::default(),
            gcov_tool: default_gcov_tool(),
            lcov_tool: default_lcov_tool(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutionSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_harness_file")]
    pub harness_file: String,
    /// Stop the suite as soon as the sought goal is covered, or as soon as
    /// the running total reaches full coverage.
    #[serde(default)]
    pub stop_on_success: bool,
    /// Measure every test's coverage in isolation instead of cumulatively.
    #[serde(default)]
    pub isolate_tests: bool,
    /// Keep a per-test coverage snapshot list in the suite result.
    #[serde(default)]
    pub individual_test_coverage: bool,
}

fn default_timeout_ms() -> u64 {
    10_000
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./.covsuite_out")
}

fn default_harness_file() -> String {
    "harness.c".to_string()
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            output_dir: default_output_dir(),
            harness_file: default_harness_file(),
            stop_on_success: false,
            isolate_tests: false,
            individual_test_coverage: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    #[serde(default)]
    pub compiler: CompilerSettings,
    #[serde(default)]
    pub coverage: CoverageSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    /// Present only when runs should be contained by the external sandbox.
    #[serde(default)]
    pub sandbox: Option<SandboxSettings>,
}

impl SuiteConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: SuiteConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Checks the flag combinations are internally consistent. Called
    /// before any measurer is built or any test executed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coverage.use_gcov_only && self.execution.isolate_tests {
            return Err(ConfigError::GcovOnlyWithIsolation);
        }
        if self.sandbox.is_some() && !self.execution.isolate_tests {
            return Err(ConfigError::SandboxWithoutIsolation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = SuiteConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.coverage.enabled);
        assert_eq!(config.coverage.goal, GoalSetting::Line);
        assert_eq!(config.execution.timeout_ms, 10_000);
        assert_eq!(config.execution.harness_file, "harness.c");
    }

    #[test]
    fn gcov_only_conflicts_with_isolation() {
        let mut config = SuiteConfig::default();
        config.coverage.use_gcov_only = true;
        config.execution.isolate_tests = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::GcovOnlyWithIsolation)
        ));
    }

    #[test]
    fn sandbox_requires_isolation() {
        let mut config = SuiteConfig::default();
        config.sandbox = Some(SandboxSettings::default());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SandboxWithoutIsolation)
        ));

        config.execution.isolate_tests = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_round_trip_with_kebab_case_keys() {
        let toml_text = r#"
            [compiler]
            cc = "clang"
            c-standard = "c11"

            [coverage]
            use-gcov-only = true
            goal = "branch"

            [execution]
            timeout-ms = 500
            stop-on-success = true
        "#;
        let config: SuiteConfig = toml::from_str(toml_text).expect("valid config must parse");
        assert_eq!(config.compiler.cc, "clang");
        assert_eq!(config.compiler.c_standard, "c11");
        assert!(config.coverage.use_gcov_only);
        assert_eq!(config.coverage.goal, GoalSetting::Branch);
        assert_eq!(config.execution.timeout_ms, 500);
        assert!(config.execution.stop_on_success);
        assert!(config.sandbox.is_none());
    }

    #[test]
    fn function_goal_parses_with_a_name() {
        let toml_text = r#"
            [coverage]
            goal = { function = { name = "target" } }
        "#;
        let config: SuiteConfig = toml::from_str(toml_text).expect("function goal must parse");
        assert_eq!(
            config.coverage.goal,
            GoalSetting::Function {
                name: "target".to_string()
            }
        );
        assert!(config.coverage.goal.is_seeking());
        assert!(!GoalSetting::Line.is_seeking());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let toml_text = r#"
            [execution]
            timeout-ms = 100
            not-a-field = true
        "#;
        assert!(
            toml::from_str::<SuiteConfig>(toml_text).is_err(),
            "deny_unknown_fields must reject typos"
        );
    }
}
