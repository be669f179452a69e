use crate::coverage::CoverageGoal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::debug;

/// Machine model the target is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachineModel {
    Bits32,
    #[default]
    Bits64,
}

impl MachineModel {
    pub fn flag(&self) -> &'static str {
        match self {
            MachineModel::Bits32 => "-m32",
            MachineModel::Bits64 => "-m64",
        }
    }

    pub fn bitness(&self) -> u32 {
        match self {
            MachineModel::Bits32 => 32,
            MachineModel::Bits64 => 64,
        }
    }
}

/// Coarse classification of a failed compiler invocation, derived from its
/// stderr by an ordered substring-rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerErrorKind {
    /// The toolchain binary itself could not be found or executed.
    MissingToolchain,
    /// The invocation was rejected before compilation (bad flag/argument).
    BadInvocation,
    /// The program or harness source failed to compile or link.
    SourceError,
    /// Phrasing not covered by the rule table. New compiler versions land
    /// here instead of being silently miscategorized.
    Unclassified,
}

/// Stderr classification rules, evaluated in priority order; the first
/// matching substring wins. This is policy data carried over from observed
/// gcc/clang phrasings, not a complete taxonomy.
pub const STDERR_RULES: &[(&str, CompilerErrorKind)] = &[
    ("command not found", CompilerErrorKind::MissingToolchain),
    ("unrecognized command-line option", CompilerErrorKind::BadInvocation),
    ("unknown argument", CompilerErrorKind::BadInvocation),
    ("invalid argument", CompilerErrorKind::BadInvocation),
    ("undefined reference", CompilerErrorKind::SourceError),
    ("error:", CompilerErrorKind::SourceError),
];

/// Classifies captured compiler stderr against [`STDERR_RULES`].
pub fn classify_stderr(stderr: &str) -> CompilerErrorKind {
    for (needle, kind) in STDERR_RULES {
        if stderr.contains(needle) {
            return *kind;
        }
    }
    CompilerErrorKind::Unclassified
}

/// A fatal compiler failure; stderr is carried verbatim (indented for
/// display) and surfaced to the caller.
#[derive(Error, Debug)]
pub enum CompilationError {
    #[error("Compiler exited with {code:?}:\n{stderr}")]
    Failed {
        code: Option<i32>,
        kind: CompilerErrorKind,
        stderr: String,
    },
    #[error("Failed to invoke compiler '{command}': {source}")]
    Invocation {
        command: String,
        source: std::io::Error,
    },
}

/// Settings for the native C toolchain invocation.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CompilerSettings {
    #[serde(default = "default_cc")]
    pub cc: String,
    #[serde(default = "default_c_standard")]
    pub c_standard: String,
}

fn default_cc() -> String {
    "gcc".to_string()
}

fn default_c_standard() -> String {
    "gnu11".to_string()
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            cc: default_cc(),
            c_standard: default_c_standard(),
        }
    }
}

/// Compiles program + harness into one executable.
#[derive(Debug, Clone)]
pub struct Compiler {
    pub settings: CompilerSettings,
    pub machine_model: MachineModel,
}

impl Compiler {
    pub fn new(settings: CompilerSettings, machine_model: MachineModel) -> Self {
        Self {
            settings,
            machine_model,
        }
    }

    /// The full compiler argv for one link of program + harness.
    ///
    /// `-Wno-attributes` and the `__alias__` macro neutralization are needed
    /// because the synthesized declarations may redeclare attributed symbols
    /// from the included program. Coverage goals add `--coverage -DGCOV`.
    pub fn build_command(
        &self,
        program: &Path,
        harness: &Path,
        output: &Path,
        goal: Option<&CoverageGoal>,
    ) -> Vec<String> {
        let mut argv = vec![
            self.settings.cc.clone(),
            format!("-std={}", self.settings.c_standard),
            self.machine_model.flag().to_string(),
            "-Wno-attributes".to_string(),
            "-D__alias__(x)=".to_string(),
        ];
        if goal.is_some() {
            argv.push("--coverage".to_string());
            argv.push("-DGCOV".to_string());
        }
        argv.push("-include".to_string());
        argv.push(program.to_string_lossy().into_owned());
        argv.push(harness.to_string_lossy().into_owned());
        argv.push("-o".to_string());
        argv.push(output.to_string_lossy().into_owned());
        argv.push("-lm".to_string());
        argv
    }

    /// Runs the toolchain, blocking until it exits. Nonzero exit raises
    /// [`CompilationError`] with the captured stderr indented for display.
    ///
    /// `work_dir` is where the coverage notes (`.gcno`) and later data files
    /// land, so coverage runs and the compile must share it.
    pub fn compile(
        &self,
        program: &Path,
        harness: &Path,
        output: &Path,
        goal: Option<&CoverageGoal>,
        work_dir: &Path,
    ) -> Result<PathBuf, CompilationError> {
        let argv = self.build_command(program, harness, output, goal);
        debug!(command = ?argv, "invoking compiler");

        let captured = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(work_dir)
            .output()
            .map_err(|source| CompilationError::Invocation {
                command: argv[0].clone(),
                source,
            })?;

        if !captured.status.success() {
            let stderr = String::from_utf8_lossy(&captured.stderr).into_owned();
            return Err(CompilationError::Failed {
                code: captured.status.code(),
                kind: classify_stderr(&stderr),
                stderr: indent_lines(&stderr),
            });
        }
        Ok(output.to_path_buf())
    }
}

fn indent_lines(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_command_carries_the_fixed_flag_set() {
        let compiler = Compiler::new(CompilerSettings::default(), MachineModel::Bits32);
        let argv = compiler.build_command(
            Path::new("prog.c"),
            Path::new("harness.c"),
            Path::new("a.out"),
            None,
        );
        assert_eq!(argv[0], "gcc");
        assert!(argv.contains(&"-std=gnu11".to_string()));
        assert!(argv.contains(&"-m32".to_string()));
        assert!(argv.contains(&"-Wno-attributes".to_string()));
        assert!(argv.contains(&"-D__alias__(x)=".to_string()));
        assert!(argv.contains(&"-lm".to_string()));
        assert!(
            !argv.contains(&"--coverage".to_string()),
            "no coverage flags without a goal"
        );

        let include_pos = argv.iter().position(|a| a == "-include").unwrap();
        assert_eq!(
            argv[include_pos + 1],
            "prog.c",
            "the program is injected via -include ahead of the harness"
        );
        assert_eq!(argv[include_pos + 2], "harness.c");
    }

    #[test]
    fn coverage_goal_adds_instrumentation_flags() {
        let compiler = Compiler::new(CompilerSettings::default(), MachineModel::Bits64);
        let argv = compiler.build_command(
            Path::new("p.c"),
            Path::new("h.c"),
            Path::new("a.out"),
            Some(&CoverageGoal::CoverLine),
        );
        assert!(argv.contains(&"--coverage".to_string()));
        assert!(argv.contains(&"-DGCOV".to_string()));
        assert!(argv.contains(&"-m64".to_string()));
    }

    #[test]
    fn stderr_rules_apply_in_priority_order() {
        assert_eq!(
            classify_stderr("gcc: error: unrecognized command-line option '-mwat'"),
            CompilerErrorKind::BadInvocation,
            "flag rules outrank the generic error: rule"
        );
        assert_eq!(
            classify_stderr("prog.c:3:5: error: expected ';'"),
            CompilerErrorKind::SourceError
        );
        assert_eq!(
            classify_stderr("ld: undefined reference to `foo'"),
            CompilerErrorKind::SourceError
        );
        assert_eq!(
            classify_stderr("sh: gcc: command not found"),
            CompilerErrorKind::MissingToolchain
        );
        assert_eq!(
            classify_stderr("some future phrasing nobody has seen"),
            CompilerErrorKind::Unclassified
        );
    }

    #[test]
    fn failed_compiles_surface_indented_stderr() {
        let stderr = indent_lines("first line\nsecond line");
        assert_eq!(stderr, "    first line\n    second line");
    }

    #[test]
    fn missing_toolchain_is_an_invocation_error() {
        let compiler = Compiler::new(
            CompilerSettings {
                cc: "covsuite-no-such-cc".to_string(),
                c_standard: default_c_standard(),
            },
            MachineModel::Bits64,
        );
        let tmp = tempfile::tempdir().expect("tempdir");
        let result = compiler.compile(
            Path::new("p.c"),
            Path::new("h.c"),
            Path::new("a.out"),
            None,
            tmp.path(),
        );
        match result {
            Err(CompilationError::Invocation { command, .. }) => {
                assert_eq!(command, "covsuite-no-such-cc");
            }
            other => panic!("expected Invocation error, got {other:?}"),
        }
    }
}
