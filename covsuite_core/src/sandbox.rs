use crate::executor::{ExecutionResult, Verdict};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resource and filesystem limits enforced by the external containment
/// tool. Without a sandbox only the wall-clock timeout applies.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SandboxSettings {
    #[serde(default = "default_tool")]
    pub tool: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_time_limit_s")]
    pub time_limit_s: u64,
    #[serde(default = "default_cores")]
    pub cores: String,
    #[serde(default = "default_max_processes")]
    pub max_processes: u32,
    #[serde(default = "default_hidden_dirs")]
    pub hidden_dirs: Vec<PathBuf>,
    #[serde(default = "default_result_files")]
    pub result_files: Vec<String>,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

fn default_tool() -> String {
    "runexec".to_string()
}

fn default_memory_limit() -> String {
    "2GB".to_string()
}

fn default_time_limit_s() -> u64 {
    900
}

fn default_cores() -> String {
    "0".to_string()
}

fn default_max_processes() -> u32 {
    16
}

fn default_hidden_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/home"), PathBuf::from("/sys/kernel/debug")]
}

fn default_result_files() -> Vec<String> {
    vec!["harness.gcda".to_string()]
}

fn default_log_file() -> PathBuf {
    PathBuf::from("sandbox.log")
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            memory_limit: default_memory_limit(),
            time_limit_s: default_time_limit_s(),
            cores: default_cores(),
            max_processes: default_max_processes(),
            hidden_dirs: default_hidden_dirs(),
            result_files: default_result_files(),
            log_file: default_log_file(),
        }
    }
}

impl SandboxSettings {
    /// Wraps a target argv in the containment tool's invocation: resource
    /// limits, a read-only root with a writable overlay at the working
    /// directory, hidden subpaths, the captured-output log, and the trailing
    /// result-files allowlist.
    pub fn wrap_command(&self, target_argv: &[String], work_dir: &Path) -> Vec<String> {
        let mut argv = vec![
            self.tool.clone(),
            "--set-prop".to_string(),
            format!("pids.max={}", self.max_processes),
            "--memlimit".to_string(),
            self.memory_limit.clone(),
            "--timelimit".to_string(),
            format!("{}s", self.time_limit_s),
            "--cores".to_string(),
            self.cores.clone(),
            "--read-only-dir".to_string(),
            "/".to_string(),
            "--overlay-dir".to_string(),
            work_dir.to_string_lossy().into_owned(),
        ];
        for hidden in &self.hidden_dirs {
            argv.push("--hidden-dir".to_string());
            argv.push(hidden.to_string_lossy().into_owned());
        }
        argv.push("--output".to_string());
        argv.push(self.log_file.to_string_lossy().into_owned());
        for result_file in &self.result_files {
            argv.push("--result-files".to_string());
            argv.push(result_file.clone());
        }
        argv.push("--".to_string());
        argv.extend_from_slice(target_argv);
        argv
    }
}

/// Re-parses the wrapper's `key=value` diagnostic lines and overwrites the
/// runner's own measurements, which the wrapper reports more reliably than
/// the raw subprocess exit status.
///
/// Returns `false` when no diagnostic line was recognized, in which case the
/// result keeps the runner's measurements untouched.
pub fn apply_wrapper_measurements(diagnostics: &str, result: &mut ExecutionResult) -> bool {
    let mut recognized = false;
    for line in diagnostics.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "cputime" => {
                if let Some(seconds) = parse_seconds(value) {
                    result.cpu_time = Some(seconds);
                    recognized = true;
                }
            }
            "walltime" => {
                if let Some(seconds) = parse_seconds(value) {
                    result.wall_time = seconds;
                    recognized = true;
                }
            }
            "memory" => {
                if let Ok(bytes) = value.trim_end_matches('B').parse::<u64>() {
                    result.peak_memory = Some(bytes);
                    recognized = true;
                }
            }
            "returnvalue" => {
                if let Ok(code) = value.parse::<i32>() {
                    result.exit_code = Some(code);
                    recognized = true;
                }
            }
            "exitsignal" => {
                result.aborted = true;
                result.verdict = Verdict::Aborted;
                recognized = true;
            }
            "terminationreason" => {
                result.aborted = true;
                result.verdict = Verdict::Aborted;
                recognized = true;
            }
            _ => {}
        }
    }
    recognized
}

fn parse_seconds(value: &str) -> Option<Duration> {
    value
        .trim_end_matches('s')
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}
