use serde::Serialize;
use std::collections::HashMap;

/// Prefix for the labels inserted by [`instrument`]. Each label marks one
/// branch entry point so gcov line counts can be attributed to branch goals.
pub const GOAL_LABEL_PREFIX: &str = "COVSUITE_GOAL_";

/// The kind of coverage target being measured for a suite run.
///
/// The goal selects both the compiler instrumentation strategy (branch,
/// condition and function goals require the source to be pre-instrumented
/// with labeled markers) and how raw gcov text is interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CoverageGoal {
    /// Cover a specific function; a test covers the goal once the function
    /// shows at least one recorded call.
    CoverFunction(String),
    CoverBranch,
    CoverCondition,
    CoverLine,
}

impl CoverageGoal {
    /// Whether this goal needs labeled markers inserted into the program
    /// source before compilation. Plain line coverage works on the raw
    /// source; everything else does not.
    pub fn requires_instrumentation(&self) -> bool {
        !matches!(self, CoverageGoal::CoverLine)
    }

    /// The target function name, when this goal seeks a specific function.
    pub fn target_function(&self) -> Option<&str> {
        match self {
            CoverageGoal::CoverFunction(name) => Some(name.as_str()),
            _ => None,
        }
    }
}

/// Coverage counts for a single run or an accumulated total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageSnapshot {
    /// Label identifying the measured artifact (usually the gcov data
    /// filename, or an aggregate name for totals).
    pub label: String,
    pub hits: u64,
    pub total: u64,
}

impl CoverageSnapshot {
    pub fn new(label: impl Into<String>, hits: u64, total: u64) -> Self {
        Self {
            label: label.into(),
            hits,
            total,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.hits as f64 / self.total as f64) * 100.0
        }
    }

    pub fn is_full(&self) -> bool {
        self.total > 0 && self.hits >= self.total
    }

    /// Additive accumulation of another snapshot into this one.
    ///
    /// Associative and commutative with respect to the (hits, total) pair,
    /// so per-test snapshots can be merged into a running total in any
    /// order. The label of `self` is kept.
    pub fn merge(&mut self, other: &CoverageSnapshot) {
        self.hits += other.hits;
        self.total += other.total;
    }
}

/// Parses the textual dump the external gcov tool produces for one run and
/// interprets it against `goal`.
///
/// Line-format dumps look like `   <count>:  <lineno>: <source>`, where
/// `count` is `-` for non-executable lines, `#####` or `=====` for executed
/// builds that never reached the line, and a number for covered lines.
/// Function summary lines look like `function <name> called <n> returned ...`.
///
/// `label_lines` is the label-to-line map produced by [`instrument`]; when
/// present, branch and condition goals count only the labeled lines.
pub fn parse_gcov(
    text: &str,
    goal: &CoverageGoal,
    label_lines: Option<&HashMap<String, usize>>,
) -> CoverageSnapshot {
    match goal {
        CoverageGoal::CoverFunction(name) => parse_function_summary(text, name),
        CoverageGoal::CoverBranch | CoverageGoal::CoverCondition => match label_lines {
            Some(labels) => parse_labeled_lines(text, labels),
            None => parse_source_lines(text),
        },
        CoverageGoal::CoverLine => parse_source_lines(text),
    }
}

fn parse_function_summary(text: &str, target: &str) -> CoverageSnapshot {
    let mut total = 0u64;
    let mut hits = 0u64;
    for line in text.lines() {
        let mut words = line.split_whitespace();
        if words.next() != Some("function") {
            continue;
        }
        let Some(name) = words.next() else { continue };
        if name != target {
            continue;
        }
        total += 1;
        // "function <name> called <n> returned ..."
        if words.next() == Some("called")
            && let Some(count) = words.next()
            && count.parse::<u64>().map(|n| n > 0).unwrap_or(false)
        {
            hits += 1;
        }
    }
    CoverageSnapshot::new(format!("function:{target}"), hits, total)
}

fn parse_labeled_lines(text: &str, labels: &HashMap<String, usize>) -> CoverageSnapshot {
    let wanted: std::collections::HashSet<usize> = labels.values().copied().collect();
    let mut hits = 0u64;
    for line in text.lines() {
        let Some((count, lineno)) = split_gcov_line(line) else {
            continue;
        };
        if wanted.contains(&lineno) && count.parse::<u64>().map(|n| n > 0).unwrap_or(false) {
            hits += 1;
        }
    }
    CoverageSnapshot::new("branch-goals", hits, labels.len() as u64)
}

fn parse_source_lines(text: &str) -> CoverageSnapshot {
    let mut total = 0u64;
    let mut hits = 0u64;
    for line in text.lines() {
        let Some((count, _lineno)) = split_gcov_line(line) else {
            continue;
        };
        if count == "-" {
            continue;
        }
        total += 1;
        if count.parse::<u64>().map(|n| n > 0).unwrap_or(false) {
            hits += 1;
        }
    }
    CoverageSnapshot::new("lines", hits, total)
}

/// Splits one gcov dump line into its count field and source line number.
/// Returns `None` for header lines (`lineno` 0) and anything not in the
/// three-column format.
fn split_gcov_line(line: &str) -> Option<(&str, usize)> {
    let mut fields = line.splitn(3, ':');
    let count = fields.next()?.trim();
    let lineno: usize = fields.next()?.trim().parse().ok()?;
    fields.next()?;
    if count.is_empty() || lineno == 0 {
        return None;
    }
    Some((count, lineno))
}

fn is_branch_opening(trimmed: &str) -> bool {
    trimmed.starts_with("if ")
        || trimmed.starts_with("if(")
        || trimmed.starts_with("} else")
        || trimmed.starts_with("else")
        || trimmed.starts_with("while ")
        || trimmed.starts_with("while(")
        || trimmed.starts_with("for ")
        || trimmed.starts_with("for(")
        || trimmed.starts_with("case ")
        || trimmed.starts_with("default:")
}

/// Inserts a distinguishable goal label after every branch opening, so each
/// branch body becomes attributable in the per-line gcov dump.
///
/// Returns the instrumented source and the map from label name to its
/// (1-based) line number in the instrumented copy. Labels only make sense
/// for sources whose branch bodies start on the line following the opening;
/// the instrumented copy is compiled in place of the original, so the map is
/// valid exactly for that copy.
pub fn instrument(source: &str) -> (String, HashMap<String, usize>) {
    let mut out_lines: Vec<String> = Vec::new();
    let mut labels = HashMap::new();
    let mut next_id = 0usize;
    for line in source.lines() {
        out_lines.push(line.to_string());
        let trimmed = line.trim_start();
        if is_branch_opening(trimmed) && trimmed.ends_with('{') {
            let label = format!("{GOAL_LABEL_PREFIX}{next_id}");
            next_id += 1;
            out_lines.push(format!("{label}: ;"));
            labels.insert(label, out_lines.len());
        }
    }
    let mut out = out_lines.join("\n");
    out.push('\n');
    (out, labels)
}
