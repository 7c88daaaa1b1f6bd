//! Pass/fail counts from test-runner output.

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub skipped: u32,
}

impl TestCounts {
    pub fn executed(&self) -> u32 {
        self.passed + self.failed + self.errors
    }

    /// Share of executed tests that passed. Nothing executed scores 0.0.
    pub fn pass_rate(&self) -> f64 {
        match self.executed() {
            0 => 0.0,
            total => f64::from(self.passed) / f64::from(total),
        }
    }
}

/// Parse cargo-style `test result:` lines (summed across binaries) or the
/// final pytest-style summary line. `None` when neither is present.
pub fn parse_test_output(output: &str) -> Option<TestCounts> {
    parse_cargo(output).or_else(|| parse_pytest(output))
}

fn parse_cargo(output: &str) -> Option<TestCounts> {
    let re = Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed; (\d+) ignored").ok()?;
    let mut counts: Option<TestCounts> = None;
    for caps in re.captures_iter(output) {
        let total = counts.get_or_insert_with(TestCounts::default);
        total.passed += caps[1].parse::<u32>().unwrap_or(0);
        total.failed += caps[2].parse::<u32>().unwrap_or(0);
        total.skipped += caps[3].parse::<u32>().unwrap_or(0);
    }
    counts
}

fn parse_pytest(output: &str) -> Option<TestCounts> {
    let re = Regex::new(r"(\d+) (passed|failed|errors?|skipped|xfailed|xpassed)\b").ok()?;

    let summary = output.lines().rev().find(|line| {
        let line = line.trim().trim_matches('=').trim();
        line.starts_with("no tests ran") || (re.is_match(line) && line.contains(" in "))
    })?;

    let mut counts = TestCounts::default();
    for caps in re.captures_iter(summary) {
        let n = caps[1].parse::<u32>().unwrap_or(0);
        match &caps[2] {
            "passed" | "xpassed" => counts.passed += n,
            "failed" => counts.failed += n,
            "error" | "errors" => counts.errors += n,
            _ => counts.skipped += n,
        }
    }
    Some(counts)
}
