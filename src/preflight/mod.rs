//! Preflight checks for a rootforge build.
//!
//! Validates host tools, the unit manifest and the build environment before
//! anything is mounted or built. `rootforge preflight` runs the full set;
//! `build` and `units` run a quick subset first (see [`check_before_build`]).

mod environment;
mod host_tools;

use anyhow::{bail, Result};

use crate::config::Config;

/// Ordered by severity, so the worst status of a report is its maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CheckStatus {
    Pass,
    /// Not applicable to this configuration.
    Skip,
    Warn,
    /// The build cannot succeed.
    Fail,
}

impl CheckStatus {
    pub fn label(self) -> &'static str {
        match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Skip => "SKIP",
            CheckStatus::Warn => "WARN",
            CheckStatus::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

impl CheckResult {
    fn new(status: CheckStatus, name: impl Into<String>, details: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            details,
        }
    }

    pub fn pass(name: impl Into<String>) -> Self {
        Self::new(CheckStatus::Pass, name, None)
    }

    pub fn pass_with(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(CheckStatus::Pass, name, Some(details.into()))
    }

    pub fn skip(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(CheckStatus::Skip, name, Some(reason.into()))
    }

    pub fn warn(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(CheckStatus::Warn, name, Some(details.into()))
    }

    pub fn fail(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(CheckStatus::Fail, name, Some(details.into()))
    }

    fn print(&self) {
        match &self.details {
            Some(details) => println!("  [{}] {}: {}", self.status.label(), self.name, details),
            None => println!("  [{}] {}", self.status.label(), self.name),
        }
    }
}

/// Check results grouped by what they examined.
#[derive(Debug, Default)]
pub struct PreflightReport {
    sections: Vec<(&'static str, Vec<CheckResult>)>,
}

impl PreflightReport {
    pub fn add(&mut self, section: &'static str, checks: Vec<CheckResult>) {
        self.sections.push((section, checks));
    }

    pub fn checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.sections.iter().flat_map(|(_, checks)| checks.iter())
    }

    pub fn count(&self, status: CheckStatus) -> usize {
        self.checks().filter(|c| c.status == status).count()
    }

    pub fn worst(&self) -> CheckStatus {
        self.checks().map(|c| c.status).max().unwrap_or(CheckStatus::Pass)
    }

    /// No check failed. Warnings do not block a build.
    pub fn passed(&self) -> bool {
        self.worst() < CheckStatus::Fail
    }

    pub fn print(&self) {
        println!("=== Preflight Check Results ===");
        for (section, checks) in &self.sections {
            println!("\n{}:", section);
            for check in checks {
                check.print();
            }
        }

        println!(
            "\nSummary: {}/{} passed, {} warnings, {} failed",
            self.count(CheckStatus::Pass),
            self.checks().count(),
            self.count(CheckStatus::Warn),
            self.count(CheckStatus::Fail)
        );
    }

    /// Print only warnings and failures.
    pub fn print_problems(&self) {
        for check in self.checks().filter(|c| c.status >= CheckStatus::Warn) {
            check.print();
        }
    }
}

/// Run all preflight checks.
pub fn run_preflight(config: &Config) -> Result<PreflightReport> {
    println!("Running preflight checks...\n");

    let mut report = PreflightReport::default();
    report.add("Host tools", host_tools::check_host_tools(config));
    report.add("Build inputs", environment::check_build_inputs(config));
    report.add("Build environment", environment::check_build_environment(config));
    Ok(report)
}

/// Run preflight and bail if any checks fail.
pub fn run_preflight_or_fail(config: &Config) -> Result<()> {
    let report = run_preflight(config)?;
    report.print();

    if !report.passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before building.",
            report.count(CheckStatus::Fail)
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}

/// The quick subset run before a build: tools the run will reach, a
/// readable manifest and archives for every unit that still has to build.
/// Skips the disk-space and privilege probes of the full check.
pub fn lite_report(config: &Config, with_images: bool) -> PreflightReport {
    let mut report = PreflightReport::default();
    let mut tools = host_tools::check_unit_tools(config);
    if with_images {
        tools.extend(host_tools::check_image_tools(config));
    }
    report.add("Host tools", tools);
    report.add("Build inputs", environment::check_pending_inputs(config));
    report
}

/// Fail fast before a build whose outcome is already known to be a failure.
pub fn check_before_build(config: &Config, with_images: bool) -> Result<()> {
    let report = lite_report(config, with_images);
    report.print_problems();
    if !report.passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Run 'rootforge preflight' for details.",
            report.count(CheckStatus::Fail)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn host_config(base: &std::path::Path) -> Config {
        let vars: HashMap<String, String> = [("ROOTFORGE_CHROOT", "false"), ("ROOTFORGE_SHELL", "sh")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(base, &vars).unwrap()
    }

    #[test]
    fn test_report_worst_and_counts() {
        let mut report = PreflightReport::default();
        report.add(
            "Host tools",
            vec![
                CheckResult::pass("tar"),
                CheckResult::warn("paxctl", "not found"),
                CheckResult::skip("phdr", "disabled"),
            ],
        );
        assert!(report.passed());
        assert_eq!(report.worst(), CheckStatus::Warn);
        assert_eq!(report.count(CheckStatus::Warn), 1);

        report.add("Build inputs", vec![CheckResult::fail("unit manifest", "missing")]);
        assert!(!report.passed());
        assert_eq!(report.count(CheckStatus::Fail), 1);
        assert_eq!(report.checks().count(), 4);
    }

    #[test]
    fn test_empty_report_passes() {
        assert!(PreflightReport::default().passed());
    }

    #[test]
    fn test_lite_check_needs_manifest() {
        let temp = TempDir::new().unwrap();
        let config = host_config(temp.path());
        let err = check_before_build(&config, false).unwrap_err();
        assert!(err.to_string().contains("Preflight failed"));

        fs::write(
            &config.units,
            "[[unit]]\nname = \"a\"\ntier = 1\n\n[[unit.step]]\nphase = \"install\"\nrun = \"true\"\n",
        )
        .unwrap();
        // tar and sh are on every test host.
        check_before_build(&config, false).unwrap();
    }
}
