//! Pipeline driver - runs build units in the order given.
//!
//! The order already encodes dependencies (tiers); nothing is reordered here.
//! A fatal failure halts the run and everything after it is reported as
//! remaining. Units marked non-fatal (or every unit, with
//! `continue_on_error`) only record their failure.

use tracing::{error, info, warn};

use crate::context::BuildContext;
use crate::error::BuildError;
use crate::executor::{self, UnitOutcome};
use crate::interrupt;
use crate::unit::BuildUnit;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Treat every unit as non-fatal.
    pub continue_on_error: bool,
}

#[derive(Debug, Clone)]
pub struct FailedUnit {
    pub unit: String,
    /// Step phase, when the failure came from a step.
    pub phase: Option<String>,
    /// Taxonomy label, or "error" for unclassified failures.
    pub kind: &'static str,
    pub message: String,
    pub log_excerpt: String,
}

impl FailedUnit {
    pub fn from_error(unit: &str, err: &anyhow::Error) -> Self {
        let class = BuildError::classify(err);
        let (phase, log_excerpt) = match class {
            Some(BuildError::StepFailure {
                phase, log_excerpt, ..
            }) => (Some(phase.clone()), log_excerpt.clone()),
            _ => (None, String::new()),
        };
        Self {
            unit: unit.to_string(),
            phase,
            kind: class.map(BuildError::kind).unwrap_or("error"),
            message: format!("{:#}", err),
            log_excerpt,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Report {
    pub total: usize,
    pub built: usize,
    pub skipped: usize,
    /// The unit that halted the run.
    pub failed: Option<FailedUnit>,
    pub non_fatal_failures: Vec<FailedUnit>,
    /// Units never attempted, in order. Includes an interrupted unit.
    pub remaining: Vec<String>,
    pub interrupted: bool,
}

impl Report {
    pub fn success(&self) -> bool {
        self.failed.is_none() && !self.interrupted
    }

    /// Units that ended with a checkpoint.
    pub fn completed(&self) -> usize {
        self.built + self.skipped
    }

    pub fn print(&self) {
        println!();
        println!("=== Build Report ===");
        println!(
            "  Units: {} total, {} built, {} skipped (already built)",
            self.total, self.built, self.skipped
        );
        println!(
            "  Completed: {}/{}, remaining: {}",
            self.completed(),
            self.total,
            self.remaining.len()
        );

        for failure in &self.non_fatal_failures {
            println!(
                "  [WARN] {} failed (non-fatal): {}",
                failure.unit, failure.message
            );
        }

        if self.interrupted {
            println!();
            println!("  Interrupted. Re-run to resume from the first unbuilt unit.");
        }

        if let Some(failed) = &self.failed {
            println!();
            match &failed.phase {
                Some(phase) => println!("  [FAIL] {} ({} step)", failed.unit, phase),
                None => println!("  [FAIL] {} ({})", failed.unit, failed.kind),
            }
            println!("  {}", failed.message);
            if !failed.log_excerpt.is_empty() {
                println!();
                println!("  --- last lines of log ---");
                for line in failed.log_excerpt.lines() {
                    println!("  | {}", line);
                }
            }
        }

        if !self.remaining.is_empty() {
            println!();
            println!("  Not attempted: {}", self.remaining.join(", "));
        }

        println!();
        if self.success() {
            println!("  Result: OK");
        } else {
            println!("  Result: FAILED");
        }
    }
}

/// Run `units` in order.
pub fn run(ctx: &BuildContext, units: &[BuildUnit], options: RunOptions) -> Report {
    let mut report = Report {
        total: units.len(),
        ..Default::default()
    };

    println!("=== Building {} units ===", units.len());

    for (index, unit) in units.iter().enumerate() {
        if interrupt::is_interrupted() {
            report.interrupted = true;
            report.remaining = names(&units[index..]);
            break;
        }

        match executor::execute(ctx, unit) {
            Ok(UnitOutcome::Skipped) => report.skipped += 1,
            Ok(UnitOutcome::Built { .. }) => report.built += 1,
            Err(err) => {
                let failure = FailedUnit::from_error(&unit.name, &err);

                if matches!(
                    BuildError::classify(&err),
                    Some(BuildError::Interrupted { .. })
                ) {
                    warn!(unit = %unit.name, "interrupted");
                    report.interrupted = true;
                    report.remaining = names(&units[index..]);
                    break;
                }

                if unit.non_fatal || options.continue_on_error {
                    warn!(unit = %unit.name, error = %failure.message, "non-fatal unit failed");
                    println!("  [WARN] {} failed, continuing: {}", unit.name, failure.message);
                    report.non_fatal_failures.push(failure);
                    continue;
                }

                error!(unit = %unit.name, error = %failure.message, "unit failed, halting");
                report.failed = Some(failure);
                report.remaining = names(&units[index + 1..]);
                break;
            }
        }
    }

    info!(
        built = report.built,
        skipped = report.skipped,
        remaining = report.remaining.len(),
        "pipeline finished"
    );
    report
}

fn names(units: &[BuildUnit]) -> Vec<String> {
    units.iter().map(|u| u.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_unit_from_step_failure() {
        let err: anyhow::Error = BuildError::StepFailure {
            unit: "zlib".to_string(),
            phase: "build".to_string(),
            code: 2,
            log_excerpt: "make: *** [all] Error 2".to_string(),
        }
        .into();

        let failure = FailedUnit::from_error("zlib", &err);
        assert_eq!(failure.phase.as_deref(), Some("build"));
        assert_eq!(failure.kind, "step failure");
        assert!(failure.log_excerpt.contains("Error 2"));
    }

    #[test]
    fn test_failed_unit_unclassified() {
        let err = anyhow::anyhow!("disk full");
        let failure = FailedUnit::from_error("zlib", &err);
        assert_eq!(failure.kind, "error");
        assert!(failure.phase.is_none());
    }

    #[test]
    fn test_report_success() {
        let mut report = Report {
            total: 3,
            built: 1,
            skipped: 2,
            ..Default::default()
        };
        assert!(report.success());
        assert_eq!(report.completed(), 3);

        report.interrupted = true;
        assert!(!report.success());
    }
}
