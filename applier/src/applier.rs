//! Policy applier: runs a plan against a firewall control interface
//!
//! Sequential mode mirrors a hand-run script: every step is issued in order,
//! a failing step is logged and skipped, and nothing is rolled back. Atomic
//! mode hands the whole table to iptables-restore, which either commits all
//! of it or leaves the kernel untouched.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::ApplyMode;
use crate::control::{FirewallControl, FILTER};
use crate::error::ControlError;
use crate::plan::{Plan, Step};

#[derive(Debug)]
pub struct StepOutcome {
    pub step: Step,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct ApplyReport {
    pub mode: ApplyMode,
    pub applied_at: DateTime<Utc>,
    pub outcomes: Vec<StepOutcome>,
    /// Output of the final listing step, when it succeeded
    pub listing: Option<String>,
}

impl ApplyReport {
    fn new(mode: ApplyMode) -> Self {
        Self {
            mode,
            applied_at: Utc::now(),
            outcomes: Vec::new(),
            listing: None,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.outcomes.iter().filter(|o| o.error.is_some())
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }

    pub fn applied_count(&self) -> usize {
        self.outcomes.len() - self.failed_count()
    }
}

pub struct PolicyApplier<'a, C: FirewallControl + ?Sized> {
    control: &'a mut C,
}

impl<'a, C: FirewallControl + ?Sized> PolicyApplier<'a, C> {
    pub fn new(control: &'a mut C) -> Self {
        Self { control }
    }

    /// Apply `plan`. Only an atomic commit failure is returned as an error;
    /// sequential step failures are recorded in the report.
    pub fn apply(&mut self, plan: &Plan, mode: ApplyMode) -> Result<ApplyReport, ControlError> {
        info!(mode = ?mode, steps = plan.step_count(), "Applying firewall policy");
        let report = match mode {
            ApplyMode::Sequential => self.apply_sequential(plan),
            ApplyMode::Atomic => self.apply_atomic(plan)?,
        };
        info!(
            "Applied {} of {} steps ({} failed)",
            report.applied_count(),
            report.outcomes.len(),
            report.failed_count()
        );
        Ok(report)
    }

    fn run_step(&mut self, step: &Step) -> Result<Option<String>, ControlError> {
        match step {
            Step::Flush => self.control.flush(FILTER).map(|_| None),
            Step::Append(rule) => self.control.append(FILTER, rule).map(|_| None),
            Step::SetPolicy(chain, policy) => {
                self.control.set_policy(FILTER, *chain, *policy).map(|_| None)
            }
            Step::List => self.control.list(FILTER).map(Some),
        }
    }

    fn record_step(&mut self, report: &mut ApplyReport, index: usize, total: usize, step: &Step) {
        match self.run_step(step) {
            Ok(listing) => {
                debug!("[{}/{}] {}", index + 1, total, step.describe());
                if listing.is_some() {
                    report.listing = listing;
                }
                report.outcomes.push(StepOutcome {
                    step: step.clone(),
                    error: None,
                });
            }
            Err(e) => {
                warn!("[{}/{}] {} failed: {e}", index + 1, total, step.describe());
                report.outcomes.push(StepOutcome {
                    step: step.clone(),
                    error: Some(e.to_string()),
                });
            }
        }
    }

    fn apply_sequential(&mut self, plan: &Plan) -> ApplyReport {
        let mut report = ApplyReport::new(ApplyMode::Sequential);
        let total = plan.step_count();
        for (index, step) in plan.steps().iter().enumerate() {
            self.record_step(&mut report, index, total, step);
        }
        report
    }

    fn apply_atomic(&mut self, plan: &Plan) -> Result<ApplyReport, ControlError> {
        let mut report = ApplyReport::new(ApplyMode::Atomic);
        let payload = plan.to_restore();
        debug!("restore payload:\n{payload}");
        self.control.restore(&payload)?;

        let total = plan.step_count();
        for (index, step) in plan.steps().iter().enumerate() {
            if *step == Step::List {
                self.record_step(&mut report, index, total, step);
            } else {
                report.outcomes.push(StepOutcome {
                    step: step.clone(),
                    error: None,
                });
            }
        }
        Ok(report)
    }
}
