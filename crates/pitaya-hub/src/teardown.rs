//! Teardown bookkeeping.
//!
//! Shutting an instrument down is a list of independent steps (disable each
//! active output, close the driver, stop the worker). Every step runs even
//! when an earlier one failed; each outcome is recorded in a
//! [`TeardownReport`] that travels back to the caller and is logged.

use pitaya_core::PitayaResult;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Outcome of one teardown step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownStep {
    /// What the step did
    pub name: String,
    /// Failure reason, `None` when the step succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TeardownStep {
    /// Whether the step succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Ordered results of every teardown step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Steps in execution order
    pub steps: Vec<TeardownStep>,
}

impl TeardownReport {
    /// Empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result of a step that already ran.
    pub fn record(&mut self, name: impl Into<String>, result: PitayaResult<()>) {
        self.steps.push(TeardownStep {
            name: name.into(),
            error: result.err().map(|e| e.to_string()),
        });
    }

    /// Run `step` and record its result.
    pub async fn run<F>(&mut self, name: impl Into<String>, step: F)
    where
        F: Future<Output = PitayaResult<()>>,
    {
        let result = step.await;
        self.record(name, result);
    }

    /// Append the steps of another report.
    pub fn extend(&mut self, other: TeardownReport) {
        self.steps.extend(other.steps);
    }

    /// Whether every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(TeardownStep::is_ok)
    }

    /// Steps that failed.
    pub fn failures(&self) -> impl Iterator<Item = &TeardownStep> {
        self.steps.iter().filter(|s| !s.is_ok())
    }

    /// Log every step under `context` (usually the device key).
    pub fn log(&self, context: &str) {
        for step in &self.steps {
            match &step.error {
                None => tracing::debug!(context, step = %step.name, "Teardown step ok"),
                Some(error) => {
                    tracing::warn!(context, step = %step.name, error = %error, "Teardown step failed")
                }
            }
        }
        if self.is_clean() {
            tracing::info!(context, steps = self.steps.len(), "Teardown complete");
        } else {
            tracing::warn!(
                context,
                failed = self.failures().count(),
                steps = self.steps.len(),
                "Teardown completed with failures"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitaya_core::PitayaError;

    #[tokio::test]
    async fn test_failing_step_does_not_abort_the_rest() {
        let mut report = TeardownReport::new();
        report
            .run("disable asg0 output", async {
                Err(PitayaError::Backend("link down".into()))
            })
            .await;
        report.run("close backend", async { Ok(()) }).await;

        assert_eq!(report.steps.len(), 2);
        assert!(!report.is_clean());
        let failed: Vec<_> = report.failures().map(|s| s.name.as_str()).collect();
        assert_eq!(failed, vec!["disable asg0 output"]);
        assert!(report.steps[1].is_ok());
    }

    #[test]
    fn test_report_serializes_compactly() {
        let mut report = TeardownReport::new();
        report.record("close backend", Ok(()));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["steps"][0]["name"], "close backend");
        assert!(json["steps"][0].get("error").is_none());

        let back: TeardownReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }
}
