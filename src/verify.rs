//! Post-condition checks against a live instance.
//!
//! Every check runs, in order, even after a failure, so the report is
//! complete. A check that errors counts as failed with the error text.

use std::future::Future;
use std::pin::Pin;

use crate::error::SnapError;
use crate::progress::{Panel, PanelStatus, ProgressReporter};

/// What a check sees: the instance under test and its status panel.
pub struct VerifyContext<'a, I> {
    pub instance: &'a I,
    panel: Panel,
}

impl<'a, I> VerifyContext<'a, I> {
    pub fn new(instance: &'a I, panel: Panel) -> Self {
        Self { instance, panel }
    }

    /// Attach a diagnostic line to the verification panel.
    pub fn note(&self, line: &str) {
        self.panel.log(line, crate::progress::LineStyle::Normal);
    }
}

pub type CheckFuture<'a> = Pin<Box<dyn Future<Output = Result<bool, SnapError>> + 'a>>;

/// A named boolean check. `Ok(false)` and `Err(_)` both count as failure.
pub trait Check<I>: Send + Sync {
    fn name(&self) -> &str;
    fn run<'a>(&'a self, ctx: &'a VerifyContext<'a, I>) -> CheckFuture<'a>;
}

/// Adapter for synchronous closures.
pub struct FnCheck<F> {
    name: String,
    f: F,
}

pub fn check_fn<I, F>(name: impl Into<String>, f: F) -> FnCheck<F>
where
    F: Fn(&VerifyContext<'_, I>) -> Result<bool, SnapError> + Send + Sync,
{
    FnCheck {
        name: name.into(),
        f,
    }
}

impl<I, F> Check<I> for FnCheck<F>
where
    F: Fn(&VerifyContext<'_, I>) -> Result<bool, SnapError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(&'a self, ctx: &'a VerifyContext<'a, I>) -> CheckFuture<'a> {
        let result = (self.f)(ctx);
        Box::pin(async move { result })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStatus {
    Running,
    Passed,
    Failed(String),
}

impl CheckStatus {
    fn label(&self) -> String {
        match self {
            CheckStatus::Running => "running".into(),
            CheckStatus::Passed => "\u{2713} passed".into(),
            CheckStatus::Failed(message) => format!("\u{2717} failed ({message})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub results: Vec<CheckResult>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.status == CheckStatus::Passed)
    }

    /// `(name, message)` of every failed check, in run order.
    pub fn failures(&self) -> Vec<(String, String)> {
        self.results
            .iter()
            .filter_map(|r| match &r.status {
                CheckStatus::Failed(message) => Some((r.name.clone(), message.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn into_result(self) -> Result<(), SnapError> {
        if self.passed() {
            Ok(())
        } else {
            Err(SnapError::VerificationFailed {
                failures: self.failures(),
            })
        }
    }
}

pub struct VerificationRunner {
    reporter: ProgressReporter,
}

impl VerificationRunner {
    pub fn new(reporter: ProgressReporter) -> Self {
        Self { reporter }
    }

    /// Run every check against `instance`, updating a status panel as each
    /// one completes.
    pub async fn run<I>(&self, checks: &[Box<dyn Check<I>>], instance: &I) -> VerificationReport {
        let panel = self.reporter.add_panel("verify");
        for check in checks {
            panel.set_row(check.name(), CheckStatus::Running.label());
        }

        let mut report = VerificationReport::default();
        for check in checks {
            let ctx = VerifyContext::new(instance, panel.clone());
            let status = match check.run(&ctx).await {
                Ok(true) => CheckStatus::Passed,
                Ok(false) => CheckStatus::Failed("returned false".into()),
                Err(e) => CheckStatus::Failed(e.to_string()),
            };
            tracing::info!(check = %check.name(), ?status, "verification check finished");
            panel.set_row(check.name(), status.label());
            report.results.push(CheckResult {
                name: check.name().to_string(),
                status,
            });
        }

        panel.finish(if report.passed() {
            PanelStatus::Success
        } else {
            PanelStatus::Failed
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Dummy;

    fn checks(calls: Arc<AtomicUsize>) -> Vec<Box<dyn Check<Dummy>>> {
        let c1 = calls.clone();
        let c2 = calls.clone();
        let c3 = calls;
        vec![
            Box::new(check_fn::<Dummy, _>("fails", move |_| {
                c1.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            })),
            Box::new(check_fn::<Dummy, _>("errors", move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
                Err(SnapError::Validation {
                    message: "nginx missing".into(),
                })
            })),
            Box::new(check_fn::<Dummy, _>("passes", move |ctx| {
                c3.fetch_add(1, Ordering::SeqCst);
                ctx.note("all good");
                Ok(true)
            })),
        ]
    }

    #[tokio::test]
    async fn all_checks_run_despite_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reporter = ProgressReporter::hidden(24);
        let runner = VerificationRunner::new(reporter.clone());

        let report = runner.run(&checks(calls.clone()), &Dummy).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!report.passed());
        assert_eq!(
            report.failures(),
            vec![
                ("fails".to_string(), "returned false".to_string()),
                ("errors".to_string(), "validation error: nginx missing".to_string()),
            ]
        );
        assert_eq!(report.results[2].status, CheckStatus::Passed);
        assert_eq!(reporter.panel_count(), 1);
    }

    #[tokio::test]
    async fn empty_check_list_passes() {
        let runner = VerificationRunner::new(ProgressReporter::hidden(24));
        let report = runner.run::<Dummy>(&[], &Dummy).await;
        assert!(report.passed());
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn failed_report_converts_to_error() {
        let report = VerificationReport {
            results: vec![CheckResult {
                name: "port_open".into(),
                status: CheckStatus::Failed("refused".into()),
            }],
        };
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("port_open: refused"));
    }
}
