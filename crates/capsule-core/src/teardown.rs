//! Ordered rollback and best-effort cleanup bookkeeping.
//!
//! [`Teardown`] collects undo steps while a multi-step resource is being
//! built and replays them in reverse. [`CleanupReport`] runs independent
//! cleanup actions, captures each failure, and keeps going.

use std::fmt;

use capsule_common::error::{CapsuleError, Result};

type Step = Box<dyn FnOnce() -> Result<()> + Send>;

/// Undo steps recorded while building a resource, replayed last-in first-out.
#[derive(Default)]
pub struct Teardown {
    steps: Vec<(String, Step)>,
}

impl Teardown {
    /// Creates an empty teardown.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an undo step. Steps run in reverse registration order.
    pub fn push<F>(&mut self, label: impl Into<String>, step: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.steps.push((label.into(), Box::new(step)));
    }

    /// Returns the number of pending steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns whether no step is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Appends every step of `later`, so that they run before this
    /// teardown's own steps.
    pub fn extend(&mut self, later: Self) {
        self.steps.extend(later.steps);
    }

    /// Runs every step, newest first, without stopping on failure.
    pub fn run(mut self) -> CleanupReport {
        let mut report = CleanupReport::new();
        while let Some((label, step)) = self.steps.pop() {
            report.attempt(&label, step);
        }
        report
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|(label, _)| label))
            .finish()
    }
}

/// Outcome of a sequence of cleanup actions that never short-circuits.
#[derive(Debug, Default)]
#[must_use]
pub struct CleanupReport {
    failures: Vec<String>,
}

impl CleanupReport {
    /// Creates a report with no failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `action`, recording and logging its failure under `label`.
    pub fn attempt<F>(&mut self, label: &str, action: F)
    where
        F: FnOnce() -> Result<()>,
    {
        if let Err(e) = action() {
            tracing::warn!(step = label, error = %e, "cleanup step failed");
            self.failures.push(format!("{label}: {e}"));
        }
    }

    /// Folds the failures of `other` into this report.
    pub fn merge(&mut self, other: Self) {
        self.failures.extend(other.failures);
    }

    /// Returns whether every action succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Returns the recorded failures, oldest first.
    #[must_use]
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    /// Converts the report into a result.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::PartialCleanup`] listing every failure.
    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(CapsuleError::PartialCleanup {
                failures: self.failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Step) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |tag: &'static str| -> Step {
            let sink = Arc::clone(&sink);
            Box::new(move || {
                sink.lock().expect("lock").push(tag);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn steps_run_in_reverse_order() {
        let (log, make) = recorder();
        let mut teardown = Teardown::new();
        teardown.push("dirs", make("dirs"));
        teardown.push("overlay", make("overlay"));
        teardown.push("bind", make("bind"));
        assert_eq!(teardown.len(), 3);
        assert!(teardown.run().is_clean());
        assert_eq!(*log.lock().expect("lock"), vec!["bind", "overlay", "dirs"]);
    }

    #[test]
    fn failures_do_not_stop_later_steps() {
        let (log, make) = recorder();
        let mut teardown = Teardown::new();
        teardown.push("first", make("first"));
        teardown.push("broken", || {
            Err(CapsuleError::Config {
                message: "boom".into(),
            })
        });
        let report = teardown.run();
        assert_eq!(*log.lock().expect("lock"), vec!["first"]);
        assert_eq!(report.failures().len(), 1);
        assert!(report.failures()[0].starts_with("broken:"));
    }

    #[test]
    fn extended_steps_run_first() {
        let (log, make) = recorder();
        let mut outer = Teardown::new();
        outer.push("outer", make("outer"));
        let mut inner = Teardown::new();
        inner.push("inner", make("inner"));
        outer.extend(inner);
        let _ = outer.run();
        assert_eq!(*log.lock().expect("lock"), vec!["inner", "outer"]);
    }

    #[test]
    fn report_aggregates_into_partial_cleanup() {
        let mut report = CleanupReport::new();
        report.attempt("ok", || Ok(()));
        report.attempt("cgroup", || {
            Err(CapsuleError::Config {
                message: "busy".into(),
            })
        });
        let mut other = CleanupReport::new();
        other.attempt("record", || {
            Err(CapsuleError::Config {
                message: "gone".into(),
            })
        });
        report.merge(other);
        match report.into_result() {
            Err(CapsuleError::PartialCleanup { failures }) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn clean_report_is_ok() {
        assert!(CleanupReport::new().into_result().is_ok());
    }
}
