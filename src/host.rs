//! Host integration seam.
//!
//! The engine reports outcomes, resolves fixtures, and observes
//! cancellation through this trait; it never interprets marker
//! semantics itself. [`StaticHost`] is the in-process implementation
//! used by the CLI and the test suite.

use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// What the engine requires from its embedder.
pub trait Host: Send + Sync {
    /// Resolve a fixture name to a value. Missing fixtures fail the
    /// scenario before any request is sent.
    fn fixture_value(&self, name: &str) -> Result<Value>;

    fn report_pass(&self, stage: &str, iteration: Option<&str>);

    fn report_fail(&self, stage: &str, iteration: Option<&str>, error: &Error);

    /// Polled between stages and before each parallel dispatch.
    fn cancelled(&self) -> bool;

    /// Forward marker strings; their semantics belong to the host.
    fn apply_markers(&self, scope: &str, markers: &[String]);
}

/// One reported outcome, kept by [`StaticHost`] for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct HostOutcome {
    pub stage: String,
    pub iteration: Option<String>,
    pub passed: bool,
    pub error: Option<String>,
}

/// Fixture-map host with a cancellation flag and recorded outcomes.
#[derive(Debug, Default)]
pub struct StaticHost {
    fixtures: HashMap<String, Value>,
    cancel: AtomicBool,
    outcomes: Mutex<Vec<HostOutcome>>,
    markers: Mutex<Vec<(String, Vec<String>)>>,
}

impl StaticHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fixture(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fixtures.insert(name.into(), value);
        self
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn outcomes(&self) -> Vec<HostOutcome> {
        self.outcomes.lock().expect("outcomes lock").clone()
    }

    pub fn applied_markers(&self) -> Vec<(String, Vec<String>)> {
        self.markers.lock().expect("markers lock").clone()
    }
}

impl Host for StaticHost {
    fn fixture_value(&self, name: &str) -> Result<Value> {
        self.fixtures
            .get(name)
            .cloned()
            .ok_or_else(|| Error::validation(format!("fixture '{name}' is not defined")))
    }

    fn report_pass(&self, stage: &str, iteration: Option<&str>) {
        self.outcomes.lock().expect("outcomes lock").push(HostOutcome {
            stage: stage.to_string(),
            iteration: iteration.map(str::to_string),
            passed: true,
            error: None,
        });
    }

    fn report_fail(&self, stage: &str, iteration: Option<&str>, error: &Error) {
        self.outcomes.lock().expect("outcomes lock").push(HostOutcome {
            stage: stage.to_string(),
            iteration: iteration.map(str::to_string),
            passed: false,
            error: Some(error.to_string()),
        });
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn apply_markers(&self, scope: &str, markers: &[String]) {
        if !markers.is_empty() {
            self.markers
                .lock()
                .expect("markers lock")
                .push((scope.to_string(), markers.to_vec()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fixture_lookup() {
        let host = StaticHost::new().with_fixture("api_key", json!("k-1"));
        assert_eq!(host.fixture_value("api_key").unwrap(), json!("k-1"));
        assert!(host.fixture_value("missing").is_err());
    }

    #[test]
    fn outcomes_are_recorded_in_order() {
        let host = StaticHost::new();
        host.report_pass("a", None);
        host.report_fail("b", Some("row-0"), &Error::verify("nope"));

        let outcomes = host.outcomes();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].passed);
        assert_eq!(outcomes[1].iteration.as_deref(), Some("row-0"));
        assert!(outcomes[1].error.as_deref().unwrap().contains("nope"));
    }

    #[test]
    fn cancellation_flag() {
        let host = StaticHost::new();
        assert!(!host.cancelled());
        host.cancel();
        assert!(host.cancelled());
    }
}
