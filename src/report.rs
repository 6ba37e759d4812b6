//! Run outcome types.

use serde::{Deserialize, Serialize};

/// Terminal state of one stage iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    Failed,
    Skipped,
}

/// Result of one stage iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    /// Iteration key for parametrized/parallel invocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<String>,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StageReport {
    pub fn passed(&self) -> bool {
        self.status == StageStatus::Passed
    }
}

/// Result of running a full scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stages: Vec<StageReport>,
    pub duration_ms: u64,
}

/// Aggregate over a whole run, written to report files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub scenarios: Vec<ScenarioReport>,
    pub total_duration_ms: u64,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&StageStatus::Skipped).unwrap(),
            "\"skipped\""
        );
    }

    #[test]
    fn report_round_trips() {
        let report = ScenarioReport {
            name: "login-flow".into(),
            success: false,
            error: Some("stage 'use' failed".into()),
            stages: vec![StageReport {
                name: "use".into(),
                iteration: Some("dev-json".into()),
                status: StageStatus::Failed,
                error: Some("status: expected 200, got 500".into()),
                duration_ms: 12,
            }],
            duration_ms: 30,
        };
        let json = serde_json::to_string(&report).unwrap();
        let back: ScenarioReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stages[0].status, StageStatus::Failed);
        assert!(!back.success);
    }
}
