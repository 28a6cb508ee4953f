//! Run, test, step and operation reports
//!
//! The tree is built bottom-up while tests execute and derives `Serialize`
//! so an external writer can turn it into JUnit, JSON or anything else.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Verb an operation report belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Apply,
    Assert,
    Command,
    Create,
    Delete,
    Error,
    Events,
    Get,
    Patch,
    Script,
    Sleep,
    Update,
    Wait,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationType::Apply => "apply",
            OperationType::Assert => "assert",
            OperationType::Command => "command",
            OperationType::Create => "create",
            OperationType::Delete => "delete",
            OperationType::Error => "error",
            OperationType::Events => "events",
            OperationType::Get => "get",
            OperationType::Patch => "patch",
            OperationType::Script => "script",
            OperationType::Sleep => "sleep",
            OperationType::Update => "update",
            OperationType::Wait => "wait",
        };
        f.write_str(s)
    }
}

/// Step phase an operation ran in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Try,
    Catch,
    Finally,
    Cleanup,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Try => "try",
            Phase::Catch => "catch",
            Phase::Finally => "finally",
            Phase::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub name: String,
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    pub phase: Phase,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationReport {
    /// Start a report now; `end_time` is set by `finish`
    pub fn start(name: impl Into<String>, operation_type: OperationType, phase: Phase) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            operation_type,
            phase,
            start_time: now,
            end_time: now,
            error: None,
        }
    }

    /// Stamp the end time and record the outcome
    pub fn finish(mut self, error: Option<String>) -> Self {
        self.end_time = Utc::now();
        self.error = error;
        self
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: Status,
    /// First unrecovered failure of the step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub operations: Vec<OperationReport>,
}

impl StepReport {
    pub fn start(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            start_time: now,
            end_time: now,
            status: Status::Passed,
            error: None,
            operations: Vec::new(),
        }
    }

    pub fn add(&mut self, report: OperationReport) {
        self.operations.push(report);
    }

    /// Mark the step failed, keeping the first failure
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = Status::Failed;
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }

    pub fn skip(&mut self) {
        self.status = Status::Skipped;
    }

    pub fn finish(&mut self) {
        self.end_time = Utc::now();
    }

    pub fn failed(&self) -> bool {
        self.status == Status::Failed
    }

    /// Operations recorded for one phase
    pub fn phase(&self, phase: Phase) -> impl Iterator<Item = &OperationReport> {
        self.operations.iter().filter(move |op| op.phase == phase)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub name: String,
    pub concurrent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<StepReport>,
    /// Teardown steps, one per cleaner that had work to do
    pub cleanup: Vec<StepReport>,
    /// Teardown failures; these never change `status`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup_errors: Vec<String>,
}

impl TestReport {
    pub fn start(name: impl Into<String>, concurrent: bool) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            concurrent,
            namespace: None,
            start_time: now,
            end_time: now,
            status: Status::Passed,
            error: None,
            steps: Vec::new(),
            cleanup: Vec::new(),
            cleanup_errors: Vec::new(),
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = Status::Failed;
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }

    pub fn skip(&mut self) {
        self.status = Status::Skipped;
    }

    pub fn finish(&mut self) {
        self.end_time = Utc::now();
    }

    pub fn failed(&self) -> bool {
        self.status == Status::Failed
    }
}

/// Aggregate counts for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Tests whose teardown reported at least one failure
    pub cleanup_failures: usize,
}

impl Summary {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub tests: Vec<TestReport>,
}

impl RunReport {
    pub fn start(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            start_time: now,
            end_time: now,
            tests: Vec::new(),
        }
    }

    pub fn add(&mut self, report: TestReport) {
        self.tests.push(report);
    }

    pub fn finish(&mut self) {
        self.end_time = Utc::now();
    }

    pub fn summary(&self) -> Summary {
        self.tests.iter().fold(Summary::default(), |mut s, t| {
            match t.status {
                Status::Passed => s.passed += 1,
                Status::Failed => s.failed += 1,
                Status::Skipped => s.skipped += 1,
            }
            if !t.cleanup_errors.is_empty() {
                s.cleanup_failures += 1;
            }
            s
        })
    }

    /// Test report by name
    pub fn test(&self, name: &str) -> Option<&TestReport> {
        self.tests.iter().find(|t| t.name == name)
    }
}
