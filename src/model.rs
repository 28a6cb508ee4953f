//! Test declarations
//!
//! A [`Test`] is an ordered list of [`Step`]s; a step runs [`Operation`]s in
//! its `try`, `catch`, `finally` and `cleanup` phases. Declarations can be
//! deserialized from YAML or built in code.
//!
//! # Example
//!
//! ```
//! use kuvio::model::{Operation, Step, Test};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let test = Test::new("configmap")
//!     .step(
//!         Step::new("create")
//!             .try_op(Operation::apply(json!({
//!                 "apiVersion": "v1",
//!                 "kind": "ConfigMap",
//!                 "metadata": { "name": "cfg" },
//!                 "data": { "key": "value" }
//!             })))
//!             .try_op(Operation::assert(json!({
//!                 "apiVersion": "v1",
//!                 "kind": "ConfigMap",
//!                 "metadata": { "name": "cfg" },
//!                 "data": { "key": "value" }
//!             })).timeout(Duration::from_secs(10)))
//!             .finally_op(Operation::sleep(Duration::from_secs(1))),
//!     );
//! assert_eq!(test.steps.len(), 1);
//! ```

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{duration, ConfigError, DeletionPropagation, Timeouts};
use crate::report::OperationType;
use crate::resource::{self, ResourceError};

/// A named value
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Binding {
    pub name: String,
    pub value: Value,
}

impl Binding {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A value exported by a command or script to the rest of the step
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Output {
    pub name: String,
    /// Literal, or a `"$name"` reference resolved against the result bindings
    pub value: Value,
    /// Only export when the result bindings match this template
    #[serde(default, rename = "match")]
    pub matches: Option<Value>,
}

impl Output {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            matches: None,
        }
    }

    pub fn when(mut self, template: Value) -> Self {
        self.matches = Some(template);
        self
    }
}

/// A set of bindings the whole test is run with
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

/// Operation on resource documents given inline or from a file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAction {
    #[serde(default)]
    pub resource: Option<Value>,
    /// File or directory, relative to the test's base path
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Expect the operation to fail (apply and create)
    #[serde(default)]
    pub should_fail: bool,
    /// Override the templating flag for this operation
    #[serde(default)]
    pub template: Option<bool>,
    /// Send server-side dry-run requests (apply and create); nothing is
    /// persisted and nothing is registered for cleanup
    #[serde(default)]
    pub dry_run: bool,
}

impl ResourceAction {
    pub fn inline(resource: Value) -> Self {
        Self {
            resource: Some(resource),
            ..Self::default()
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(path.into()),
            ..Self::default()
        }
    }

    /// The documents this action operates on
    pub fn documents(&self, base_path: Option<&Path>) -> Result<Vec<Value>, ResourceError> {
        documents(self.resource.as_ref(), self.file.as_deref(), base_path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAction {
    /// Object with a name, or a partial document selecting by labels
    #[serde(default)]
    pub resource: Option<Value>,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub deletion_propagation_policy: Option<DeletionPropagation>,
    #[serde(default)]
    pub template: Option<bool>,
}

impl DeleteAction {
    pub fn documents(&self, base_path: Option<&Path>) -> Result<Vec<Value>, ResourceError> {
        documents(self.resource.as_ref(), self.file.as_deref(), base_path)
    }
}

fn documents(
    resource: Option<&Value>,
    file: Option<&Path>,
    base_path: Option<&Path>,
) -> Result<Vec<Value>, ResourceError> {
    match (resource, file) {
        (Some(resource), None) => Ok(vec![resource.clone()]),
        (None, Some(file)) => {
            let path = match base_path {
                Some(base) if file.is_relative() => base.join(file),
                _ => file.to_path_buf(),
            };
            resource::load_path(&path)
        }
        _ => Err(ResourceError::Source),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAction {
    pub entrypoint: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<Binding>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Template matched against `{"$error", "$stdout", "$stderr"}`
    #[serde(default)]
    pub check: Option<Value>,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptAction {
    pub content: String,
    #[serde(default)]
    pub env: Vec<Binding>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub check: Option<Value>,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

/// Objects of one kind, optionally narrowed by name or labels
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Defaults to the test namespace for namespaced kinds
    #[serde(default)]
    pub namespace: Option<String>,
    /// Equality label selector such as `app=web,tier=db`
    #[serde(default)]
    pub selector: Option<String>,
}

impl ObjectReference {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Partial document addressing the referenced objects
    pub fn template(&self) -> Result<Value, ResourceError> {
        let mut metadata = Map::new();
        if let Some(name) = &self.name {
            metadata.insert("name".to_string(), Value::String(name.clone()));
        }
        if let Some(ns) = &self.namespace {
            metadata.insert("namespace".to_string(), Value::String(ns.clone()));
        }
        if let Some(selector) = &self.selector {
            let labels = parse_selector(selector)?;
            if !labels.is_empty() {
                metadata.insert("labels".to_string(), Value::Object(labels));
            }
        }
        let mut root = Map::new();
        root.insert("apiVersion".to_string(), Value::String(self.api_version.clone()));
        root.insert("kind".to_string(), Value::String(self.kind.clone()));
        root.insert("metadata".to_string(), Value::Object(metadata));
        Ok(Value::Object(root))
    }
}

/// `k=v,k2=v2` into a label map; `==` is accepted for `=`
fn parse_selector(selector: &str) -> Result<Map<String, Value>, ResourceError> {
    let invalid = || ResourceError::Selector(selector.to_string());
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(|term| {
            let (key, value) = term
                .split_once("==")
                .or_else(|| term.split_once('='))
                .ok_or_else(invalid)?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || key.ends_with('!') {
                return Err(invalid());
            }
            Ok((key.to_string(), Value::String(value.to_string())))
        })
        .collect()
}

/// How collected objects are printed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

/// Print objects to the log
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAction {
    #[serde(flatten)]
    pub reference: ObjectReference,
    #[serde(default)]
    pub format: OutputFormat,
}

/// Print the events of a namespace to the log
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsAction {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
}

impl EventsAction {
    pub fn reference(&self) -> ObjectReference {
        ObjectReference {
            api_version: "v1".to_string(),
            kind: "Event".to_string(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            selector: self.selector.clone(),
        }
    }
}

/// State a wait polls for
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitFor {
    /// Every referenced object is gone
    Deletion {},
    /// Every referenced object reports `status.conditions[type=name]` with
    /// the given status, compared case-insensitively
    Condition {
        name: String,
        #[serde(default = "condition_true")]
        value: String,
    },
    /// Every referenced object matches a partial template
    Match(Value),
}

fn condition_true() -> String {
    "true".to_string()
}

/// Poll until referenced objects reach a state
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitAction {
    #[serde(flatten)]
    pub reference: ObjectReference,
    #[serde(rename = "for")]
    pub wait_for: WaitFor,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SleepAction {
    #[serde(deserialize_with = "duration::deserialize")]
    pub duration: Duration,
}

/// What an operation does
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Apply(ResourceAction),
    Create(ResourceAction),
    Update(ResourceAction),
    Patch(ResourceAction),
    Delete(DeleteAction),
    Assert(ResourceAction),
    Error(ResourceAction),
    Command(CommandAction),
    Script(ScriptAction),
    Sleep(SleepAction),
    Get(GetAction),
    Events(EventsAction),
    Wait(WaitAction),
}

impl Action {
    pub fn operation_type(&self) -> OperationType {
        match self {
            Action::Apply(_) => OperationType::Apply,
            Action::Create(_) => OperationType::Create,
            Action::Update(_) => OperationType::Update,
            Action::Patch(_) => OperationType::Patch,
            Action::Delete(_) => OperationType::Delete,
            Action::Assert(_) => OperationType::Assert,
            Action::Error(_) => OperationType::Error,
            Action::Command(_) => OperationType::Command,
            Action::Script(_) => OperationType::Script,
            Action::Sleep(_) => OperationType::Sleep,
            Action::Get(_) => OperationType::Get,
            Action::Events(_) => OperationType::Events,
            Action::Wait(_) => OperationType::Wait,
        }
    }

    /// Whether the action may run in catch, finally and cleanup phases
    pub fn allowed_outside_try(&self) -> bool {
        matches!(
            self,
            Action::Delete(_)
                | Action::Command(_)
                | Action::Script(_)
                | Action::Sleep(_)
                | Action::Get(_)
                | Action::Events(_)
                | Action::Wait(_)
        )
    }
}

/// One entry of a step phase
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Keep running the rest of the phase when this operation fails
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default, deserialize_with = "duration::deserialize_option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    /// Named cluster to run against
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(flatten)]
    pub action: Action,
}

impl Operation {
    pub fn new(action: Action) -> Self {
        Self {
            continue_on_error: false,
            timeout: None,
            bindings: Vec::new(),
            cluster: None,
            action,
        }
    }

    pub fn apply(resource: Value) -> Self {
        Self::new(Action::Apply(ResourceAction::inline(resource)))
    }

    pub fn create(resource: Value) -> Self {
        Self::new(Action::Create(ResourceAction::inline(resource)))
    }

    pub fn update(resource: Value) -> Self {
        Self::new(Action::Update(ResourceAction::inline(resource)))
    }

    pub fn patch(resource: Value) -> Self {
        Self::new(Action::Patch(ResourceAction::inline(resource)))
    }

    pub fn delete(resource: Value) -> Self {
        Self::new(Action::Delete(DeleteAction {
            resource: Some(resource),
            ..DeleteAction::default()
        }))
    }

    pub fn assert(expected: Value) -> Self {
        Self::new(Action::Assert(ResourceAction::inline(expected)))
    }

    pub fn error(forbidden: Value) -> Self {
        Self::new(Action::Error(ResourceAction::inline(forbidden)))
    }

    pub fn command(entrypoint: impl Into<String>, args: &[&str]) -> Self {
        Self::new(Action::Command(CommandAction {
            entrypoint: entrypoint.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..CommandAction::default()
        }))
    }

    pub fn script(content: impl Into<String>) -> Self {
        Self::new(Action::Script(ScriptAction {
            content: content.into(),
            ..ScriptAction::default()
        }))
    }

    pub fn sleep(duration: Duration) -> Self {
        Self::new(Action::Sleep(SleepAction { duration }))
    }

    pub fn get(reference: ObjectReference) -> Self {
        Self::new(Action::Get(GetAction {
            reference,
            format: OutputFormat::default(),
        }))
    }

    /// Events of the test namespace
    pub fn events() -> Self {
        Self::new(Action::Events(EventsAction::default()))
    }

    pub fn wait(reference: ObjectReference, wait_for: WaitFor) -> Self {
        Self::new(Action::Wait(WaitAction {
            reference,
            wait_for,
        }))
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn binding(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.push(Binding::new(name, value));
        self
    }

    pub fn cluster(mut self, name: impl Into<String>) -> Self {
        self.cluster = Some(name.into());
        self
    }

    /// Expect apply or create to fail
    pub fn should_fail(mut self) -> Self {
        if let Action::Apply(a) | Action::Create(a) = &mut self.action {
            a.should_fail = true;
        }
        self
    }

    /// Send apply or create as a server-side dry run
    pub fn dry_run(mut self) -> Self {
        if let Action::Apply(a) | Action::Create(a) = &mut self.action {
            a.dry_run = true;
        }
        self
    }

    /// Set the check template of a command or script
    pub fn check(mut self, template: Value) -> Self {
        match &mut self.action {
            Action::Command(c) => c.check = Some(template),
            Action::Script(s) => s.check = Some(template),
            _ => {}
        }
        self
    }

    /// Add an output to a command or script
    pub fn output(mut self, output: Output) -> Self {
        match &mut self.action {
            Action::Command(c) => c.outputs.push(output),
            Action::Script(s) => s.outputs.push(output),
            _ => {}
        }
        self
    }

    /// Add an environment variable to a command or script
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let binding = Binding::new(name, Value::String(value.into()));
        match &mut self.action {
            Action::Command(c) => c.env.push(binding),
            Action::Script(s) => s.env.push(binding),
            _ => {}
        }
        self
    }

    /// Set the propagation policy of a delete
    pub fn propagation(mut self, policy: DeletionPropagation) -> Self {
        if let Action::Delete(d) = &mut self.action {
            d.deletion_propagation_policy = Some(policy);
        }
        self
    }

    pub fn operation_type(&self) -> OperationType {
        self.action.operation_type()
    }
}

/// A unit of sequential work inside a test
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default)]
    pub skip_delete: Option<bool>,
    #[serde(default)]
    pub deletion_propagation_policy: Option<DeletionPropagation>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub template: Option<bool>,
    #[serde(rename = "try")]
    pub try_ops: Vec<Operation>,
    #[serde(default)]
    pub catch: Vec<Operation>,
    #[serde(default)]
    pub finally: Vec<Operation>,
    /// Operations run at teardown, after the step's own resources are removed
    #[serde(default)]
    pub cleanup: Vec<Operation>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn try_op(mut self, op: Operation) -> Self {
        self.try_ops.push(op);
        self
    }

    pub fn catch_op(mut self, op: Operation) -> Self {
        self.catch.push(op);
        self
    }

    pub fn finally_op(mut self, op: Operation) -> Self {
        self.finally.push(op);
        self
    }

    pub fn cleanup_op(mut self, op: Operation) -> Self {
        self.cleanup.push(op);
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn binding(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.push(Binding::new(name, value));
        self
    }

    pub fn skip_delete(mut self, skip: bool) -> Self {
        self.skip_delete = Some(skip);
        self
    }

    pub fn deletion_propagation(mut self, policy: DeletionPropagation) -> Self {
        self.deletion_propagation_policy = Some(policy);
        self
    }

    pub fn cluster(mut self, name: impl Into<String>) -> Self {
        self.cluster = Some(name.into());
        self
    }

    /// Display name, falling back to the step position
    pub fn display_name(&self, index: usize) -> String {
        if self.name.is_empty() {
            format!("step-{}", index + 1)
        } else {
            self.name.clone()
        }
    }
}

/// A declarative end-to-end test
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Test {
    pub name: String,
    /// Fixed namespace; generated when absent
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub skip: bool,
    /// Run in parallel with other concurrent tests (default true)
    #[serde(default)]
    pub concurrent: Option<bool>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default)]
    pub deletion_propagation_policy: Option<DeletionPropagation>,
    #[serde(default)]
    pub skip_delete: Option<bool>,
    #[serde(default, deserialize_with = "duration::deserialize_option")]
    pub delay_before_cleanup: Option<Duration>,
    #[serde(default)]
    pub template: Option<bool>,
    #[serde(default)]
    pub fail_fast: Option<bool>,
    #[serde(default)]
    pub cluster: Option<String>,
    /// Catch handlers run by every step of the test, before the step's own
    #[serde(default)]
    pub catch: Vec<Operation>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    pub steps: Vec<Step>,
    /// Directory relative `file` references resolve against
    #[serde(skip)]
    pub base_path: Option<PathBuf>,
}

impl Test {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse a YAML declaration
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read a YAML declaration; relative files resolve against its directory
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut test = Self::from_yaml(&std::fs::read_to_string(path)?)?;
        test.base_path = path.parent().map(Path::to_path_buf);
        Ok(test)
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = Some(concurrent);
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn binding(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.push(Binding::new(name, value));
        self
    }

    pub fn deletion_propagation(mut self, policy: DeletionPropagation) -> Self {
        self.deletion_propagation_policy = Some(policy);
        self
    }

    pub fn skip_delete(mut self, skip: bool) -> Self {
        self.skip_delete = Some(skip);
        self
    }

    pub fn delay_before_cleanup(mut self, delay: Duration) -> Self {
        self.delay_before_cleanup = Some(delay);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = Some(fail_fast);
        self
    }

    pub fn cluster(mut self, name: impl Into<String>) -> Self {
        self.cluster = Some(name.into());
        self
    }

    pub fn catch_op(mut self, op: Operation) -> Self {
        self.catch.push(op);
        self
    }

    pub fn scenario(mut self, bindings: BTreeMap<String, Value>) -> Self {
        self.scenarios.push(Scenario {
            bindings: bindings
                .into_iter()
                .map(|(name, value)| Binding { name, value })
                .collect(),
        });
        self
    }

    pub fn base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    pub fn is_concurrent(&self) -> bool {
        self.concurrent.unwrap_or(true)
    }
}
