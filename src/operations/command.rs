use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Operation, OperationError, Outputs};
use crate::bindings::{is_valid_name, BindingError, Bindings};
use crate::exec::{self, RunResult};
use crate::matching;
use crate::model::{Binding, Output};
use crate::report::OperationType;
use crate::wait::WaitError;

/// Run a local process and expose its result as bindings
///
/// The result is published as `$stdout`, `$stderr` and `$error` (null on a
/// zero exit status). Without a `check` template a non-zero exit fails the
/// operation; with one, the template is matched against those three values
/// instead.
pub struct Command {
    kind: OperationType,
    program: String,
    args: Vec<String>,
    env: Vec<Binding>,
    work_dir: Option<PathBuf>,
    namespace: Option<String>,
    check: Option<Value>,
    outputs: Vec<Output>,
    timeout: Duration,
}

impl Command {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            kind: OperationType::Command,
            program: program.into(),
            args,
            env: Vec::new(),
            work_dir: None,
            namespace: None,
            check: None,
            outputs: Vec::new(),
            timeout,
        }
    }

    /// Run `content` through `sh -c`
    pub fn script(content: impl Into<String>, timeout: Duration) -> Self {
        Self {
            kind: OperationType::Script,
            ..Self::new("sh", vec!["-c".to_string(), content.into()], timeout)
        }
    }

    pub fn env(mut self, env: Vec<Binding>) -> Self {
        self.env = env;
        self
    }

    pub fn work_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.work_dir = dir;
        self
    }

    /// Exported to the process as `NAMESPACE`
    pub fn namespace(mut self, ns: Option<String>) -> Self {
        self.namespace = ns;
        self
    }

    pub fn check(mut self, check: Option<Value>) -> Self {
        self.check = check;
        self
    }

    pub fn outputs(mut self, outputs: Vec<Output>) -> Self {
        self.outputs = outputs;
        self
    }

    fn environment(&self, bindings: &Bindings) -> Result<BTreeMap<String, String>, OperationError> {
        let mut vars = BTreeMap::new();
        if let Some(ns) = &self.namespace {
            vars.insert("NAMESPACE".to_string(), ns.clone());
        }
        for var in &self.env {
            let value = match bindings.resolve_value(&var.value)? {
                Value::String(s) => s,
                other => other.to_string(),
            };
            vars.insert(var.name.clone(), value);
        }
        Ok(vars)
    }

    async fn run(
        &self,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<RunResult, OperationError> {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        let started = Instant::now();
        let deadline_exceeded = |state: &str| {
            OperationError::DeadlineExceeded(
                WaitError::new(self.kind.to_string(), &self.program, self.timeout, started.elapsed())
                    .with_state(state),
            )
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(deadline_exceeded("cancelled while running")),
            result = tokio::time::timeout(
                self.timeout,
                exec::run_with_env(&self.program, &args, env, self.work_dir.as_deref()),
            ) => match result {
                Err(_) => Err(deadline_exceeded("still running")),
                Ok(Err(e)) => Err(OperationError::Command(e.to_string())),
                Ok(Ok(result)) => Ok(result),
            },
        }
    }
}

#[async_trait]
impl Operation for Command {
    async fn exec(
        &self,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<Outputs, OperationError> {
        let env = self.environment(bindings)?;
        let result = self.run(&env, cancel).await?;
        debug!(program = %self.program, exit_code = result.exit_code, "Process finished");

        let error = if result.passed() {
            Value::Null
        } else {
            Value::String(format!("exit status {}", result.exit_code))
        };
        let document = json!({
            "$error": error,
            "$stdout": result.stdout,
            "$stderr": result.stderr,
        });

        match &self.check {
            Some(check) => {
                let check = bindings.resolve_value(check)?;
                matching::match_value(&check, &document)?;
            }
            None if !result.passed() => {
                warn!(program = %self.program, exit_code = result.exit_code, stderr = %result.stderr.trim(), "Process failed");
                return Err(OperationError::Command(format!(
                    "{} {}: exit status {}: {}",
                    self.kind,
                    self.program,
                    result.exit_code,
                    result.stderr.trim()
                )));
            }
            None => {}
        }

        let scope = bindings
            .register("error", error.clone())?
            .register("stdout", Value::String(result.stdout.clone()))?
            .register("stderr", Value::String(result.stderr.clone()))?;
        let mut outputs = vec![
            ("error".to_string(), error),
            ("stdout".to_string(), Value::String(result.stdout)),
            ("stderr".to_string(), Value::String(result.stderr)),
        ];

        for output in &self.outputs {
            if let Some(condition) = &output.matches {
                if !matching::matches(&scope.resolve_value(condition)?, &document) {
                    continue;
                }
            }
            if !is_valid_name(&output.name) {
                return Err(BindingError::InvalidName(output.name.clone()).into());
            }
            let value = scope.resolve_value(&output.value)?;
            outputs.push((output.name.clone(), value));
        }

        info!(operation = %self.kind, program = %self.program, "Process succeeded");
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get<'a>(outputs: &'a Outputs, name: &str) -> Option<&'a Value> {
        outputs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    #[tokio::test]
    async fn test_command_exposes_result_bindings() {
        let cmd = Command::new("echo", vec!["hello".to_string()], Duration::from_secs(5));
        let outputs = cmd
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(get(&outputs, "stdout"), Some(&json!("hello\n")));
        assert_eq!(get(&outputs, "error"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_script_exports_namespace() {
        let cmd = Command::script("printf %s \"$NAMESPACE\"", Duration::from_secs(5))
            .namespace(Some("ns-1".to_string()));
        let outputs = cmd
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(get(&outputs, "stdout"), Some(&json!("ns-1")));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_without_check() {
        let cmd = Command::script("echo oops >&2; exit 3", Duration::from_secs(5));
        let err = cmd
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            OperationError::Command(msg) => {
                assert!(msg.contains("exit status 3"));
                assert!(msg.contains("oops"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_check_replaces_exit_status_rule() {
        let expect_failure = Command::script("echo bad >&2; exit 1", Duration::from_secs(5))
            .check(Some(json!({"$error": "exit status 1", "$stderr": "bad\n"})));
        assert!(expect_failure
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .is_ok());

        let mismatch = Command::script("echo good", Duration::from_secs(5))
            .check(Some(json!({"$stdout": "other\n"})));
        let err = mismatch
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Check(_)));
    }

    #[tokio::test]
    async fn test_outputs_and_env() {
        let bindings = Bindings::new().register("greeting", json!("hi")).unwrap();
        let cmd = Command::script("printf %s \"$GREETING\"", Duration::from_secs(5))
            .env(vec![Binding::new("GREETING", json!("$greeting"))])
            .outputs(vec![
                Output::new("said", json!("$stdout")),
                Output::new("never", json!(1)).when(json!({"$stdout": "nope"})),
            ]);
        let outputs = cmd
            .exec(&bindings, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(get(&outputs, "said"), Some(&json!("hi")));
        assert_eq!(get(&outputs, "never"), None);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let cmd = Command::new("kuvio-no-such-binary", Vec::new(), Duration::from_secs(5));
        let err = cmd
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Command(ref msg) if msg.contains("command not found")));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let cmd = Command::script("sleep 10", Duration::from_millis(200));
        let err = cmd
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_deadline_exceeded());
    }

    #[test]
    fn test_script_kind() {
        let cmd = Command::script("true", Duration::from_secs(1));
        assert_eq!(cmd.kind, OperationType::Script);
        assert_eq!(cmd.program, "sh");
        assert_eq!(cmd.args, vec!["-c".to_string(), "true".to_string()]);
    }
}
