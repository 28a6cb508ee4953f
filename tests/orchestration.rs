//! End-to-end orchestration against the in-memory cluster

use kuvio::client::{Call, ClientError, MemoryClient, ObjectKey, Verb};
use kuvio::model::{ObjectReference, Operation, Output, Step, Test, WaitFor};
use kuvio::report::{OperationType, Phase, Status};
use kuvio::{Configuration, Runner};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn cm(name: &str) -> Value {
    json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}})
}

fn cm_with(name: &str, value: &str) -> Value {
    json!({"apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": name, "labels": {"app": "web"}},
        "data": {"key": value}})
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::new("v1", "ConfigMap", Some("ns"), name)
}

fn namespace_key(name: &str) -> ObjectKey {
    ObjectKey::new("v1", "Namespace", None, name)
}

fn runner(memory: &MemoryClient) -> Runner {
    Runner::new(Configuration::new(), Arc::new(memory.clone()))
}

#[tokio::test(start_paused = true)]
async fn test_apply_new_resource_creates_and_cleans_up() {
    let memory = MemoryClient::new();
    let test = Test::new("t")
        .namespace("ns")
        .step(Step::new("s").try_op(Operation::apply(cm("a"))));

    let report = runner(&memory).run(vec![test]).await.unwrap();

    assert!(report.summary().success());
    let creates: Vec<ObjectKey> = memory
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Create(key) => Some(key),
            _ => None,
        })
        .collect();
    assert_eq!(creates, vec![namespace_key("ns"), key("a")]);
    assert_eq!(memory.count(Verb::Patch), 0);
    assert_eq!(memory.deleted_keys(), vec![key("a"), namespace_key("ns")]);
}

#[tokio::test(start_paused = true)]
async fn test_passing_step_runs_finally_then_deletes_applied_resource() {
    let memory = MemoryClient::new();
    let test = Test::new("t").namespace("ns").step(
        Step::new("s")
            .try_op(Operation::apply(cm("a")))
            .finally_op(Operation::sleep(Duration::from_millis(10))),
    );

    let report = runner(&memory).run(vec![test]).await.unwrap();

    let step = &report.tests[0].steps[0];
    assert_eq!(step.status, Status::Passed);
    assert_eq!(step.phase(Phase::Finally).count(), 1);
    assert!(step.phase(Phase::Finally).all(|op| !op.failed()));
    assert!(memory.deleted_keys().contains(&key("a")));
    assert!(!memory.contains(&key("a")));
}

#[tokio::test(start_paused = true)]
async fn test_catch_collects_diagnostics_for_failed_step() {
    let memory = MemoryClient::new();
    let test = Test::new("t").namespace("ns").step(
        Step::new("s")
            .try_op(Operation::create(cm("scratch")).dry_run())
            .try_op(Operation::assert(cm("missing")).timeout(Duration::from_secs(1)))
            .catch_op(Operation::events())
            .catch_op(Operation::get(
                ObjectReference::new("v1", "ConfigMap").selector("app=web"),
            ))
            .finally_op(Operation::wait(
                ObjectReference::new("v1", "ConfigMap").name("scratch"),
                WaitFor::Deletion {},
            )),
    );

    let report = runner(&memory).run(vec![test]).await.unwrap();

    let step = &report.tests[0].steps[0];
    assert_eq!(step.status, Status::Failed);
    let catch: Vec<OperationType> = step.phase(Phase::Catch).map(|op| op.operation_type).collect();
    assert_eq!(catch, vec![OperationType::Events, OperationType::Get]);
    assert!(step.phase(Phase::Catch).all(|op| !op.failed()));
    assert!(step.phase(Phase::Finally).all(|op| !op.failed()));
    assert!(!memory.deleted_keys().contains(&key("scratch")));
}

#[tokio::test(start_paused = true)]
async fn test_apply_existing_resource_patches_without_cleanup() {
    let memory = MemoryClient::new();
    memory.insert(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "ns"}}));
    memory.insert(json!({"apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": "a", "namespace": "ns"}, "data": {"key": "old"}}));
    let test = Test::new("t").namespace("ns").step(
        Step::new("s").try_op(Operation::apply(cm_with("a", "new"))),
    );

    let report = runner(&memory).run(vec![test]).await.unwrap();

    assert!(report.summary().success());
    assert_eq!(memory.count(Verb::Create), 0);
    assert_eq!(memory.count(Verb::Patch), 1);
    assert_eq!(memory.count(Verb::Delete), 0);
    assert_eq!(memory.object(&key("a")).unwrap()["data"]["key"], json!("new"));
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_runs_newest_first() {
    let memory = MemoryClient::new();
    let test = Test::new("t")
        .namespace("ns")
        .step(
            Step::new("one")
                .try_op(Operation::apply(cm("a")))
                .try_op(Operation::apply(cm("b"))),
        )
        .step(Step::new("two").try_op(Operation::create(cm("c"))));

    let report = runner(&memory).run(vec![test]).await.unwrap();

    assert_eq!(
        memory.deleted_keys(),
        vec![key("c"), key("b"), key("a"), namespace_key("ns")]
    );
    let cleanup: Vec<&str> = report.tests[0]
        .cleanup
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(cleanup, vec!["cleanup (two)", "cleanup (one)", "cleanup (main)"]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_step_runs_finally_and_still_cleans_up() {
    let memory = MemoryClient::new();
    let test = Test::new("t").namespace("ns").step(
        Step::new("s")
            .try_op(Operation::apply(cm("a")))
            .try_op(Operation::assert(cm("missing")).timeout(Duration::from_secs(1)))
            .finally_op(Operation::sleep(Duration::from_secs(1))),
    );

    let start = Instant::now();
    let report = runner(&memory).run(vec![test]).await.unwrap();

    let test = &report.tests[0];
    assert_eq!(test.status, Status::Failed);
    let step = &test.steps[0];
    let finally: Vec<_> = step.phase(Phase::Finally).collect();
    assert_eq!(finally.len(), 1);
    assert_eq!(finally[0].operation_type, OperationType::Sleep);
    assert!(!finally[0].failed());
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(!memory.contains(&key("a")));
}

#[tokio::test(start_paused = true)]
async fn test_assert_times_out_with_deadline_error() {
    let memory = MemoryClient::new();
    memory.insert(json!({"apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": "a", "namespace": "ns"}, "data": {"key": "other"}}));
    let test = Test::new("t").namespace("ns").step(
        Step::new("s").try_op(Operation::assert(cm_with("a", "wanted")).timeout(Duration::from_secs(2))),
    );

    let start = Instant::now();
    let report = runner(&memory).run(vec![test]).await.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(2));
    let error = report.tests[0].steps[0].error.clone().unwrap();
    assert!(error.contains("assert deadline exceeded"), "{error}");
    assert!(error.contains("value mismatch"), "{error}");
}

#[tokio::test(start_paused = true)]
async fn test_error_operation_succeeds_immediately_when_absent() {
    let memory = MemoryClient::new();
    let test = Test::new("t")
        .namespace("ns")
        .step(Step::new("s").try_op(Operation::error(cm_with("a", "bad"))));

    let start = Instant::now();
    let report = runner(&memory).run(vec![test]).await.unwrap();

    assert!(report.summary().success());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_assert_matches_any_candidate() {
    let memory = MemoryClient::new();
    memory.insert(json!({"apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": "a", "namespace": "ns", "labels": {"app": "web"}},
        "data": {"key": "other"}}));
    memory.insert(json!({"apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": "b", "namespace": "ns", "labels": {"app": "web"}},
        "data": {"key": "wanted"}}));
    let selector = json!({"apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"labels": {"app": "web"}}, "data": {"key": "wanted"}});
    let test = Test::new("t")
        .namespace("ns")
        .step(Step::new("s").try_op(Operation::assert(selector)));

    let start = Instant::now();
    let report = runner(&memory).run(vec![test]).await.unwrap();

    assert!(report.summary().success());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_catch_runs_test_then_step_handlers() {
    let memory = MemoryClient::new();
    let test = Test::new("t")
        .namespace("ns")
        .catch_op(Operation::sleep(Duration::from_millis(10)))
        .step(
            Step::new("s")
                .try_op(Operation::assert(cm("missing")).timeout(Duration::from_secs(1)))
                .catch_op(Operation::delete(cm("missing"))),
        );

    let report = runner(&memory).run(vec![test]).await.unwrap();

    let step = &report.tests[0].steps[0];
    let catch: Vec<OperationType> = step.phase(Phase::Catch).map(|op| op.operation_type).collect();
    assert_eq!(catch, vec![OperationType::Sleep, OperationType::Delete]);
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_skips_remaining_tests() {
    let memory = MemoryClient::new();
    let runner = Runner::new(
        Configuration::new().fail_fast(true),
        Arc::new(memory.clone()),
    );
    let failing = Test::new("failing")
        .namespace("ns-a")
        .concurrent(false)
        .step(Step::new("s").try_op(Operation::assert(cm("missing")).timeout(Duration::from_secs(1))));
    let later = Test::new("later")
        .namespace("ns-b")
        .concurrent(false)
        .step(Step::new("s").try_op(Operation::apply(cm("a"))));

    let report = runner.run(vec![failing, later]).await.unwrap();

    let summary = report.summary();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(report.test("later").unwrap().status, Status::Skipped);
    assert!(!memory.contains(&namespace_key("ns-b")));
}

#[tokio::test(start_paused = true)]
async fn test_skipped_test_is_reported() {
    let memory = MemoryClient::new();
    let tests = vec![
        Test::new("skipped").skip(true).step(Step::new("s").try_op(Operation::apply(cm("a")))),
        Test::new("ran").namespace("ns").step(Step::new("s")),
    ];

    let report = runner(&memory).run(tests).await.unwrap();

    let summary = report.summary();
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.total(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_continue_on_error_runs_later_operations() {
    let memory = MemoryClient::new();
    let test = Test::new("t").namespace("ns").skip_delete(true).step(
        Step::new("s")
            .try_op(
                Operation::assert(cm("missing"))
                    .timeout(Duration::from_secs(1))
                    .continue_on_error(),
            )
            .try_op(Operation::apply(cm("after"))),
    );

    let report = runner(&memory).run(vec![test]).await.unwrap();

    assert_eq!(report.tests[0].status, Status::Failed);
    assert_eq!(report.tests[0].steps[0].phase(Phase::Try).count(), 2);
    assert!(memory.contains(&key("after")));
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_failure_does_not_fail_test() {
    let memory = MemoryClient::new();
    memory.fail_next(Verb::Delete, ClientError::Transport("connection reset".to_string()));
    let test = Test::new("t")
        .namespace("ns")
        .step(Step::new("s").try_op(Operation::apply(cm("a"))));

    let report = runner(&memory).run(vec![test]).await.unwrap();

    let test = &report.tests[0];
    assert_eq!(test.status, Status::Passed);
    assert_eq!(test.cleanup_errors.len(), 1);
    assert!(test.cleanup_errors[0].contains("connection reset"));
    assert_eq!(report.summary().cleanup_failures, 1);
    assert!(report.summary().success());
}

#[tokio::test(start_paused = true)]
async fn test_scenarios_run_once_each() {
    let memory = MemoryClient::new();
    let test = Test::new("t")
        .namespace("ns")
        .skip_delete(true)
        .concurrent(false)
        .scenario([("suffix".to_string(), json!("x"))].into_iter().collect())
        .scenario([("suffix".to_string(), json!("y"))].into_iter().collect())
        .step(Step::new("s").try_op(Operation::apply(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "cm"},
            "data": {"suffix": "$suffix"},
        }))));

    let report = runner(&memory).run(vec![test]).await.unwrap();

    assert_eq!(report.tests.len(), 2);
    assert!(report.summary().success());
    assert_eq!(memory.object(&key("cm")).unwrap()["data"]["suffix"], json!("y"));
}

#[tokio::test(start_paused = true)]
async fn test_operations_target_named_clusters() {
    let primary = MemoryClient::new();
    let secondary = MemoryClient::new();
    let runner = Runner::new(Configuration::new(), Arc::new(primary.clone()))
        .with_cluster("secondary", Arc::new(secondary.clone()));
    let test = Test::new("t").namespace("ns").step(
        Step::new("s")
            .try_op(Operation::apply(cm("remote")).cluster("secondary"))
            .try_op(Operation::assert(cm("remote")).cluster("secondary")),
    );

    let report = runner.run(vec![test]).await.unwrap();

    assert!(report.summary().success());
    assert!(!primary.contains(&key("remote")));
    assert_eq!(primary.deleted_keys(), vec![namespace_key("ns")]);
    assert_eq!(secondary.deleted_keys(), vec![key("remote")]);
}

#[tokio::test]
async fn test_outputs_become_bindings() {
    let memory = MemoryClient::new();
    let test = Test::new("t").namespace("ns").skip_delete(true).step(
        Step::new("s")
            .try_op(
                Operation::script("printf generated")
                    .output(Output::new("name", json!("$stdout"))),
            )
            .try_op(Operation::apply(cm("$name"))),
    );

    let report = runner(&memory).run(vec![test]).await.unwrap();

    assert!(report.summary().success(), "{:?}", report.tests[0].error);
    assert!(memory.contains(&key("generated")));
}

#[tokio::test]
async fn test_declarations_load_from_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("configmap.yaml"),
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: from-file\ndata:\n  key: value\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("test.yaml"),
        r#"
name: from-yaml
namespace: ns
concurrent: false
steps:
  - name: create
    try:
      - apply:
          file: configmap.yaml
      - assert:
          resource:
            apiVersion: v1
            kind: ConfigMap
            metadata:
              name: from-file
            data:
              key: value
        timeout: 5s
    finally:
      - sleep:
          duration: 10ms
"#,
    )
    .unwrap();

    let memory = MemoryClient::new();
    let test = Test::from_file(dir.path().join("test.yaml")).unwrap();
    let report = runner(&memory).run(vec![test]).await.unwrap();

    let test = report.test("from-yaml").unwrap();
    assert_eq!(test.status, Status::Passed, "{:?}", test.error);
    assert_eq!(memory.deleted_keys(), vec![key("from-file"), namespace_key("ns")]);
}
