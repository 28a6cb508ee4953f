//! Read-only collectors that print cluster state to the log

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{bounded, Operation, OperationError, Outputs, Target};
use crate::bindings::Bindings;
use crate::client::read_candidates;
use crate::model::OutputFormat;
use crate::resource;
use crate::wait::WaitError;

/// Resolve `template` and read the objects it addresses, once
async fn fetch(
    operation: &str,
    target: &Target,
    template: &Value,
    bindings: &Bindings,
    cancel: &CancellationToken,
) -> Result<(Value, Vec<Value>), OperationError> {
    let template = target.prepare(template, bindings).await?;
    let started = Instant::now();
    let request = read_candidates(target.client.as_ref(), &template);
    let found = bounded(started + target.timeout, cancel, request).await;
    match found {
        Some(found) => Ok((template, found?)),
        None => Err(OperationError::DeadlineExceeded(
            WaitError::new(
                operation,
                resource::describe(&template),
                target.timeout,
                started.elapsed(),
            )
            .with_state("request pending"),
        )),
    }
}

/// Print the referenced objects
///
/// A named object that does not exist fails the operation; an empty
/// selection does not.
pub struct Get {
    target: Target,
    template: Value,
    format: OutputFormat,
}

impl Get {
    pub fn new(target: Target, template: Value, format: OutputFormat) -> Self {
        Self {
            target,
            template,
            format,
        }
    }
}

#[async_trait]
impl Operation for Get {
    async fn exec(
        &self,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<Outputs, OperationError> {
        let (template, objects) = fetch("get", &self.target, &self.template, bindings, cancel).await?;
        let description = resource::describe(&template);
        if objects.is_empty() {
            if resource::name(&template).is_some() {
                return Err(OperationError::NotFound(description));
            }
            info!(resource = %description, "No resources found");
            return Ok(Outputs::new());
        }

        let rendered = render(&objects, self.format)?;
        info!(resource = %description, count = objects.len(), "\n{rendered}");
        Ok(Outputs::new())
    }
}

pub(crate) fn render(objects: &[Value], format: OutputFormat) -> Result<String, OperationError> {
    match format {
        OutputFormat::Json => {
            let list = match objects {
                [single] => single.clone(),
                many => Value::Array(many.to_vec()),
            };
            serde_json::to_string_pretty(&list).map_err(|e| OperationError::Render(e.to_string()))
        }
        OutputFormat::Yaml => objects
            .iter()
            .map(|obj| serde_yaml::to_string(obj).map_err(|e| OperationError::Render(e.to_string())))
            .collect::<Result<Vec<_>, _>>()
            .map(|docs| docs.join("---\n")),
    }
}

/// Print the events of the referenced namespace, oldest first
///
/// Events without a timestamp come last.
pub struct Events {
    target: Target,
    template: Value,
}

impl Events {
    pub fn new(target: Target, template: Value) -> Self {
        Self { target, template }
    }
}

#[async_trait]
impl Operation for Events {
    async fn exec(
        &self,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<Outputs, OperationError> {
        let (template, events) =
            fetch("events", &self.target, &self.template, bindings, cancel).await?;
        let namespace = resource::namespace(&template).unwrap_or("-");
        if events.is_empty() {
            info!(namespace = %namespace, "No events found");
        } else {
            info!(namespace = %namespace, count = events.len(), "\n{}", render_events(&events));
        }
        Ok(Outputs::new())
    }
}

fn event_time(event: &Value) -> &str {
    ["/lastTimestamp", "/eventTime", "/metadata/creationTimestamp"]
        .iter()
        .find_map(|ptr| event.pointer(ptr).and_then(Value::as_str))
        .unwrap_or("-")
}

/// One line per event: time, type, reason, object and message
pub(crate) fn render_events(events: &[Value]) -> String {
    let field = |event: &Value, ptr: &str| -> String {
        event
            .pointer(ptr)
            .and_then(Value::as_str)
            .unwrap_or("-")
            .to_string()
    };
    let mut sorted: Vec<&Value> = events.iter().collect();
    sorted.sort_by_key(|event| {
        let time = event_time(*event);
        (time == "-", time)
    });
    sorted
        .into_iter()
        .map(|event| {
            format!(
                "{} {} {} {}/{}: {}",
                event_time(event),
                field(event, "/type"),
                field(event, "/reason"),
                field(event, "/involvedObject/kind"),
                field(event, "/involvedObject/name"),
                field(event, "/message"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::super::testing::target;
    use super::*;
    use crate::client::{Call, MemoryClient, Verb};
    use serde_json::json;

    fn pod(name: &str, app: &str) -> Value {
        json!({"apiVersion": "v1", "kind": "Pod",
            "metadata": {"name": name, "namespace": "ns", "labels": {"app": app}}})
    }

    fn event(name: &str, time: &str, reason: &str) -> Value {
        json!({"apiVersion": "v1", "kind": "Event",
            "metadata": {"name": name, "namespace": "ns"},
            "lastTimestamp": time, "type": "Normal", "reason": reason,
            "involvedObject": {"kind": "Pod", "name": "web-1"},
            "message": format!("{reason} happened")})
    }

    #[tokio::test]
    async fn test_get_by_selector_lists_in_test_namespace() {
        let memory = MemoryClient::new();
        memory.insert(pod("a", "web"));
        memory.insert(pod("b", "db"));
        let template = json!({"apiVersion": "v1", "kind": "Pod",
            "metadata": {"labels": {"app": "web"}}});

        Get::new(target(&memory), template, OutputFormat::Yaml)
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap();

        match &memory.calls()[0] {
            Call::List(selector) => {
                assert_eq!(selector.namespace.as_deref(), Some("ns"));
                assert_eq!(selector.label_selector(), "app=web");
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_missing_named_object_fails() {
        let memory = MemoryClient::new();
        let err = Get::new(target(&memory), pod("gone", "web"), OutputFormat::Yaml)
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::NotFound(_)));

        let selector = json!({"apiVersion": "v1", "kind": "Pod",
            "metadata": {"labels": {"app": "none"}}});
        Get::new(target(&memory), selector, OutputFormat::Yaml)
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_collectors_stop_on_cancel() {
        let memory = MemoryClient::new();
        let token = CancellationToken::new();
        token.cancel();

        let err = Events::new(target(&memory), json!({"apiVersion": "v1", "kind": "Event"}))
            .exec(&Bindings::new(), &token)
            .await
            .unwrap_err();
        assert!(err.is_deadline_exceeded());
        assert_eq!(memory.count(Verb::List), 0);
    }

    #[tokio::test]
    async fn test_events_are_read_from_namespace() {
        let memory = MemoryClient::new();
        memory.insert(event("e1", "2024-01-01T00:00:00Z", "Scheduled"));

        Events::new(target(&memory), json!({"apiVersion": "v1", "kind": "Event"}))
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(memory.count(Verb::List), 1);
    }

    #[test]
    fn test_render_events_oldest_first() {
        let events = vec![
            event("e2", "2024-01-01T00:00:05Z", "Started"),
            event("e1", "2024-01-01T00:00:00Z", "Scheduled"),
        ];
        assert_eq!(
            render_events(&events),
            "2024-01-01T00:00:00Z Normal Scheduled Pod/web-1: Scheduled happened\n\
             2024-01-01T00:00:05Z Normal Started Pod/web-1: Started happened"
        );
    }

    #[test]
    fn test_render_events_without_time_last() {
        let mut undated = event("e0", "", "Pulled");
        undated["lastTimestamp"] = Value::Null;
        let events = vec![undated, event("e1", "2024-01-01T00:00:00Z", "Scheduled")];

        let rendered = render_events(&events);
        let lines: Vec<&str> = rendered.lines().collect();
        assert!(lines[0].contains("Scheduled"));
        assert_eq!(lines[1], "- Normal Pulled Pod/web-1: Pulled happened");
    }

    #[test]
    fn test_render_formats() {
        let objects = vec![pod("a", "web")];
        let yaml = render(&objects, OutputFormat::Yaml).unwrap();
        assert!(yaml.contains("kind: Pod"));

        let json = render(&objects, OutputFormat::Json).unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, objects[0]);

        let two = render(&[pod("a", "web"), pod("b", "web")], OutputFormat::Yaml).unwrap();
        assert_eq!(two.matches("---\n").count(), 1);
    }
}
