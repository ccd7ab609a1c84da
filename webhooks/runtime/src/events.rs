use crate::{
    core::{AdmissionRequest, COMPONENT_NAME},
    k8s::{Client, ObjectReference},
};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tokio::sync::mpsc;
use tracing::{debug, info_span, warn, Instrument};

/// The number of events buffered before new events are dropped.
const QUEUE_CAPACITY: usize = 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    AdmissionFailed,
    AdmissionDenied,
    AdmissionMutated,
    ErrorEncodingResponse,
}

/// An audit event about an admitted object.
#[derive(Clone, Debug, PartialEq)]
pub struct AuditEvent {
    pub object: ObjectReference,
    pub reason: Reason,
    pub note: String,
}

/// Receives audit events. Emitting never blocks the request path.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: AuditEvent);
}

/// Publishes audit events to the Kubernetes events API from a background task.
#[derive(Clone, Debug)]
pub struct KubeEvents {
    tx: mpsc::Sender<AuditEvent>,
}

#[derive(Clone, Debug, Default)]
pub struct NoopEvents(());

// === impl Reason ===

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdmissionFailed => "AdmissionFailed",
            Self::AdmissionDenied => "AdmissionDenied",
            Self::AdmissionMutated => "AdmissionMutated",
            Self::ErrorEncodingResponse => "ErrorEncodingResponse",
        }
    }

    fn event_type(&self) -> EventType {
        match self {
            Self::AdmissionMutated => EventType::Normal,
            _ => EventType::Warning,
        }
    }
}

// === impl AuditEvent ===

impl AuditEvent {
    /// A handler refused the request and explained why.
    pub fn failed(req: &AdmissionRequest, message: &str) -> Option<Self> {
        Some(Self {
            object: object_reference(req)?,
            reason: Reason::AdmissionFailed,
            note: message.to_string(),
        })
    }

    /// A handler refused the request without a reason.
    pub fn denied(req: &AdmissionRequest, path: &str) -> Option<Self> {
        Some(Self {
            object: object_reference(req)?,
            reason: Reason::AdmissionDenied,
            note: format!(
                "Handler for {path} denied the {} operation for a {}",
                operation(req),
                subject(req)
            ),
        })
    }

    pub fn mutated(req: &AdmissionRequest, path: &str) -> Option<Self> {
        Some(Self {
            object: object_reference(req)?,
            reason: Reason::AdmissionMutated,
            note: format!("Handler for {path} patched a {}", subject(req)),
        })
    }

    pub fn encoding_failed(req: &AdmissionRequest, error: &dyn std::fmt::Display) -> Option<Self> {
        Some(Self {
            object: object_reference(req)?,
            reason: Reason::ErrorEncodingResponse,
            note: format!("Failed to encode the admission response: {error}"),
        })
    }

    pub fn write_failed(req: &AdmissionRequest, error: &dyn std::fmt::Display) -> Option<Self> {
        Some(Self {
            object: object_reference(req)?,
            reason: Reason::ErrorEncodingResponse,
            note: format!("Failed to write the admission response: {error}"),
        })
    }
}

/// The operation as it appears on the wire, e.g. `CREATE`.
pub(crate) fn operation(req: &AdmissionRequest) -> String {
    serde_json::to_value(&req.operation)
        .ok()
        .and_then(|op| op.as_str().map(String::from))
        .unwrap_or_default()
}

/// Describes the request's object, e.g. `Pod named web-0 in ns-0 namespace`.
/// Objects named by the API server on creation have no name yet.
pub(crate) fn subject(req: &AdmissionRequest) -> String {
    let mut subject = req.kind.kind.clone();
    if !req.name.is_empty() {
        subject.push_str(" named ");
        subject.push_str(&req.name);
    }
    match req.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => {
            subject.push_str(" in ");
            subject.push_str(ns);
            subject.push_str(" namespace");
        }
        _ => subject.push_str(" (cluster-scoped)"),
    }
    subject
}

/// Builds a reference to the request's object, falling back to the old object
/// for deletions. Requests without either cannot be referenced.
fn object_reference(req: &AdmissionRequest) -> Option<ObjectReference> {
    let obj = req.object.as_ref().or(req.old_object.as_ref())?;
    let types = obj.types.as_ref();

    let api_version = types.map(|t| t.api_version.clone()).or_else(|| {
        let gvk = &req.kind;
        Some(if gvk.group.is_empty() {
            gvk.version.clone()
        } else {
            format!("{}/{}", gvk.group, gvk.version)
        })
    });
    let kind = types
        .map(|t| t.kind.clone())
        .or_else(|| Some(req.kind.kind.clone()));
    let name = obj
        .metadata
        .name
        .clone()
        .or_else(|| Some(req.name.clone()))
        .filter(|n| !n.is_empty());
    let namespace = obj
        .metadata
        .namespace
        .clone()
        .or_else(|| req.namespace.clone());

    Some(ObjectReference {
        api_version: api_version.filter(|v| !v.is_empty()),
        kind: kind.filter(|k| !k.is_empty()),
        name,
        namespace: namespace.filter(|ns| !ns.is_empty()),
        uid: obj.metadata.uid.clone(),
        resource_version: obj.metadata.resource_version.clone(),
        ..Default::default()
    })
}

// === impl KubeEvents ===

impl KubeEvents {
    /// Spawns the publisher task. `instance` identifies this replica.
    pub fn spawn(client: Client, instance: Option<String>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let reporter = Reporter {
            controller: COMPONENT_NAME.to_string(),
            instance,
        };
        let recorder = Recorder::new(client, reporter);
        tokio::spawn(Self::publish(recorder, rx).instrument(info_span!("events")));
        Self { tx }
    }

    async fn publish(recorder: Recorder, mut rx: mpsc::Receiver<AuditEvent>) {
        while let Some(AuditEvent {
            object,
            reason,
            note,
        }) = rx.recv().await
        {
            let event = Event {
                type_: reason.event_type(),
                reason: reason.as_str().to_string(),
                note: Some(note),
                action: "Admit".to_string(),
                secondary: None,
            };
            if let Err(error) = recorder.publish(&event, &object).await {
                warn!(%error, reason = reason.as_str(), "Failed to publish event");
            }
        }
        debug!("Event publisher stopped");
    }
}

impl EventSink for KubeEvents {
    fn emit(&self, event: AuditEvent) {
        if let Err(error) = self.tx.try_send(event) {
            warn!(%error, "Dropping audit event");
        }
    }
}

impl EventSink for NoopEvents {
    fn emit(&self, _: AuditEvent) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Debug, Default)]
    pub(crate) struct Recorded(Mutex<Vec<AuditEvent>>);

    impl Recorded {
        pub(crate) fn take(&self) -> Vec<AuditEvent> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    impl EventSink for Recorded {
        fn emit(&self, event: AuditEvent) {
            self.0.lock().push(event);
        }
    }

    fn mk_request(ns: Option<&str>, name: &str) -> AdmissionRequest {
        serde_json::from_value(json!({
            "uid": "uid-0",
            "kind": {"group": "apps", "version": "v1", "kind": "Deployment"},
            "resource": {"group": "apps", "version": "v1", "resource": "deployments"},
            "namespace": ns,
            "name": name,
            "operation": "UPDATE",
            "userInfo": {"username": "admin"},
            "object": {
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {
                    "name": name,
                    "namespace": ns,
                    "uid": "0d6c2c5e-3f2a-4f0e-8f0e-6b5c2d1a9e77",
                },
            },
        }))
        .expect("request must decode")
    }

    #[test]
    fn denial_notes_name_the_object() {
        let ev = AuditEvent::denied(&mk_request(Some("ns-0"), "web"), "/deployment/affinity").unwrap();
        assert_eq!(ev.reason, Reason::AdmissionDenied);
        assert_eq!(
            ev.note,
            "Handler for /deployment/affinity denied the UPDATE operation for a Deployment named web in ns-0 namespace"
        );
        assert_eq!(ev.object.kind.as_deref(), Some("Deployment"));
        assert_eq!(ev.object.api_version.as_deref(), Some("apps/v1"));
        assert_eq!(ev.object.namespace.as_deref(), Some("ns-0"));
        assert_eq!(
            ev.object.uid.as_deref(),
            Some("0d6c2c5e-3f2a-4f0e-8f0e-6b5c2d1a9e77")
        );
    }

    #[test]
    fn cluster_scoped_objects() {
        let ev = AuditEvent::mutated(&mk_request(None, "web"), "/x").unwrap();
        assert_eq!(ev.reason, Reason::AdmissionMutated);
        assert_eq!(ev.note, "Handler for /x patched a Deployment named web (cluster-scoped)");
        assert_eq!(ev.object.namespace, None);
        assert!(matches!(ev.reason.event_type(), EventType::Normal));
    }

    #[test]
    fn unnamed_objects_omit_the_name() {
        let req = mk_request(Some("ns-0"), "");
        let ev = AuditEvent::mutated(&req, "/x").unwrap();
        assert_eq!(ev.note, "Handler for /x patched a Deployment in ns-0 namespace");
        assert_eq!(ev.object.name, None);

        let ev = AuditEvent::denied(&mk_request(None, ""), "/x").unwrap();
        assert_eq!(
            ev.note,
            "Handler for /x denied the UPDATE operation for a Deployment (cluster-scoped)"
        );
    }

    #[test]
    fn failures_carry_the_message() {
        let ev = AuditEvent::failed(&mk_request(Some("ns-0"), "web"), "no replicas").unwrap();
        assert_eq!(ev.reason, Reason::AdmissionFailed);
        assert_eq!(ev.note, "no replicas");
        assert!(matches!(ev.reason.event_type(), EventType::Warning));

        let ev = AuditEvent::write_failed(&mk_request(Some("ns-0"), "web"), &"connection reset").unwrap();
        assert_eq!(ev.reason, Reason::ErrorEncodingResponse);
        assert_eq!(ev.note, "Failed to write the admission response: connection reset");
    }

    #[test]
    fn requests_without_objects_are_not_referenced() {
        let mut req = mk_request(Some("ns-0"), "web");
        req.object = None;
        assert!(AuditEvent::failed(&req, "nope").is_none());

        req.old_object = Some(
            serde_json::from_value(json!({"metadata": {"name": "old"}}))
                .expect("object must decode"),
        );
        let ev = AuditEvent::failed(&req, "nope").unwrap();
        assert_eq!(ev.object.name.as_deref(), Some("old"));
        assert_eq!(ev.object.kind.as_deref(), Some("Deployment"));
        assert_eq!(ev.object.api_version.as_deref(), Some("apps/v1"));
    }
}
