//! Kubernetes Events for kit transitions and failures.

use std::sync::Mutex;

use async_trait::async_trait;
use kiln_core::Kit;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::{info, warn};

pub const REPORTER: &str = "kiln-kit-controller";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";
pub const REASON_PHASE_CHANGED: &str = "PhaseChanged";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Where reconcile events go. Publishing is best effort and never fails a pass.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, kit: &Kit, kind: EventKind, reason: &str, note: String);
}

/// Events recorded on the API server against the kit.
pub struct KubeEvents {
    client: Client,
    reporter: Reporter,
}

impl KubeEvents {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self { client, reporter: Reporter { controller: REPORTER.into(), instance } }
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn publish(&self, kit: &Kit, kind: EventKind, reason: &str, note: String) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), kit.object_ref(&()));
        let ev = Event {
            type_: match kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: reason.into(),
            note: Some(note),
            action: "Reconcile".into(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(ev).await {
            warn!(kit = %kit.name_any(), reason, error = %e, "failed to publish event");
        }
    }
}

/// Logs events instead of recording them; used when no cluster is attached.
#[derive(Debug, Default)]
pub struct LogEvents;

#[async_trait]
impl EventSink for LogEvents {
    async fn publish(&self, kit: &Kit, kind: EventKind, reason: &str, note: String) {
        match kind {
            EventKind::Normal => info!(kit = %kit.name_any(), reason, note = %note, "event"),
            EventKind::Warning => warn!(kit = %kit.name_any(), reason, note = %note, "event"),
        }
    }
}

/// Keeps published events in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryEvents {
    events: Mutex<Vec<(String, EventKind, String, String)>>,
}

impl MemoryEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(kit name, kind, reason, note)` in publish order.
    pub fn events(&self) -> Vec<(String, EventKind, String, String)> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|(_, _, r, _)| r).collect()
    }
}

#[async_trait]
impl EventSink for MemoryEvents {
    async fn publish(&self, kit: &Kit, kind: EventKind, reason: &str, note: String) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).push((kit.name_any(), kind, reason.to_string(), note));
    }
}
