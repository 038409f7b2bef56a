use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Notifications — the outward observation stream for every instance.
/// One variant per lifecycle edge. Subscribers enrol through the instance
/// mailbox or through the orchestrator (by id or wildcard pattern).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Notification {
    Started {
        instance: String,
        configuration: Vec<String>,
    },
    /// The configuration changed as the result of one step.
    StateChanged {
        instance: String,
        from: Vec<String>,
        to: Vec<String>,
        event: String,
    },
    TransitionTaken {
        instance: String,
        source: String,
        targets: Vec<String>,
        event: String,
    },
    /// No active state accepted the event. Observable, never an error.
    EventDropped {
        instance: String,
        event: String,
    },
    TimerArmed {
        instance: String,
        state: String,
        delay_ms: u64,
    },
    TimerCancelled {
        instance: String,
        state: String,
    },
    TimerFired {
        instance: String,
        state: String,
        delay_ms: u64,
    },
    ServiceStarted {
        instance: String,
        state: String,
        src: String,
        invocation: Uuid,
    },
    ServiceDone {
        instance: String,
        src: String,
        invocation: Uuid,
    },
    ServiceFailed {
        instance: String,
        src: String,
        invocation: Uuid,
        message: String,
    },
    /// A parallel region entered its final state.
    RegionCompleted {
        instance: String,
        region: String,
    },
    SpawnRequested {
        instance: String,
        child_id: String,
        src: String,
    },
    /// The instance reached a top-level final state.
    Done {
        instance: String,
        output: Option<Value>,
    },
    /// A recoverable fault: the step was aborted, the instance lives on.
    Diagnostic {
        instance: String,
        code: String,
        message: String,
        at: Timestamp,
    },
    Stopped {
        instance: String,
    },
}

impl Notification {
    /// The instance this notification concerns, for subscription routing.
    pub fn instance(&self) -> &str {
        match self {
            Notification::Started { instance, .. }
            | Notification::StateChanged { instance, .. }
            | Notification::TransitionTaken { instance, .. }
            | Notification::EventDropped { instance, .. }
            | Notification::TimerArmed { instance, .. }
            | Notification::TimerCancelled { instance, .. }
            | Notification::TimerFired { instance, .. }
            | Notification::ServiceStarted { instance, .. }
            | Notification::ServiceDone { instance, .. }
            | Notification::ServiceFailed { instance, .. }
            | Notification::RegionCompleted { instance, .. }
            | Notification::SpawnRequested { instance, .. }
            | Notification::Done { instance, .. }
            | Notification::Diagnostic { instance, .. }
            | Notification::Stopped { instance } => instance,
        }
    }
}
