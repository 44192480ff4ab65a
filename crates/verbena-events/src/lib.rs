//! Agent events and notifiers for cross-agent observability.
//!
//! Events are emitted whenever lock or workflow state changes so that peer
//! agents (and UIs, persistence layers, tests) can observe progress. The
//! transport that physically carries an event to another agent is out of
//! scope; this crate only defines the seam.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use verbena_workflow::{Priority, TaskStatus};

/// Events emitted by the coordinator, executor and scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
  /// An agent joined a resource's waiter queue.
  LockRequested {
    resource_id: String,
    agent_id: String,
    priority: Priority,
  },

  /// A resource was granted to an agent.
  LockGranted {
    resource_id: String,
    agent_id: String,
  },

  /// The owner released a resource.
  LockReleased {
    resource_id: String,
    agent_id: String,
  },

  /// A wait-for cycle was detected; the reporting agent is aborting its
  /// own pending requests.
  DeadlockDetected {
    cycle: Vec<String>,
    resources: Vec<String>,
    resolution: String,
  },

  /// A task changed status (running, completed, failed, retrying, blocked).
  TaskStatusUpdate {
    workflow_id: String,
    task_id: String,
    status: TaskStatus,
    retry_count: u32,
    error: Option<String>,
    execution_time_ms: Option<u64>,
  },

  WorkflowSubmitted {
    workflow_id: String,
  },

  WorkflowStarted {
    workflow_id: String,
  },

  WorkflowCompleted {
    workflow_id: String,
    progress: f64,
  },

  WorkflowFailed {
    workflow_id: String,
    progress: f64,
  },

  WorkflowCancelled {
    workflow_id: String,
  },
}

/// Best-effort, fire-and-forget event delivery to peer agents.
///
/// Implementations must never fail the calling operation: a lock grant or
/// task completion proceeds whether or not the event reaches anyone.
pub trait Notifier: Send + Sync {
  /// Deliver an event to every peer.
  fn broadcast(&self, from_agent: &str, event: AgentEvent);

  /// Deliver an event to a single named peer.
  fn send_to(&self, from_agent: &str, target_agent: &str, event: AgentEvent);
}

/// A no-op notifier that discards all events.
///
/// Useful for tests or single-agent deployments.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
  fn broadcast(&self, _from_agent: &str, _event: AgentEvent) {}

  fn send_to(&self, _from_agent: &str, _target_agent: &str, _event: AgentEvent) {}
}

/// An addressed event as handed to a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
  pub from_agent: String,
  /// `None` for broadcasts.
  pub to_agent: Option<String>,
  pub event: AgentEvent,
}

/// A notifier that forwards envelopes onto an unbounded channel.
///
/// The channel is unbounded so a slow consumer cannot stall lock grants or
/// task completions. Event volume is low (a handful per task transition),
/// so unbounded buffering is acceptable; a transport that cares can drain
/// and drop on its side.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<Envelope>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<Envelope>) -> Self {
    Self { sender }
  }

  /// Convenience constructor returning the receiving half alongside.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self { sender }, receiver)
  }
}

impl Notifier for ChannelNotifier {
  fn broadcast(&self, from_agent: &str, event: AgentEvent) {
    // Send errors mean the receiver is gone; delivery is best-effort.
    let _ = self.sender.send(Envelope {
      from_agent: from_agent.to_string(),
      to_agent: None,
      event,
    });
  }

  fn send_to(&self, from_agent: &str, target_agent: &str, event: AgentEvent) {
    let _ = self.sender.send(Envelope {
      from_agent: from_agent.to_string(),
      to_agent: Some(target_agent.to_string()),
      event,
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn channel_notifier_delivers_envelopes() {
    let (notifier, mut receiver) = ChannelNotifier::channel();

    notifier.broadcast(
      "agent1",
      AgentEvent::WorkflowSubmitted {
        workflow_id: "wf-1".to_string(),
      },
    );
    notifier.send_to(
      "agent1",
      "agent2",
      AgentEvent::LockReleased {
        resource_id: "db".to_string(),
        agent_id: "agent1".to_string(),
      },
    );

    let first = receiver.try_recv().unwrap();
    assert_eq!(first.from_agent, "agent1");
    assert!(first.to_agent.is_none());

    let second = receiver.try_recv().unwrap();
    assert_eq!(second.to_agent.as_deref(), Some("agent2"));
  }

  #[test]
  fn dropped_receiver_never_fails_the_sender() {
    let (notifier, receiver) = ChannelNotifier::channel();
    drop(receiver);

    notifier.broadcast(
      "agent1",
      AgentEvent::WorkflowStarted {
        workflow_id: "wf-1".to_string(),
      },
    );
  }

  #[test]
  fn events_round_trip_through_json() {
    let event = AgentEvent::DeadlockDetected {
      cycle: vec!["agent1".to_string(), "agent2".to_string()],
      resources: vec!["db".to_string()],
      resolution: "youngest_dies".to_string(),
    };
    let json = serde_json::to_string(&event).unwrap();
    assert!(json.contains("\"deadlock_detected\""));
    let back: AgentEvent = serde_json::from_str(&json).unwrap();
    match back {
      AgentEvent::DeadlockDetected { cycle, .. } => assert_eq!(cycle.len(), 2),
      other => panic!("unexpected event: {other:?}"),
    }
  }
}
