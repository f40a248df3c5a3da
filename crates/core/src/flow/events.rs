//! # Flow Events
//!
//! The messages a flow delivers to its client endpoint. Every event is
//! tagged with the client-chosen flow id so one endpoint can multiplex
//! several flows. Exactly one terminal event (`Done` or `Error`) is
//! delivered per flow, and never both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Payload of a flow event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEventKind {
    /// A transformed result batch produced by one phase.
    Results { phase_id: usize, batch: Value },
    /// Clean completion: the tail phase observed end-of-input.
    Done,
    /// Fatal failure; the flow is torn down after sending this.
    Error { reason: FlowError },
}

/// Envelope delivered to the client endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowEvent {
    /// Client-chosen flow identifier.
    pub flow_id: String,
    /// When the flow emitted the event.
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: FlowEventKind,
}

impl FlowEvent {
    pub(crate) fn new(flow_id: &str, kind: FlowEventKind) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Why a flow terminated abnormally.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowError {
    /// The wall-clock flow timeout elapsed before the tail signalled done.
    #[error("flow timed out")]
    Timeout,
    /// A phase worker died abnormally.
    #[error("phase {phase_id} failed: {reason}")]
    Phase { phase_id: usize, reason: String },
}
