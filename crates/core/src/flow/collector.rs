//! # Result Collection
//!
//! Client-side accumulation of a flow's result stream. The collector
//! drains `FlowEvent`s for one flow id until the terminal `Done` arrives
//! or its own collect timeout elapses; the collect timeout never tears the
//! flow down, it only ends the wait.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Duration, Instant};

use super::events::{FlowError, FlowEvent, FlowEventKind};

/// Why a collect call returned no results.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollectError {
    /// The collect timeout elapsed with an empty accumulator. A timeout
    /// with partial results is not an error.
    #[error("no results before the collect timeout")]
    Timeout,
    /// The flow itself failed; carries the flow's error payload.
    #[error("flow failed: {0}")]
    Flow(FlowError),
}

/// Accumulates result batches per phase, in arrival order.
pub struct ResultCollector {
    flow_id: String,
    rx: mpsc::Receiver<FlowEvent>,
}

impl ResultCollector {
    /// Collect from `rx`, ignoring events tagged with other flow ids.
    pub fn new(flow_id: impl Into<String>, rx: mpsc::Receiver<FlowEvent>) -> Self {
        Self {
            flow_id: flow_id.into(),
            rx,
        }
    }

    /// Drain the stream until terminal `Done`, a flow error, or the
    /// collect timeout.
    ///
    /// On `Done`, and on a timeout with a non-empty accumulator, returns
    /// the finalized results: a single flat list when only one phase
    /// produced results, otherwise one flat list per phase, ordered by
    /// ascending phase id. A closed stream with no terminal is treated
    /// like the timeout case.
    pub async fn collect(mut self, timeout: Duration) -> Result<Value, CollectError> {
        let deadline = Instant::now() + timeout;
        let mut accum: BTreeMap<usize, Vec<Value>> = BTreeMap::new();

        loop {
            let event = match timeout_at(deadline, self.rx.recv()).await {
                Err(_) | Ok(None) => {
                    return if accum.is_empty() {
                        Err(CollectError::Timeout)
                    } else {
                        Ok(finalize(accum))
                    };
                }
                Ok(Some(event)) => event,
            };
            if event.flow_id != self.flow_id {
                continue;
            }
            match event.kind {
                FlowEventKind::Results { phase_id, batch } => {
                    accum.entry(phase_id).or_default().push(batch);
                }
                FlowEventKind::Done => return Ok(finalize(accum)),
                FlowEventKind::Error { reason } => return Err(CollectError::Flow(reason)),
            }
        }
    }
}

/// Concatenate each phase's batches into one flat sequence; list batches
/// are flattened elementwise, anything else counts as a single element.
fn finalize(accum: BTreeMap<usize, Vec<Value>>) -> Value {
    let mut per_phase: Vec<Value> = accum
        .into_values()
        .map(|batches| {
            let mut flat = Vec::new();
            for batch in batches {
                match batch {
                    Value::Array(items) => flat.extend(items),
                    other => flat.push(other),
                }
            }
            Value::Array(flat)
        })
        .collect();
    match per_phase.len() {
        1 => per_phase.swap_remove(0),
        _ => Value::Array(per_phase),
    }
}
