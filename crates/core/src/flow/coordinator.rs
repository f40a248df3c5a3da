//! # Flow Coordinator
//!
//! Owns one end-to-end pipeline execution: realizes the phase description
//! as workers, relays results to the client endpoint, enforces the flow
//! timeout, and tears everything down on the first terminal condition.
//!
//! The flow actor is deliberately off the data path: inputs go from the
//! [`FlowHandle`] straight into the head phase's mailboxes, and only
//! results, failures, and cache traffic pass through the actor itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::cache::{CacheHandle, CacheOp};
use super::converge::{self, PhaseLayout};
use super::events::{FlowError, FlowEvent, FlowEventKind};
use super::pipeline::{PhaseHandle, PhaseSpec};
use super::worker::{InputRouter, WorkerReport, MAILBOX_CAPACITY};
use crate::module::PhaseContext;

/// Pure transform applied to every result batch before client delivery.
/// Mapped elementwise when the batch is a JSON array, applied once
/// otherwise; the distinction is observable when a transformer's domain is
/// the whole batch.
pub type Xform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Start-time options for a flow.
#[derive(Clone, Default)]
pub struct FlowOptions {
    timeout: Option<Duration>,
    xform: Option<Xform>,
}

impl FlowOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wall-clock bound from start to terminal delivery; default unbounded.
    /// The same bound caps each `add_inputs` call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Transform applied to every result batch before it reaches the
    /// client; absent means identity.
    pub fn with_xform(mut self, xform: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.xform = Some(Arc::new(xform));
        self
    }
}

impl fmt::Debug for FlowOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowOptions")
            .field("timeout", &self.timeout)
            .field("xform", &self.xform.as_ref().map(|_| "…"))
            .finish()
    }
}

/// Client-side handle for a running flow.
///
/// Dropping the handle does not stop the flow; termination comes from the
/// tail signalling done, a phase failure, or the flow timeout.
#[derive(Debug)]
pub struct FlowHandle {
    flow_id: String,
    timeout: Option<Duration>,
    head: InputRouter,
    phases: Vec<PhaseHandle>,
    cache: CacheHandle,
}

impl FlowHandle {
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Deliver a batch to the head phase, round-robin across its workers.
    /// Returns once every element has been accepted, bounded by the flow
    /// timeout; a full head mailbox backpressures the caller.
    pub async fn add_inputs(&mut self, inputs: Vec<Value>) -> Result<()> {
        let timeout = self.timeout;
        match timeout {
            Some(t) => tokio::time::timeout(t, self.head.send_batch(inputs))
                .await
                .map_err(|_| anyhow!("flow timed out accepting inputs"))?,
            None => self.head.send_batch(inputs).await,
        }
    }

    /// Signal end-of-input to the head phase. Does not synchronize with
    /// prior `add_inputs` calls beyond their own completion.
    pub async fn finish_inputs(&self) -> Result<()> {
        self.head.broadcast_done().await
    }

    /// Runtime topology of the pipeline, head first. For tests.
    pub fn phases(&self) -> &[PhaseHandle] {
        &self.phases
    }

    /// Handle to the per-flow cache, usable from outside the pipeline.
    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    /// Store a value in the per-flow cache.
    pub async fn cache_put(&self, key: impl Into<String>, value: Value) -> Result<()> {
        self.cache.put(key, value).await
    }

    /// Look up a value in the per-flow cache; `None` means not found.
    pub async fn cache_get(&self, key: &str) -> Result<Option<Value>> {
        self.cache.get(key).await
    }
}

/// The flow actor: supervises workers, serves the cache, relays results.
pub struct Flow {
    flow_id: String,
    client: mpsc::Sender<FlowEvent>,
    xform: Option<Xform>,
    timeout: Option<Duration>,
    cache: HashMap<String, Value>,
    supervisor: JoinSet<()>,
    worker_phases: HashMap<tokio::task::Id, usize>,
    report_rx: mpsc::Receiver<WorkerReport>,
    /// Keeps the report channel open even if every worker exits, so the
    /// actor keeps waiting for the timeout instead of spinning on a closed
    /// channel.
    _report_tx: mpsc::Sender<WorkerReport>,
    cache_rx: mpsc::Receiver<CacheOp>,
}

impl Flow {
    /// Build the pipeline and start the flow.
    ///
    /// Workers are constructed tail-to-head so each phase knows its
    /// successor at construction; `phase_id` counts head = 0. If any
    /// module fails to `init`, already-spawned workers are torn down and
    /// no flow is exposed.
    pub async fn start(
        client: mpsc::Sender<FlowEvent>,
        flow_id: impl Into<String>,
        pipeline: Vec<PhaseSpec>,
        options: FlowOptions,
    ) -> Result<FlowHandle> {
        let flow_id = flow_id.into();
        ensure!(!pipeline.is_empty(), "pipeline must contain at least one phase");
        for (idx, spec) in pipeline.iter().enumerate() {
            ensure!(
                spec.converge != Some(0),
                "phase {idx}: converge worker count must be at least 1"
            );
        }
        tracing::debug!(flow_id = %flow_id, phases = pipeline.len(), "starting flow");

        let (report_tx, report_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (cache_tx, cache_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let cache_handle = CacheHandle { tx: cache_tx };

        let mut supervisor = JoinSet::new();
        let mut worker_phases = HashMap::new();
        let mut phases: Vec<PhaseHandle> = Vec::with_capacity(pipeline.len());
        let mut next: Option<PhaseHandle> = None;

        for (phase_id, spec) in pipeline.into_iter().enumerate().rev() {
            let mut modules = Vec::with_capacity(spec.worker_count());
            for _ in 0..spec.worker_count() {
                let mut module = (spec.factory)();
                module
                    .init(
                        spec.args.clone(),
                        PhaseContext::new(phase_id, cache_handle.clone()),
                    )
                    .await
                    .with_context(|| format!("phase {phase_id} failed to construct"))?;
                modules.push(module);
            }
            let handle = converge::spawn_phase(
                &mut supervisor,
                &mut worker_phases,
                PhaseLayout {
                    phase_id,
                    accumulate: spec.accumulate,
                    converge: spec.converge.is_some(),
                    tick: spec.tick,
                },
                modules,
                next.as_ref(),
                &report_tx,
            );
            next = Some(handle.clone());
            phases.push(handle);
        }
        phases.reverse();

        let head = phases
            .first()
            .map(|phase| InputRouter::new(phase.workers.clone()))
            .context("pipeline must contain at least one phase")?;

        let actor = Flow {
            flow_id: flow_id.clone(),
            client,
            xform: options.xform,
            timeout: options.timeout,
            cache: HashMap::new(),
            supervisor,
            worker_phases,
            report_rx,
            _report_tx: report_tx,
            cache_rx,
        };
        tokio::spawn(actor.run());

        Ok(FlowHandle {
            flow_id,
            timeout: options.timeout,
            head,
            phases,
            cache: cache_handle,
        })
    }

    /// Event loop: runs until the first terminal condition, sends exactly
    /// one terminal event, then tears the pipeline down.
    #[tracing::instrument(skip(self), fields(flow_id = %self.flow_id))]
    async fn run(mut self) {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let outcome = loop {
            tokio::select! {
                _ = expiry(deadline) => {
                    break FlowEventKind::Error {
                        reason: FlowError::Timeout,
                    };
                }
                Some(report) = self.report_rx.recv() => {
                    match report {
                        WorkerReport::Results { phase_id, batch } => {
                            let batch = apply_xform(&self.xform, batch);
                            let event = FlowEvent::new(
                                &self.flow_id,
                                FlowEventKind::Results { phase_id, batch },
                            );
                            if self.client.send(event).await.is_err() {
                                tracing::debug!("client endpoint gone; tearing flow down");
                                self.supervisor.abort_all();
                                return;
                            }
                        }
                        WorkerReport::Done { .. } => break FlowEventKind::Done,
                        WorkerReport::Failed { phase_id, reason } => {
                            break FlowEventKind::Error {
                                reason: FlowError::Phase { phase_id, reason },
                            };
                        }
                    }
                }
                Some(op) = self.cache_rx.recv() => self.serve_cache(op),
                Some(joined) = self.supervisor.join_next_with_id() => {
                    match joined {
                        Ok((id, ())) => {
                            // A worker may exit normally mid-flow; its
                            // undelivered outputs are silently dropped.
                            self.worker_phases.remove(&id);
                        }
                        Err(err) if err.is_cancelled() => {}
                        Err(err) => {
                            let phase_id = self
                                .worker_phases
                                .remove(&err.id())
                                .unwrap_or_default();
                            break FlowEventKind::Error {
                                reason: FlowError::Phase {
                                    phase_id,
                                    reason: err.to_string(),
                                },
                            };
                        }
                    }
                }
            }
        };

        if matches!(outcome, FlowEventKind::Error { .. }) {
            tracing::warn!("flow terminated abnormally: {outcome:?}");
        }
        let _ = self
            .client
            .send(FlowEvent::new(&self.flow_id, outcome))
            .await;
        // Returning drops the pending timeout and the cache; the
        // supervisor owns every worker task.
        self.supervisor.abort_all();
    }

    fn serve_cache(&mut self, op: CacheOp) {
        match op {
            CacheOp::Put { key, value, reply } => {
                self.cache.insert(key, value);
                let _ = reply.send(());
            }
            CacheOp::Get { key, reply } => {
                let _ = reply.send(self.cache.get(&key).cloned());
            }
        }
    }
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn apply_xform(xform: &Option<Xform>, batch: Value) -> Value {
    match xform {
        None => batch,
        Some(f) => match batch {
            Value::Array(items) => Value::Array(items.into_iter().map(|item| f(item)).collect()),
            other => f(other),
        },
    }
}
