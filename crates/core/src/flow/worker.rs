//! # Phase Workers
//!
//! One actor per phase instance. A worker owns a module, drains its
//! mailbox, and routes whatever the module returns: downstream when a next
//! phase exists, up to the flow as a result batch at the pipeline tail.
//!
//! ## Inbox state machine
//!
//! ```text
//! Open ──inputs_done──▶ DoneLocal ──propagated──▶ DoneAnnounced
//! ```
//!
//! Inputs arriving after `DoneLocal` are a logic error upstream; the worker
//! reports a phase failure rather than silently dropping them.

use anyhow::{anyhow, bail, ensure, Context, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::converge::ConvergeRole;
use crate::module::PhaseModule;

/// Mailbox capacity for every worker and for the flow's report channel.
/// Bounded so a stalled phase backpressures its upstream instead of
/// buffering without limit.
pub(crate) const MAILBOX_CAPACITY: usize = 64;

/// Messages a phase worker accepts.
#[derive(Debug)]
pub(crate) enum PhaseMsg {
    /// One routed input element.
    Input(Value),
    /// A synchronously submitted batch (the `add_inputs` fast path).
    SyncInputs(Vec<Value>),
    /// Upstream end-of-input.
    InputsDone,
    /// A converging partner has processed its own end-of-input
    /// (leader-only).
    PartnerDone,
}

/// Reports a worker sends up to its flow.
#[derive(Debug)]
pub(crate) enum WorkerReport {
    /// A result batch from a tail worker.
    Results { phase_id: usize, batch: Value },
    /// The tail phase observed end-of-input.
    Done { phase_id: usize },
    /// The worker died abnormally.
    Failed { phase_id: usize, reason: String },
}

/// Round-robin router over the workers of one downstream phase.
///
/// Distribution is per element and stable within a sender: each clone
/// keeps its own cursor. A single-member target degenerates to direct
/// forwarding.
#[derive(Debug, Clone)]
pub(crate) struct InputRouter {
    targets: Vec<mpsc::Sender<PhaseMsg>>,
    cursor: usize,
}

impl InputRouter {
    pub(crate) fn new(targets: Vec<mpsc::Sender<PhaseMsg>>) -> Self {
        Self { targets, cursor: 0 }
    }

    /// Route one element to exactly one member.
    pub(crate) async fn send(&mut self, input: Value) -> Result<()> {
        let idx = self.cursor;
        self.cursor = (self.cursor + 1) % self.targets.len();
        self.targets[idx]
            .send(PhaseMsg::Input(input))
            .await
            .map_err(|_| anyhow!("downstream phase mailbox closed"))
    }

    /// Split a batch round-robin into per-member sub-batches, preserving
    /// per-member order, and deliver each over the sync fast path.
    pub(crate) async fn send_batch(&mut self, inputs: Vec<Value>) -> Result<()> {
        if self.targets.len() == 1 {
            return self.targets[0]
                .send(PhaseMsg::SyncInputs(inputs))
                .await
                .map_err(|_| anyhow!("downstream phase mailbox closed"));
        }
        let mut buckets: Vec<Vec<Value>> = vec![Vec::new(); self.targets.len()];
        for input in inputs {
            buckets[self.cursor].push(input);
            self.cursor = (self.cursor + 1) % self.targets.len();
        }
        for (idx, bucket) in buckets.into_iter().enumerate() {
            if !bucket.is_empty() {
                self.targets[idx]
                    .send(PhaseMsg::SyncInputs(bucket))
                    .await
                    .map_err(|_| anyhow!("downstream phase mailbox closed"))?;
            }
        }
        Ok(())
    }

    /// End-of-input goes to every member exactly once.
    pub(crate) async fn broadcast_done(&self) -> Result<()> {
        for target in &self.targets {
            target
                .send(PhaseMsg::InputsDone)
                .await
                .map_err(|_| anyhow!("downstream phase mailbox closed"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InboxState {
    Open,
    DoneLocal,
    DoneAnnounced,
}

/// A single phase instance: module, routing, and end-of-input bookkeeping.
pub(crate) struct PhaseWorker {
    pub(crate) phase_id: usize,
    pub(crate) module: Box<dyn PhaseModule>,
    pub(crate) next: Option<InputRouter>,
    pub(crate) report_tx: mpsc::Sender<WorkerReport>,
    pub(crate) converge: Option<ConvergeRole>,
    pub(crate) tick: Option<std::time::Duration>,
    pub(crate) inbox: InboxState,
}

impl PhaseWorker {
    /// Mailbox loop. Runs until the flow drops the worker's senders or a
    /// module callback fails. Failures are reported, never panicked.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<PhaseMsg>) {
        loop {
            let msg = match self.tick {
                Some(tick) => match timeout(tick, rx.recv()).await {
                    Ok(msg) => msg,
                    Err(_) => {
                        if let Err(err) = self.on_tick().await {
                            self.fail(err).await;
                            return;
                        }
                        continue;
                    }
                },
                None => rx.recv().await,
            };
            let Some(msg) = msg else {
                // All senders gone: the flow terminated. Exit quietly.
                return;
            };
            if let Err(err) = self.on_message(msg).await {
                self.fail(err).await;
                return;
            }
        }
    }

    async fn on_message(&mut self, msg: PhaseMsg) -> Result<()> {
        match msg {
            PhaseMsg::Input(input) => {
                self.ensure_open()?;
                let outputs = self
                    .module
                    .handle_input(input)
                    .await
                    .context("handle_input failed")?;
                self.emit(outputs).await
            }
            PhaseMsg::SyncInputs(batch) => {
                self.ensure_open()?;
                let outputs = self
                    .module
                    .handle_sync_inputs(batch)
                    .await
                    .context("handle_sync_inputs failed")?;
                self.emit(outputs).await
            }
            PhaseMsg::InputsDone => self.on_inputs_done().await,
            PhaseMsg::PartnerDone => self.on_partner_done().await,
        }
    }

    async fn on_tick(&mut self) -> Result<()> {
        let outputs = self
            .module
            .handle_timeout()
            .await
            .context("handle_timeout failed")?;
        self.emit(outputs).await
    }

    /// Upstream signalled end-of-input: flush the module, then propagate
    /// per role. Mailbox FIFO guarantees every input routed before the EOI
    /// has already been processed.
    async fn on_inputs_done(&mut self) -> Result<()> {
        ensure!(
            self.inbox == InboxState::Open,
            "duplicate end-of-input signal"
        );
        self.inbox = InboxState::DoneLocal;
        let outputs = self
            .module
            .handle_inputs_done()
            .await
            .context("handle_inputs_done failed")?;
        self.emit(outputs).await?;

        match self.converge.as_mut() {
            None => self.announce_done().await,
            Some(ConvergeRole::Member { leader }) => {
                // The leader emits the group's single downstream EOI once
                // every partner has checked in.
                leader
                    .send(PhaseMsg::PartnerDone)
                    .await
                    .map_err(|_| anyhow!("convergence leader is gone"))?;
                self.inbox = InboxState::DoneAnnounced;
                self.tick = None;
                Ok(())
            }
            Some(ConvergeRole::Leader { local_done, .. }) => {
                *local_done = true;
                self.try_announce_group_done().await
            }
        }
    }

    async fn on_partner_done(&mut self) -> Result<()> {
        match self.converge.as_mut() {
            Some(ConvergeRole::Leader {
                pending_partners, ..
            }) => {
                ensure!(
                    *pending_partners > 0,
                    "partner notification after all partners were counted"
                );
                *pending_partners -= 1;
                self.try_announce_group_done().await
            }
            _ => bail!("partner notification on a non-leader worker"),
        }
    }

    async fn try_announce_group_done(&mut self) -> Result<()> {
        let announce = matches!(
            &self.converge,
            Some(ConvergeRole::Leader {
                pending_partners: 0,
                local_done: true,
            })
        ) && self.inbox != InboxState::DoneAnnounced;
        if announce {
            self.announce_done().await?;
        }
        Ok(())
    }

    async fn announce_done(&mut self) -> Result<()> {
        match &self.next {
            Some(router) => router.broadcast_done().await?,
            None => {
                self.report(WorkerReport::Done {
                    phase_id: self.phase_id,
                })
                .await?
            }
        }
        self.inbox = InboxState::DoneAnnounced;
        self.tick = None;
        Ok(())
    }

    /// Forward a callback's outputs: per element downstream, or as one
    /// result batch to the flow at the tail.
    async fn emit(&mut self, outputs: Vec<Value>) -> Result<()> {
        if outputs.is_empty() {
            return Ok(());
        }
        match &mut self.next {
            Some(router) => {
                for output in outputs {
                    router.send(output).await?;
                }
                Ok(())
            }
            None => {
                let phase_id = self.phase_id;
                self.report(WorkerReport::Results {
                    phase_id,
                    batch: Value::Array(outputs),
                })
                .await
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        ensure!(
            self.inbox == InboxState::Open,
            "input received after end-of-input"
        );
        Ok(())
    }

    async fn report(&mut self, report: WorkerReport) -> Result<()> {
        self.report_tx
            .send(report)
            .await
            .map_err(|_| anyhow!("flow terminated"))
    }

    async fn fail(&mut self, err: anyhow::Error) {
        tracing::warn!(phase_id = self.phase_id, "phase worker failed: {err:#}");
        let _ = self
            .report_tx
            .send(WorkerReport::Failed {
                phase_id: self.phase_id,
                reason: format!("{err:#}"),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::FnPhase;
    use serde_json::json;
    use std::time::Duration;

    fn identity_module() -> Box<dyn PhaseModule> {
        Box::new(FnPhase::new(|v| Ok(vec![v])))
    }

    fn spawn_worker(
        next: Option<InputRouter>,
        report_tx: mpsc::Sender<WorkerReport>,
    ) -> mpsc::Sender<PhaseMsg> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let worker = PhaseWorker {
            phase_id: 0,
            module: identity_module(),
            next,
            report_tx,
            converge: None,
            tick: None,
            inbox: InboxState::Open,
        };
        tokio::spawn(worker.run(rx));
        tx
    }

    #[tokio::test]
    async fn test_tail_worker_reports_results_then_done() {
        let (report_tx, mut report_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let tx = spawn_worker(None, report_tx);

        tx.send(PhaseMsg::Input(json!(7))).await.unwrap();
        tx.send(PhaseMsg::InputsDone).await.unwrap();

        match report_rx.recv().await.unwrap() {
            WorkerReport::Results { phase_id, batch } => {
                assert_eq!(phase_id, 0);
                assert_eq!(batch, json!([7]));
            }
            other => panic!("expected results, got {other:?}"),
        }
        assert!(matches!(
            report_rx.recv().await.unwrap(),
            WorkerReport::Done { phase_id: 0 }
        ));
    }

    #[tokio::test]
    async fn test_input_after_eoi_is_a_phase_failure() {
        let (report_tx, mut report_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let tx = spawn_worker(None, report_tx);

        tx.send(PhaseMsg::InputsDone).await.unwrap();
        tx.send(PhaseMsg::Input(json!(1))).await.unwrap();

        assert!(matches!(
            report_rx.recv().await.unwrap(),
            WorkerReport::Done { .. }
        ));
        match report_rx.recv().await.unwrap() {
            WorkerReport::Failed { reason, .. } => {
                assert!(reason.contains("after end-of-input"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_outputs_round_robin_across_downstream_members() {
        let (a_tx, mut a_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (b_tx, mut b_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (report_tx, _report_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let tx = spawn_worker(Some(InputRouter::new(vec![a_tx, b_tx])), report_tx);

        for n in 0..4 {
            tx.send(PhaseMsg::Input(json!(n))).await.unwrap();
        }

        for expected in [0, 2] {
            match a_rx.recv().await.unwrap() {
                PhaseMsg::Input(v) => assert_eq!(v, json!(expected)),
                other => panic!("unexpected message {other:?}"),
            }
        }
        for expected in [1, 3] {
            match b_rx.recv().await.unwrap() {
                PhaseMsg::Input(v) => assert_eq!(v, json!(expected)),
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_eoi_broadcasts_to_every_downstream_member() {
        let (a_tx, mut a_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (b_tx, mut b_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (report_tx, _report_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let tx = spawn_worker(Some(InputRouter::new(vec![a_tx, b_tx])), report_tx);

        tx.send(PhaseMsg::InputsDone).await.unwrap();

        assert!(matches!(a_rx.recv().await.unwrap(), PhaseMsg::InputsDone));
        assert!(matches!(b_rx.recv().await.unwrap(), PhaseMsg::InputsDone));
    }

    #[tokio::test]
    async fn test_module_error_is_reported_with_context() {
        let (report_tx, mut report_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let worker = PhaseWorker {
            phase_id: 3,
            module: Box::new(FnPhase::new(|_| anyhow::bail!("bad datum"))),
            next: None,
            report_tx,
            converge: None,
            tick: None,
            inbox: InboxState::Open,
        };
        tokio::spawn(worker.run(rx));

        tx.send(PhaseMsg::Input(json!(1))).await.unwrap();

        match report_rx.recv().await.unwrap() {
            WorkerReport::Failed { phase_id, reason } => {
                assert_eq!(phase_id, 3);
                assert!(reason.contains("bad datum"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tick_invokes_handle_timeout() {
        struct Ticker {
            ticks: usize,
        }

        #[async_trait::async_trait]
        impl PhaseModule for Ticker {
            async fn handle_input(&mut self, _input: Value) -> Result<Vec<Value>> {
                Ok(Vec::new())
            }
            async fn handle_timeout(&mut self) -> Result<Vec<Value>> {
                self.ticks += 1;
                Ok(vec![json!(self.ticks)])
            }
        }

        let (report_tx, mut report_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (_tx, rx) = mpsc::channel::<PhaseMsg>(MAILBOX_CAPACITY);
        let worker = PhaseWorker {
            phase_id: 0,
            module: Box::new(Ticker { ticks: 0 }),
            next: None,
            report_tx,
            converge: None,
            tick: Some(Duration::from_millis(10)),
            inbox: InboxState::Open,
        };
        tokio::spawn(worker.run(rx));

        match report_rx.recv().await.unwrap() {
            WorkerReport::Results { batch, .. } => assert_eq!(batch, json!([1])),
            other => panic!("expected tick results, got {other:?}"),
        }
    }
}
