//! # Converging Phases
//!
//! A `{converge, N}` phase is one logical phase backed by N workers.
//! Regular outputs need no coordination (each member forwards its own),
//! but end-of-input must leave the group exactly once:
//!
//! ```text
//! upstream EOI ──broadcast──▶ member 0 (leader) ─┐
//!                             member 1 ──PartnerDone──▶ leader
//!                             member 2 ──PartnerDone──▶ leader
//!                                                      │
//!                       leader: own EOI processed AND all partners done
//!                                                      │
//!                                            single downstream EOI
//! ```
//!
//! The leader is the first-created member. If any member dies before the
//! group EOI is emitted, the failure reaches the flow through the normal
//! worker report path and the group never re-issues EOI.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::pipeline::PhaseHandle;
use super::worker::{InboxState, InputRouter, PhaseMsg, PhaseWorker, WorkerReport, MAILBOX_CAPACITY};
use crate::module::PhaseModule;

/// A converging worker's place in its group. Workers of non-converging
/// phases carry no role.
#[derive(Debug)]
pub(crate) enum ConvergeRole {
    /// Holds the EOI quorum: counts partner check-ins, emits the group's
    /// single downstream EOI.
    Leader {
        pending_partners: usize,
        local_done: bool,
    },
    /// Reports its own EOI to the leader instead of propagating it.
    Member { leader: mpsc::Sender<PhaseMsg> },
}

/// Flags shared by every worker of one phase.
pub(crate) struct PhaseLayout {
    pub(crate) phase_id: usize,
    pub(crate) accumulate: bool,
    pub(crate) converge: bool,
    pub(crate) tick: Option<std::time::Duration>,
}

/// Realize one phase as workers inside the flow's supervisor set.
///
/// Mailboxes for all members are created before any worker is spawned so
/// non-leaders know the leader's address at construction. Each member gets
/// its own router over the downstream phase, keeping round-robin cursors
/// per worker.
pub(crate) fn spawn_phase(
    supervisor: &mut JoinSet<()>,
    worker_phases: &mut HashMap<tokio::task::Id, usize>,
    layout: PhaseLayout,
    modules: Vec<Box<dyn PhaseModule>>,
    next: Option<&PhaseHandle>,
    report_tx: &mpsc::Sender<WorkerReport>,
) -> PhaseHandle {
    let count = modules.len();
    let (txs, rxs): (Vec<_>, Vec<_>) = (0..count)
        .map(|_| mpsc::channel::<PhaseMsg>(MAILBOX_CAPACITY))
        .unzip();

    for (member, (module, rx)) in modules.into_iter().zip(rxs).enumerate() {
        let converge = if layout.converge {
            Some(if member == 0 {
                ConvergeRole::Leader {
                    pending_partners: count - 1,
                    local_done: false,
                }
            } else {
                ConvergeRole::Member {
                    leader: txs[0].clone(),
                }
            })
        } else {
            None
        };
        let worker = PhaseWorker {
            phase_id: layout.phase_id,
            module,
            next: next.map(|handle| InputRouter::new(handle.workers.clone())),
            report_tx: report_tx.clone(),
            converge,
            tick: layout.tick,
            inbox: InboxState::Open,
        };
        let abort = supervisor.spawn(worker.run(rx));
        worker_phases.insert(abort.id(), layout.phase_id);
    }

    PhaseHandle {
        phase_id: layout.phase_id,
        accumulate: layout.accumulate,
        converge: layout.converge,
        workers: txs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::FnPhase;
    use serde_json::json;
    use tokio::time::{sleep, Duration};

    fn echo_modules(n: usize) -> Vec<Box<dyn PhaseModule>> {
        (0..n)
            .map(|_| Box::new(FnPhase::new(|v| Ok(vec![v]))) as Box<dyn PhaseModule>)
            .collect()
    }

    fn downstream_stub() -> (PhaseHandle, mpsc::Receiver<PhaseMsg>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = PhaseHandle {
            phase_id: 1,
            accumulate: false,
            converge: false,
            workers: vec![tx],
        };
        (handle, rx)
    }

    #[tokio::test]
    async fn test_group_emits_exactly_one_downstream_eoi() {
        let mut supervisor = JoinSet::new();
        let mut worker_phases = HashMap::new();
        let (report_tx, _report_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (next, mut next_rx) = downstream_stub();

        let group = spawn_phase(
            &mut supervisor,
            &mut worker_phases,
            PhaseLayout {
                phase_id: 0,
                accumulate: false,
                converge: true,
                tick: None,
            },
            echo_modules(3),
            Some(&next),
            &report_tx,
        );

        for worker in &group.workers {
            worker.send(PhaseMsg::InputsDone).await.unwrap();
        }

        assert!(matches!(next_rx.recv().await.unwrap(), PhaseMsg::InputsDone));
        // No second EOI may follow.
        sleep(Duration::from_millis(50)).await;
        assert!(next_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leader_waits_for_every_partner() {
        let mut supervisor = JoinSet::new();
        let mut worker_phases = HashMap::new();
        let (report_tx, _report_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (next, mut next_rx) = downstream_stub();

        let group = spawn_phase(
            &mut supervisor,
            &mut worker_phases,
            PhaseLayout {
                phase_id: 0,
                accumulate: false,
                converge: true,
                tick: None,
            },
            echo_modules(3),
            Some(&next),
            &report_tx,
        );

        // Leader and one member done; the third is still open.
        group.workers[0].send(PhaseMsg::InputsDone).await.unwrap();
        group.workers[1].send(PhaseMsg::InputsDone).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(next_rx.try_recv().is_err());

        group.workers[2].send(PhaseMsg::InputsDone).await.unwrap();
        assert!(matches!(next_rx.recv().await.unwrap(), PhaseMsg::InputsDone));
    }

    #[tokio::test]
    async fn test_members_forward_their_own_outputs_without_coordination() {
        let mut supervisor = JoinSet::new();
        let mut worker_phases = HashMap::new();
        let (report_tx, _report_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (next, mut next_rx) = downstream_stub();

        let group = spawn_phase(
            &mut supervisor,
            &mut worker_phases,
            PhaseLayout {
                phase_id: 0,
                accumulate: false,
                converge: true,
                tick: None,
            },
            echo_modules(2),
            Some(&next),
            &report_tx,
        );

        group.workers[1]
            .send(PhaseMsg::Input(json!("b")))
            .await
            .unwrap();
        match next_rx.recv().await.unwrap() {
            PhaseMsg::Input(v) => assert_eq!(v, json!("b")),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_converge_of_one_needs_no_partners() {
        let mut supervisor = JoinSet::new();
        let mut worker_phases = HashMap::new();
        let (report_tx, mut report_rx) = mpsc::channel(MAILBOX_CAPACITY);

        let group = spawn_phase(
            &mut supervisor,
            &mut worker_phases,
            PhaseLayout {
                phase_id: 0,
                accumulate: false,
                converge: true,
                tick: None,
            },
            echo_modules(1),
            None,
            &report_tx,
        );

        group.workers[0].send(PhaseMsg::InputsDone).await.unwrap();
        assert!(matches!(
            report_rx.recv().await.unwrap(),
            WorkerReport::Done { phase_id: 0 }
        ));
    }
}
