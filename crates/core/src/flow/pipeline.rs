//! # Pipeline Description
//!
//! A pipeline is an ordered sequence of [`PhaseSpec`]s, head first. Each
//! spec names a module factory, the phase's behavior flags, and its init
//! args. The flow consumes the description at start and realizes every
//! phase as one or more workers; [`PhaseHandle`] is the runtime view of a
//! realized phase.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use super::worker::PhaseMsg;
use crate::module::PhaseModule;

/// Constructs one module instance per phase worker. A converging phase
/// calls the factory once per member.
pub type ModuleFactory = Box<dyn Fn() -> Box<dyn PhaseModule> + Send + Sync>;

/// Description of one pipeline phase.
///
/// The default behavior is `stage`: every output is forwarded downstream
/// as soon as the module returns it. Builders toggle the other behaviors:
///
/// ```rust,ignore
/// use conflux_core::flow::PhaseSpec;
/// use conflux_core::module::FnPhase;
///
/// let spec = PhaseSpec::new(|| Box::new(FnPhase::new(|v| Ok(vec![v]))))
///     .converge(3)
///     .with_args(serde_json::json!({ "window": 16 }));
/// ```
pub struct PhaseSpec {
    pub(crate) factory: ModuleFactory,
    pub(crate) args: Value,
    pub(crate) accumulate: bool,
    /// `Some(n)` is the `{converge, n}` annotation; the count is consumed
    /// at construction and persisted on workers as a plain flag.
    pub(crate) converge: Option<usize>,
    pub(crate) tick: Option<Duration>,
}

impl PhaseSpec {
    /// A stage phase built from the given module factory.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn PhaseModule> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            args: Value::Null,
            accumulate: false,
            converge: None,
            tick: None,
        }
    }

    /// Mark the phase as accumulating: the module buffers outputs and
    /// flushes them on `handle_inputs_done`. The flag is a hint the module
    /// itself honors; the worker simply forwards whatever the callbacks
    /// return.
    pub fn accumulate(mut self) -> Self {
        self.accumulate = true;
        self
    }

    /// Run the phase as `n` converging workers sharing one leader.
    pub fn converge(mut self, n: usize) -> Self {
        self.converge = Some(n);
        self
    }

    /// Init args passed to every module instance of this phase.
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Invoke `handle_timeout` whenever the worker mailbox has been idle
    /// this long. Ticking stops once the phase has announced end-of-input.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = Some(tick);
        self
    }

    /// Number of workers this phase realizes as.
    pub(crate) fn worker_count(&self) -> usize {
        self.converge.unwrap_or(1)
    }
}

impl fmt::Debug for PhaseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseSpec")
            .field("accumulate", &self.accumulate)
            .field("converge", &self.converge)
            .field("tick", &self.tick)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// Runtime handle for one realized phase: its id, behavior flags, and the
/// mailboxes of its workers. Returned by
/// [`FlowHandle::phases`](super::FlowHandle::phases) for topology
/// assertions in tests.
#[derive(Debug, Clone)]
pub struct PhaseHandle {
    pub(crate) phase_id: usize,
    pub(crate) accumulate: bool,
    pub(crate) converge: bool,
    pub(crate) workers: Vec<mpsc::Sender<PhaseMsg>>,
}

impl PhaseHandle {
    /// 0-based index of the phase, head = 0.
    pub fn phase_id(&self) -> usize {
        self.phase_id
    }

    pub fn is_accumulate(&self) -> bool {
        self.accumulate
    }

    pub fn is_converge(&self) -> bool {
        self.converge
    }

    /// Number of live workers backing the phase.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}
