//! # Phase Modules
//!
//! The behavior contract a pipeline phase plugs into the flow coordinator.
//! A module owns its user state between invocations; the worker that hosts
//! it handles mailbox plumbing, output routing, and end-of-input
//! propagation.
//!
//! ## Callback lifecycle
//!
//! ```text
//! init(args, ctx)                once, before the flow starts
//!   ├── handle_input(v)          once per routed input
//!   ├── handle_sync_inputs(vs)   fast path for batched submission
//!   ├── handle_timeout()         mailbox idle for the phase tick
//!   └── handle_inputs_done()     once, after upstream end-of-input
//! ```
//!
//! Every callback returns an ordered (possibly empty) sequence of outputs.
//! The worker forwards them to the next phase, or to the flow as a result
//! batch when the phase is the pipeline tail. An error return kills the
//! worker and fails the whole flow.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::flow::CacheHandle;

/// Per-worker context handed to a module at startup.
///
/// Carries the worker's phase id and a handle to the flow's key/value
/// cache. The cache is not serviced until the flow is running, so modules
/// that want to memoize should stash the handle in `init` and call it from
/// the input callbacks.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    phase_id: usize,
    cache: CacheHandle,
}

impl PhaseContext {
    pub(crate) fn new(phase_id: usize, cache: CacheHandle) -> Self {
        Self { phase_id, cache }
    }

    /// 0-based index of the phase this module instance runs in, head = 0.
    pub fn phase_id(&self) -> usize {
        self.phase_id
    }

    /// Handle to the per-flow key/value cache.
    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }
}

/// The capability set a user phase implements.
///
/// User state lives in `&mut self`; the hosting worker serializes all
/// callbacks, so no internal locking is needed.
#[async_trait]
pub trait PhaseModule: Send {
    /// Called exactly once before any input arrives. A failure here is a
    /// start error: the flow is never exposed to the client.
    async fn init(&mut self, _args: Value, _ctx: PhaseContext) -> Result<()> {
        Ok(())
    }

    /// Consume one input, produce zero or more outputs.
    async fn handle_input(&mut self, input: Value) -> Result<Vec<Value>>;

    /// Fast path for a synchronously submitted batch. The default feeds the
    /// batch through [`handle_input`](Self::handle_input) element by element.
    async fn handle_sync_inputs(&mut self, inputs: Vec<Value>) -> Result<Vec<Value>> {
        let mut outputs = Vec::new();
        for input in inputs {
            outputs.extend(self.handle_input(input).await?);
        }
        Ok(outputs)
    }

    /// Invoked when the worker's mailbox has been idle for the phase tick
    /// (see [`PhaseSpec::with_tick`](crate::flow::PhaseSpec::with_tick)).
    async fn handle_timeout(&mut self) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }

    /// Invoked after upstream end-of-input, before EOI propagates
    /// downstream. Accumulating modules flush their buffered outputs here.
    async fn handle_inputs_done(&mut self) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

/// Adapter turning a plain closure into a stage-style module.
///
/// Covers the common map-shaped phase without a struct per phase:
///
/// ```rust,ignore
/// use conflux_core::module::FnPhase;
///
/// let double = FnPhase::new(|v| Ok(vec![serde_json::json!(v.as_i64().unwrap_or(0) * 2)]));
/// ```
pub struct FnPhase<F> {
    f: F,
}

impl<F> FnPhase<F>
where
    F: FnMut(Value) -> Result<Vec<Value>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> PhaseModule for FnPhase<F>
where
    F: FnMut(Value) -> Result<Vec<Value>> + Send,
{
    async fn handle_input(&mut self, input: Value) -> Result<Vec<Value>> {
        (self.f)(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Tripler;

    #[async_trait]
    impl PhaseModule for Tripler {
        async fn handle_input(&mut self, input: Value) -> Result<Vec<Value>> {
            let n = input.as_i64().unwrap_or(0);
            Ok(vec![json!(n * 3)])
        }
    }

    #[tokio::test]
    async fn test_default_sync_inputs_feeds_each_element() {
        let mut module = Tripler;
        let outputs = module
            .handle_sync_inputs(vec![json!(1), json!(2), json!(3)])
            .await
            .unwrap();
        assert_eq!(outputs, vec![json!(3), json!(6), json!(9)]);
    }

    #[tokio::test]
    async fn test_fn_phase_wraps_closure() {
        let mut phase = FnPhase::new(|v: Value| {
            let n = v.as_i64().unwrap_or(0);
            Ok(vec![json!(n + 1)])
        });
        let outputs = phase.handle_input(json!(41)).await.unwrap();
        assert_eq!(outputs, vec![json!(42)]);
    }

    #[tokio::test]
    async fn test_fn_phase_can_fan_out() {
        let mut phase = FnPhase::new(|v: Value| Ok(vec![v.clone(), v]));
        let outputs = phase.handle_sync_inputs(vec![json!("a")]).await.unwrap();
        assert_eq!(outputs, vec![json!("a"), json!("a")]);
    }
}
